//! Stage selection for partial runs.
//!
//! Stages are numbered from 1 in each pipeline's declared order. Bit 0 is a
//! sentinel meaning "every stage"; otherwise bit `i` enables stage `i`.
//! Enabled stages always execute in declared order, whatever order the
//! selection list used.

use crate::{ComputeError, ComputeResult};

/// Upper bound on stages per pipeline.
pub const MAX_STAGES: usize = 31;

const ALL_SENTINEL: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageMask {
    bits: u32,
}

impl StageMask {
    /// Every stage enabled.
    pub const fn all() -> Self {
        Self { bits: ALL_SENTINEL }
    }

    /// Enables exactly the listed 1-based stage indices.
    ///
    /// # Errors
    ///
    /// `Configuration` if an index is 0 or above `stage_count`.
    pub fn from_indices(indices: &[usize], stage_count: usize) -> ComputeResult<Self> {
        let mut bits = 0u32;
        for &i in indices {
            if i == 0 || i > stage_count || i > MAX_STAGES {
                return Err(ComputeError::configuration(format!(
                    "no stage with index {i} ({stage_count} stages available)"
                )));
            }
            bits |= 1 << i;
        }
        Ok(Self { bits })
    }

    /// Parses a comma-separated list such as `"1,3,4"`.
    ///
    /// # Errors
    ///
    /// `Configuration` if the list names no stage, or an entry is not a
    /// valid index.
    pub fn parse(list: &str, stage_count: usize) -> ComputeResult<Self> {
        let indices = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<usize>().map_err(|_| {
                    ComputeError::configuration(format!("invalid stage index '{s}'"))
                })
            })
            .collect::<ComputeResult<Vec<_>>>()?;
        if indices.is_empty() {
            return Err(ComputeError::configuration("stage list is empty"));
        }
        Self::from_indices(&indices, stage_count)
    }

    /// Whether stage `index` (1-based) runs.
    #[inline]
    pub fn is_enabled(&self, index: usize) -> bool {
        self.bits & ALL_SENTINEL != 0 || (index <= MAX_STAGES && self.bits & (1 << index) != 0)
    }

    /// Whether all `stage_count` stages run.
    pub fn runs_all(&self, stage_count: usize) -> bool {
        (1..=stage_count).all(|i| self.is_enabled(i))
    }

    /// Enabled stage indices in declared order.
    pub fn enabled(&self, stage_count: usize) -> impl Iterator<Item = usize> + '_ {
        (1..=stage_count).filter(move |&i| self.is_enabled(i))
    }
}

impl Default for StageMask {
    fn default() -> Self {
        Self::all()
    }
}
