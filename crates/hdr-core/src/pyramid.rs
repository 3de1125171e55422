//! Mip pyramid metadata over a single flat `f32` backing buffer.
//!
//! Level `k` has dimensions `(width >> k, height >> k)` and starts at
//! `offset` in the backing buffer:
//!
//! ```text
//!   [ level 0: w*h ][ level 1: (w/2)*(h/2) ][ level 2 ] ...
//! ```
//!
//! The same layout is uploaded to the GPU, so level indexing is identical on
//! both paths.

use crate::color::clamp;
use crate::image::ImageSize;
use rayon::prelude::*;

/// Smallest side kept by the gradient-domain pyramid.
pub const GRAD_DOM_MIN_SIZE: u32 = 32;

/// One level of a pyramid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MipLevel {
    pub width: u32,
    pub height: u32,
    /// First element of this level in the backing buffer.
    pub offset: usize,
    /// `2^(k+1)`, the central-difference scale at level `k`.
    pub divider: f32,
}

impl MipLevel {
    #[inline]
    pub fn len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index into the backing buffer, with coordinates clamped into the level.
    #[inline]
    pub fn clamped_index(&self, x: i64, y: i64) -> usize {
        let cx = clamp(x, 0, self.width as i64 - 1) as usize;
        let cy = clamp(y, 0, self.height as i64 - 1) as usize;
        self.offset + cy * self.width as usize + cx
    }
}

/// How many levels a pyramid gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelRule {
    /// Keep halving while both sides stay at or above the bound.
    /// The base level is always present.
    MinSize(u32),
    /// A fixed count, capped so the coarsest level is at least 1x1.
    Fixed(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MipPyramid {
    levels: Vec<MipLevel>,
    len: usize,
}

impl MipPyramid {
    pub fn new(size: ImageSize, rule: LevelRule) -> Self {
        let count = match rule {
            LevelRule::MinSize(min) => {
                let mut n = 0;
                let (mut w, mut h) = (size.width, size.height);
                while w >= min && h >= min {
                    n += 1;
                    w /= 2;
                    h /= 2;
                }
                n.max(1)
            }
            LevelRule::Fixed(n) => {
                let smallest = size.width.min(size.height);
                let available = (u32::BITS - smallest.leading_zeros()) as usize;
                n.clamp(1, available)
            }
        };

        let mut levels = Vec::with_capacity(count);
        let mut offset = 0;
        for k in 0..count {
            let level = MipLevel {
                width: size.width >> k,
                height: size.height >> k,
                offset,
                divider: 2f32.powi(k as i32 + 1),
            };
            offset += level.len();
            levels.push(level);
        }
        Self { levels, len: offset }
    }

    #[inline]
    pub fn levels(&self) -> &[MipLevel] {
        &self.levels
    }

    #[inline]
    pub fn level(&self, k: usize) -> &MipLevel {
        &self.levels[k]
    }

    #[inline]
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    #[inline]
    pub fn coarsest(&self) -> &MipLevel {
        &self.levels[self.levels.len() - 1]
    }

    /// Total number of elements across all levels.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocates a zeroed backing buffer.
    pub fn alloc(&self) -> Vec<f32> {
        vec![0.0; self.len]
    }

    /// Slice of `buf` holding level `k`.
    pub fn level_slice<'a>(&self, buf: &'a [f32], k: usize) -> &'a [f32] {
        let l = &self.levels[k];
        &buf[l.offset..l.offset + l.len()]
    }

    /// Reads level `k` at `(x, y)` with edge replication.
    #[inline]
    pub fn get_value(&self, buf: &[f32], k: usize, x: i64, y: i64) -> f32 {
        buf[self.levels[k].clamped_index(x, y)]
    }

    /// Fills levels `1..` from level 0 by repeated 2x2 box filtering.
    pub fn build(&self, buf: &mut [f32]) {
        for k in 1..self.levels.len() {
            let src = self.levels[k - 1];
            let dst = self.levels[k];
            let (head, tail) = buf.split_at_mut(dst.offset);
            mipmap(
                &head[src.offset..src.offset + src.len()],
                src.width,
                &mut tail[..dst.len()],
                dst.width,
            );
        }
    }
}

/// Downsamples `src` (row length `src_width`) into `dst` by averaging 2x2 blocks.
///
/// `dst` pixel `(x, y)` averages the block whose top-left is `(2x, 2y)`.
pub fn mipmap(src: &[f32], src_width: u32, dst: &mut [f32], dst_width: u32) {
    if dst_width == 0 {
        return;
    }
    let sw = src_width as usize;
    dst.par_chunks_mut(dst_width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let top = 2 * y * sw;
            let bottom = top + sw;
            for (x, out) in row.iter_mut().enumerate() {
                let a = src[top + 2 * x];
                let b = src[top + 2 * x + 1];
                let c = src[bottom + 2 * x];
                let d = src[bottom + 2 * x + 1];
                *out = (a + b + c + d) / 4.0;
            }
        });
}
