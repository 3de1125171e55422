//! Pixel-by-pixel comparison of GPU output against the reference.

use hdr_core::{ImageSize, NUM_CHANNELS};
use tracing::trace;

use crate::status::Reporter;

/// Comparison settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verifier {
    /// Largest absolute channel difference still counted as a match.
    pub tolerance: f32,
    /// Mismatches reported individually, as a fraction of the pixel count.
    pub max_error_fraction: f32,
}

impl Default for Verifier {
    fn default() -> Self {
        Self {
            tolerance: 1.0,
            max_error_fraction: 0.05,
        }
    }
}

/// Outcome of one comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationReport {
    pub mismatches: usize,
    pub max_difference: u8,
}

impl VerificationReport {
    #[inline]
    pub fn passed(&self) -> bool {
        self.mismatches == 0
    }
}

impl std::fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.passed() {
            write!(f, "Verification passed")
        } else {
            write!(
                f,
                "Verification failed: {} mismatches (max difference {})",
                self.mismatches, self.max_difference
            )
        }
    }
}

impl Verifier {
    /// Number of mismatches reported individually for `size`.
    pub fn max_reported(&self, size: ImageSize) -> usize {
        (size.pixel_count() as f64 * self.max_error_fraction as f64) as usize
    }

    /// Compares every channel of every pixel.
    pub fn compare(
        &self,
        reference: &[u8],
        output: &[u8],
        size: ImageSize,
        reporter: &Reporter,
    ) -> VerificationReport {
        trace!(size = %size, tolerance = self.tolerance, "Verifier::compare");
        let limit = self.max_reported(size);
        let width = size.width as usize;
        let mut mismatches = 0usize;
        let mut max_difference = 0u8;

        for (i, (&r, &o)) in reference.iter().zip(output.iter()).enumerate() {
            let diff = r.abs_diff(o);
            if diff as f32 <= self.tolerance {
                continue;
            }
            max_difference = max_difference.max(diff);
            if mismatches < limit {
                let pixel = i / NUM_CHANNELS;
                reporter.error(format!(
                    "Mismatch at ({},{},{}): {r} vs {o}",
                    pixel % width,
                    pixel / width,
                    i % NUM_CHANNELS
                ));
            }
            mismatches += 1;
            if mismatches == limit {
                reporter.error("Supressing further errors");
            }
        }

        VerificationReport {
            mismatches,
            max_difference,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Severity;
    use std::sync::{Arc, Mutex};

    fn collecting() -> (Reporter, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        let reporter = Reporter::new(Arc::new(move |_: Severity, msg: &str| {
            captured.lock().unwrap().push(msg.to_string());
        }));
        (reporter, lines)
    }

    #[test]
    fn test_within_tolerance_passes() {
        let size = ImageSize::new(2, 1).unwrap();
        let (reporter, lines) = collecting();
        let report = Verifier::default().compare(
            &[10, 20, 30, 255, 0, 0, 0, 255],
            &[11, 19, 30, 255, 1, 0, 0, 255],
            size,
            &reporter,
        );
        assert!(report.passed());
        assert!(lines.lock().unwrap().is_empty());
    }

    #[test]
    fn test_mismatch_location() {
        let size = ImageSize::new(2, 2).unwrap();
        let reference = vec![100u8; 16];
        let mut output = reference.clone();
        output[3 * 4 + 2] = 90;
        let (reporter, lines) = collecting();
        let verifier = Verifier {
            max_error_fraction: 1.0,
            ..Verifier::default()
        };
        let report = verifier.compare(&reference, &output, size, &reporter);
        assert_eq!(report.mismatches, 1);
        assert_eq!(report.max_difference, 10);
        assert_eq!(lines.lock().unwrap()[0], "Mismatch at (1,1,2): 100 vs 90");
    }

    #[test]
    fn test_suppression_after_cap() {
        // 100 px at 0.05 reports 5 mismatches.
        let size = ImageSize::new(10, 10).unwrap();
        let reference = vec![0u8; size.byte_len()];
        let output = vec![50u8; size.byte_len()];
        let (reporter, lines) = collecting();
        let report = Verifier::default().compare(&reference, &output, size, &reporter);

        assert_eq!(report.mismatches, size.byte_len());
        assert!(!report.passed());
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[5], "Supressing further errors");
    }
}
