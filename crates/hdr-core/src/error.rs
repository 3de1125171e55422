//! Error types for hdr-core operations.
//!
//! Every reference operator validates its buffers and tunables up front and
//! reports problems through [`Error`] rather than panicking mid-image.
//!
//! # Usage
//!
//! ```rust
//! use hdr_core::{Error, ImageSize, Result};
//!
//! fn check(size: ImageSize, buf: &[u8]) -> Result<()> {
//!     if buf.len() != size.byte_len() {
//!         return Err(Error::buffer_size(size.byte_len(), buf.len()));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Result type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while preparing or running a tone-mapping operator.
///
/// # Categories
///
/// - **Dimension errors**: [`InvalidDimensions`](Error::InvalidDimensions),
///   [`ImageTooLarge`](Error::ImageTooLarge)
/// - **Buffer errors**: [`BufferSize`](Error::BufferSize)
/// - **Parameter errors**: [`InvalidParameter`](Error::InvalidParameter)
#[derive(Debug, Error)]
pub enum Error {
    /// Width or height is zero, or the byte size overflows `usize`.
    #[error("invalid dimensions: {width}x{height} ({reason})")]
    InvalidDimensions {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
        /// Reason why dimensions are invalid
        reason: String,
    },

    /// A pixel buffer does not hold exactly `width * height * 4` bytes.
    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSize {
        /// Bytes required by the image size
        expected: usize,
        /// Bytes actually supplied
        actual: usize,
    },

    /// The image has more pixels than an operator's integer arithmetic allows.
    ///
    /// Histogram equalisation evaluates `255 * count` in 32-bit unsigned
    /// arithmetic on both paths, which bounds the pixel count.
    #[error("image of {pixels} pixels exceeds the {limit} pixel limit of {operator}")]
    ImageTooLarge {
        /// Operator name
        operator: &'static str,
        /// Pixels in the image
        pixels: u64,
        /// Largest supported pixel count
        limit: u64,
    },

    /// A tunable is outside its valid range (NaN, non-positive, ...).
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter {
        /// Parameter name
        name: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

impl Error {
    /// Creates an [`Error::InvalidDimensions`] error.
    #[inline]
    pub fn invalid_dimensions(width: u32, height: u32, reason: impl Into<String>) -> Self {
        Self::InvalidDimensions {
            width,
            height,
            reason: reason.into(),
        }
    }

    /// Creates an [`Error::BufferSize`] error.
    #[inline]
    pub fn buffer_size(expected: usize, actual: usize) -> Self {
        Self::BufferSize { expected, actual }
    }

    /// Creates an [`Error::InvalidParameter`] error.
    #[inline]
    pub fn invalid_parameter(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    /// Returns `true` if the error concerns image geometry or buffer length.
    #[inline]
    pub fn is_size_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidDimensions { .. } | Self::BufferSize { .. } | Self::ImageTooLarge { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_size_message() {
        let err = Error::buffer_size(64, 60);
        let msg = err.to_string();
        assert!(msg.contains("64"));
        assert!(msg.contains("60"));
        assert!(err.is_size_error());
    }

    #[test]
    fn test_invalid_parameter() {
        let err = Error::invalid_parameter("key", "must be positive");
        assert!(err.to_string().contains("'key'"));
        assert!(!err.is_size_error());
    }

    #[test]
    fn test_too_large() {
        let err = Error::ImageTooLarge {
            operator: "histEq",
            pixels: 20_000_000,
            limit: 16_843_009,
        };
        assert!(err.to_string().contains("histEq"));
    }
}
