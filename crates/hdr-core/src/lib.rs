//! # hdr-core
//!
//! Image model, colour math and CPU reference implementations of four HDR
//! tone-mapping operators.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        tonemap                           │
//! │  hist_eq   reinhard_global   reinhard_local   grad_dom   │
//! └───────┬──────────────┬───────────────┬───────────────────┘
//!         │              │               │
//!   ┌─────▼─────┐  ┌─────▼─────┐  ┌──────▼──────┐
//!   │   color   │  │   image   │  │   pyramid   │
//!   │ HSV, XYZ  │  │ RGBA8,    │  │ flat mip    │
//!   │ luminance │  │ clamping  │  │ levels      │
//!   └───────────┘  └───────────┘  └─────────────┘
//! ```
//!
//! The reference operators are the ground truth that `hdr-compute` checks its
//! GPU kernels against. They run row-parallel on rayon's global pool.
//!
//! # Example
//!
//! ```rust
//! use hdr_core::{Image, tonemap};
//!
//! let input = Image::filled(4, 4, [128, 128, 128, 255]).unwrap();
//! let mut output = Image::new(4, 4).unwrap();
//! tonemap::reinhard_global(
//!     input.as_bytes(),
//!     output.as_bytes_mut(),
//!     input.size(),
//!     &tonemap::ReinhardGlobalParams::default(),
//! ).unwrap();
//! assert!(output.pixel(0, 0)[0] < 255);
//! ```

pub mod color;
pub mod error;
pub mod image;
pub mod pyramid;
pub mod tonemap;

pub use error::{Error, Result};
pub use image::{Image, ImageSize};
pub use pyramid::{LevelRule, MipLevel, MipPyramid};

/// Largest 8-bit channel value.
pub const PIXEL_RANGE: f32 = 255.0;

/// Interleaved channels per pixel (RGBA).
pub const NUM_CHANNELS: usize = 4;

/// Brightness histogram bins, one per 8-bit value.
pub const HIST_SIZE: usize = PIXEL_RANGE as usize + 1;
