//! CPU reference tone-mapping operators.
//!
//! Each operator reads an RGBA8 buffer and writes one of the same size. Rows
//! are processed in parallel with rayon; every pixel writes only its own four
//! bytes, so no synchronisation is needed beyond the read-only input.
//!
//! | Operator | Entry point | Tunables |
//! |----------|-------------|----------|
//! | Histogram equalisation | [`hist_eq`] | none |
//! | Global Reinhard | [`reinhard_global`] | [`ReinhardGlobalParams`] |
//! | Local Reinhard | [`reinhard_local`] | [`ReinhardLocalParams`] |
//! | Gradient-domain compression | [`grad_dom`] | [`GradDomParams`] |
//!
//! The GPU kernels in `hdr-compute` evaluate the same expressions in the same
//! order so the two paths agree to within one 8-bit step.

mod grad_dom;
mod histeq;
mod reinhard;

pub use grad_dom::{
    attenuated_gradients, attenuation, attenuation_scale, divergence, grad_dom,
    gradient_magnitudes, level_alphas, log_luminance, solve_poisson, GradDomParams,
    PoissonSolution,
};
pub use histeq::{cumulative, equalize_value, hist_eq, histogram, HIST_EQ_MAX_PIXELS};
pub use reinhard::{
    global_operator, local_adaptation, luminance_stats, reinhard_global, reinhard_local,
    scale_constants, LuminanceStats, ReinhardGlobalParams, ReinhardLocalParams,
};

use crate::image::quantize;
use crate::NUM_CHANNELS;
use glam::Vec3;

/// Added to luminance before taking its logarithm.
pub const LOG_EPSILON: f32 = 0.000001;

/// `(c / lum)^saturation` per channel; zero where the ratio is not positive.
#[inline]
pub fn chroma_ratio(rgb: Vec3, lum: f32, saturation: f32) -> Vec3 {
    let ratio = |c: f32| {
        let r = c / lum;
        if r > 0.0 { r.powf(saturation) } else { 0.0 }
    };
    Vec3::new(ratio(rgb.x), ratio(rgb.y), ratio(rgb.z))
}

/// Writes RGB to one output pixel and copies alpha from the input pixel.
#[inline]
pub(crate) fn store_rgb(out: &mut [u8], rgb: Vec3, src: &[u8]) {
    out[0] = quantize(rgb.x);
    out[1] = quantize(rgb.y);
    out[2] = quantize(rgb.z);
    out[NUM_CHANNELS - 1] = src[NUM_CHANNELS - 1];
}

pub(crate) fn check_positive(name: &'static str, value: f32) -> crate::Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(crate::Error::invalid_parameter(
            name,
            format!("must be positive and finite, got {value}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chroma_ratio_of_grey_is_one() {
        let r = chroma_ratio(Vec3::splat(80.0), 80.0, 1.6);
        assert_eq!(r, Vec3::ONE);
    }

    #[test]
    fn test_chroma_ratio_zero_channel() {
        let r = chroma_ratio(Vec3::new(0.0, 10.0, 0.0), 7.152, 0.5);
        assert_eq!(r.x, 0.0);
        assert_eq!(r.z, 0.0);
        assert!(r.y > 1.0);
    }

    #[test]
    fn test_check_positive() {
        assert!(check_positive("key", 0.18).is_ok());
        assert!(check_positive("key", 0.0).is_err());
        assert!(check_positive("key", f32::NAN).is_err());
    }
}
