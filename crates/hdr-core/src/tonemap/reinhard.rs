//! Reinhard photographic tone reproduction, global and local variants.

use crate::color::rgb_to_xyz;
use crate::error::{Error, Result};
use crate::image::{rgb, ImageSize};
use crate::pyramid::{LevelRule, MipPyramid};
use crate::tonemap::{check_positive, chroma_ratio, store_rgb, LOG_EPSILON};
use crate::{NUM_CHANNELS, PIXEL_RANGE};
use glam::Vec3;
use rayon::prelude::*;
use tracing::{debug, trace};

/// Tunables of the global operator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReinhardGlobalParams {
    /// Target middle-grey of the scaled image.
    pub key: f32,
    /// Chrominance exponent.
    pub saturation: f32,
}

impl Default for ReinhardGlobalParams {
    fn default() -> Self {
        Self {
            key: 0.18,
            saturation: 1.6,
        }
    }
}

impl ReinhardGlobalParams {
    pub fn validate(&self) -> Result<()> {
        check_positive("key", self.key)?;
        check_positive("saturation", self.saturation)
    }
}

/// Tunables of the local (dodging-and-burning) operator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReinhardLocalParams {
    pub key: f32,
    pub saturation: f32,
    /// Contrast threshold that stops the centre/surround walk.
    pub epsilon: f32,
    /// Sharpening exponent in the per-level scale constant.
    pub phi: f32,
    /// Requested pyramid levels, capped by image size.
    pub levels: usize,
}

impl Default for ReinhardLocalParams {
    fn default() -> Self {
        Self {
            key: 0.18,
            saturation: 1.6,
            epsilon: 0.05,
            phi: 8.0,
            levels: 8,
        }
    }
}

impl ReinhardLocalParams {
    pub fn validate(&self) -> Result<()> {
        check_positive("key", self.key)?;
        check_positive("saturation", self.saturation)?;
        check_positive("epsilon", self.epsilon)?;
        if !self.phi.is_finite() {
            return Err(Error::invalid_parameter("phi", "must be finite"));
        }
        if self.levels == 0 {
            return Err(Error::invalid_parameter("levels", "need at least one level"));
        }
        Ok(())
    }

    /// The luminance pyramid used for an image of `size`.
    pub fn pyramid(&self, size: ImageSize) -> MipPyramid {
        MipPyramid::new(size, LevelRule::Fixed(self.levels))
    }
}

/// Log-average and maximum of the image luminance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LuminanceStats {
    /// `exp(mean(log(Y + 1e-6)))`
    pub log_average: f32,
    /// Largest Y, the white point of the global operator.
    pub max: f32,
}

pub fn luminance_stats(input: &[u8], size: ImageSize) -> LuminanceStats {
    let (sum, max) = input
        .par_chunks(NUM_CHANNELS)
        .fold(
            || (0f64, 0f32),
            |(sum, max), px| {
                let y = rgb_to_xyz(rgb(px)).y;
                (sum + (y + LOG_EPSILON).ln() as f64, max.max(y))
            },
        )
        .reduce(|| (0f64, 0f32), |a, b| (a.0 + b.0, a.1.max(b.1)));

    LuminanceStats {
        log_average: (sum / size.pixel_count() as f64).exp() as f32,
        max,
    }
}

/// `Ld = L (1 + L / Lwhite²) / (1 + L)`
#[inline]
pub fn global_operator(l: f32, l_white: f32) -> f32 {
    l * (1.0 + l / (l_white * l_white)) / (1.0 + l)
}

/// Applies the global operator.
pub fn reinhard_global(
    input: &[u8],
    output: &mut [u8],
    size: ImageSize,
    params: &ReinhardGlobalParams,
) -> Result<()> {
    trace!(size = %size, key = params.key, sat = params.saturation, "tonemap::reinhard_global");
    size.check_buffers(input, output)?;
    params.validate()?;

    let stats = luminance_stats(input, size);
    debug!(log_average = stats.log_average, l_white = stats.max, "luminance stats");
    let scale = params.key / stats.log_average;

    output
        .par_chunks_mut(NUM_CHANNELS)
        .zip(input.par_chunks(NUM_CHANNELS))
        .for_each(|(out, src)| {
            let c = rgb(src);
            let lum = rgb_to_xyz(c).y;
            if lum <= 0.0 {
                store_rgb(out, Vec3::ZERO, src);
                return;
            }
            let ld = global_operator(scale * lum, stats.max);
            store_rgb(out, chroma_ratio(c, lum, params.saturation) * ld * PIXEL_RANGE, src);
        });
    Ok(())
}

/// Per-level scale constants `2^phi * key / (2^i)²`, one per adjacent level pair.
pub fn scale_constants(params: &ReinhardLocalParams, levels: usize) -> Vec<f32> {
    let numerator = 2f32.powf(params.phi) * params.key;
    (0..levels.saturating_sub(1))
        .map(|i| numerator / 4f32.powi(i as i32))
        .collect()
}

/// Walks from the finest level towards the coarsest and returns the scaled
/// luminance of the largest neighbourhood without a strong contrast edge.
///
/// `lums` holds the plain luminance pyramid; values are multiplied by
/// `factor` (key over log-average) as they are read.
pub fn local_adaptation(
    pyramid: &MipPyramid,
    lums: &[f32],
    x: i64,
    y: i64,
    factor: f32,
    scales: &[f32],
    epsilon: f32,
) -> f32 {
    let mut local = pyramid.get_value(lums, 0, x, y) * factor;
    for i in 0..pyramid.num_levels() - 1 {
        let centre = pyramid.get_value(lums, i, x >> i, y >> i) * factor;
        let surround = pyramid.get_value(lums, i + 1, x >> (i + 1), y >> (i + 1)) * factor;
        let contrast = (centre - surround).abs() / (scales[i] + centre);
        if contrast > epsilon {
            local = centre;
            break;
        }
        local = surround;
    }
    local
}

/// Applies the local operator over a luminance pyramid.
pub fn reinhard_local(
    input: &[u8],
    output: &mut [u8],
    size: ImageSize,
    params: &ReinhardLocalParams,
) -> Result<()> {
    trace!(size = %size, levels = params.levels, "tonemap::reinhard_local");
    size.check_buffers(input, output)?;
    params.validate()?;

    let pyramid = params.pyramid(size);
    let mut lums = pyramid.alloc();
    lums[..size.pixel_count()]
        .par_iter_mut()
        .zip(input.par_chunks(NUM_CHANNELS))
        .for_each(|(l, px)| *l = rgb_to_xyz(rgb(px)).y);
    pyramid.build(&mut lums);

    let stats = luminance_stats(input, size);
    let factor = params.key / stats.log_average;
    let scales = scale_constants(params, pyramid.num_levels());
    debug!(levels = pyramid.num_levels(), factor, "local pyramid ready");

    let w = size.width as usize;
    output
        .par_chunks_mut(w * NUM_CHANNELS)
        .zip(input.par_chunks(w * NUM_CHANNELS))
        .enumerate()
        .for_each(|(y, (out_row, src_row))| {
            for x in 0..w {
                let px = x * NUM_CHANNELS..(x + 1) * NUM_CHANNELS;
                let (out, src) = (&mut out_row[px.clone()], &src_row[px]);
                let lum = lums[y * w + x];
                if lum <= 0.0 {
                    store_rgb(out, Vec3::ZERO, src);
                    continue;
                }
                let local = local_adaptation(
                    &pyramid,
                    &lums,
                    x as i64,
                    y as i64,
                    factor,
                    &scales,
                    params.epsilon,
                );
                let ld = lum * factor / (1.0 + local);
                store_rgb(out, chroma_ratio(rgb(src), lum, params.saturation) * ld * PIXEL_RANGE, src);
            }
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grey(w: u32, h: u32, v: u8) -> Vec<u8> {
        [v, v, v, 255].repeat((w * h) as usize)
    }

    #[test]
    fn test_stats_of_constant_image() {
        let size = ImageSize::new(4, 4).unwrap();
        let stats = luminance_stats(&grey(4, 4, 100), size);
        assert_relative_eq!(stats.log_average, 100.0, max_relative = 1e-4);
        assert_relative_eq!(stats.max, 100.0, max_relative = 1e-5);
    }

    #[test]
    fn test_global_operator_monotonic() {
        let mut prev = 0.0;
        for i in 1..100 {
            let ld = global_operator(i as f32 * 0.05, 2.0);
            assert!(ld > prev);
            prev = ld;
        }
        assert_relative_eq!(global_operator(2.0, 2.0), 1.0);
    }

    #[test]
    fn test_scale_constants() {
        let p = ReinhardLocalParams::default();
        let k = scale_constants(&p, 4);
        assert_eq!(k.len(), 3);
        assert_relative_eq!(k[0], 256.0 * 0.18);
        assert_relative_eq!(k[1], 256.0 * 0.18 / 4.0);
        assert_relative_eq!(k[2], 256.0 * 0.18 / 16.0);
    }

    #[test]
    fn test_local_on_constant_image_matches_global_shape() {
        let size = ImageSize::new(16, 16).unwrap();
        let input = grey(16, 16, 90);
        let mut output = vec![0u8; input.len()];
        reinhard_local(&input, &mut output, size, &ReinhardLocalParams::default()).unwrap();
        let first = &output[..4];
        assert!(output.chunks_exact(4).all(|p| p == first));
        // L = 0.18 everywhere, local = 0.18, Ld = 0.18 / 1.18
        let expected = (0.18f32 / 1.18 * 255.0) as u8;
        assert!((first[0] as i32 - expected as i32).abs() <= 1);
        assert_eq!(first[3], 255);
    }

    #[test]
    fn test_black_pixels_stay_black() {
        let size = ImageSize::new(2, 1).unwrap();
        let input = [0, 0, 0, 9, 200, 100, 50, 9];
        let mut output = [1u8; 8];
        reinhard_global(&input, &mut output, size, &ReinhardGlobalParams::default()).unwrap();
        assert_eq!(&output[..4], &[0, 0, 0, 9]);
    }

    #[test]
    fn test_rejects_bad_params() {
        let size = ImageSize::new(1, 1).unwrap();
        let mut out = [0u8; 4];
        let p = ReinhardGlobalParams { key: -1.0, ..Default::default() };
        assert!(reinhard_global(&[1, 2, 3, 4], &mut out, size, &p).is_err());
    }
}
