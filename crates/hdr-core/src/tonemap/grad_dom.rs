//! Gradient-domain HDR compression.
//!
//! ```text
//!   log Y ──► pyramid ──► |∇| per level ──► attenuation Φ (coarse → fine)
//!     │                                          │
//!     └──► forward ∇ ─────────── × Φ₀ ──► div G ─┴─► Poisson solve ──► exp
//! ```

use crate::color::luminance;
use crate::error::{Error, Result};
use crate::image::{rgb, ImageSize};
use crate::pyramid::{LevelRule, MipPyramid, GRAD_DOM_MIN_SIZE};
use crate::tonemap::{check_positive, chroma_ratio, store_rgb, LOG_EPSILON};
use crate::NUM_CHANNELS;
use rayon::prelude::*;
use tracing::{debug, trace};

/// Tunables of gradient-domain compression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradDomParams {
    /// Multiplier on `exp(mean gradient)` giving the per-level alpha.
    pub adjust_alpha: f32,
    /// Attenuation exponent; below 1 compresses large gradients.
    pub beta: f32,
    pub saturation: f32,
    /// Per-pixel change below which a pixel counts as converged.
    pub threshold: f32,
    /// Fraction of pixels that must converge before the solve stops.
    pub converged_fraction: f32,
    pub max_iterations: u32,
    /// Pyramid levels continue while both sides are at least this large.
    pub min_level_size: u32,
}

impl Default for GradDomParams {
    fn default() -> Self {
        Self {
            adjust_alpha: 0.1,
            beta: 0.85,
            saturation: 0.5,
            threshold: 0.0005,
            converged_fraction: 0.9,
            max_iterations: 10_000,
            min_level_size: GRAD_DOM_MIN_SIZE,
        }
    }
}

impl GradDomParams {
    pub fn validate(&self) -> Result<()> {
        check_positive("adjust_alpha", self.adjust_alpha)?;
        check_positive("beta", self.beta)?;
        check_positive("saturation", self.saturation)?;
        check_positive("threshold", self.threshold)?;
        if !(self.converged_fraction > 0.0 && self.converged_fraction <= 1.0) {
            return Err(Error::invalid_parameter(
                "converged_fraction",
                format!("must be in (0, 1], got {}", self.converged_fraction),
            ));
        }
        if self.max_iterations == 0 {
            return Err(Error::invalid_parameter("max_iterations", "must be at least 1"));
        }
        if self.min_level_size == 0 {
            return Err(Error::invalid_parameter("min_level_size", "must be at least 1"));
        }
        Ok(())
    }

    pub fn pyramid(&self, size: ImageSize) -> MipPyramid {
        MipPyramid::new(size, LevelRule::MinSize(self.min_level_size))
    }

    /// Number of converged pixels that ends the solve.
    pub fn converged_target(&self, pixels: usize) -> u32 {
        (pixels as f64 * self.converged_fraction as f64).ceil() as u32
    }
}

/// Writes `log(Y + 1e-6)` of every pixel into `out`.
pub fn log_luminance(input: &[u8], out: &mut [f32]) {
    out.par_iter_mut()
        .zip(input.par_chunks(NUM_CHANNELS))
        .for_each(|(l, px)| *l = (luminance(rgb(px)) + LOG_EPSILON).ln());
}

/// Central-difference gradient magnitude of every level, scaled by `1 / 2^(k+1)`.
///
/// `lums` and `grads` share the pyramid layout.
pub fn gradient_magnitudes(pyramid: &MipPyramid, lums: &[f32], grads: &mut [f32]) {
    for (k, level) in pyramid.levels().iter().enumerate() {
        let w = level.width as usize;
        let dst = &mut grads[level.offset..level.offset + level.len()];
        dst.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
            let y = y as i64;
            for (x, g) in row.iter_mut().enumerate() {
                let x = x as i64;
                let gx = (pyramid.get_value(lums, k, x - 1, y) - pyramid.get_value(lums, k, x + 1, y))
                    / level.divider;
                let gy = (pyramid.get_value(lums, k, x, y + 1) - pyramid.get_value(lums, k, x, y - 1))
                    / level.divider;
                *g = (gx * gx + gy * gy).sqrt();
            }
        });
    }
}

/// `adjust_alpha * exp(mean |∇|)` for each level.
pub fn level_alphas(pyramid: &MipPyramid, grads: &[f32], adjust_alpha: f32) -> Vec<f32> {
    (0..pyramid.num_levels())
        .map(|k| {
            let level = pyramid.level_slice(grads, k);
            let sum: f64 = level.par_iter().map(|&g| g as f64).sum();
            adjust_alpha * (sum / level.len() as f64).exp() as f32
        })
        .collect()
}

/// `(α / g) · (g / α)^β`, or 0 for a flat pixel.
#[inline]
pub fn attenuation_scale(g: f32, alpha: f32, beta: f32) -> f32 {
    if g == 0.0 {
        0.0
    } else {
        (alpha / g) * (g / alpha).powf(beta)
    }
}

/// Builds the attenuation pyramid from the coarsest level down to level 0.
///
/// The coarsest level is the plain per-pixel scale. Each finer level takes a
/// 9/3/3/1 weighted sample of the coarser map around `(x/2, y/2)`, leaning
/// towards the side of the fine pixel, and multiplies it by its own scale.
pub fn attenuation(pyramid: &MipPyramid, grads: &[f32], alphas: &[f32], beta: f32) -> Vec<f32> {
    let mut atten = pyramid.alloc();
    let last = pyramid.num_levels() - 1;
    let coarsest = pyramid.coarsest();
    atten[coarsest.offset..coarsest.offset + coarsest.len()]
        .par_iter_mut()
        .zip(pyramid.level_slice(grads, last).par_iter())
        .for_each(|(a, &g)| *a = attenuation_scale(g, alphas[last], beta));

    for k in (0..last).rev() {
        let fine = *pyramid.level(k);
        let coarse = *pyramid.level(k + 1);
        let (head, tail) = atten.split_at_mut(coarse.offset);
        let coarse_map = &tail[..coarse.len()];
        let fine_map = &mut head[fine.offset..fine.offset + fine.len()];
        let grads = pyramid.level_slice(grads, k);
        let alpha = alphas[k];

        fine_map
            .par_chunks_mut(fine.width as usize)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, a) in row.iter_mut().enumerate() {
                    let g = grads[y * fine.width as usize + x];
                    if g == 0.0 {
                        *a = 0.0;
                        continue;
                    }
                    let up = upsample_weighted(
                        coarse_map,
                        coarse.width as i64,
                        coarse.height as i64,
                        x as i64,
                        y as i64,
                    );
                    *a = (1.0 / 16.0) * up * attenuation_scale(g, alpha, beta);
                }
            });
    }
    atten
}

/// 9/3/3/1 sample of a coarse map for fine pixel `(x, y)`; weights sum to 16.
fn upsample_weighted(coarse: &[f32], cw: i64, ch: i64, x: i64, y: i64) -> f32 {
    let (mut cx, mut cy) = (x / 2, y / 2);
    let mut nx = if x & 1 == 1 { 1 } else { -1 };
    let mut ny = if y & 1 == 1 { 1 } else { -1 };
    if cx + nx < 0 || cx + nx >= cw {
        nx = 0;
    }
    if cy + ny < 0 || cy + ny >= ch {
        ny = 0;
    }
    if cx == cw {
        cx -= 1;
    }
    if cy == ch {
        cy -= 1;
    }
    let at = |px: i64, py: i64| coarse[(py.clamp(0, ch - 1) * cw + px.clamp(0, cw - 1)) as usize];
    9.0 * at(cx, cy) + 3.0 * at(cx + nx, cy) + 3.0 * at(cx, cy + ny) + 1.0 * at(cx + nx, cy + ny)
}

/// Forward-difference gradients of level-0 log luminance times the finest
/// attenuation map. Zero on the last column (x) and last row (y).
pub fn attenuated_gradients(size: ImageSize, lums: &[f32], atten: &[f32]) -> (Vec<f32>, Vec<f32>) {
    let (w, h) = (size.width as usize, size.height as usize);
    let n = size.pixel_count();
    let mut gx = vec![0.0; n];
    let mut gy = vec![0.0; n];
    gx.par_chunks_mut(w)
        .zip(gy.par_chunks_mut(w))
        .enumerate()
        .for_each(|(y, (row_x, row_y))| {
            for x in 0..w {
                let i = y * w + x;
                let dx = if x + 1 < w { lums[i + 1] - lums[i] } else { 0.0 };
                let dy = if y + 1 < h { lums[i + w] - lums[i] } else { 0.0 };
                row_x[x] = dx * atten[i];
                row_y[x] = dy * atten[i];
            }
        });
    (gx, gy)
}

/// Backward-difference divergence. Row 0 drops the y term, column 0 the x term.
pub fn divergence(size: ImageSize, gx: &[f32], gy: &[f32]) -> Vec<f32> {
    let w = size.width as usize;
    let mut div = vec![0.0; size.pixel_count()];
    div.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        for (x, d) in row.iter_mut().enumerate() {
            let i = y * w + x;
            let ddx = if x > 0 { gx[i] - gx[i - 1] } else { 0.0 };
            let ddy = if y > 0 { gy[i] - gy[i - w] } else { 0.0 };
            *d = match (x > 0, y > 0) {
                (true, true) => ddx + ddy,
                (true, false) => ddx,
                (false, true) => ddy,
                (false, false) => 0.0,
            };
        }
    });
    div
}

/// Result of [`solve_poisson`].
#[derive(Debug, Clone)]
pub struct PoissonSolution {
    pub field: Vec<f32>,
    pub iterations: u32,
    pub converged: u32,
}

/// Jacobi relaxation of `∇²I = div` with zero values outside the image.
///
/// Each iteration sets every unconverged pixel to
/// `0.25 * (west + east + north + south - div)` from the previous iterate.
/// A pixel whose change drops below the threshold is marked converged and
/// carries its value forward from then on. Stops once the converged count
/// reaches [`GradDomParams::converged_target`] or after `max_iterations`.
pub fn solve_poisson(
    size: ImageSize,
    initial: &[f32],
    div: &[f32],
    params: &GradDomParams,
) -> PoissonSolution {
    let (w, h) = (size.width as usize, size.height as usize);
    let target = params.converged_target(size.pixel_count());
    let mut prev = initial.to_vec();
    let mut next = vec![0.0; prev.len()];
    let mut flags = vec![false; prev.len()];
    let mut converged = 0u32;
    let mut iterations = 0u32;

    while converged < target && iterations < params.max_iterations {
        let src = &prev;
        converged += next
            .par_chunks_mut(w)
            .zip(flags.par_chunks_mut(w))
            .enumerate()
            .map(|(y, (row, done))| {
                let mut newly = 0u32;
                for x in 0..w {
                    let i = y * w + x;
                    if done[x] {
                        row[x] = src[i];
                        continue;
                    }
                    let west = if x > 0 { src[i - 1] } else { 0.0 };
                    let east = if x + 1 < w { src[i + 1] } else { 0.0 };
                    let north = if y > 0 { src[i - w] } else { 0.0 };
                    let south = if y + 1 < h { src[i + w] } else { 0.0 };
                    let v = 0.25 * (west + east + north + south - div[i]);
                    row[x] = v;
                    if (v - src[i]).abs() < params.threshold {
                        done[x] = true;
                        newly += 1;
                    }
                }
                newly
            })
            .sum::<u32>();
        std::mem::swap(&mut prev, &mut next);
        iterations += 1;
    }

    PoissonSolution {
        field: prev,
        iterations,
        converged,
    }
}

/// Compresses the dynamic range of `input` in the gradient domain.
pub fn grad_dom(input: &[u8], output: &mut [u8], size: ImageSize, params: &GradDomParams) -> Result<()> {
    trace!(size = %size, alpha = params.adjust_alpha, beta = params.beta, "tonemap::grad_dom");
    size.check_buffers(input, output)?;
    params.validate()?;

    let pyramid = params.pyramid(size);
    let n = size.pixel_count();
    let mut lums = pyramid.alloc();
    log_luminance(input, &mut lums[..n]);
    pyramid.build(&mut lums);

    let mut grads = pyramid.alloc();
    gradient_magnitudes(&pyramid, &lums, &mut grads);
    let alphas = level_alphas(&pyramid, &grads, params.adjust_alpha);
    let atten = attenuation(&pyramid, &grads, &alphas, params.beta);

    let (gx, gy) = attenuated_gradients(size, &lums[..n], &atten[..n]);
    let div = divergence(size, &gx, &gy);
    let solution = solve_poisson(size, &lums[..n], &div, params);
    debug!(
        levels = pyramid.num_levels(),
        iterations = solution.iterations,
        converged = solution.converged,
        "poisson solve finished"
    );

    output
        .par_chunks_mut(NUM_CHANNELS)
        .zip(input.par_chunks(NUM_CHANNELS))
        .enumerate()
        .for_each(|(i, (out, src))| {
            let ratio = chroma_ratio(rgb(src), lums[i].exp(), params.saturation);
            store_rgb(out, ratio * solution.field[i].exp(), src);
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn size(w: u32, h: u32) -> ImageSize {
        ImageSize::new(w, h).unwrap()
    }

    #[test]
    fn test_zero_field_is_fixed_point() {
        let s = size(8, 6);
        let zeros = vec![0.0; 48];
        let sol = solve_poisson(s, &zeros, &zeros, &GradDomParams::default());
        assert_eq!(sol.iterations, 1);
        assert_eq!(sol.converged, 48);
        assert!(sol.field.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_ramp_interior_is_harmonic() {
        let s = size(6, 5);
        let ramp: Vec<f32> = (0..30).map(|i| (i % 6 + 2 * (i / 6) + 1) as f32).collect();
        let params = GradDomParams { max_iterations: 1, ..Default::default() };
        let sol = solve_poisson(s, &ramp, &[0.0; 30], &params);
        assert_eq!(sol.iterations, 1);
        for y in 1..4 {
            for x in 1..5 {
                assert_eq!(sol.field[y * 6 + x], ramp[y * 6 + x], "({x},{y})");
            }
        }
    }

    #[test]
    fn test_solved_field_is_fixed_point() {
        let (w, h) = (7usize, 5usize);
        let field: Vec<f32> = (0..w * h).map(|i| ((i * 7) % 11) as f32 - 3.0).collect();
        let at = |x: isize, y: isize| {
            if x < 0 || y < 0 || x >= w as isize || y >= h as isize {
                0.0
            } else {
                field[y as usize * w + x as usize]
            }
        };
        let div: Vec<f32> = (0..w * h)
            .map(|i| {
                let (x, y) = ((i % w) as isize, (i / w) as isize);
                at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * field[i]
            })
            .collect();
        let sol = solve_poisson(size(7, 5), &field, &div, &GradDomParams::default());
        assert_eq!(sol.iterations, 1);
        assert_eq!(sol.converged, 35);
        assert_eq!(sol.field, field);
    }

    #[test]
    fn test_solver_respects_iteration_cap() {
        let s = size(4, 4);
        let init = vec![100.0; 16];
        let div = vec![0.0; 16];
        let params = GradDomParams { max_iterations: 3, ..Default::default() };
        let sol = solve_poisson(s, &init, &div, &params);
        assert_eq!(sol.iterations, 3);
        assert!(sol.converged < params.converged_target(16));
    }

    #[test]
    fn test_divergence_borders() {
        let s = size(3, 2);
        let gx = [1.0, 3.0, 6.0, 10.0, 20.0, 40.0];
        let gy = [2.0, 2.0, 2.0, 5.0, 7.0, 11.0];
        let div = divergence(s, &gx, &gy);
        assert_eq!(div[0], 0.0);
        assert_eq!(div[1], 2.0);
        assert_eq!(div[2], 3.0);
        assert_eq!(div[3], 3.0);
        assert_eq!(div[4], 10.0 + 5.0);
        assert_eq!(div[5], 20.0 + 9.0);
    }

    #[test]
    fn test_forward_gradients_zero_at_far_edges() {
        let s = size(3, 2);
        let lums = [0.0, 1.0, 3.0, 2.0, 2.0, 2.0];
        let atten = [2.0; 6];
        let (gx, gy) = attenuated_gradients(s, &lums, &atten);
        assert_eq!(gx, vec![2.0, 4.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(gy, vec![4.0, 2.0, -2.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_attenuation_scale() {
        assert_eq!(attenuation_scale(0.0, 0.1, 0.85), 0.0);
        assert_relative_eq!(attenuation_scale(0.1, 0.1, 0.85), 1.0);
        // large gradients are attenuated, small ones boosted
        assert!(attenuation_scale(1.0, 0.1, 0.85) < 1.0);
        assert!(attenuation_scale(0.01, 0.1, 0.85) > 1.0);
    }

    #[test]
    fn test_upsample_weights_sum_to_sixteen() {
        let coarse = vec![1.0; 4 * 4];
        for y in 0..9 {
            for x in 0..9 {
                assert_eq!(upsample_weighted(&coarse, 4, 4, x, y), 16.0);
            }
        }
    }

    #[test]
    fn test_flat_image_gradients_vanish() {
        let s = size(64, 64);
        let params = GradDomParams::default();
        let pyramid = params.pyramid(s);
        assert_eq!(pyramid.num_levels(), 2);
        let mut lums = pyramid.alloc();
        lums[..64 * 64].fill(3.0);
        pyramid.build(&mut lums);
        let mut grads = pyramid.alloc();
        gradient_magnitudes(&pyramid, &lums, &mut grads);
        assert!(grads.iter().all(|&g| g == 0.0));
        let alphas = level_alphas(&pyramid, &grads, params.adjust_alpha);
        assert_relative_eq!(alphas[0], 0.1);
        let atten = attenuation(&pyramid, &grads, &alphas, params.beta);
        assert!(atten.iter().all(|&a| a == 0.0));
    }
}
