//! Histogram equalisation of the HSV value channel.

use crate::color::{hsv_to_rgb, rgb_to_hsv};
use crate::error::{Error, Result};
use crate::image::{rgb, ImageSize};
use crate::tonemap::store_rgb;
use crate::{HIST_SIZE, NUM_CHANNELS, PIXEL_RANGE};
use rayon::prelude::*;
use tracing::trace;

/// Largest image for which `255 * count` fits in `u32`.
pub const HIST_EQ_MAX_PIXELS: u64 = u32::MAX as u64 / PIXEL_RANGE as u64;

const PIXELS_PER_TASK: usize = 16 * 1024;

/// Counts pixels per brightness, where brightness is `max(r, g, b)`.
pub fn histogram(input: &[u8]) -> [u32; HIST_SIZE] {
    input
        .par_chunks(PIXELS_PER_TASK * NUM_CHANNELS)
        .fold(
            || [0u32; HIST_SIZE],
            |mut hist, chunk| {
                for px in chunk.chunks_exact(NUM_CHANNELS) {
                    hist[px[0].max(px[1]).max(px[2]) as usize] += 1;
                }
                hist
            },
        )
        .reduce(
            || [0u32; HIST_SIZE],
            |mut a, b| {
                for (x, y) in a.iter_mut().zip(b.iter()) {
                    *x += y;
                }
                a
            },
        )
}

/// Inclusive prefix sum.
pub fn cumulative(hist: &[u32; HIST_SIZE]) -> [u32; HIST_SIZE] {
    let mut cdf = [0u32; HIST_SIZE];
    let mut acc = 0u32;
    for (c, h) in cdf.iter_mut().zip(hist.iter()) {
        acc += h;
        *c = acc;
    }
    cdf
}

/// Remaps brightness `v` to `255 * (cdf[v] - cdf[0]) / (pixels - cdf[0])`.
///
/// Integer division, matching the kernel. Returns 0 when every pixel sits in
/// bin 0.
#[inline]
pub fn equalize_value(v: u32, cdf: &[u32; HIST_SIZE], pixels: u32) -> u32 {
    let denom = pixels - cdf[0];
    if denom == 0 {
        return 0;
    }
    (PIXEL_RANGE as u32 * (cdf[v as usize] - cdf[0])) / denom
}

/// Equalises the value channel of `input` into `output`, keeping hue and
/// saturation.
///
/// # Errors
///
/// Buffer-size mismatch, or an image above [`HIST_EQ_MAX_PIXELS`].
pub fn hist_eq(input: &[u8], output: &mut [u8], size: ImageSize) -> Result<()> {
    trace!(size = %size, "tonemap::hist_eq");
    size.check_buffers(input, output)?;
    let pixels = size.pixel_count() as u64;
    if pixels > HIST_EQ_MAX_PIXELS {
        return Err(Error::ImageTooLarge {
            operator: "histEq",
            pixels,
            limit: HIST_EQ_MAX_PIXELS,
        });
    }

    let cdf = cumulative(&histogram(input));
    let pixels = pixels as u32;

    output
        .par_chunks_mut(NUM_CHANNELS)
        .zip(input.par_chunks(NUM_CHANNELS))
        .for_each(|(out, src)| {
            let mut hsv = rgb_to_hsv(rgb(src));
            hsv.z = equalize_value(hsv.z as u32, &cdf, pixels) as f32;
            store_rgb(out, hsv_to_rgb(hsv), src);
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_uses_max_channel() {
        let input = [10, 200, 30, 0, 5, 5, 5, 255, 0, 0, 0, 9];
        let hist = histogram(&input);
        assert_eq!(hist[200], 1);
        assert_eq!(hist[5], 1);
        assert_eq!(hist[0], 1);
        assert_eq!(hist.iter().sum::<u32>(), 3);
    }

    #[test]
    fn test_cumulative() {
        let mut hist = [0u32; HIST_SIZE];
        hist[0] = 2;
        hist[3] = 5;
        hist[255] = 1;
        let cdf = cumulative(&hist);
        assert_eq!(cdf[0], 2);
        assert_eq!(cdf[2], 2);
        assert_eq!(cdf[3], 7);
        assert_eq!(cdf[255], 8);
    }

    #[test]
    fn test_all_black_does_not_divide_by_zero() {
        let mut hist = [0u32; HIST_SIZE];
        hist[0] = 4;
        let cdf = cumulative(&hist);
        assert_eq!(equalize_value(0, &cdf, 4), 0);
    }

    #[test]
    fn test_two_levels_spread_over_range() {
        let size = ImageSize::new(2, 1).unwrap();
        let input = [40, 40, 40, 7, 90, 90, 90, 8];
        let mut output = [0u8; 8];
        hist_eq(&input, &mut output, size).unwrap();
        // cdf = 1 at 40 and 2 at 90, cdf[0] = 0
        assert_eq!(output, [127, 127, 127, 7, 255, 255, 255, 8]);
    }
}
