//! RGBA8 image buffers and edge-replicating pixel accessors.
//!
//! Images are row-major, origin top-left, with four interleaved 8-bit
//! channels. The fourth channel is carried through every operator untouched.
//!
//! ```text
//!   byte offset = (y * width + x) * 4 + c        c in 0..4
//! ```
//!
//! Reads through [`get_pixel`] clamp coordinates into the image (edge
//! replication) so neighbourhood stencils never index outside the buffer.
//! Writes through [`set_pixel`] clamp the value to `0..=255` and truncate.

use crate::color::clamp;
use crate::error::{Error, Result};
use crate::{NUM_CHANNELS, PIXEL_RANGE};
use glam::Vec3;

/// Width and height of an image in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    /// Validates and creates an image size.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidDimensions`] when either side is zero or the byte
    /// length would overflow `usize`.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::invalid_dimensions(width, height, "zero-sized image"));
        }
        (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(NUM_CHANNELS))
            .ok_or_else(|| Error::invalid_dimensions(width, height, "byte size overflows"))?;
        Ok(Self { width, height })
    }

    /// Number of pixels.
    #[inline]
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Number of bytes in an RGBA8 buffer of this size.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.pixel_count() * NUM_CHANNELS
    }

    /// Linear pixel index of in-bounds coordinates.
    #[inline]
    pub fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    /// Linear pixel index after clamping the coordinates into the image.
    #[inline]
    pub fn clamped_index(&self, x: i64, y: i64) -> usize {
        let cx = clamp(x, 0, self.width as i64 - 1);
        let cy = clamp(y, 0, self.height as i64 - 1);
        cy as usize * self.width as usize + cx as usize
    }

    /// Checks that `input` and `output` both match this size.
    pub fn check_buffers(&self, input: &[u8], output: &[u8]) -> Result<()> {
        let expected = self.byte_len();
        if input.len() != expected {
            return Err(Error::buffer_size(expected, input.len()));
        }
        if output.len() != expected {
            return Err(Error::buffer_size(expected, output.len()));
        }
        Ok(())
    }
}

impl std::fmt::Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Reads channel `c` at `(x, y)` with edge replication.
#[inline]
pub fn get_pixel(data: &[u8], size: ImageSize, x: i64, y: i64, c: usize) -> f32 {
    data[size.clamped_index(x, y) * NUM_CHANNELS + c] as f32
}

/// Writes channel `c` at `(x, y)`, clamping the value to the 8-bit range.
#[inline]
pub fn set_pixel(data: &mut [u8], size: ImageSize, x: u32, y: u32, c: usize, value: f32) {
    data[size.index(x, y) * NUM_CHANNELS + c] = quantize(value);
}

/// Clamps to `0..=255` and truncates toward zero. NaN maps to 0.
#[inline]
pub fn quantize(value: f32) -> u8 {
    clamp(value, 0.0, PIXEL_RANGE) as u8
}

/// RGB channels of one packed pixel as floats in `0..=255`.
#[inline]
pub fn rgb(pixel: &[u8]) -> Vec3 {
    Vec3::new(pixel[0] as f32, pixel[1] as f32, pixel[2] as f32)
}

/// An owned RGBA8 image.
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    size: ImageSize,
    data: Vec<u8>,
}

impl Image {
    /// Creates a black, fully transparent image.
    pub fn new(width: u32, height: u32) -> Result<Self> {
        let size = ImageSize::new(width, height)?;
        Ok(Self {
            size,
            data: vec![0; size.byte_len()],
        })
    }

    /// Wraps an existing RGBA8 buffer.
    ///
    /// # Errors
    ///
    /// [`Error::BufferSize`] if `data.len() != width * height * 4`.
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let size = ImageSize::new(width, height)?;
        if data.len() != size.byte_len() {
            return Err(Error::buffer_size(size.byte_len(), data.len()));
        }
        Ok(Self { size, data })
    }

    /// Creates an image filled with one RGBA value.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Result<Self> {
        let size = ImageSize::new(width, height)?;
        let data = rgba.iter().copied().cycle().take(size.byte_len()).collect();
        Ok(Self { size, data })
    }

    #[inline]
    pub fn size(&self) -> ImageSize {
        self.size
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.size.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.size.height
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    /// RGBA value at in-bounds coordinates.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = self.size.index(x, y) * NUM_CHANNELS;
        [self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]]
    }

    pub fn set(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        let i = self.size.index(x, y) * NUM_CHANNELS;
        self.data[i..i + NUM_CHANNELS].copy_from_slice(&rgba);
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("size", &self.size)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_validation() {
        assert!(ImageSize::new(0, 4).is_err());
        assert!(ImageSize::new(4, 0).is_err());
        let s = ImageSize::new(3, 2).unwrap();
        assert_eq!(s.pixel_count(), 6);
        assert_eq!(s.byte_len(), 24);
        assert_eq!(s.to_string(), "3x2");
    }

    #[test]
    fn test_edge_replication() {
        let mut img = Image::new(3, 2).unwrap();
        img.set(0, 0, [10, 0, 0, 0]);
        img.set(2, 1, [20, 0, 0, 0]);
        let s = img.size();
        assert_eq!(get_pixel(img.as_bytes(), s, -5, -5, 0), 10.0);
        assert_eq!(get_pixel(img.as_bytes(), s, 100, 100, 0), 20.0);
        assert_eq!(s.clamped_index(-1, 1), s.index(0, 1));
        assert_eq!(s.clamped_index(i64::MAX, i64::MIN), s.index(2, 0));
    }

    #[test]
    fn test_set_pixel_clamps() {
        let s = ImageSize::new(1, 1).unwrap();
        let mut buf = vec![0u8; 4];
        set_pixel(&mut buf, s, 0, 0, 0, 300.0);
        set_pixel(&mut buf, s, 0, 0, 1, -4.0);
        set_pixel(&mut buf, s, 0, 0, 2, 12.9);
        set_pixel(&mut buf, s, 0, 0, 3, f32::NAN);
        assert_eq!(buf, vec![255, 0, 12, 0]);
    }

    #[test]
    fn test_from_rgba_rejects_short_buffer() {
        assert!(Image::from_rgba(2, 2, vec![0; 15]).is_err());
        let img = Image::filled(2, 1, [1, 2, 3, 4]).unwrap();
        assert_eq!(img.as_bytes(), &[1, 2, 3, 4, 1, 2, 3, 4]);
    }
}
