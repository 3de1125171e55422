//! Texture interop.
//!
//! In interop mode pixels never touch the host: the caller's input texture is
//! copied into the pipeline's input buffer before the stages run (acquire),
//! and the output buffer is copied into the caller's output texture after
//! (release). Rows are copied one at a time unless a row is already aligned
//! to `COPY_BYTES_PER_ROW_ALIGNMENT`.

use std::sync::Arc;

use hdr_core::ImageSize;

use crate::{ComputeError, ComputeResult};

/// A device the caller already owns, shared with its renderer.
#[derive(Clone)]
pub struct SharedDevice {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub adapter_info: wgpu::AdapterInfo,
}

/// Caller-owned input/output textures.
///
/// The output texture takes 4-byte texels laid out as RGBA8. The input does
/// too, except on the defective half-float path where it is `Rgba16Float`.
#[derive(Clone)]
pub struct InteropTextures {
    pub input: wgpu::Texture,
    pub output: wgpu::Texture,
}

impl InteropTextures {
    pub fn new(input: wgpu::Texture, output: wgpu::Texture) -> Self {
        Self { input, output }
    }

    /// Bytes per texel of the input texture.
    pub fn input_texel_bytes(&self) -> u32 {
        self.input.format().block_copy_size(None).unwrap_or(0)
    }

    /// Checks sizes, formats and usages against an image of `size`.
    pub fn validate(&self, size: ImageSize, half_float_input: bool) -> ComputeResult<()> {
        for (role, texture) in [("input", &self.input), ("output", &self.output)] {
            if texture.width() != size.width || texture.height() != size.height {
                return Err(ComputeError::configuration(format!(
                    "{role} texture is {}x{}, expected {size}",
                    texture.width(),
                    texture.height()
                )));
            }
        }

        let expected_input = if half_float_input { 8 } else { 4 };
        if half_float_input && self.input.format() != wgpu::TextureFormat::Rgba16Float {
            return Err(ComputeError::configuration(format!(
                "half-float input needs an Rgba16Float texture, got {:?}",
                self.input.format()
            )));
        }
        if self.input_texel_bytes() != expected_input {
            return Err(ComputeError::configuration(format!(
                "input texture format {:?} is not {expected_input} bytes per texel",
                self.input.format()
            )));
        }
        if self.output.format().block_copy_size(None) != Some(4) {
            return Err(ComputeError::configuration(format!(
                "output texture format {:?} is not 4 bytes per texel",
                self.output.format()
            )));
        }

        if !self.input.usage().contains(wgpu::TextureUsages::COPY_SRC) {
            return Err(ComputeError::configuration("input texture lacks COPY_SRC usage"));
        }
        if !self.output.usage().contains(wgpu::TextureUsages::COPY_DST) {
            return Err(ComputeError::configuration("output texture lacks COPY_DST usage"));
        }
        Ok(())
    }

    /// Records the copy of the input texture into `buffer`.
    pub fn acquire(&self, encoder: &mut wgpu::CommandEncoder, buffer: &wgpu::Buffer) {
        let row_bytes = self.input.width() * self.input_texel_bytes();
        for (origin_y, rows, offset) in row_copies(self.input.height(), row_bytes) {
            encoder.copy_texture_to_buffer(
                texel_copy(&self.input, origin_y),
                buffer_copy(buffer, offset, row_bytes, rows),
                extent(self.input.width(), rows),
            );
        }
    }

    /// Records the copy of `buffer` into the output texture.
    pub fn release(&self, encoder: &mut wgpu::CommandEncoder, buffer: &wgpu::Buffer) {
        let row_bytes = self.output.width() * 4;
        for (origin_y, rows, offset) in row_copies(self.output.height(), row_bytes) {
            encoder.copy_buffer_to_texture(
                buffer_copy(buffer, offset, row_bytes, rows),
                texel_copy(&self.output, origin_y),
                extent(self.output.width(), rows),
            );
        }
    }
}

/// `(first row, row count, buffer offset)` for each copy command.
fn row_copies(height: u32, row_bytes: u32) -> Vec<(u32, u32, u64)> {
    if row_bytes % wgpu::COPY_BYTES_PER_ROW_ALIGNMENT == 0 {
        vec![(0, height, 0)]
    } else {
        (0..height)
            .map(|y| (y, 1, y as u64 * row_bytes as u64))
            .collect()
    }
}

fn texel_copy(texture: &wgpu::Texture, y: u32) -> wgpu::TexelCopyTextureInfo<'_> {
    wgpu::TexelCopyTextureInfo {
        texture,
        mip_level: 0,
        origin: wgpu::Origin3d { x: 0, y, z: 0 },
        aspect: wgpu::TextureAspect::All,
    }
}

/// Single-row copies leave the row pitch unset; it only has to be aligned
/// when given.
fn buffer_copy(buffer: &wgpu::Buffer, offset: u64, row_bytes: u32, rows: u32) -> wgpu::TexelCopyBufferInfo<'_> {
    let multi = rows > 1;
    wgpu::TexelCopyBufferInfo {
        buffer,
        layout: wgpu::TexelCopyBufferLayout {
            offset,
            bytes_per_row: multi.then_some(row_bytes),
            rows_per_image: multi.then_some(rows),
        },
    }
}

fn extent(width: u32, rows: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width,
        height: rows,
        depth_or_array_layers: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_rows_copy_once() {
        // 64 px * 4 bytes = 256
        assert_eq!(row_copies(10, 256), vec![(0, 10, 0)]);
    }

    #[test]
    fn test_unaligned_rows_copy_per_row() {
        let copies = row_copies(3, 40);
        assert_eq!(copies, vec![(0, 1, 0), (1, 1, 40), (2, 1, 80)]);
    }
}
