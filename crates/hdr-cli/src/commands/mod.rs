//! CLI command implementations

pub mod devices;
pub mod run;

use anyhow::{Context, Result};
use hdr_compute::{Algorithm, Severity, StatusSink};
use hdr_core::Image;
use image::{DynamicImage, RgbaImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Load image from path as RGBA8
pub fn load_image(path: &Path) -> Result<Image> {
    let decoded = image::open(path)
        .with_context(|| format!("Failed to load: {}", path.display()))?
        .into_rgba8();
    let (width, height) = decoded.dimensions();
    Ok(Image::from_rgba(width, height, decoded.into_raw())?)
}

/// Save image to path. JPEG output drops the alpha channel.
pub fn save_image(path: &Path, image: &Image) -> Result<()> {
    let rgba = RgbaImage::from_raw(image.width(), image.height(), image.as_bytes().to_vec())
        .context("Image buffer does not match its size")?;
    let dynamic = DynamicImage::ImageRgba8(rgba);
    let result = if is_jpeg(path) {
        DynamicImage::ImageRgb8(dynamic.to_rgb8()).save(path)
    } else {
        dynamic.save(path)
    };
    result.with_context(|| format!("Failed to save: {}", path.display()))
}

fn is_jpeg(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
}

/// `<dir>/<stem>_<filter>.jpg` beside the input.
pub fn default_output(input: &Path, algorithm: Algorithm) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    input.with_file_name(format!("{stem}_{}.jpg", algorithm.name()))
}

/// Prints status lines the way the tool reports progress: info on stdout,
/// everything else through `tracing`.
pub fn status_sink() -> Arc<dyn StatusSink> {
    Arc::new(|severity: Severity, message: &str| match severity {
        Severity::Info => println!("{message}"),
        Severity::Debug => tracing::debug!("{message}"),
        Severity::Warn => tracing::warn!("{message}"),
        Severity::Error => tracing::error!("{message}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_output_name() {
        let out = default_output(Path::new("/tmp/images/memorial.png"), Algorithm::GradDom);
        assert_eq!(out, Path::new("/tmp/images/memorial_gradDom.jpg"));
        let out = default_output(Path::new("lena.jpg"), Algorithm::HistEq);
        assert_eq!(out, Path::new("lena_histEq.jpg"));
    }

    #[test]
    fn test_png_keeps_alpha() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.png");
        let mut img = Image::new(5, 3).unwrap();
        for y in 0..3 {
            for x in 0..5 {
                img.set(x, y, [(x * 50) as u8, (y * 100) as u8, 7, 99]);
            }
        }
        save_image(&path, &img).unwrap();
        let loaded = load_image(&path).unwrap();
        assert_eq!(loaded, img);
    }

    #[test]
    fn test_jpeg_output_is_opaque() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grey.JPG");
        let img = Image::filled(8, 8, [120, 120, 120, 10]).unwrap();
        save_image(&path, &img).unwrap();
        let loaded = load_image(&path).unwrap();
        assert_eq!(loaded.size(), img.size());
        assert_eq!(loaded.pixel(3, 3)[3], 255);
    }

    #[test]
    fn test_missing_input_names_path() {
        let err = load_image(Path::new("/nonexistent/hdr.png")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/hdr.png"));
    }
}
