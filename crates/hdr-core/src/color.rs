//! Per-pixel colour math shared by the reference operators.
//!
//! All functions work on floats in the 8-bit value range (`0.0..=255.0`).
//! Hue is in degrees; an achromatic black pixel reports hue `-1.0`.

use glam::{Mat3, Vec3};

/// Rec. 709 luminance weights.
pub const LUMINANCE_WEIGHTS: Vec3 = Vec3::new(0.2126, 0.7152, 0.0722);

/// Linear sRGB to CIE XYZ (D65). Stored column-major.
pub const RGB_TO_XYZ: Mat3 = Mat3::from_cols(
    Vec3::new(0.4124, 0.2126, 0.0193),
    Vec3::new(0.3576, 0.7152, 0.1192),
    Vec3::new(0.1805, 0.0722, 0.9505),
);

/// CIE XYZ (D65) to linear sRGB. Stored column-major.
pub const XYZ_TO_RGB: Mat3 = Mat3::from_cols(
    Vec3::new(3.240479, -0.969256, 0.055648),
    Vec3::new(-1.53715, 1.875991, -0.204043),
    Vec3::new(-0.498535, 0.041556, 1.057311),
);

/// Hue reported for pure black, where hue is undefined.
pub const UNDEFINED_HUE: f32 = -1.0;

/// Returns `lo` if `x < lo`, `hi` if `x > hi`, else `x`.
///
/// Unlike `f32::clamp` this never panics on `lo > hi` and passes NaN through.
#[inline]
pub fn clamp<T: PartialOrd>(x: T, lo: T, hi: T) -> T {
    if x < lo {
        lo
    } else if x > hi {
        hi
    } else {
        x
    }
}

#[inline]
pub fn luminance(rgb: Vec3) -> f32 {
    LUMINANCE_WEIGHTS.x * rgb.x + LUMINANCE_WEIGHTS.y * rgb.y + LUMINANCE_WEIGHTS.z * rgb.z
}

#[inline]
pub fn rgb_to_xyz(rgb: Vec3) -> Vec3 {
    RGB_TO_XYZ * rgb
}

#[inline]
pub fn xyz_to_rgb(xyz: Vec3) -> Vec3 {
    XYZ_TO_RGB * xyz
}

/// Converts RGB to `(hue°, saturation, value)`.
///
/// Value is `max(r, g, b)`, so it stays on the 0..255 scale.
pub fn rgb_to_hsv(rgb: Vec3) -> Vec3 {
    let (r, g, b) = (rgb.x, rgb.y, rgb.z);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    if max == 0.0 {
        return Vec3::new(UNDEFINED_HUE, 0.0, max);
    }
    let s = delta / max;
    if delta == 0.0 {
        return Vec3::new(0.0, 0.0, max);
    }

    let mut h = if r == max {
        (g - b) / delta
    } else if g == max {
        (b - r) / delta + 2.0
    } else {
        (r - g) / delta + 4.0
    };
    h *= 60.0;
    if h < 0.0 {
        h += 360.0;
    }
    Vec3::new(h, s, max)
}

/// Converts `(hue°, saturation, value)` back to RGB.
pub fn hsv_to_rgb(hsv: Vec3) -> Vec3 {
    let (h, s, v) = (hsv.x, hsv.y, hsv.z);
    if s == 0.0 {
        return Vec3::splat(v);
    }

    let h = h / 60.0;
    let sector = h.floor();
    let f = h - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));

    match sector as i32 {
        0 => Vec3::new(v, t, p),
        1 => Vec3::new(q, v, p),
        2 => Vec3::new(p, v, t),
        3 => Vec3::new(p, q, v),
        4 => Vec3::new(t, p, v),
        _ => Vec3::new(v, p, q),
    }
}

/// Triangle weighting: 0 at the ends of `0..=1`, 1 in the middle.
#[inline]
pub fn weight(l: f32) -> f32 {
    if l < 0.5 { 2.0 * l } else { 2.0 * (1.0 - l) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_clamp() {
        assert_eq!(clamp(-3, 0, 10), 0);
        assert_eq!(clamp(30, 0, 10), 10);
        assert_eq!(clamp(7, 0, 10), 7);
        assert_eq!(clamp(1.5f32, 0.0, 1.0), 1.0);
        assert!(clamp(f32::NAN, 0.0, 1.0).is_nan());
    }

    #[test]
    fn test_hsv_roundtrip_grid() {
        for r in (0..=255).step_by(15) {
            for g in (0..=255).step_by(17) {
                for b in (0..=255).step_by(51) {
                    let rgb = Vec3::new(r as f32, g as f32, b as f32);
                    let back = hsv_to_rgb(rgb_to_hsv(rgb));
                    assert_abs_diff_eq!(back.x, rgb.x, epsilon = 1e-3);
                    assert_abs_diff_eq!(back.y, rgb.y, epsilon = 1e-3);
                    assert_abs_diff_eq!(back.z, rgb.z, epsilon = 1e-3);
                }
            }
        }
    }

    #[test]
    fn test_black_has_undefined_hue() {
        let hsv = rgb_to_hsv(Vec3::ZERO);
        assert_eq!(hsv.x, UNDEFINED_HUE);
        assert_eq!(hsv.y, 0.0);
        assert_eq!(hsv_to_rgb(hsv), Vec3::ZERO);
    }

    #[test]
    fn test_hsv_primaries() {
        assert_abs_diff_eq!(rgb_to_hsv(Vec3::new(255.0, 0.0, 0.0)).x, 0.0);
        assert_abs_diff_eq!(rgb_to_hsv(Vec3::new(0.0, 255.0, 0.0)).x, 120.0);
        assert_abs_diff_eq!(rgb_to_hsv(Vec3::new(0.0, 0.0, 255.0)).x, 240.0);
        assert_abs_diff_eq!(rgb_to_hsv(Vec3::new(10.0, 20.0, 40.0)).z, 40.0);
    }

    #[test]
    fn test_xyz_roundtrip_grid() {
        for r in (0..=255).step_by(51) {
            for g in (0..=255).step_by(51) {
                for b in (0..=255).step_by(51) {
                    let rgb = Vec3::new(r as f32, g as f32, b as f32);
                    let back = xyz_to_rgb(rgb_to_xyz(rgb));
                    assert_abs_diff_eq!(back.x, rgb.x, epsilon = 0.1);
                    assert_abs_diff_eq!(back.y, rgb.y, epsilon = 0.1);
                    assert_abs_diff_eq!(back.z, rgb.z, epsilon = 0.1);
                }
            }
        }
    }

    #[test]
    fn test_xyz_y_is_luminance() {
        let rgb = Vec3::new(200.0, 100.0, 50.0);
        assert_abs_diff_eq!(rgb_to_xyz(rgb).y, luminance(rgb), epsilon = 1e-3);
        assert_abs_diff_eq!(luminance(Vec3::splat(128.0)), 128.0, epsilon = 1e-3);
    }

    #[test]
    fn test_weight() {
        assert_eq!(weight(0.0), 0.0);
        assert_eq!(weight(0.25), 0.5);
        assert_eq!(weight(0.5), 1.0);
        assert_eq!(weight(1.0), 0.0);
    }
}
