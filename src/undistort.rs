//! Lens undistortion for pinhole cameras
//!
//! This module scales the camera intrinsics to the live frame resolution and
//! builds a dense per-pixel lookup table that maps every destination pixel to
//! its source location in the distorted input frame (radial k1/k2 and
//! tangential p1/p2 model).

use image::{ImageBuffer, Luma, RgbImage};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CalibError;

/// Width and height of a frame in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Focal lengths and principal point of a pinhole camera
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    /// 3x3 camera matrix
    #[rustfmt::skip]
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx,
            0.0, self.fy, self.cy,
            0.0, 0.0, 1.0,
        )
    }

    /// Rescale for a frame of `current` size when the parameters were
    /// calibrated at `calib` size. Principal point follows its focal length.
    pub fn scaled(&self, current: FrameSize, calib: FrameSize) -> Self {
        if current == calib {
            return *self;
        }

        let scale_x = current.width as f64 / calib.width as f64;
        let scale_y = current.height as f64 / calib.height as f64;

        Self {
            fx: self.fx * scale_x,
            fy: self.fy * scale_y,
            cx: self.cx * scale_x,
            cy: self.cy * scale_y,
        }
    }
}

/// Radial (k1, k2) and tangential (p1, p2) distortion coefficients
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
}

impl Distortion {
    /// Map an ideal normalized image point to its distorted position
    #[inline]
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let x2 = x * x;
        let y2 = y * y;
        let r2 = x2 + y2;
        let xy2 = 2.0 * x * y;
        let radial = 1.0 + (self.k2 * r2 + self.k1) * r2;

        (
            x * radial + self.p1 * xy2 + self.p2 * (r2 + 2.0 * x2),
            y * radial + self.p1 * (r2 + 2.0 * y2) + self.p2 * xy2,
        )
    }
}

/// Dense undistortion lookup table: for each destination pixel, the x and y
/// source coordinates in the distorted frame
#[derive(Debug, Clone)]
pub struct UndistortMap {
    map_x: ImageBuffer<Luma<f32>, Vec<f32>>,
    map_y: ImageBuffer<Luma<f32>, Vec<f32>>,
}

impl UndistortMap {
    /// Build the map for a frame of `size` using the (already scaled)
    /// intrinsics. The same camera matrix is used for the undistorted output.
    pub fn build(
        intrinsics: &Intrinsics,
        distortion: &Distortion,
        size: FrameSize,
    ) -> Result<Self, CalibError> {
        let k = intrinsics.matrix();
        let k_inv = k.try_inverse().ok_or(CalibError::SingularIntrinsics {
            fx: intrinsics.fx,
            fy: intrinsics.fy,
        })?;

        let mut map_x = ImageBuffer::new(size.width, size.height);
        let mut map_y = ImageBuffer::new(size.width, size.height);

        for v in 0..size.height {
            for u in 0..size.width {
                let ray = k_inv * Vector3::new(u as f64, v as f64, 1.0);
                let (x, y) = (ray.x / ray.z, ray.y / ray.z);
                let (xd, yd) = distortion.distort(x, y);

                let src_x = intrinsics.fx * xd + intrinsics.cx;
                let src_y = intrinsics.fy * yd + intrinsics.cy;

                map_x.put_pixel(u, v, Luma([src_x as f32]));
                map_y.put_pixel(u, v, Luma([src_y as f32]));
            }
        }

        Ok(Self { map_x, map_y })
    }

    pub fn size(&self) -> FrameSize {
        FrameSize::new(self.map_x.width(), self.map_x.height())
    }

    /// Source coordinates for destination pixel (x, y)
    #[inline]
    pub fn source_of(&self, x: u32, y: u32) -> (f32, f32) {
        (self.map_x.get_pixel(x, y)[0], self.map_y.get_pixel(x, y)[0])
    }

    /// Resample `src` through the map with bilinear interpolation.
    /// Pixels that fall outside the source are black.
    pub fn remap(&self, src: &RgbImage) -> Result<RgbImage, CalibError> {
        let frame = FrameSize::new(src.width(), src.height());
        let map = self.size();
        if frame != map {
            return Err(CalibError::SizeMismatch { frame, map });
        }

        let mut dst = RgbImage::new(map.width, map.height);
        for (x, y, pixel) in dst.enumerate_pixels_mut() {
            let (sx, sy) = self.source_of(x, y);
            pixel.0 = bilinear_sample(src, sx, sy);
        }

        Ok(dst)
    }
}

/// Bilinear interpolation with a constant (black) border
#[inline]
fn bilinear_sample(src: &RgbImage, x: f32, y: f32) -> [u8; 3] {
    let (w, h) = (src.width() as i64, src.height() as i64);

    let x0f = x.floor();
    let y0f = y.floor();
    let fx = x - x0f;
    let fy = y - y0f;
    let x0 = x0f as i64;
    let y0 = y0f as i64;

    if x0 < -1 || y0 < -1 || x0 >= w || y0 >= h {
        return [0; 3];
    }

    let fetch = |px: i64, py: i64| -> [f32; 3] {
        if px < 0 || py < 0 || px >= w || py >= h {
            [0.0; 3]
        } else {
            let p = src.get_pixel(px as u32, py as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        }
    };

    let p00 = fetch(x0, y0);
    let p10 = fetch(x0 + 1, y0);
    let p01 = fetch(x0, y0 + 1);
    let p11 = fetch(x0 + 1, y0 + 1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let value = p00[c] * (1.0 - fx) * (1.0 - fy)
            + p10[c] * fx * (1.0 - fy)
            + p01[c] * (1.0 - fx) * fy
            + p11[c] * fx * fy;
        out[c] = value.round().clamp(0.0, 255.0) as u8;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Intrinsics {
        Intrinsics { fx: 325.42, fy: 332.31, cx: 177.29, cy: 127.3 }
    }

    #[test]
    fn test_same_size_keeps_intrinsics() {
        let size = FrameSize::new(320, 240);
        let scaled = base().scaled(size, size);
        assert_eq!(scaled, base());
        assert_eq!(scaled.matrix(), base().matrix());
    }

    #[test]
    fn test_double_width_scales_x_only() {
        let scaled = base().scaled(FrameSize::new(640, 240), FrameSize::new(320, 240));
        assert_eq!(scaled.fx, base().fx * 2.0);
        assert_eq!(scaled.cx, base().cx * 2.0);
        assert_eq!(scaled.fy, base().fy);
        assert_eq!(scaled.cy, base().cy);
    }

    #[test]
    fn test_zero_distortion_is_identity() {
        let size = FrameSize::new(64, 48);
        let intr = base().scaled(size, FrameSize::new(320, 240));
        let map = UndistortMap::build(&intr, &Distortion::default(), size).unwrap();

        assert_eq!(map.size(), size);
        for y in 0..size.height {
            for x in 0..size.width {
                let (sx, sy) = map.source_of(x, y);
                assert!((sx - x as f32).abs() < 1e-3, "x at ({}, {}) = {}", x, y, sx);
                assert!((sy - y as f32).abs() < 1e-3, "y at ({}, {}) = {}", x, y, sy);
            }
        }
    }

    #[test]
    fn test_barrel_distortion_moves_corners() {
        let size = FrameSize::new(320, 240);
        let dist = Distortion { k1: -0.4153, k2: 0.2467, p1: -0.00195, p2: 0.00185 };
        let map = UndistortMap::build(&base(), &dist, size).unwrap();

        // Principal point stays put, corners are pulled towards the centre
        let (sx, sy) = map.source_of(177, 127);
        assert!((sx - 177.0).abs() < 0.5);
        assert!((sy - 127.0).abs() < 0.5);

        let (cx, cy) = map.source_of(0, 0);
        assert!(cx > 0.0 && cy > 0.0);
    }

    #[test]
    fn test_singular_intrinsics() {
        let intr = Intrinsics { fx: 0.0, fy: 300.0, cx: 160.0, cy: 120.0 };
        let result = UndistortMap::build(&intr, &Distortion::default(), FrameSize::new(8, 8));
        assert!(matches!(result, Err(CalibError::SingularIntrinsics { .. })));
    }

    #[test]
    fn test_identity_remap_copies_pixels() {
        let size = FrameSize::new(16, 12);
        let intr = Intrinsics { fx: 20.0, fy: 20.0, cx: 8.0, cy: 6.0 };
        let map = UndistortMap::build(&intr, &Distortion::default(), size).unwrap();

        let src = RgbImage::from_fn(16, 12, |x, y| image::Rgb([x as u8 * 10, y as u8 * 20, 7]));
        let dst = map.remap(&src).unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn test_remap_rejects_wrong_size() {
        let size = FrameSize::new(8, 8);
        let map = UndistortMap::build(&base(), &Distortion::default(), size).unwrap();
        let src = RgbImage::new(4, 4);
        assert!(matches!(map.remap(&src), Err(CalibError::SizeMismatch { .. })));
    }
}
