//! Post-undistortion image adjustments
//!
//! Everything applied after the geometric remap:
//! - Resize to a fixed output resolution
//! - Saturation shift in HSV space (8-bit, hue in 0..180)
//! - Unsharp masking with a fixed 5x5 Gaussian (mirrored borders)
//! - Cross-hair marker at the principal point

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;

use crate::demosaic::mirror;
use crate::error::CalibError;
use crate::knobs::MAX_OUTPUT_DIMENSION;
use crate::undistort::FrameSize;

/// Blur kernel size used for sharpening
const SHARPEN_KERNEL_SIZE: usize = 5;
/// Blur sigma used for sharpening
const SHARPEN_SIGMA: f32 = 5.0;
/// Half-length of the cross-hair arms in pixels
const CROSS_RADIUS: f32 = 10.0;

/// Resize with bilinear filtering
pub fn resize(img: &RgbImage, size: FrameSize) -> Result<RgbImage, CalibError> {
    if size.width > MAX_OUTPUT_DIMENSION || size.height > MAX_OUTPUT_DIMENSION {
        return Err(CalibError::OutputTooLarge(size));
    }
    Ok(imageops::resize(img, size.width, size.height, FilterType::Triangle))
}

/// Reduce a frame to one channel with BT.601 weights
/// (0.299 R + 0.587 G + 0.114 B, 14-bit fixed point).
/// `DynamicImage::to_luma8` would use Rec. 709 weights instead.
pub fn to_gray(frame: &DynamicImage) -> GrayImage {
    let rgb = frame.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0.map(u32::from);
        Luma([((r * 4899 + g * 9617 + b * 1868 + 8192) >> 14) as u8])
    })
}

/// Convert an RGB pixel to 8-bit HSV (H in 0..180, S and V in 0..=255)
#[inline]
pub fn rgb_to_hsv(rgb: [u8; 3]) -> [u8; 3] {
    let [r, g, b] = rgb.map(|c| c as f32);
    let v = r.max(g).max(b);
    let min = r.min(g).min(b);
    let diff = v - min;

    let s = if v > 0.0 { diff * 255.0 / v } else { 0.0 };

    let mut h = if diff == 0.0 {
        0.0
    } else if v == r {
        60.0 * (g - b) / diff
    } else if v == g {
        120.0 + 60.0 * (b - r) / diff
    } else {
        240.0 + 60.0 * (r - g) / diff
    };
    if h < 0.0 {
        h += 360.0;
    }

    let h = (h / 2.0).round() as u32 % 180;
    [h as u8, s.round() as u8, v as u8]
}

/// Inverse of [`rgb_to_hsv`]
#[inline]
pub fn hsv_to_rgb(hsv: [u8; 3]) -> [u8; 3] {
    let h = hsv[0] as f32 * 2.0 / 60.0;
    let s = hsv[1] as f32 / 255.0;
    let v = hsv[2] as f32;

    if s == 0.0 {
        let v = v as u8;
        return [v, v, v];
    }

    let sector = h.floor();
    let f = h - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));

    let (r, g, b) = match sector as u32 % 6 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };

    [r, g, b].map(|c| c.round().clamp(0.0, 255.0) as u8)
}

/// Add `delta` to the saturation channel of every pixel, in place.
/// The result saturates at 0 and 255.
pub fn shift_saturation(img: &mut RgbImage, delta: f64) {
    for pixel in img.pixels_mut() {
        let mut hsv = rgb_to_hsv(pixel.0);
        hsv[1] = (hsv[1] as f64 + delta).round().clamp(0.0, 255.0) as u8;
        pixel.0 = hsv_to_rgb(hsv);
    }
}

/// Normalised 1-D Gaussian taps
fn gaussian_kernel(size: usize, sigma: f32) -> Vec<f32> {
    let half = (size / 2) as f32;
    let taps: Vec<f32> = (0..size)
        .map(|i| {
            let d = i as f32 - half;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = taps.iter().sum();
    taps.into_iter().map(|t| t / sum).collect()
}

/// Separable blur in floating point, borders mirrored without repeating
/// the edge pixel
fn blur(img: &RgbImage, kernel: &[f32]) -> Vec<[f32; 3]> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let half = (kernel.len() / 2) as isize;
    let src: Vec<[f32; 3]> = img.pixels().map(|p| p.0.map(|c| c as f32)).collect();
    let mut horizontal = vec![[0f32; 3]; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = [0f32; 3];
            for (k, weight) in kernel.iter().enumerate() {
                let sx = mirror(x as isize + k as isize - half, w);
                let p = src[y * w + sx];
                for c in 0..3 {
                    acc[c] += weight * p[c];
                }
            }
            horizontal[y * w + x] = acc;
        }
    }

    let mut out = vec![[0f32; 3]; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = [0f32; 3];
            for (k, weight) in kernel.iter().enumerate() {
                let sy = mirror(y as isize + k as isize - half, h);
                let p = horizontal[sy * w + x];
                for c in 0..3 {
                    acc[c] += weight * p[c];
                }
            }
            out[y * w + x] = acc;
        }
    }
    out
}

/// Unsharp mask: `(1 + amount) * img - amount * blur(img)`, saturated
pub fn sharpen(img: &RgbImage, amount: f64) -> RgbImage {
    let kernel = gaussian_kernel(SHARPEN_KERNEL_SIZE, SHARPEN_SIGMA);
    let blurred = blur(img, &kernel);

    let mut out = RgbImage::new(img.width(), img.height());
    for ((dst, src), smooth) in out.pixels_mut().zip(img.pixels()).zip(blurred.iter()) {
        for c in 0..3 {
            let value = (1.0 + amount) * src[c] as f64 - amount * smooth[c] as f64;
            dst[c] = value.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Draw a white cross centred at (x, y); parts outside the image are clipped
pub fn draw_center_cross(img: &mut RgbImage, x: i32, y: i32) {
    let white = Rgb([255, 255, 255]);
    let (x, y) = (x as f32, y as f32);
    draw_line_segment_mut(img, (x - CROSS_RADIUS, y), (x + CROSS_RADIUS, y), white);
    draw_line_segment_mut(img, (x, y - CROSS_RADIUS), (x, y + CROSS_RADIUS), white);
}
