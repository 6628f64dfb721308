//! Bayer demosaicing
//!
//! Reconstructs a full RGB image from a single-channel colour filter array
//! frame. Two methods are available: plain bilinear neighbour averaging and
//! the Malvar-He-Cutler gradient-corrected interpolation (5x5 kernels).
//! Borders are handled by mirroring, which keeps the 2x2 pattern phase intact.

use image::{GrayImage, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

/// Colour of a single sensor site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Site {
    Red,
    Green,
    Blue,
}

/// 2x2 layout of the colour filter array, named row by row from the
/// top-left pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BayerPattern {
    Rggb,
    Bggr,
    Grbg,
    #[default]
    Gbrg,
}

impl BayerPattern {
    fn cells(&self) -> [Site; 4] {
        use Site::*;
        match self {
            BayerPattern::Rggb => [Red, Green, Green, Blue],
            BayerPattern::Bggr => [Blue, Green, Green, Red],
            BayerPattern::Grbg => [Green, Red, Blue, Green],
            BayerPattern::Gbrg => [Green, Blue, Red, Green],
        }
    }

    #[inline]
    fn site(&self, x: usize, y: usize) -> Site {
        self.cells()[(y & 1) * 2 + (x & 1)]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BayerPattern::Rggb => "RGGB",
            BayerPattern::Bggr => "BGGR",
            BayerPattern::Grbg => "GRBG",
            BayerPattern::Gbrg => "GBRG",
        }
    }
}

/// Demosaicing algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DemosaicMethod {
    /// Average of the nearest same-colour neighbours
    Bilinear,
    /// Malvar-He-Cutler gradient-corrected interpolation
    #[default]
    Malvar,
}

/// Demosaic a raw Bayer frame into RGB
pub fn demosaic(raw: &GrayImage, pattern: BayerPattern, method: DemosaicMethod) -> RgbImage {
    let (w, h) = (raw.width() as usize, raw.height() as usize);
    let mut out = RgbImage::new(raw.width(), raw.height());
    if w == 0 || h == 0 {
        return out;
    }

    let cfa = Cfa { data: raw.as_raw(), width: w, height: h };

    for y in 0..h {
        for x in 0..w {
            let rgb = match method {
                DemosaicMethod::Bilinear => bilinear_at(&cfa, pattern, x, y),
                DemosaicMethod::Malvar => malvar_at(&cfa, pattern, x, y),
            };
            out.put_pixel(x as u32, y as u32, Rgb(rgb));
        }
    }

    out
}

/// Borrowed view of the sensor data with mirrored out-of-range access
struct Cfa<'a> {
    data: &'a [u8],
    width: usize,
    height: usize,
}

impl Cfa<'_> {
    #[inline]
    fn at(&self, x: isize, y: isize) -> i32 {
        let x = mirror(x, self.width);
        let y = mirror(y, self.height);
        self.data[y * self.width + x] as i32
    }
}

/// Reflect an index into `0..len` without repeating the edge pixel.
/// Parity is preserved so the filter pattern stays aligned.
#[inline]
pub(crate) fn mirror(i: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let mut i = i.rem_euclid(period);
    if i >= len as isize {
        i = period - i;
    }
    i as usize
}

fn bilinear_at(cfa: &Cfa, pattern: BayerPattern, x: usize, y: usize) -> [u8; 3] {
    let mut sum = [0i32; 3];
    let mut count = [0i32; 3];
    let own = pattern.site(x, y);

    for dy in -1isize..=1 {
        for dx in -1isize..=1 {
            let (nx, ny) = (x as isize + dx, y as isize + dy);
            let site = pattern.site(mirror(nx, cfa.width), mirror(ny, cfa.height));
            // The centre only contributes its own channel
            if (dx != 0 || dy != 0) && site == own {
                continue;
            }
            let c = channel(site);
            sum[c] += cfa.at(nx, ny);
            count[c] += 1;
        }
    }

    let mut rgb = [0u8; 3];
    for c in 0..3 {
        if count[c] > 0 {
            rgb[c] = ((sum[c] + count[c] / 2) / count[c]) as u8;
        }
    }
    rgb
}

#[inline]
fn channel(site: Site) -> usize {
    match site {
        Site::Red => 0,
        Site::Green => 1,
        Site::Blue => 2,
    }
}

/// Kernel taps as (dx, dy, weight) with weights doubled, normalised by 16
type Kernel = &'static [(isize, isize, i32)];

/// Green at a red or blue site
#[rustfmt::skip]
const G_AT_RB: Kernel = &[
    (0, -2, -2), (0, -1, 4),
    (-2, 0, -2), (-1, 0, 4), (0, 0, 8), (1, 0, 4), (2, 0, -2),
    (0, 1, 4), (0, 2, -2),
];

/// Red/blue at a green site whose horizontal neighbours carry that colour
#[rustfmt::skip]
const RB_AT_G_ROW: Kernel = &[
    (0, -2, 1),
    (-1, -1, -2), (1, -1, -2),
    (-2, 0, -2), (-1, 0, 8), (0, 0, 10), (1, 0, 8), (2, 0, -2),
    (-1, 1, -2), (1, 1, -2),
    (0, 2, 1),
];

/// Red/blue at a green site whose vertical neighbours carry that colour
#[rustfmt::skip]
const RB_AT_G_COL: Kernel = &[
    (0, -2, -2),
    (-1, -1, -2), (0, -1, 8), (1, -1, -2),
    (-2, 0, 1), (0, 0, 10), (2, 0, 1),
    (-1, 1, -2), (0, 1, 8), (1, 1, -2),
    (0, 2, -2),
];

/// Red at a blue site and blue at a red site
#[rustfmt::skip]
const RB_AT_BR: Kernel = &[
    (0, -2, -3),
    (-1, -1, 4), (1, -1, 4),
    (-2, 0, -3), (0, 0, 12), (2, 0, -3),
    (-1, 1, 4), (1, 1, 4),
    (0, 2, -3),
];

#[inline]
fn convolve(cfa: &Cfa, x: usize, y: usize, kernel: Kernel) -> u8 {
    let (x, y) = (x as isize, y as isize);
    let acc: i32 = kernel
        .iter()
        .map(|&(dx, dy, w)| w * cfa.at(x + dx, y + dy))
        .sum();
    ((acc + 8) >> 4).clamp(0, 255) as u8
}

fn malvar_at(cfa: &Cfa, pattern: BayerPattern, x: usize, y: usize) -> [u8; 3] {
    let own = cfa.at(x as isize, y as isize) as u8;

    match pattern.site(x, y) {
        Site::Red => [own, convolve(cfa, x, y, G_AT_RB), convolve(cfa, x, y, RB_AT_BR)],
        Site::Blue => [convolve(cfa, x, y, RB_AT_BR), convolve(cfa, x, y, G_AT_RB), own],
        Site::Green => {
            let right = pattern.site(mirror(x as isize + 1, cfa.width), y);
            let row = convolve(cfa, x, y, RB_AT_G_ROW);
            let col = convolve(cfa, x, y, RB_AT_G_COL);
            if right == Site::Red {
                [row, own, col]
            } else {
                [col, own, row]
            }
        }
    }
}
