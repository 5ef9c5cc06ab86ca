//! Face chip extraction: landmark alignment, padding, jittering, and tensor
//! layout for the descriptor model.
//!
//! A chip is produced by fitting a similarity transform (scale, rotation,
//! translation) from the detected landmarks to canonical positions in a
//! 112×112 frame, then sampling the source image through the inverse of that
//! transform. Padding and jitter are applied to the transform, so the cost of
//! extraction is always one chip's worth of pixels.

use crate::types::{Landmarks, Point, Rectangle};
use image::{imageops, Rgb, RgbImage};
use ndarray::Array4;
use rand::Rng;

/// Side length of the square chip fed to the descriptor model.
pub const CHIP_SIZE: u32 = 112;

/// Canonical landmark positions in a 112×112 chip, as used by ArcFace-style
/// recognizers including SFace.
pub const REFERENCE_LANDMARKS: Landmarks = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Padding beyond this is treated as this much.
pub const MAX_PADDING: f64 = 1e6;

const JITTER_MAX_SCALE: f64 = 0.1;
const JITTER_MAX_SHIFT: f64 = 0.05;

/// Bound for padded rectangle corners so widths stay representable.
const COORD_LIMIT: f64 = (1 << 28) as f64;

/// Clamp `padding` into `[0, MAX_PADDING]`; NaN counts as zero.
pub fn sanitize_padding(padding: f64) -> f64 {
    if padding.is_nan() {
        0.0
    } else {
        padding.clamp(0.0, MAX_PADDING)
    }
}

/// Expand `region` by `padding` times its width (height) on each side.
pub fn padded_region(region: &Rectangle, padding: f64) -> Rectangle {
    let padding = sanitize_padding(padding);
    let grow = |lo: i32, hi: i32| {
        let pad = (hi as f64 - lo as f64) * padding;
        let lo = (lo as f64 - pad).round().clamp(-COORD_LIMIT, COORD_LIMIT) as i32;
        let hi = (hi as f64 + pad).round().clamp(-COORD_LIMIT, COORD_LIMIT) as i32;
        (lo, hi)
    };
    let (x0, x1) = grow(region.min.x, region.max.x);
    let (y0, y1) = grow(region.min.y, region.max.y);
    Rectangle::new(Point::new(x0, y0), Point::new(x1, y1))
}

/// Reference landmarks stretched into `region`, for detections that carry no
/// keypoints.
pub fn box_landmarks(region: &Rectangle) -> Landmarks {
    let sx = region.width() as f32 / CHIP_SIZE as f32;
    let sy = region.height() as f32 / CHIP_SIZE as f32;
    REFERENCE_LANDMARKS.map(|(x, y)| (region.min.x as f32 + x * sx, region.min.y as f32 + y * sy))
}

/// Similarity transform mapping image coordinates to chip coordinates:
///
/// ```text
/// | u |   | a  -b | | x |   | tx |
/// | v | = | b   a | | y | + | ty |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChipTransform {
    pub a: f64,
    pub b: f64,
    pub tx: f64,
    pub ty: f64,
}

impl ChipTransform {
    /// Least-squares fit of `src` onto `dst`. `None` when the source points
    /// all coincide.
    pub fn fit(src: &Landmarks, dst: &Landmarks) -> Option<Self> {
        let n = src.len() as f64;
        let centroid = |pts: &Landmarks| {
            let (sx, sy) = pts
                .iter()
                .fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x as f64, ay + y as f64));
            (sx / n, sy / n)
        };
        let (smx, smy) = centroid(src);
        let (dmx, dmy) = centroid(dst);

        let (mut dot, mut cross, mut spread) = (0.0, 0.0, 0.0);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx as f64 - smx, sy as f64 - smy);
            let (dx, dy) = (dx as f64 - dmx, dy as f64 - dmy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            spread += sx * sx + sy * sy;
        }
        // Also rejects NaN landmarks.
        if !(spread > f64::EPSILON) {
            return None;
        }

        let a = dot / spread;
        let b = cross / spread;
        Some(Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        })
    }

    /// Transform that places `landmarks` on [`REFERENCE_LANDMARKS`].
    pub fn align(landmarks: &Landmarks) -> Option<Self> {
        Self::fit(landmarks, &REFERENCE_LANDMARKS)
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Inverse mapping from chip to image coordinates. `None` when the
    /// transform is degenerate.
    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if !det.is_normal() {
            return None;
        }
        let a = self.a / det;
        let b = -self.b / det;
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }

    /// Follow with a zoom by `scale` about the chip center and a shift of
    /// `(dx, dy)` chip pixels.
    pub fn then_zoom(&self, scale: f64, dx: f64, dy: f64) -> Self {
        let c = CHIP_SIZE as f64 / 2.0;
        Self {
            a: self.a * scale,
            b: self.b * scale,
            tx: c + (self.tx - c) * scale + dx,
            ty: c + (self.ty - c) * scale + dy,
        }
    }

    /// Shrink the face so the chip also covers `padding` times the face size
    /// on each side.
    pub fn with_padding(&self, padding: f64) -> Self {
        self.then_zoom(1.0 / (1.0 + 2.0 * sanitize_padding(padding)), 0.0, 0.0)
    }
}

/// One random perturbation of a face chip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jitter {
    /// Zoom applied about the chip center.
    pub scale: f64,
    /// Shift as a fraction of the chip width.
    pub dx: f64,
    /// Shift as a fraction of the chip height.
    pub dy: f64,
    pub mirror: bool,
}

impl Jitter {
    pub fn random(rng: &mut impl Rng) -> Self {
        Self {
            scale: 1.0 + rng.gen_range(-JITTER_MAX_SCALE..=JITTER_MAX_SCALE),
            dx: rng.gen_range(-JITTER_MAX_SHIFT..=JITTER_MAX_SHIFT),
            dy: rng.gen_range(-JITTER_MAX_SHIFT..=JITTER_MAX_SHIFT),
            mirror: rng.gen_bool(0.5),
        }
    }

    pub fn apply(&self, transform: &ChipTransform) -> ChipTransform {
        let size = CHIP_SIZE as f64;
        transform.then_zoom(self.scale, self.dx * size, self.dy * size)
    }
}

/// Sample a `CHIP_SIZE` x `CHIP_SIZE` chip from `image` through `transform`,
/// with black outside the image.
pub fn extract_chip(image: &RgbImage, transform: &ChipTransform, mirror: bool) -> RgbImage {
    let mut chip = RgbImage::new(CHIP_SIZE, CHIP_SIZE);
    let Some(inverse) = transform.inverse() else {
        return chip;
    };

    for (u, v, px) in chip.enumerate_pixels_mut() {
        let (x, y) = inverse.apply(u as f64, v as f64);
        *px = sample_bilinear(image, x, y);
    }

    if mirror {
        imageops::flip_horizontal_in_place(&mut chip);
    }
    chip
}

fn sample_bilinear(image: &RgbImage, x: f64, y: f64) -> Rgb<u8> {
    let (w, h) = (image.width() as f64, image.height() as f64);
    // Negated so NaN falls through to black.
    if !(x > -1.0 && y > -1.0 && x < w && y < h) {
        return Rgb([0, 0, 0]);
    }

    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let (x0, y0) = (x0 as i64, y0 as i64);

    let mut acc = [0.0f64; 3];
    for (ox, oy, weight) in [
        (0, 0, (1.0 - fx) * (1.0 - fy)),
        (1, 0, fx * (1.0 - fy)),
        (0, 1, (1.0 - fx) * fy),
        (1, 1, fx * fy),
    ] {
        let (sx, sy) = (x0 + ox, y0 + oy);
        if sx < 0 || sy < 0 || sx >= image.width() as i64 || sy >= image.height() as i64 {
            continue;
        }
        let p = image.get_pixel(sx as u32, sy as u32);
        for (c, slot) in acc.iter_mut().enumerate() {
            *slot += p[c] as f64 * weight;
        }
    }
    Rgb(acc.map(|v| v.round().clamp(0.0, 255.0) as u8))
}

/// Lay out a chip as a `[1, 3, H, W]` RGB tensor with raw 0–255 values.
pub fn chip_tensor(chip: &RgbImage) -> Array4<f32> {
    let (w, h) = (chip.width() as usize, chip.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, px) in chip.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = px[0] as f32;
        tensor[[0, 1, y, x]] = px[1] as f32;
        tensor[[0, 2, y, x]] = px[2] as f32;
    }
    tensor
}
