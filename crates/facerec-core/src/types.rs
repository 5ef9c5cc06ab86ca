use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of elements in a face descriptor.
pub const DESCRIPTOR_SIZE: usize = 128;

/// Integer pixel coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle given by its min (top-left) and max (bottom-right) corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rectangle {
    pub min: Point,
    pub max: Point,
}

impl Rectangle {
    pub const fn new(min: Point, max: Point) -> Self {
        Self { min, max }
    }

    pub fn width(&self) -> i32 {
        self.max.x.saturating_sub(self.min.x)
    }

    pub fn height(&self) -> i32 {
        self.max.y.saturating_sub(self.min.y)
    }

    /// True when the rectangle covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    /// Clip to the `[0, width) x [0, height)` image area.
    pub fn clamp_to(&self, width: u32, height: u32) -> Rectangle {
        let w = width as i32;
        let h = height as i32;
        Rectangle {
            min: Point::new(self.min.x.clamp(0, w), self.min.y.clamp(0, h)),
            max: Point::new(self.max.x.clamp(0, w), self.max.y.clamp(0, h)),
        }
    }
}

/// Five facial keypoints in image coordinates: left eye, right eye, nose,
/// left mouth corner, right mouth corner.
pub type Landmarks = [(f32, f32); 5];

/// One face located in an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub rect: Rectangle,
    pub confidence: f64,
    /// Keypoints used to align the face, when the detector provides them.
    #[serde(default)]
    pub landmarks: Option<Landmarks>,
}

impl Detection {
    pub fn new(rect: Rectangle, confidence: f64) -> Self {
        Self {
            rect,
            confidence,
            landmarks: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("descriptor must have {DESCRIPTOR_SIZE} elements, got {0}")]
pub struct DescriptorLengthError(pub usize);

/// A 128-element face embedding. Two descriptors of the same person are
/// expected to be close in Euclidean distance.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor([f32; DESCRIPTOR_SIZE]);

impl Descriptor {
    pub const fn new(values: [f32; DESCRIPTOR_SIZE]) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Euclidean distance, accumulated in `f64`.
    pub fn distance(&self, other: &Descriptor) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(&a, &b)| {
                let d = a as f64 - b as f64;
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }

    /// Scale to unit Euclidean length. A zero vector is returned unchanged.
    pub fn normalized(&self) -> Descriptor {
        let norm = self.0.iter().map(|&v| v as f64 * v as f64).sum::<f64>().sqrt();
        if norm == 0.0 || !norm.is_finite() {
            return self.clone();
        }
        Descriptor(self.0.map(|v| (v as f64 / norm) as f32))
    }

    /// Element-wise mean. Returns `None` for an empty input.
    pub fn mean<'a, I>(descriptors: I) -> Option<Descriptor>
    where
        I: IntoIterator<Item = &'a Descriptor>,
    {
        let mut sum = [0.0f64; DESCRIPTOR_SIZE];
        let mut count = 0usize;
        for d in descriptors {
            for (acc, &v) in sum.iter_mut().zip(d.0.iter()) {
                *acc += v as f64;
            }
            count += 1;
        }
        if count == 0 {
            return None;
        }
        Some(Descriptor(std::array::from_fn(|i| {
            (sum[i] / count as f64) as f32
        })))
    }
}

impl From<[f32; DESCRIPTOR_SIZE]> for Descriptor {
    fn from(values: [f32; DESCRIPTOR_SIZE]) -> Self {
        Self(values)
    }
}

impl TryFrom<&[f32]> for Descriptor {
    type Error = DescriptorLengthError;

    fn try_from(values: &[f32]) -> Result<Self, Self::Error> {
        let array: [f32; DESCRIPTOR_SIZE] = values
            .try_into()
            .map_err(|_| DescriptorLengthError(values.len()))?;
        Ok(Self(array))
    }
}
