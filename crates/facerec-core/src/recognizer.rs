//! SFace face descriptor extractor via ONNX Runtime.
//!
//! Turns a detected face of an RGB image into a unit-length 128-dimensional
//! descriptor. The face is aligned on its landmarks, padded, optionally
//! jittered, sampled into a 112x112 chip, and run through the descriptor
//! network.

use crate::chip::{self, ChipTransform, Jitter};
use crate::types::{Descriptor, Detection, Rectangle};
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use thiserror::Error;

// Fixed seed so repeated calls on the same input yield the same descriptor.
const JITTER_SEED: u64 = 0;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}; download face_recognition_sface_2021dec.onnx into the models directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region {0:?} does not overlap the image")]
    EmptyRegion(Rectangle),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Capability: compute a descriptor for a detected face.
pub trait Recognize {
    /// `face` supplies the region and, when available, the alignment
    /// landmarks. `padding` grows the face by that fraction on each side
    /// before extraction. `jitter` is how many randomly perturbed chips are
    /// averaged; 0 or 1 means a single unperturbed chip.
    fn recognize(
        &mut self,
        image: &RgbImage,
        face: &Detection,
        padding: f64,
        jitter: u32,
    ) -> Result<Descriptor, RecognizerError>;
}

/// Convert raw network output into a unit-length descriptor.
pub fn descriptor_from_output(raw: &[f32]) -> Result<Descriptor, RecognizerError> {
    Descriptor::try_from(raw)
        .map(|d| d.normalized())
        .map_err(|e| RecognizerError::InferenceFailed(e.to_string()))
}

/// Image-to-chip transform for `face`: fitted on its landmarks, or on the
/// reference layout stretched over its rectangle when it has none.
pub fn chip_transform(face: &Detection, padding: f64) -> Option<ChipTransform> {
    let landmarks = face
        .landmarks
        .unwrap_or_else(|| chip::box_landmarks(&face.rect));
    ChipTransform::align(&landmarks).map(|t| t.with_padding(padding))
}

/// SFace-based descriptor extractor. The ONNX session is released on drop.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the SFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded SFace model"
        );

        Ok(Self { session })
    }

    /// Run the network on one chip and copy the output into an owned descriptor.
    fn embed(&mut self, face_chip: &RgbImage) -> Result<Descriptor, RecognizerError> {
        let input = chip::chip_tensor(face_chip);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("descriptor extraction: {e}")))?;

        descriptor_from_output(raw)
    }
}

impl Recognize for FaceRecognizer {
    fn recognize(
        &mut self,
        image: &RgbImage,
        face: &Detection,
        padding: f64,
        jitter: u32,
    ) -> Result<Descriptor, RecognizerError> {
        let padded = chip::padded_region(&face.rect, padding);
        if padded.is_empty() || padded.clamp_to(image.width(), image.height()).is_empty() {
            return Err(RecognizerError::EmptyRegion(face.rect));
        }
        let transform =
            chip_transform(face, padding).ok_or(RecognizerError::EmptyRegion(face.rect))?;

        if jitter <= 1 {
            let face_chip = chip::extract_chip(image, &transform, false);
            return self.embed(&face_chip);
        }

        let mut rng = StdRng::seed_from_u64(JITTER_SEED);
        let mut descriptors = Vec::with_capacity(jitter as usize);
        for _ in 0..jitter {
            let j = Jitter::random(&mut rng);
            let face_chip = chip::extract_chip(image, &j.apply(&transform), j.mirror);
            descriptors.push(self.embed(&face_chip)?);
        }

        tracing::trace!(jitter, "averaged jittered descriptors");

        // The mean of unit vectors is shorter than one.
        Descriptor::mean(&descriptors)
            .map(|d| d.normalized())
            .ok_or_else(|| RecognizerError::InferenceFailed("no jittered descriptors".into()))
    }
}
