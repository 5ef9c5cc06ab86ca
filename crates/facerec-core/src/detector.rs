//! SCRFD face detector via ONNX Runtime.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor-free decoding and NMS post-processing.
//! Raw float boxes and five-point landmarks are decoded from the network
//! outputs and converted to integer [`Detection`] rectangles in source image
//! coordinates. Landmarks stay in floating point for alignment.

use crate::types::{Detection, Landmarks, Point, Rectangle};
use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download det_10g.onnx from insightface into the models directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("images should have same size: image {index} is {actual:?}, expected {expected:?}")]
    SizeMismatch {
        index: usize,
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("image has zero width or height")]
    EmptyImage,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Capability: locate faces in images.
pub trait Detect {
    /// Detect faces in one image, highest confidence first.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError>;

    /// Detect faces in several images of identical dimensions.
    ///
    /// Returns one detection list per input image, in input order. An empty
    /// batch yields an empty result.
    fn detect_batch(&mut self, images: &[RgbImage]) -> Result<Vec<Vec<Detection>>, DetectorError> {
        check_uniform_size(images)?;
        images.iter().map(|image| self.detect(image)).collect()
    }
}

/// Fail with [`DetectorError::SizeMismatch`] unless all images share the first
/// image's dimensions.
pub fn check_uniform_size(images: &[RgbImage]) -> Result<(), DetectorError> {
    let Some(first) = images.first() else {
        return Ok(());
    };
    let expected = first.dimensions();
    for (index, image) in images.iter().enumerate().skip(1) {
        if image.dimensions() != expected {
            return Err(DetectorError::SizeMismatch {
                index,
                expected,
                actual: image.dimensions(),
            });
        }
    }
    Ok(())
}

/// Float box produced by stride decoding, before rounding to a [`Detection`].
#[derive(Debug, Clone)]
struct RawBox {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    confidence: f32,
    landmarks: Option<Landmarks>,
}

impl RawBox {
    fn into_detection(self) -> Detection {
        Detection {
            rect: Rectangle::new(
                Point::new(self.x.round() as i32, self.y.round() as i32),
                Point::new(
                    (self.x + self.width).round() as i32,
                    (self.y + self.height).round() as i32,
                ),
            ),
            confidence: self.confidence as f64,
            landmarks: self.landmarks,
        }
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
    /// Absent for exports without keypoint heads.
    kps: Option<usize>,
}

/// SCRFD-based face detector. The ONNX session is released on drop.
pub struct FaceDetector {
    session: Session,
    input_size: usize,
    confidence_threshold: f32,
    nms_threshold: f32,
    /// Per-stride output indices for strides [8, 16, 32]. Discovered by name
    /// at load time; falls back to positional ordering.
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if num_outputs < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires at least 6 outputs (3 strides × score/bbox), got {num_outputs}"
            )));
        }

        let stride_outputs = discover_output_indices(&output_names);
        tracing::debug!(?stride_outputs, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_size: SCRFD_INPUT_SIZE,
            confidence_threshold: SCRFD_CONFIDENCE_THRESHOLD,
            nms_threshold: SCRFD_NMS_THRESHOLD,
            stride_outputs,
        })
    }

    /// Override the minimum face score.
    pub fn with_confidence_threshold(mut self, confidence: f32) -> Self {
        self.confidence_threshold = confidence;
        self
    }

    /// Preprocess an RGB image into a NCHW float tensor with letterbox padding.
    fn preprocess(&self, image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
        let (width, height) = image.dimensions();
        let size = self.input_size;

        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as usize).clamp(1, size);
        let new_h = ((height as f32 * scale).round() as usize).clamp(1, size);
        let pad_x = (size - new_w) as f32 / 2.0;
        let pad_y = (size - new_h) as f32 / 2.0;

        let letterbox = LetterboxInfo { scale, pad_x, pad_y };

        let resized = imageops::resize(
            image,
            new_w as u32,
            new_h as u32,
            imageops::FilterType::Triangle,
        );

        // Padding is zero after normalization, which is what `zeros` already holds.
        let pad_x_start = pad_x.floor() as usize;
        let pad_y_start = pad_y.floor() as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, px) in resized.enumerate_pixels() {
            let tx = x as usize + pad_x_start;
            let ty = y as usize + pad_y_start;
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (px[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        (tensor, letterbox)
    }
}

impl Detect for FaceDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectorError::EmptyImage);
        }

        let (input, letterbox) = self.preprocess(image);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_boxes = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let indices = self.stride_outputs[stride_pos];

            let (_, scores) = outputs[indices.score]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[indices.bbox]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let kps = match indices.kps {
                Some(idx) => Some(outputs[idx].try_extract_tensor::<f32>().map_err(|e| {
                    DetectorError::InferenceFailed(format!("keypoints stride {stride}: {e}"))
                })?),
                None => None,
            };

            all_boxes.extend(decode_stride(
                scores,
                bboxes,
                kps.map(|(_, k)| k),
                stride,
                self.input_size,
                &letterbox,
                self.confidence_threshold,
            ));
        }

        let kept = nms(all_boxes, self.nms_threshold);
        tracing::trace!(faces = kept.len(), "SCRFD detections after NMS");

        Ok(kept.into_iter().map(RawBox::into_detection).collect())
    }
}

/// Discover output tensor ordering by name.
///
/// SCRFD models may export tensors with named outputs ("score_8", "bbox_16",
/// "kps_32", ...) or generic numeric names. Otherwise falls back to the
/// standard positional ordering:
///   [0-2] = scores, [3-5] = bboxes, [6-8] = keypoints when present
fn discover_output_indices(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideOutputs {
                score: find("score", stride)?,
                bbox: find("bbox", stride)?,
                kps: find("kps", stride),
            })
        })
        .collect();

    match named {
        Some(outputs) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [outputs[0], outputs[1], outputs[2]]
        }
        None => {
            let has_kps = names.len() >= 9;
            tracing::info!(
                ?names,
                has_kps,
                "SCRFD: output names not recognized, using positional mapping"
            );
            std::array::from_fn(|pos| StrideOutputs {
                score: pos,
                bbox: pos + 3,
                kps: has_kps.then_some(pos + 6),
            })
        }
    }
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: Option<&[f32]>,
    stride: usize,
    input_size: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<RawBox> {
    let grid = input_size / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;
    let unletterbox = |x: f32, y: f32| {
        (
            (x - letterbox.pad_x) / letterbox.scale,
            (y - letterbox.pad_y) / letterbox.scale,
        )
    };

    let mut boxes = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid * stride) as f32;
        let anchor_cy = (anchor_idx / grid * stride) as f32;

        // [left, top, right, bottom] distances in stride units
        let off = idx * 4;
        let Some(d) = bboxes.get(off..off + 4) else {
            continue;
        };
        let (x1, y1) = unletterbox(anchor_cx - d[0] * s, anchor_cy - d[1] * s);
        let (x2, y2) = unletterbox(anchor_cx + d[2] * s, anchor_cy + d[3] * s);

        // Five (dx, dy) offsets from the anchor in stride units
        let landmarks = kps
            .and_then(|k| k.get(idx * 10..idx * 10 + 10))
            .map(|k| {
                std::array::from_fn(|i| unletterbox(anchor_cx + k[2 * i] * s, anchor_cy + k[2 * i + 1] * s))
            });

        boxes.push(RawBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }

    boxes
}

/// Non-Maximum Suppression: remove overlapping boxes, highest confidence first.
fn nms(mut boxes: Vec<RawBox>, iou_threshold: f32) -> Vec<RawBox> {
    boxes.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<RawBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Compute Intersection-over-Union between two boxes.
fn iou(a: &RawBox, b: &RawBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.width * a.height + b.width * b.height - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn make_box(x: f32, y: f32, w: f32, h: f32, conf: f32) -> RawBox {
        RawBox { x, y, width: w, height: h, confidence: conf, landmarks: None }
    }

    #[test]
    fn test_iou_identical() {
        let a = make_box(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = make_box(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_box(5.0, 0.0, 10.0, 10.0, 1.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert!(iou(&a, &make_box(20.0, 20.0, 10.0, 10.0, 1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let boxes = vec![
            make_box(5.0, 5.0, 100.0, 100.0, 0.8),
            make_box(200.0, 200.0, 50.0, 50.0, 0.7),
            make_box(0.0, 0.0, 100.0, 100.0, 0.9),
        ];
        let result = nms(boxes, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_decode_stride_maps_back_through_letterbox() {
        // Identity letterbox, stride 32 → 20x20 grid, 800 anchors.
        let letterbox = LetterboxInfo { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let mut scores = vec![0.0f32; 800];
        let mut bboxes = vec![0.0f32; 800 * 4];
        // Anchor 43 → cell 21 → row 1, col 1 → center (32, 32).
        scores[43] = 0.95;
        bboxes[43 * 4..43 * 4 + 4].copy_from_slice(&[0.5, 0.5, 1.0, 1.0]);

        let boxes = decode_stride(&scores, &bboxes, None, 32, 640, &letterbox, 0.5);
        assert_eq!(boxes.len(), 1);
        let det = boxes[0].clone().into_detection();
        assert_eq!(det.rect, Rectangle::new(Point::new(16, 16), Point::new(64, 64)));
        assert!((det.confidence - 0.95).abs() < 1e-6);
        assert!(det.landmarks.is_none());
    }

    #[test]
    fn test_decode_stride_landmarks() {
        // Stride 16 → 40x40 grid; letterbox scale 2 with 80px vertical padding.
        let letterbox = LetterboxInfo { scale: 2.0, pad_x: 0.0, pad_y: 80.0 };
        let mut scores = vec![0.0f32; 3200];
        let bboxes = vec![1.0f32; 3200 * 4];
        let mut kps = vec![0.0f32; 3200 * 10];
        // Anchor 2 * (40 * 10 + 5) → center (80, 160).
        let idx = 2 * (40 * 10 + 5);
        scores[idx] = 0.9;
        kps[idx * 10..idx * 10 + 10]
            .copy_from_slice(&[-1.0, -1.0, 1.0, -1.0, 0.0, 0.0, -1.0, 1.0, 1.0, 1.0]);

        let boxes = decode_stride(&scores, &bboxes, Some(kps.as_slice()), 16, 640, &letterbox, 0.5);
        assert_eq!(boxes.len(), 1);
        let lm = boxes[0].landmarks.unwrap();
        // (80 - 16, 160 - 16) in letterbox space → ((64 - 0) / 2, (144 - 80) / 2)
        assert_eq!(lm[0], (32.0, 32.0));
        assert_eq!(lm[1], (48.0, 32.0));
        assert_eq!(lm[2], (40.0, 40.0));
        assert_eq!(lm[4], (48.0, 48.0));

        // Truncated keypoint tensor: box survives without landmarks.
        let short = decode_stride(&scores, &bboxes, Some(&kps[..10]), 16, 640, &letterbox, 0.5);
        assert_eq!(short.len(), 1);
        assert!(short[0].landmarks.is_none());
    }

    #[test]
    fn test_decode_stride_respects_threshold() {
        let letterbox = LetterboxInfo { scale: 2.0, pad_x: 0.0, pad_y: 80.0 };
        let scores = vec![0.5f32; 800];
        let bboxes = vec![1.0f32; 800 * 4];
        assert!(decode_stride(&scores, &bboxes, None, 32, 640, &letterbox, 0.5).is_empty());
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();

        let indices = discover_output_indices(&names);
        assert_eq!(indices[0], StrideOutputs { score: 2, bbox: 0, kps: Some(1) });
        assert_eq!(indices[2], StrideOutputs { score: 8, bbox: 6, kps: Some(7) });
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        let indices = discover_output_indices(&names);
        assert_eq!(indices[1], StrideOutputs { score: 1, bbox: 4, kps: Some(7) });

        let six: Vec<String> = (0..6).map(|i: usize| i.to_string()).collect();
        let indices = discover_output_indices(&six);
        assert_eq!(indices[2], StrideOutputs { score: 2, bbox: 5, kps: None });
    }

    #[test]
    fn test_check_uniform_size() {
        let a = RgbImage::from_pixel(4, 3, Rgb([0, 0, 0]));
        let b = RgbImage::from_pixel(4, 3, Rgb([9, 9, 9]));
        let c = RgbImage::from_pixel(3, 4, Rgb([0, 0, 0]));

        assert!(check_uniform_size(&[]).is_ok());
        assert!(check_uniform_size(&[a.clone(), b.clone()]).is_ok());

        match check_uniform_size(&[a, b, c]) {
            Err(DetectorError::SizeMismatch { index, expected, actual }) => {
                assert_eq!(index, 2);
                assert_eq!(expected, (4, 3));
                assert_eq!(actual, (3, 4));
            }
            other => panic!("expected SizeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceDetector::load("/nonexistent/det_10g.onnx").err().unwrap();
        assert!(matches!(err, DetectorError::ModelNotFound(_)));
    }
}
