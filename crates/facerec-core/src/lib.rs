//! facerec-core: face detection, descriptor extraction, and name matching.
//!
//! Uses SCRFD for face detection and SFace for 128-dimensional face
//! descriptors, both running via ONNX Runtime. Known faces are kept in an
//! in-memory [`Gallery`] and matched by Euclidean distance.

pub mod builder;
pub mod chip;
pub mod detector;
pub mod gallery;
pub mod matcher;
pub mod recognizer;
pub mod types;

pub use builder::{build_gallery, BuildOptions, BuildReport, GalleryError, SamplePolicy};
pub use detector::{Detect, DetectorError, FaceDetector};
pub use gallery::{Gallery, Person};
pub use matcher::{EuclideanMatcher, Matcher, Nearest, ParallelMatcher, Verdict, NO_MATCH_DISTANCE};
pub use recognizer::{descriptor_from_output, FaceRecognizer, Recognize, RecognizerError};
pub use types::{Descriptor, Detection, Landmarks, Point, Rectangle, DESCRIPTOR_SIZE};

/// File name of the SCRFD detection model inside a models directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";

/// File name of the SFace descriptor model inside a models directory.
pub const RECOGNIZER_MODEL_FILE: &str = "face_recognition_sface_2021dec.onnx";
