//! Gallery construction from a persons directory.
//!
//! Layout: every immediate subdirectory of the root is a person, named after
//! the directory; every file inside it is a sample image of that person.
//! Entries are visited in file-name order, so the gallery order is stable.

use crate::detector::{Detect, DetectorError};
use crate::gallery::Gallery;
use crate::recognizer::{Recognize, RecognizerError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("reading {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("expected exactly one face in {path}, found {count}")]
    FaceCount { path: PathBuf, count: usize },
    #[error("detecting faces in {path}: {source}")]
    Detection {
        path: PathBuf,
        #[source]
        source: DetectorError,
    },
    #[error("computing descriptor for {path}: {source}")]
    Recognition {
        path: PathBuf,
        #[source]
        source: RecognizerError,
    },
}

/// What to do when a decodable sample cannot produce a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplePolicy {
    /// Stop building and return the error.
    #[default]
    Abort,
    /// Log a warning and continue with the next sample.
    Skip,
}

/// Descriptor extraction parameters used for every sample.
#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    pub padding: f64,
    pub jitter: u32,
    pub policy: SamplePolicy,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            padding: 0.0,
            jitter: 30,
            policy: SamplePolicy::Abort,
        }
    }
}

/// Counters collected while building.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildReport {
    /// Samples that contributed a descriptor.
    pub samples: usize,
    /// Files that could not be decoded as images.
    pub undecodable: usize,
    /// Samples dropped under [`SamplePolicy::Skip`].
    pub skipped: usize,
    /// Persons that ended up with no descriptors.
    pub empty_persons: Vec<String>,
}

/// Build a gallery from `root`.
///
/// A person whose directory yields no descriptors is still added, with an
/// empty descriptor list; such persons are listed in the report.
pub fn build_gallery<D, R>(
    root: &Path,
    detector: &mut D,
    recognizer: &mut R,
    options: &BuildOptions,
) -> Result<(Gallery, BuildReport), GalleryError>
where
    D: Detect + ?Sized,
    R: Recognize + ?Sized,
{
    let mut gallery = Gallery::new();
    let mut report = BuildReport::default();

    for person_dir in sorted_entries(root)? {
        if !person_dir.file_type().is_dir() {
            continue;
        }
        let name = person_dir.file_name().to_string_lossy().into_owned();
        gallery.insert_person(&name);

        for sample in sorted_entries(person_dir.path())? {
            if sample.file_type().is_dir() {
                continue;
            }
            let path = sample.path();

            let image = match image::open(path) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "skipping undecodable file");
                    report.undecodable += 1;
                    continue;
                }
            };

            let outcome = detector
                .detect(&image)
                .map_err(|source| GalleryError::Detection {
                    path: path.to_path_buf(),
                    source,
                })
                .and_then(|faces| match faces.as_slice() {
                    [face] => Ok(face.clone()),
                    _ => Err(GalleryError::FaceCount {
                        path: path.to_path_buf(),
                        count: faces.len(),
                    }),
                })
                .and_then(|face| {
                    recognizer
                        .recognize(&image, &face, options.padding, options.jitter)
                        .map_err(|source| GalleryError::Recognition {
                            path: path.to_path_buf(),
                            source,
                        })
                });

            match outcome {
                Ok(descriptor) => {
                    gallery.add(&name, descriptor);
                    report.samples += 1;
                }
                Err(err) => match options.policy {
                    SamplePolicy::Abort => return Err(err),
                    SamplePolicy::Skip => {
                        tracing::warn!(error = %err, "skipping sample");
                        report.skipped += 1;
                    }
                },
            }
        }

        let count = gallery.get(&name).map_or(0, |p| p.descriptors.len());
        if count == 0 {
            tracing::warn!(person = %name, "person has no usable samples");
            report.empty_persons.push(name.clone());
        }
        tracing::info!(person = %name, descriptors = count, "person loaded");
    }

    tracing::info!(
        persons = gallery.len(),
        descriptors = gallery.descriptor_count(),
        undecodable = report.undecodable,
        skipped = report.skipped,
        "gallery built"
    );

    Ok((gallery, report))
}

fn sorted_entries(dir: &Path) -> Result<Vec<walkdir::DirEntry>, GalleryError> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| GalleryError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Descriptor, Detection, Point, Rectangle, DESCRIPTOR_SIZE};
    use image::{Rgb, RgbImage};
    use std::fs;

    /// Reports as many faces as the red channel of pixel (0, 0).
    struct FakeDetector;

    impl Detect for FakeDetector {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
            let red = image.get_pixel(0, 0)[0];
            if red == 255 {
                return Err(DetectorError::InferenceFailed("broken sample".into()));
            }
            Ok((0..red)
                .map(|_| Detection::new(Rectangle::new(Point::new(0, 0), Point::new(4, 4)), 0.99))
                .collect())
        }
    }

    /// Descriptor filled with the green channel of pixel (0, 0); records calls.
    #[derive(Default)]
    struct FakeRecognizer {
        calls: Vec<(f64, u32)>,
    }

    impl Recognize for FakeRecognizer {
        fn recognize(
            &mut self,
            image: &RgbImage,
            _face: &Detection,
            padding: f64,
            jitter: u32,
        ) -> Result<Descriptor, RecognizerError> {
            self.calls.push((padding, jitter));
            let green = image.get_pixel(0, 0)[1] as f32;
            Ok(Descriptor::new([green; DESCRIPTOR_SIZE]))
        }
    }

    fn sample(dir: &Path, file: &str, faces: u8, tag: u8) {
        fs::create_dir_all(dir).unwrap();
        RgbImage::from_pixel(4, 4, Rgb([faces, tag, 0]))
            .save(dir.join(file))
            .unwrap();
    }

    fn tags(gallery: &Gallery, name: &str) -> Vec<f32> {
        gallery
            .get(name)
            .unwrap()
            .descriptors
            .iter()
            .map(|d| d.as_slice()[0])
            .collect()
    }

    #[test]
    fn test_builds_persons_in_name_order() {
        let root = tempfile::tempdir().unwrap();
        sample(&root.path().join("carol"), "1.png", 1, 30);
        sample(&root.path().join("bob"), "b.png", 1, 21);
        sample(&root.path().join("bob"), "a.png", 1, 20);
        fs::write(root.path().join("README.txt"), "not a person").unwrap();

        let mut recognizer = FakeRecognizer::default();
        let options = BuildOptions { padding: 0.25, jitter: 3, policy: SamplePolicy::Abort };
        let (gallery, report) =
            build_gallery(root.path(), &mut FakeDetector, &mut recognizer, &options).unwrap();

        let names: Vec<&str> = gallery.all().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["bob", "carol"]);
        assert_eq!(tags(&gallery, "bob"), [20.0, 21.0]);
        assert_eq!(tags(&gallery, "carol"), [30.0]);
        assert_eq!(report.samples, 3);
        assert_eq!(recognizer.calls, vec![(0.25, 3); 3]);
    }

    #[test]
    fn test_undecodable_files_and_nested_dirs_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let alice = root.path().join("alice");
        sample(&alice, "good.png", 1, 7);
        fs::write(alice.join("notes.txt"), "hello").unwrap();
        fs::write(alice.join("broken.png"), [0u8, 1, 2, 3]).unwrap();
        sample(&alice.join("nested"), "ignored.png", 1, 99);

        let (gallery, report) = build_gallery(
            root.path(),
            &mut FakeDetector,
            &mut FakeRecognizer::default(),
            &BuildOptions::default(),
        )
        .unwrap();

        assert_eq!(tags(&gallery, "alice"), [7.0]);
        assert_eq!(report.undecodable, 2);
        assert_eq!(report.samples, 1);
    }

    #[test]
    fn test_face_count_other_than_one_aborts() {
        let root = tempfile::tempdir().unwrap();
        sample(&root.path().join("dave"), "group.png", 2, 0);

        let err = build_gallery(
            root.path(),
            &mut FakeDetector,
            &mut FakeRecognizer::default(),
            &BuildOptions::default(),
        )
        .unwrap_err();

        match err {
            GalleryError::FaceCount { path, count } => {
                assert_eq!(count, 2);
                assert!(path.ends_with("dave/group.png"));
            }
            other => panic!("expected FaceCount, got {other:?}"),
        }
    }

    #[test]
    fn test_no_face_aborts() {
        let root = tempfile::tempdir().unwrap();
        sample(&root.path().join("erin"), "empty.png", 0, 0);

        let err = build_gallery(
            root.path(),
            &mut FakeDetector,
            &mut FakeRecognizer::default(),
            &BuildOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GalleryError::FaceCount { count: 0, .. }));
    }

    #[test]
    fn test_detector_failure_aborts() {
        let root = tempfile::tempdir().unwrap();
        sample(&root.path().join("frank"), "x.png", 255, 0);

        let err = build_gallery(
            root.path(),
            &mut FakeDetector,
            &mut FakeRecognizer::default(),
            &BuildOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GalleryError::Detection { .. }));
    }

    #[test]
    fn test_skip_policy_continues_and_keeps_empty_person() {
        let root = tempfile::tempdir().unwrap();
        sample(&root.path().join("gina"), "group.png", 3, 0);
        sample(&root.path().join("gina"), "broken.png", 255, 0);
        sample(&root.path().join("hank"), "ok.png", 1, 5);

        let options = BuildOptions { policy: SamplePolicy::Skip, ..BuildOptions::default() };
        let (gallery, report) = build_gallery(
            root.path(),
            &mut FakeDetector,
            &mut FakeRecognizer::default(),
            &options,
        )
        .unwrap();

        assert_eq!(gallery.len(), 2);
        assert!(gallery.get("gina").unwrap().descriptors.is_empty());
        assert_eq!(tags(&gallery, "hank"), [5.0]);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.empty_persons, vec!["gina".to_string()]);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let err = build_gallery(
            &root.path().join("missing"),
            &mut FakeDetector,
            &mut FakeRecognizer::default(),
            &BuildOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GalleryError::ReadDir { .. }));
    }
}
