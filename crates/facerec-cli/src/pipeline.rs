//! Per-image recognition: detect every face, describe it, match it.

use facerec_core::{Detect, DetectorError, Detection, Gallery, Matcher, Recognize, Rectangle};
use image::RgbImage;
use serde::Serialize;

/// One face found in an image, after matching.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceReport {
    pub rect: Rectangle,
    pub confidence: f64,
    /// Matched person, or `None` when the face is unknown.
    pub name: Option<String>,
    /// Distance to the nearest gallery descriptor, `None` for an empty gallery.
    pub distance: Option<f64>,
}

/// Descriptor extraction parameters and acceptance threshold.
#[derive(Debug, Clone, Copy)]
pub struct RecognitionParams {
    pub padding: f64,
    pub jitter: u32,
    pub match_distance: f64,
}

/// Detector, recognizer and a frozen gallery wired together.
pub struct Pipeline<D, R> {
    detector: D,
    recognizer: R,
    gallery: Gallery,
    matcher: Box<dyn Matcher>,
    params: RecognitionParams,
}

impl<D: Detect, R: Recognize> Pipeline<D, R> {
    pub fn new(
        detector: D,
        recognizer: R,
        gallery: Gallery,
        matcher: Box<dyn Matcher>,
        params: RecognitionParams,
    ) -> Self {
        Self {
            detector,
            recognizer,
            gallery,
            matcher,
            params,
        }
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    /// Detect, describe and match every face in `image`. A face whose
    /// descriptor cannot be computed is logged and left out.
    pub fn process(&mut self, image: &RgbImage) -> Result<Vec<FaceReport>, DetectorError> {
        let detections = self.detector.detect(image)?;
        Ok(self.describe(image, detections))
    }

    /// Like [`process`](Self::process) for several same-sized images, using
    /// batch detection.
    pub fn process_batch(
        &mut self,
        images: &[RgbImage],
    ) -> Result<Vec<Vec<FaceReport>>, DetectorError> {
        let batches = self.detector.detect_batch(images)?;
        Ok(images
            .iter()
            .zip(batches)
            .map(|(image, detections)| self.describe(image, detections))
            .collect())
    }

    fn describe(&mut self, image: &RgbImage, detections: Vec<Detection>) -> Vec<FaceReport> {
        let mut reports = Vec::with_capacity(detections.len());

        for detection in detections {
            let descriptor = match self.recognizer.recognize(
                image,
                &detection,
                self.params.padding,
                self.params.jitter,
            ) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    tracing::warn!(rect = ?detection.rect, error = %e, "skipping face");
                    continue;
                }
            };

            let nearest = self.matcher.nearest(&self.gallery, &descriptor);
            let verdict = nearest.classify(self.params.match_distance);

            tracing::debug!(
                rect = ?detection.rect,
                confidence = detection.confidence,
                nearest = ?nearest.person.map(|p| p.name.as_str()),
                distance = nearest.distance,
                known = verdict.is_known(),
                "face matched"
            );

            reports.push(FaceReport {
                rect: detection.rect,
                confidence: detection.confidence,
                name: verdict.name().map(str::to_string),
                distance: nearest.person.map(|_| nearest.distance),
            });
        }

        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facerec_core::{Descriptor, EuclideanMatcher, Point, RecognizerError, DESCRIPTOR_SIZE};
    use image::Rgb;

    /// One face per distinct non-black column band: the red channel of each
    /// detected pixel column at row 0 becomes the descriptor value.
    struct StripeDetector;

    impl Detect for StripeDetector {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
            Ok((0..image.width())
                .filter(|&x| image.get_pixel(x, 0)[0] != 0)
                .map(|x| {
                    Detection::new(
                        Rectangle::new(Point::new(x as i32, 0), Point::new(x as i32 + 1, 1)),
                        0.9,
                    )
                })
                .collect())
        }
    }

    /// Descriptor filled with red / 100; a red value of 255 fails.
    struct PixelRecognizer;

    impl Recognize for PixelRecognizer {
        fn recognize(
            &mut self,
            image: &RgbImage,
            face: &Detection,
            _padding: f64,
            _jitter: u32,
        ) -> Result<Descriptor, RecognizerError> {
            let red = image.get_pixel(face.rect.min.x as u32, 0)[0];
            if red == 255 {
                return Err(RecognizerError::EmptyRegion(face.rect));
            }
            let v = red as f32 / 100.0;
            Ok(Descriptor::new([v; DESCRIPTOR_SIZE]))
        }
    }

    fn pipeline(gallery: Gallery) -> Pipeline<StripeDetector, PixelRecognizer> {
        Pipeline::new(
            StripeDetector,
            PixelRecognizer,
            gallery,
            Box::new(EuclideanMatcher),
            RecognitionParams { padding: 0.2, jitter: 1, match_distance: 0.5 },
        )
    }

    fn image_with(values: &[u8]) -> RgbImage {
        let mut img = RgbImage::from_pixel(values.len() as u32, 1, Rgb([0, 0, 0]));
        for (x, &v) in values.iter().enumerate() {
            img.put_pixel(x as u32, 0, Rgb([v, 0, 0]));
        }
        img
    }

    #[test]
    fn test_known_and_unknown_faces() {
        let mut gallery = Gallery::new();
        gallery.add("Bob", Descriptor::new([1.0; DESCRIPTOR_SIZE]));

        let mut p = pipeline(gallery);
        // 100 → exactly Bob; 200 → distance sqrt(128) from Bob
        let reports = p.process(&image_with(&[100, 0, 200])).unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].name.as_deref(), Some("Bob"));
        assert_eq!(reports[0].distance, Some(0.0));
        assert_eq!(reports[1].name, None);
        assert!((reports[1].distance.unwrap() - 128f64.sqrt()).abs() < 1e-6);
        assert_eq!(reports[1].rect.min.x, 2);
    }

    #[test]
    fn test_empty_gallery_reports_unknown_without_distance() {
        let mut p = pipeline(Gallery::new());
        let reports = p.process(&image_with(&[50])).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].name, None);
        assert_eq!(reports[0].distance, None);
    }

    #[test]
    fn test_batch_rejects_mixed_sizes() {
        let mut p = pipeline(Gallery::new());
        let err = p
            .process_batch(&[image_with(&[1, 2]), image_with(&[1, 2, 3])])
            .unwrap_err();
        assert!(matches!(err, DetectorError::SizeMismatch { index: 1, .. }));

        let ok = p.process_batch(&[image_with(&[10, 0]), image_with(&[0, 0])]).unwrap();
        assert_eq!(ok.len(), 2);
        assert_eq!(ok[0].len(), 1);
        assert!(ok[1].is_empty());
    }

    #[test]
    fn test_failed_face_does_not_drop_the_others() {
        let mut gallery = Gallery::new();
        gallery.add("Bob", Descriptor::new([1.0; DESCRIPTOR_SIZE]));

        let mut p = pipeline(gallery);
        let reports = p.process(&image_with(&[255, 100, 255])).unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].name.as_deref(), Some("Bob"));
        assert_eq!(reports[0].rect.min.x, 1);
    }

    #[test]
    fn test_report_serializes_to_json() {
        let report = FaceReport {
            rect: Rectangle::new(Point::new(1, 2), Point::new(3, 4)),
            confidence: 0.5,
            name: Some("Bob".into()),
            distance: Some(0.25),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["name"], "Bob");
        assert_eq!(json["rect"]["max"]["y"], 4);
        assert_eq!(json["distance"], 0.25);
    }
}
