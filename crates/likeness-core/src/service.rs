//! End-to-end classification: decode, crop, featurize, predict, package.

use crate::artifacts::{ArtifactLoadError, ArtifactStore, Artifacts};
use crate::cascade::{CascadeDetector, CascadeError};
use crate::classifier::ClassifierError;
use crate::config::{CascadePaths, PipelineConfig};
use crate::cropper::FaceCropper;
use crate::decoder::{self, DecodeError, ImageSource};
use crate::features::FeatureVectorBuilder;
use crate::types::{ClassificationResult, DetectionRegion};
use crate::wavelet::WaveletFeatureExtractor;
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("artifacts are not loaded; call initialize() first")]
    Uninitialized,
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("inference: {0}")]
    Inference(#[from] ClassifierError),
    #[error("classifier predicted class id {id}, label map has {classes} classes")]
    UnknownClassId { id: usize, classes: usize },
    #[error("classifier returned {got} probabilities for {expected} classes")]
    ProbabilityCount { got: usize, expected: usize },
}

/// Shared, thread-safe classification pipeline.
pub struct ClassificationService {
    cropper: FaceCropper,
    extractor: WaveletFeatureExtractor,
    builder: FeatureVectorBuilder,
    store: Arc<ArtifactStore>,
}

impl ClassificationService {
    /// Build the pipeline, loading both cascade definitions from disk.
    ///
    /// Artifacts are not touched; call [`initialize`](Self::initialize).
    pub fn new(
        config: &PipelineConfig,
        cascades: &CascadePaths,
        store: Arc<ArtifactStore>,
    ) -> Result<Self, CascadeError> {
        let faces = CascadeDetector::load(&cascades.face, config.face)?;
        let eyes = CascadeDetector::load(&cascades.eyes, config.eyes)?;
        let cropper = FaceCropper::new(Box::new(faces), Box::new(eyes), config.min_eyes);

        Ok(Self::from_parts(
            cropper,
            WaveletFeatureExtractor::new(&config.wavelet).with_channel_order(config.channel_order),
            FeatureVectorBuilder::new(config.feature_size, config.channel_order),
            store,
        ))
    }

    pub fn from_parts(
        cropper: FaceCropper,
        extractor: WaveletFeatureExtractor,
        builder: FeatureVectorBuilder,
        store: Arc<ArtifactStore>,
    ) -> Self {
        Self {
            cropper,
            extractor,
            builder,
            store,
        }
    }

    /// Load the label map and classifier. Safe to call more than once.
    pub fn initialize(&self) -> Result<(), ArtifactLoadError> {
        self.store.ensure_loaded().map(|_| ())
    }

    /// Classify every accepted face in the image.
    ///
    /// No accepted face is not an error: the result is empty.
    pub fn classify(&self, source: &ImageSource) -> Result<Vec<ClassificationResult>, ClassifyError> {
        let artifacts = self.artifacts()?;
        let image = decoder::decode(source)?;
        self.classify_with(artifacts, &image)
    }

    /// [`classify`](Self::classify) for an already decoded image.
    pub fn classify_image(&self, image: &RgbImage) -> Result<Vec<ClassificationResult>, ClassifyError> {
        let artifacts = self.artifacts()?;
        self.classify_with(artifacts, image)
    }

    /// Decode and crop only; no artifacts needed.
    pub fn detect_faces(&self, source: &ImageSource) -> Result<Vec<DetectionRegion>, ClassifyError> {
        let image = decoder::decode(source)?;
        Ok(self.cropper.crop_faces(&image))
    }

    fn artifacts(&self) -> Result<&Artifacts, ClassifyError> {
        self.store.artifacts().ok_or(ClassifyError::Uninitialized)
    }

    fn classify_with(
        &self,
        artifacts: &Artifacts,
        image: &RgbImage,
    ) -> Result<Vec<ClassificationResult>, ClassifyError> {
        let regions = self.cropper.crop_faces(image);
        tracing::debug!(faces = regions.len(), "accepted face regions");

        regions
            .iter()
            .map(|region| self.classify_region(artifacts, region))
            .collect()
    }

    fn classify_region(
        &self,
        artifacts: &Artifacts,
        region: &DetectionRegion,
    ) -> Result<ClassificationResult, ClassifyError> {
        let labels = artifacts.label_map();
        let classifier = artifacts.classifier();

        let detail = self.extractor.extract(&region.color);
        let features = self.builder.build(&region.color, &detail);

        let (id, probabilities) = classifier.predict_with_proba(&features)?;
        let class_name = labels
            .name_of(id)
            .ok_or(ClassifyError::UnknownClassId {
                id,
                classes: labels.len(),
            })?
            .to_string();

        if probabilities.len() != labels.len() {
            return Err(ClassifyError::ProbabilityCount {
                got: probabilities.len(),
                expected: labels.len(),
            });
        }

        tracing::debug!(bbox = ?region.bbox, class = %class_name, id, "face classified");

        Ok(ClassificationResult {
            class_name,
            class_probability: to_percentages(&probabilities),
            class_dictionary: labels.to_dictionary(),
        })
    }
}

/// Probabilities in `[0, 1]` as percentages rounded to two decimals
/// (half-to-even).
pub fn to_percentages(probabilities: &[f32]) -> Vec<f64> {
    probabilities
        .iter()
        .map(|&p| (p as f64 * 100.0 * 100.0).round_ties_even() / 100.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactPaths;
    use crate::classifier::Classifier;
    use crate::cropper::ObjectDetector;
    use crate::features::FeatureVector;
    use crate::labels::LabelMap;
    use crate::types::Rect;
    use crate::wavelet::WaveletConfig;
    use image::{GrayImage, Rgb};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed(Vec<Rect>);

    impl ObjectDetector for Fixed {
        fn detect(&self, _image: &GrayImage) -> Vec<Rect> {
            self.0.clone()
        }
    }

    struct Stub {
        id: usize,
        proba: Vec<f32>,
    }

    impl Classifier for Stub {
        fn predict(&self, features: &FeatureVector) -> Result<usize, ClassifierError> {
            if features.len() != 16384 {
                return Err(ClassifierError::InferenceFailed(format!("got {} features", features.len())));
            }
            Ok(self.id)
        }

        fn predict_proba(&self, _features: &FeatureVector) -> Result<Vec<f32>, ClassifierError> {
            Ok(self.proba.clone())
        }
    }

    const LABELS: &str = r#"{"lionel_messi": 0, "roger_federer": 1, "virat_kohli": 2}"#;

    fn store(classifier: Stub) -> Arc<ArtifactStore> {
        let labels = LabelMap::from_json(LABELS).unwrap();
        Arc::new(ArtifactStore::preloaded(Artifacts::new(labels, Box::new(classifier))))
    }

    fn service(faces: Vec<Rect>, eyes: usize, classifier: Stub) -> ClassificationService {
        let cropper = FaceCropper::new(
            Box::new(Fixed(faces)),
            Box::new(Fixed(vec![Rect::new(2, 2, 5, 5); eyes])),
            2,
        );
        ClassificationService::from_parts(
            cropper,
            WaveletFeatureExtractor::new(&WaveletConfig::default()),
            FeatureVectorBuilder::default(),
            store(classifier),
        )
    }

    fn photo() -> RgbImage {
        RgbImage::from_fn(120, 90, |x, y| Rgb([(x * 2) as u8, (y * 2) as u8, ((x + y) % 256) as u8]))
    }

    fn federer() -> Stub {
        Stub {
            id: 1,
            proba: vec![0.2, 0.5, 0.3],
        }
    }

    #[test]
    fn test_no_face_is_empty() {
        let svc = service(vec![], 2, federer());
        assert!(svc.classify_image(&photo()).unwrap().is_empty());
    }

    #[test]
    fn test_single_eye_face_is_empty() {
        let svc = service(vec![Rect::new(10, 10, 50, 50)], 1, federer());
        assert!(svc.classify_image(&photo()).unwrap().is_empty());
    }

    #[test]
    fn test_one_face_one_result() {
        let svc = service(vec![Rect::new(10, 10, 50, 60)], 2, federer());
        let results = svc.classify_image(&photo()).unwrap();
        assert_eq!(results.len(), 1);

        let result = &results[0];
        assert_eq!(result.class_name, "roger_federer");
        assert_eq!(result.class_probability, vec![20.0, 50.0, 30.0]);
        let total: f64 = result.class_probability.iter().sum();
        assert!((total - 100.0).abs() < 1e-6);
        assert_eq!(result.class_dictionary, LabelMap::from_json(LABELS).unwrap().to_dictionary());
        assert_eq!(result.top_class_id(), Some(1));
    }

    #[test]
    fn test_results_follow_face_order() {
        let svc = service(
            vec![Rect::new(0, 0, 40, 40), Rect::new(60, 30, 40, 40)],
            3,
            federer(),
        );
        assert_eq!(svc.classify_image(&photo()).unwrap().len(), 2);
    }

    #[test]
    fn test_uninitialized_fails_fast() {
        let store = Arc::new(ArtifactStore::new(ArtifactPaths::in_dir(Path::new("/nonexistent"))));
        let cropper = FaceCropper::new(Box::new(Fixed(vec![])), Box::new(Fixed(vec![])), 2);
        let svc = ClassificationService::from_parts(
            cropper,
            WaveletFeatureExtractor::default(),
            FeatureVectorBuilder::default(),
            store,
        );
        assert!(matches!(svc.classify_image(&photo()), Err(ClassifyError::Uninitialized)));
        assert!(matches!(
            svc.classify(&ImageSource::Encoded("not even base64".into())),
            Err(ClassifyError::Uninitialized)
        ));
        assert!(svc.initialize().is_err());
    }

    #[test]
    fn test_decode_failure_is_distinct() {
        let svc = service(vec![Rect::new(10, 10, 50, 50)], 2, federer());
        let err = svc.classify(&ImageSource::Encoded("data:image/png;base64,????".into())).unwrap_err();
        assert!(matches!(err, ClassifyError::Decode(_)), "{err}");
    }

    #[test]
    fn test_unknown_class_id() {
        let svc = service(vec![Rect::new(10, 10, 50, 50)], 2, Stub { id: 7, proba: vec![0.1, 0.2, 0.7] });
        let err = svc.classify_image(&photo()).unwrap_err();
        assert!(matches!(err, ClassifyError::UnknownClassId { id: 7, classes: 3 }), "{err}");
    }

    #[test]
    fn test_probability_count_mismatch() {
        let svc = service(vec![Rect::new(10, 10, 50, 50)], 2, Stub { id: 0, proba: vec![0.4, 0.6] });
        let err = svc.classify_image(&photo()).unwrap_err();
        assert!(matches!(err, ClassifyError::ProbabilityCount { got: 2, expected: 3 }), "{err}");
    }

    /// Fails on the separate calls so only the combined one can succeed.
    struct SingleRun {
        runs: Arc<AtomicUsize>,
    }

    impl Classifier for SingleRun {
        fn predict(&self, _features: &FeatureVector) -> Result<usize, ClassifierError> {
            Err(ClassifierError::InferenceFailed("separate predict".into()))
        }

        fn predict_proba(&self, _features: &FeatureVector) -> Result<Vec<f32>, ClassifierError> {
            Err(ClassifierError::InferenceFailed("separate predict_proba".into()))
        }

        fn predict_with_proba(
            &self,
            _features: &FeatureVector,
        ) -> Result<(usize, Vec<f32>), ClassifierError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok((2, vec![0.1, 0.1, 0.8]))
        }
    }

    #[test]
    fn test_one_inference_per_face() {
        let runs = Arc::new(AtomicUsize::new(0));
        let labels = LabelMap::from_json(LABELS).unwrap();
        let classifier = SingleRun { runs: Arc::clone(&runs) };
        let store = Arc::new(ArtifactStore::preloaded(Artifacts::new(labels, Box::new(classifier))));
        let cropper = FaceCropper::new(
            Box::new(Fixed(vec![Rect::new(0, 0, 40, 40), Rect::new(60, 30, 40, 40)])),
            Box::new(Fixed(vec![Rect::new(2, 2, 5, 5); 2])),
            2,
        );
        let svc = ClassificationService::from_parts(
            cropper,
            WaveletFeatureExtractor::default(),
            FeatureVectorBuilder::default(),
            store,
        );

        let results = svc.classify_image(&photo()).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.class_name == "virat_kohli"));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_initialize_is_idempotent_when_preloaded() {
        let svc = service(vec![], 2, federer());
        assert!(svc.initialize().is_ok());
        assert!(svc.initialize().is_ok());
    }

    #[test]
    fn test_percentages_round_to_two_decimals() {
        assert_eq!(to_percentages(&[0.5, 1.0 / 3.0, 2.0 / 3.0, 0.0]), vec![50.0, 33.33, 66.67, 0.0]);
    }

    #[test]
    fn test_service_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ClassificationService>();
    }
}
