//! End-to-end runs through real cascade files on disk with a stub classifier.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::{ImageFormat, Rgb, RgbImage};
use likeness_core::{
    ArtifactStore, Artifacts, CascadePaths, ClassificationService, Classifier, ClassifierError,
    ClassifyError, DetectorParams, FeatureVector, ImageSource, LabelMap, PipelineConfig, Rect,
};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

/// 4x4 window, one stump: fires where the right half is brighter than the left.
const EDGE_CASCADE: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier"><stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>4</height>
  <width>4</width>
  <stageNum>1</stageNum>
  <stages>
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>0.5</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>0 -1 0 0.1</internalNodes>
          <leafValues>-1. 1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>0 0 2 4 -1.</_>
        <_>2 0 2 4 1.</_></rects>
      <tilted>0</tilted></_></features></cascade>
</opencv_storage>
"#;

struct Uniform {
    classes: usize,
}

impl Classifier for Uniform {
    fn predict(&self, features: &FeatureVector) -> Result<usize, ClassifierError> {
        assert_eq!(features.len(), 4 * 64 * 64);
        Ok(self.classes - 1)
    }

    fn predict_proba(&self, _features: &FeatureVector) -> Result<Vec<f32>, ClassifierError> {
        Ok(vec![1.0 / self.classes as f32; self.classes])
    }
}

fn write_cascades(dir: &Path) -> CascadePaths {
    let paths = CascadePaths::in_dir(dir);
    std::fs::write(&paths.face, EDGE_CASCADE).unwrap();
    std::fs::write(&paths.eyes, EDGE_CASCADE).unwrap();
    paths
}

fn store() -> Arc<ArtifactStore> {
    let labels = LabelMap::from_json(r#"{"ada": 0, "grace": 1}"#).unwrap();
    Arc::new(ArtifactStore::preloaded(Artifacts::new(
        labels,
        Box::new(Uniform { classes: 2 }),
    )))
}

fn config(min_eyes: usize) -> PipelineConfig {
    PipelineConfig {
        face: DetectorParams {
            scale_factor: 2.0,
            min_neighbors: 0,
            ..DetectorParams::face()
        },
        min_eyes,
        ..PipelineConfig::default()
    }
}

/// Black left half, white right half.
fn edge_png() -> String {
    let img = RgbImage::from_fn(8, 8, |x, _| {
        if x < 4 {
            Rgb([0, 0, 0])
        } else {
            Rgb([255, 255, 255])
        }
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    format!("data:image/png;base64,{}", BASE64.encode(out.into_inner()))
}

#[test]
fn test_faces_found_by_cascade_are_classified() {
    let dir = tempfile::tempdir().unwrap();
    let cascades = write_cascades(dir.path());
    let service = ClassificationService::new(&config(0), &cascades, store()).unwrap();
    service.initialize().unwrap();

    let source = ImageSource::Encoded(edge_png());
    let regions = service.detect_faces(&source).unwrap();
    let boxes: Vec<Rect> = regions.iter().map(|r| r.bbox).collect();
    assert_eq!(boxes, vec![Rect::new(2, 0, 4, 4), Rect::new(2, 2, 4, 4)]);

    let results = service.classify(&source).unwrap();
    assert_eq!(results.len(), 2);
    for result in &results {
        assert_eq!(result.class_name, "grace");
        assert_eq!(result.class_probability, vec![50.0, 50.0]);
        assert_eq!(result.class_dictionary.len(), 2);
    }

    let json = serde_json::to_value(&results[0]).unwrap();
    assert_eq!(json["class"], "grace");
    assert_eq!(json["class_dictionary"]["ada"], 0);
}

#[test]
fn test_faces_without_eyes_yield_no_results() {
    let dir = tempfile::tempdir().unwrap();
    let cascades = write_cascades(dir.path());
    let service = ClassificationService::new(&config(2), &cascades, store()).unwrap();
    service.initialize().unwrap();

    // 4x4 face crops are too small for the eye scan, so no face passes.
    let results = service.classify(&ImageSource::Encoded(edge_png())).unwrap();
    assert!(results.is_empty());
}

#[test]
fn test_bad_payload_is_a_decode_error() {
    let dir = tempfile::tempdir().unwrap();
    let cascades = write_cascades(dir.path());
    let service = ClassificationService::new(&config(2), &cascades, store()).unwrap();

    let err = service
        .classify(&ImageSource::Encoded("data:image/png;base64,bm90IGFuIGltYWdl".into()))
        .unwrap_err();
    assert!(matches!(err, ClassifyError::Decode(_)), "{err}");
}

#[test]
fn test_missing_cascade_fails_construction() {
    let dir = tempfile::tempdir().unwrap();
    let result = ClassificationService::new(&config(2), &CascadePaths::in_dir(dir.path()), store());
    assert!(result.is_err());
}
