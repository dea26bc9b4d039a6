//! likeness-core: face identity classification pipeline.
//!
//! Haar cascades find faces (kept only when enough eyes are visible inside),
//! each crop is turned into a raw-pixel plus wavelet-detail feature vector,
//! and a pretrained classifier exported to ONNX assigns the identity.

pub mod artifacts;
pub mod cascade;
pub mod classifier;
pub mod config;
pub mod cropper;
pub mod decoder;
pub mod features;
pub mod imaging;
pub mod labels;
pub mod service;
pub mod types;
pub mod wavelet;

pub use artifacts::{ArtifactLoadError, ArtifactPaths, ArtifactStore, Artifacts};
pub use cascade::{CascadeDetector, CascadeError, DetectorParams, HaarCascade};
pub use classifier::{Classifier, ClassifierError, OnnxClassifier};
pub use config::{CascadePaths, PipelineConfig};
pub use cropper::{FaceCropper, ObjectDetector};
pub use decoder::{DecodeError, ImageSource};
pub use features::{ChannelOrder, FeatureVector, FeatureVectorBuilder};
pub use labels::{LabelMap, LabelMapError};
pub use service::{ClassificationService, ClassifyError};
pub use types::{ClassificationResult, DetectionRegion, Rect};
pub use wavelet::{WaveletConfig, WaveletFamily, WaveletFeatureExtractor};
