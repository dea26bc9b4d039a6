//! Pipeline tuning knobs.

use crate::cascade::DetectorParams;
use crate::cropper::DEFAULT_MIN_EYES;
use crate::features::{ChannelOrder, DEFAULT_FEATURE_SIZE};
use crate::wavelet::WaveletConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CASCADE_DIR: &str = "opencv";
pub const FACE_CASCADE_FILE: &str = "haarcascade_frontalface_default.xml";
pub const EYE_CASCADE_FILE: &str = "haarcascade_eye.xml";

/// Everything that shapes detection and feature extraction.
///
/// Deserializable from TOML or JSON; omitted fields take the defaults the
/// reference classifier was trained with. Detector tables are overlays on
/// their own presets, so `[face] min_neighbors = 3` keeps the face scale step.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "PipelineFile")]
pub struct PipelineConfig {
    pub face: DetectorParams,
    pub eyes: DetectorParams,
    pub min_eyes: usize,
    pub wavelet: WaveletConfig,
    pub feature_size: u32,
    pub channel_order: ChannelOrder,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            face: DetectorParams::face(),
            eyes: DetectorParams::eyes(),
            min_eyes: DEFAULT_MIN_EYES,
            wavelet: WaveletConfig::default(),
            feature_size: DEFAULT_FEATURE_SIZE,
            channel_order: ChannelOrder::default(),
        }
    }
}

/// Per-field detector overrides as they appear in a config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DetectorOverrides {
    scale_factor: Option<f64>,
    min_neighbors: Option<u32>,
    min_size: Option<u32>,
    max_size: Option<u32>,
}

impl DetectorOverrides {
    fn apply(self, base: DetectorParams) -> DetectorParams {
        DetectorParams {
            scale_factor: self.scale_factor.unwrap_or(base.scale_factor),
            min_neighbors: self.min_neighbors.unwrap_or(base.min_neighbors),
            min_size: self.min_size.unwrap_or(base.min_size),
            max_size: self.max_size.unwrap_or(base.max_size),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PipelineFile {
    face: DetectorOverrides,
    eyes: DetectorOverrides,
    min_eyes: Option<usize>,
    wavelet: Option<WaveletConfig>,
    feature_size: Option<u32>,
    channel_order: Option<ChannelOrder>,
}

impl From<PipelineFile> for PipelineConfig {
    fn from(file: PipelineFile) -> Self {
        let defaults = PipelineConfig::default();
        Self {
            face: file.face.apply(defaults.face),
            eyes: file.eyes.apply(defaults.eyes),
            min_eyes: file.min_eyes.unwrap_or(defaults.min_eyes),
            wavelet: file.wavelet.unwrap_or(defaults.wavelet),
            feature_size: file.feature_size.unwrap_or(defaults.feature_size),
            channel_order: file.channel_order.unwrap_or(defaults.channel_order),
        }
    }
}

/// Face and eye cascade definition files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadePaths {
    pub face: PathBuf,
    pub eyes: PathBuf,
}

impl CascadePaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            face: dir.join(FACE_CASCADE_FILE),
            eyes: dir.join(EYE_CASCADE_FILE),
        }
    }
}

impl Default for CascadePaths {
    fn default() -> Self {
        Self::in_dir(Path::new(DEFAULT_CASCADE_DIR))
    }
}
