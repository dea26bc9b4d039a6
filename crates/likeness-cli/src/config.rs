use anyhow::{Context, Result};
use likeness_core::artifacts::DEFAULT_ARTIFACT_DIR;
use likeness_core::config::DEFAULT_CASCADE_DIR;
use likeness_core::{ArtifactPaths, CascadePaths, PipelineConfig};
use std::path::PathBuf;

/// CLI configuration, loaded from `LIKENESS_*` environment variables.
pub struct Config {
    /// Directory holding `class_dictionary.json` and `saved_model.onnx`.
    pub artifact_dir: PathBuf,
    /// Directory holding the face and eye cascade XML files.
    pub cascade_dir: PathBuf,
    /// Pipeline tuning, from `LIKENESS_CONFIG` (TOML) with env overrides.
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut pipeline: PipelineConfig = match var("LIKENESS_CONFIG") {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading pipeline config {path}"))?;
                toml::from_str(&text).with_context(|| format!("parsing pipeline config {path}"))?
            }
            None => PipelineConfig::default(),
        };

        if let Some(min_eyes) = parsed(&var, "LIKENESS_MIN_EYES") {
            pipeline.min_eyes = min_eyes;
        }
        if let Some(size) = parsed(&var, "LIKENESS_FEATURE_SIZE") {
            pipeline.feature_size = size;
        }

        Ok(Self {
            artifact_dir: var("LIKENESS_ARTIFACT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACT_DIR)),
            cascade_dir: var("LIKENESS_CASCADE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CASCADE_DIR)),
            pipeline,
        })
    }

    pub fn artifact_paths(&self) -> ArtifactPaths {
        ArtifactPaths::in_dir(&self.artifact_dir)
    }

    pub fn cascade_paths(&self) -> CascadePaths {
        CascadePaths::in_dir(&self.cascade_dir)
    }
}

/// Parse an env value, ignoring it (with a warning) when malformed.
fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment value");
            None
        }
    }
}
