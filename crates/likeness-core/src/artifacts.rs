//! Process-wide cache of the label map and the trained classifier.
//!
//! Loading happens once, on an explicit [`ArtifactStore::ensure_loaded`] call.
//! Concurrent first callers are serialized; every later read goes straight to
//! the `OnceLock` without locking.

use crate::classifier::{Classifier, ClassifierError, OnnxClassifier};
use crate::labels::{LabelMap, LabelMapError};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use thiserror::Error;

/// Default artifact directory, relative to the working directory.
pub const DEFAULT_ARTIFACT_DIR: &str = "artifacts";
pub const LABEL_MAP_FILE: &str = "class_dictionary.json";
pub const CLASSIFIER_FILE: &str = "saved_model.onnx";

#[derive(Error, Debug)]
pub enum ArtifactLoadError {
    #[error("label map: {0}")]
    LabelMap(#[from] LabelMapError),
    #[error("classifier: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("artifact initialization lock poisoned by an earlier panic")]
    Poisoned,
}

/// On-disk locations of the artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub label_map: PathBuf,
    pub classifier: PathBuf,
}

impl ArtifactPaths {
    /// Standard file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            label_map: dir.join(LABEL_MAP_FILE),
            classifier: dir.join(CLASSIFIER_FILE),
        }
    }
}

impl Default for ArtifactPaths {
    fn default() -> Self {
        Self::in_dir(Path::new(DEFAULT_ARTIFACT_DIR))
    }
}

/// The loaded, immutable artifact pair.
pub struct Artifacts {
    label_map: LabelMap,
    classifier: Box<dyn Classifier>,
}

impl Artifacts {
    pub fn new(label_map: LabelMap, classifier: Box<dyn Classifier>) -> Self {
        Self {
            label_map,
            classifier,
        }
    }

    /// Read the label map JSON and load the ONNX classifier.
    pub fn load(paths: &ArtifactPaths) -> Result<Self, ArtifactLoadError> {
        let label_map = LabelMap::load(&paths.label_map)?;
        let classifier = OnnxClassifier::load(&paths.classifier)?;
        Ok(Self::new(label_map, Box::new(classifier)))
    }

    pub fn label_map(&self) -> &LabelMap {
        &self.label_map
    }

    pub fn classifier(&self) -> &dyn Classifier {
        self.classifier.as_ref()
    }
}

impl std::fmt::Debug for Artifacts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifacts")
            .field("classes", &self.label_map.len())
            .finish_non_exhaustive()
    }
}

/// Lazily initialized, shareable artifact cache.
pub struct ArtifactStore {
    paths: Option<ArtifactPaths>,
    loaded: OnceLock<Artifacts>,
    init: Mutex<()>,
}

impl ArtifactStore {
    /// A store that will load from `paths` on first [`ensure_loaded`](Self::ensure_loaded).
    pub fn new(paths: ArtifactPaths) -> Self {
        Self {
            paths: Some(paths),
            loaded: OnceLock::new(),
            init: Mutex::new(()),
        }
    }

    /// A store that is already initialized with in-memory artifacts.
    pub fn preloaded(artifacts: Artifacts) -> Self {
        Self {
            paths: None,
            loaded: OnceLock::from(artifacts),
            init: Mutex::new(()),
        }
    }

    /// Load the artifacts if this has not happened yet.
    ///
    /// A failed load leaves the store uninitialized, so a later call retries.
    pub fn ensure_loaded(&self) -> Result<&Artifacts, ArtifactLoadError> {
        if let Some(artifacts) = self.loaded.get() {
            return Ok(artifacts);
        }

        let _guard = self.init.lock().map_err(|_| ArtifactLoadError::Poisoned)?;
        if let Some(artifacts) = self.loaded.get() {
            return Ok(artifacts);
        }

        // `preloaded` stores are always initialized, so paths exist here.
        let paths = self.paths.clone().unwrap_or_default();
        tracing::info!(
            label_map = %paths.label_map.display(),
            classifier = %paths.classifier.display(),
            "loading artifacts"
        );
        let artifacts = Artifacts::load(&paths)?;
        Ok(self.loaded.get_or_init(|| artifacts))
    }

    /// The cached artifacts, or `None` before a successful load.
    pub fn artifacts(&self) -> Option<&Artifacts> {
        self.loaded.get()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.get().is_some()
    }
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("paths", &self.paths)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
