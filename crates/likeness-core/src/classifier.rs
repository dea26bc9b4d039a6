//! Pretrained classifier seam and its ONNX Runtime implementation.
//!
//! The ONNX artifact is a scikit-learn classifier exported with the ZipMap
//! operator disabled: a `[1, D]` float input, an `int64` label output and a
//! `[1, C]` float probability output.

use crate::features::FeatureVector;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("classifier artifact not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("classifier session poisoned by an earlier panic")]
    Poisoned,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A trained model mapping a feature vector to a class id.
pub trait Classifier: Send + Sync {
    /// Most likely class id.
    fn predict(&self, features: &FeatureVector) -> Result<usize, ClassifierError>;

    /// Per-class probabilities, indexed by class id.
    fn predict_proba(&self, features: &FeatureVector) -> Result<Vec<f32>, ClassifierError>;

    /// Class id and probabilities together. Backends that produce both from
    /// one inference should override this.
    fn predict_with_proba(
        &self,
        features: &FeatureVector,
    ) -> Result<(usize, Vec<f32>), ClassifierError> {
        Ok((self.predict(features)?, self.predict_proba(features)?))
    }
}

/// Output tensor indices: (label_idx, probability_idx).
type OutputIndices = (usize, usize);

/// ONNX Runtime backed classifier.
pub struct OnnxClassifier {
    session: Mutex<Session>,
    outputs: OutputIndices,
}

impl OnnxClassifier {
    /// Load the ONNX classifier from the given path.
    pub fn load(model_path: &Path) -> Result<Self, ClassifierError> {
        if !model_path.exists() {
            return Err(ClassifierError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded classifier model"
        );

        if output_names.len() < 2 {
            return Err(ClassifierError::InferenceFailed(format!(
                "classifier must expose label and probability outputs, got {}",
                output_names.len()
            )));
        }

        let outputs = discover_output_indices(&output_names);
        tracing::debug!(?outputs, "classifier output tensor mapping");

        Ok(Self {
            session: Mutex::new(session),
            outputs,
        })
    }

    /// Run the model once, returning the label and the probability row.
    fn run(&self, features: &FeatureVector) -> Result<(i64, Vec<f32>), ClassifierError> {
        let (label_idx, proba_idx) = self.outputs;
        let mut session = self.session.lock().map_err(|_| ClassifierError::Poisoned)?;

        let outputs = session.run(ort::inputs![TensorRef::from_array_view(features.as_row())?])?;

        let (_, labels) = outputs[label_idx]
            .try_extract_tensor::<i64>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("label output: {e}")))?;
        let (_, probabilities) = outputs[proba_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("probability output: {e}")))?;

        let label = labels
            .first()
            .copied()
            .ok_or_else(|| ClassifierError::InferenceFailed("empty label output".into()))?;
        if probabilities.is_empty() {
            return Err(ClassifierError::InferenceFailed("empty probability output".into()));
        }

        Ok((label, probabilities.to_vec()))
    }
}

impl Classifier for OnnxClassifier {
    fn predict(&self, features: &FeatureVector) -> Result<usize, ClassifierError> {
        let (label, _) = self.run(features)?;
        class_id(label)
    }

    fn predict_proba(&self, features: &FeatureVector) -> Result<Vec<f32>, ClassifierError> {
        let (_, probabilities) = self.run(features)?;
        Ok(probabilities)
    }

    fn predict_with_proba(
        &self,
        features: &FeatureVector,
    ) -> Result<(usize, Vec<f32>), ClassifierError> {
        let (label, probabilities) = self.run(features)?;
        Ok((class_id(label)?, probabilities))
    }
}

fn class_id(label: i64) -> Result<usize, ClassifierError> {
    usize::try_from(label)
        .map_err(|_| ClassifierError::InferenceFailed(format!("negative class id {label}")))
}

/// Find the label and probability outputs by name.
///
/// skl2onnx names them `label` / `probabilities` or `output_label` /
/// `output_probability`. Unrecognized names fall back to positions 0 and 1.
fn discover_output_indices(names: &[String]) -> OutputIndices {
    let find = |needle: &str| names.iter().position(|n| n.to_ascii_lowercase().contains(needle));

    match (find("label"), find("probab")) {
        (Some(label), Some(proba)) if label != proba => (label, proba),
        _ => {
            tracing::info!(
                ?names,
                "classifier output names not recognized, using positional mapping [0]=label, [1]=probabilities"
            );
            (0, 1)
        }
    }
}
