//! Model seams for the hybrid predictor and their ONNX Runtime backends.

use ndarray::{Array2, ArrayView2, ArrayView3};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{DynValue, Tensor};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{ArtifactLoadError, InferenceError};

/// Output of a tabular model for a batch of encoded rows.
#[derive(Debug, Clone, PartialEq)]
pub enum TabularOutput {
    /// Calibrated class probabilities, shape (n_rows, n_classes)
    Probabilities(Array2<f64>),
    /// Raw scalar output per row (regression or margin)
    Raw(Vec<f64>),
}

impl TabularOutput {
    /// Positive-class probability when calibrated, raw output otherwise.
    pub fn into_scores(self) -> Result<Vec<f64>, InferenceError> {
        match self {
            TabularOutput::Probabilities(probs) => {
                if probs.ncols() < 2 {
                    return Err(InferenceError::Shape(format!(
                        "expected at least 2 probability columns, got {}",
                        probs.ncols()
                    )));
                }
                Ok(probs.column(1).to_vec())
            }
            TabularOutput::Raw(values) => Ok(values),
        }
    }
}

/// Maps encoded rows (n_rows, n_features) to one output per row.
pub trait TabularModel: Send + Sync + fmt::Debug {
    fn predict(&self, rows: ArrayView2<'_, f32>) -> Result<TabularOutput, InferenceError>;

    /// Short label for logs and model info.
    fn kind(&self) -> &'static str;
}

/// Maps encoded windows (n_windows, window_length, n_features) to one probability per window.
pub trait SequenceModel: Send + Sync + fmt::Debug {
    fn predict(&self, windows: ArrayView3<'_, f32>) -> Result<Vec<f64>, InferenceError>;

    fn kind(&self) -> &'static str;
}

fn build_session(path: &Path) -> Result<Session, String> {
    Session::builder()
        .map_err(|e| e.to_string())?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| e.to_string())?
        .with_intra_threads(4)
        .map_err(|e| e.to_string())?
        .commit_from_file(path)
        .map_err(|e| e.to_string())
}

fn extract_f32(value: &DynValue) -> Result<(Vec<i64>, Vec<f32>), InferenceError> {
    let (shape, data) = value
        .try_extract_tensor::<f32>()
        .map_err(InferenceError::runtime)?;
    Ok((shape.iter().copied().collect(), data.to_vec()))
}

fn missing_output(index: usize, len: usize) -> InferenceError {
    InferenceError::Shape(format!(
        "expected at least {} outputs from model, got {}",
        index + 1,
        len
    ))
}

/// Tabular model exported to ONNX (e.g. a boosted-tree classifier).
pub struct OnnxTabularModel {
    path: PathBuf,
    session: Mutex<Session>,
    probability_output: bool,
}

impl fmt::Debug for OnnxTabularModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnnxTabularModel")
            .field("path", &self.path)
            .field("probability_output", &self.probability_output)
            .finish()
    }
}

impl OnnxTabularModel {
    /// Load ONNX model from file.
    ///
    /// With `probability_output`, output 1 holds class probabilities
    /// (output 0 being the predicted labels); otherwise output 0 is a raw score.
    pub fn load(path: &Path, probability_output: bool) -> Result<Self, ArtifactLoadError> {
        let session = build_session(path).map_err(|message| ArtifactLoadError::Onnx {
            path: path.to_path_buf(),
            message,
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            session: Mutex::new(session),
            probability_output,
        })
    }
}

impl TabularModel for OnnxTabularModel {
    fn predict(&self, rows: ArrayView2<'_, f32>) -> Result<TabularOutput, InferenceError> {
        let n_rows = rows.nrows();
        let input_tensor = Tensor::from_array(rows.to_owned()).map_err(InferenceError::runtime)?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| InferenceError::Runtime(format!("Failed to lock session: {}", e)))?;
        let outputs = session
            .run(ort::inputs![input_tensor])
            .map_err(InferenceError::runtime)?;

        if self.probability_output {
            if outputs.len() < 2 {
                return Err(missing_output(1, outputs.len()));
            }
            let (shape, data) = extract_f32(&outputs[1])?;
            if shape.len() != 2 || shape[0] as usize != n_rows {
                return Err(InferenceError::Shape(format!(
                    "unexpected probability shape {:?} for {} rows",
                    shape, n_rows
                )));
            }
            let n_cols = shape[1] as usize;
            let probs = Array2::from_shape_vec(
                (n_rows, n_cols),
                data.into_iter().map(f64::from).collect(),
            )
            .map_err(|e| InferenceError::Shape(e.to_string()))?;
            Ok(TabularOutput::Probabilities(probs))
        } else {
            if outputs.len() < 1 {
                return Err(missing_output(0, outputs.len()));
            }
            let (_, data) = extract_f32(&outputs[0])?;
            if data.len() != n_rows {
                return Err(InferenceError::Shape(format!(
                    "expected {} raw outputs, got {}",
                    n_rows,
                    data.len()
                )));
            }
            Ok(TabularOutput::Raw(data.into_iter().map(f64::from).collect()))
        }
    }

    fn kind(&self) -> &'static str {
        "onnx"
    }
}

/// Session state of a lazily-initialized model.
enum LazySession {
    Pending,
    Ready(Session),
    /// Initialization failed once; not retried for the life of the model.
    Failed(String),
}

/// Sequence model exported to ONNX.
///
/// The runtime session is created on first use, so a bundle whose sequence
/// model is never exercised does not pay the session start-up cost.
pub struct OnnxSequenceModel {
    path: PathBuf,
    session: Mutex<LazySession>,
}

impl fmt::Debug for OnnxSequenceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnnxSequenceModel")
            .field("path", &self.path)
            .finish()
    }
}

impl OnnxSequenceModel {
    pub fn lazy(path: &Path) -> Result<Self, ArtifactLoadError> {
        if !path.exists() {
            return Err(ArtifactLoadError::NotFound(path.to_path_buf()));
        }
        Ok(Self {
            path: path.to_path_buf(),
            session: Mutex::new(LazySession::Pending),
        })
    }
}

impl SequenceModel for OnnxSequenceModel {
    fn predict(&self, windows: ArrayView3<'_, f32>) -> Result<Vec<f64>, InferenceError> {
        let n_windows = windows.shape()[0];
        let input_tensor =
            Tensor::from_array(windows.to_owned()).map_err(InferenceError::runtime)?;

        let mut guard = self
            .session
            .lock()
            .map_err(|e| InferenceError::Runtime(format!("Failed to lock session: {}", e)))?;
        if matches!(*guard, LazySession::Pending) {
            tracing::info!("Initializing ONNX sequence model from {}", self.path.display());
            *guard = match build_session(&self.path) {
                Ok(session) => LazySession::Ready(session),
                Err(message) => {
                    tracing::warn!(
                        "ONNX sequence model {} failed to initialize, disabled: {}",
                        self.path.display(),
                        message
                    );
                    LazySession::Failed(message)
                }
            };
        }
        let session = match &mut *guard {
            LazySession::Ready(session) => session,
            LazySession::Failed(message) => {
                return Err(InferenceError::Runtime(format!(
                    "sequence session unavailable: {}",
                    message
                )))
            }
            LazySession::Pending => {
                return Err(InferenceError::Runtime("sequence session unavailable".into()))
            }
        };

        let outputs = session
            .run(ort::inputs![input_tensor])
            .map_err(InferenceError::runtime)?;
        if outputs.len() < 1 {
            return Err(missing_output(0, outputs.len()));
        }
        let (_, data) = extract_f32(&outputs[0])?;

        if data.len() != n_windows {
            return Err(InferenceError::Shape(format!(
                "expected {} sequence outputs, got {}",
                n_windows,
                data.len()
            )));
        }
        Ok(data.into_iter().map(f64::from).collect())
    }

    fn kind(&self) -> &'static str {
        "onnx"
    }
}
