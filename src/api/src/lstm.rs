//! Single-layer LSTM with a sigmoid dense head, evaluated natively.
//!
//! Weights use the Keras layout: `kernel` is (input_dim, 4 * units),
//! `recurrent_kernel` is (units, 4 * units), gates ordered i, f, c, o.

use ndarray::{s, Array1, Array2, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::error::{ArtifactLoadError, InferenceError};
use crate::model::SequenceModel;

/// Serialized weights as stored in the bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LstmSpec {
    pub kernel: Vec<Vec<f32>>,
    pub recurrent_kernel: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
    pub dense_kernel: Vec<f32>,
    pub dense_bias: f32,
}

#[derive(Debug, Clone)]
pub struct LstmModel {
    kernel: Array2<f64>,
    recurrent_kernel: Array2<f64>,
    bias: Array1<f64>,
    dense_kernel: Array1<f64>,
    dense_bias: f64,
    units: usize,
}

fn to_matrix(rows: &[Vec<f32>], name: &str, cols: usize) -> Result<Array2<f64>, ArtifactLoadError> {
    let n_rows = rows.len();
    let mut flat = Vec::with_capacity(n_rows * cols);
    for (i, row) in rows.iter().enumerate() {
        if row.len() != cols {
            return Err(ArtifactLoadError::invalid(format!(
                "{} row {} has {} values, expected {}",
                name,
                i,
                row.len(),
                cols
            )));
        }
        flat.extend(row.iter().map(|v| f64::from(*v)));
    }
    Array2::from_shape_vec((n_rows, cols), flat)
        .map_err(|e| ArtifactLoadError::invalid(format!("{}: {}", name, e)))
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl LstmModel {
    /// Build from serialized weights, checking every shape against `input_dim`.
    pub fn from_spec(spec: &LstmSpec, input_dim: usize) -> Result<Self, ArtifactLoadError> {
        let units = spec.dense_kernel.len();
        if units == 0 {
            return Err(ArtifactLoadError::invalid("lstm has zero units"));
        }
        if spec.kernel.len() != input_dim {
            return Err(ArtifactLoadError::invalid(format!(
                "lstm kernel expects {} input features, encoder produces {}",
                spec.kernel.len(),
                input_dim
            )));
        }
        if spec.recurrent_kernel.len() != units {
            return Err(ArtifactLoadError::invalid(format!(
                "lstm recurrent_kernel has {} rows, expected {}",
                spec.recurrent_kernel.len(),
                units
            )));
        }
        if spec.bias.len() != 4 * units {
            return Err(ArtifactLoadError::invalid(format!(
                "lstm bias has {} values, expected {}",
                spec.bias.len(),
                4 * units
            )));
        }

        Ok(Self {
            kernel: to_matrix(&spec.kernel, "kernel", 4 * units)?,
            recurrent_kernel: to_matrix(&spec.recurrent_kernel, "recurrent_kernel", 4 * units)?,
            bias: spec.bias.iter().map(|v| f64::from(*v)).collect(),
            dense_kernel: spec.dense_kernel.iter().map(|v| f64::from(*v)).collect(),
            dense_bias: f64::from(spec.dense_bias),
            units,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.kernel.nrows()
    }

    fn run_window(&self, window: ndarray::ArrayView2<'_, f32>) -> f64 {
        let n = self.units;
        let mut h = Array1::<f64>::zeros(n);
        let mut c = Array1::<f64>::zeros(n);

        for x in window.rows() {
            let x = x.mapv(f64::from);
            let z = x.dot(&self.kernel) + h.dot(&self.recurrent_kernel) + &self.bias;

            let i = z.slice(s![0..n]).mapv(sigmoid);
            let f = z.slice(s![n..2 * n]).mapv(sigmoid);
            let g = z.slice(s![2 * n..3 * n]).mapv(f64::tanh);
            let o = z.slice(s![3 * n..4 * n]).mapv(sigmoid);

            c = &f * &c + &i * &g;
            h = &o * &c.mapv(f64::tanh);
        }

        sigmoid(h.dot(&self.dense_kernel) + self.dense_bias)
    }
}

impl SequenceModel for LstmModel {
    fn predict(&self, windows: ArrayView3<'_, f32>) -> Result<Vec<f64>, InferenceError> {
        let n_features = windows.shape()[2];
        if n_features != self.input_dim() {
            return Err(InferenceError::Shape(format!(
                "windows carry {} features, lstm expects {}",
                n_features,
                self.input_dim()
            )));
        }
        Ok(windows
            .outer_iter()
            .map(|window| self.run_window(window))
            .collect())
    }

    fn kind(&self) -> &'static str {
        "lstm"
    }
}
