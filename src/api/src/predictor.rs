//! Hybrid risk prediction.
//!
//! A patient's daily history is completed against the feature contract,
//! encoded, cut into sliding windows of length `L`, scored by the tabular model
//! (window end row) and the sequence model (whole window), blended, and mapped
//! back onto one value per input date. The first `L - 1` dates carry the first
//! blended value.

use chrono::NaiveDate;
use ndarray::{s, Array2, Array3};
use tracing::{debug, warn};

use crate::artifacts::{HybridModel, ModelHandle};
use crate::error::InferenceError;
use crate::types::{probability_to_score, FeatureRow, PredictionSource, RiskPoint, RiskSeries};

/// Per-date probabilities in [0, 1], aligned with the date-sorted history.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilitySeries {
    pub source: PredictionSource,
    pub dates: Vec<NaiveDate>,
    pub values: Vec<f64>,
}

/// Number of complete windows over `n_rows` rows.
pub fn window_count(n_rows: usize, window_length: usize) -> usize {
    (n_rows + 1).saturating_sub(window_length)
}

/// Sliding windows: window `w` covers encoded rows `[w, w + L - 1]`.
pub fn make_windows(encoded: &Array2<f32>, window_length: usize) -> Array3<f32> {
    let n_windows = window_count(encoded.nrows(), window_length);
    let mut windows = Array3::<f32>::zeros((n_windows, window_length, encoded.ncols()));
    for w in 0..n_windows {
        windows
            .slice_mut(s![w, .., ..])
            .assign(&encoded.slice(s![w..w + window_length, ..]));
    }
    windows
}

/// Combine per-window outputs. `alpha` weighs the sequence model.
pub fn blend(
    sequence: Option<&[f64]>,
    tabular: Option<&[f64]>,
    alpha: f64,
    n_windows: usize,
) -> (PredictionSource, Vec<f64>) {
    match (sequence, tabular) {
        (Some(s), Some(t)) => (
            PredictionSource::Hybrid,
            s.iter()
                .zip(t)
                .map(|(s, t)| alpha * s + (1.0 - alpha) * t)
                .collect(),
        ),
        (Some(s), None) => (PredictionSource::SequenceOnly, s.to_vec()),
        (None, Some(t)) => (PredictionSource::TabularOnly, t.to_vec()),
        (None, None) => (PredictionSource::FallbackHeuristic, vec![0.0; n_windows]),
    }
}

/// Map per-window values back onto `n_rows` dates, padding the warm-up period.
pub fn realign(blended: &[f64], n_rows: usize, window_length: usize) -> Vec<f64> {
    let first = blended.first().copied().unwrap_or(0.0);
    let warm_up = window_length.saturating_sub(1).min(n_rows);

    let mut out = vec![first; warm_up];
    out.extend(blended.iter().take(n_rows - warm_up));
    out.resize(n_rows, first);
    out.into_iter().map(|v| v.clamp(0.0, 1.0)).collect()
}

/// Check a sub-model's output and clamp it to [0, 1].
fn sanitize(values: Vec<f64>, expected: usize) -> Result<Vec<f64>, InferenceError> {
    if values.len() != expected {
        return Err(InferenceError::Shape(format!(
            "expected {} outputs, got {}",
            expected,
            values.len()
        )));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(InferenceError::Runtime("model produced non-finite output".into()));
    }
    Ok(values.into_iter().map(|v| v.clamp(0.0, 1.0)).collect())
}

impl HybridModel {
    fn tabular_scores(&self, encoded: &Array2<f32>, n_windows: usize) -> Option<Vec<f64>> {
        let model = self.tabular.as_ref()?;
        let last_rows = encoded.slice(s![self.window_length() - 1.., ..]);
        let result = model
            .predict(last_rows)
            .and_then(|out| out.into_scores())
            .and_then(|scores| sanitize(scores, n_windows));
        match result {
            Ok(scores) => Some(scores),
            Err(e) => {
                warn!("Tabular model ({}) unavailable for this call: {}", model.kind(), e);
                None
            }
        }
    }

    fn sequence_scores(&self, encoded: &Array2<f32>, n_windows: usize) -> Option<Vec<f64>> {
        let model = self.sequence.as_ref()?;
        let windows = make_windows(encoded, self.window_length());
        let result = model
            .predict(windows.view())
            .and_then(|scores| sanitize(scores, n_windows));
        match result {
            Ok(scores) => Some(scores),
            Err(e) => {
                warn!("Sequence model ({}) unavailable for this call: {}", model.kind(), e);
                None
            }
        }
    }

    /// Blended probability per date, in date order.
    ///
    /// Never fails: model or encoding failures degrade to whatever remains,
    /// down to an all-zero series tagged `FallbackHeuristic`.
    pub fn predict_proba_series(&self, history: &[FeatureRow]) -> ProbabilitySeries {
        let mut rows = history.to_vec();
        rows.sort_by_key(|r| r.date);
        if rows.windows(2).any(|w| w[0].date == w[1].date) {
            warn!("History contains duplicate dates; keeping input order among them");
        }

        let n_rows = rows.len();
        let window_length = self.window_length();
        let n_windows = window_count(n_rows, window_length);

        let table = self.contract.complete(&rows);
        if !table.defaulted.is_empty() {
            warn!(
                "History is missing contract columns, defaulted: {:?}",
                table.defaulted
            );
        }

        let (tabular, sequence) = if n_windows == 0 {
            debug!(
                "{} rows is shorter than the window length {}, no window available",
                n_rows, window_length
            );
            (None, None)
        } else {
            match self.preprocessor.transform(&table) {
                Ok(encoded) => (
                    self.tabular_scores(&encoded, n_windows),
                    self.sequence_scores(&encoded, n_windows),
                ),
                Err(e) => {
                    warn!("Feature encoding failed, no model usable: {}", e);
                    (None, None)
                }
            }
        };

        let (source, blended) = blend(
            sequence.as_deref(),
            tabular.as_deref(),
            self.blend_weight,
            n_windows,
        );
        if source == PredictionSource::FallbackHeuristic && n_windows > 0 {
            warn!("No model produced a prediction; returning the zero fallback");
        }

        ProbabilitySeries {
            source,
            dates: rows.iter().map(|r| r.date).collect(),
            values: realign(&blended, n_rows, window_length),
        }
    }

    /// Risk per date as integer percentages.
    pub fn predict(&self, history: &[FeatureRow]) -> RiskSeries {
        let series = self.predict_proba_series(history);
        RiskSeries {
            source: series.source,
            points: series
                .dates
                .into_iter()
                .zip(series.values)
                .map(|(date, probability)| RiskPoint {
                    date,
                    probability,
                    score: probability_to_score(probability),
                })
                .collect(),
        }
    }
}

/// Score a patient's history with the given artifacts.
pub fn predict(history: &[FeatureRow], handle: &ModelHandle) -> RiskSeries {
    handle.predict(history)
}
