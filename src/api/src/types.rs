//! Feature rows, risk series and request/response types for the crisis-risk API.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One raw feature value as supplied by the feature source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Number(f64),
    Text(String),
    /// Explicit `null`; treated like an absent column.
    Missing,
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        FeatureValue::Number(v)
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        FeatureValue::Text(v.to_string())
    }
}

impl From<String> for FeatureValue {
    fn from(v: String) -> Self {
        FeatureValue::Text(v)
    }
}

/// One patient-day of measurements keyed by column name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub values: BTreeMap<String, FeatureValue>,
}

impl FeatureRow {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            values: BTreeMap::new(),
        }
    }

    /// Builder-style setter.
    pub fn with(mut self, column: &str, value: impl Into<FeatureValue>) -> Self {
        self.values.insert(column.to_string(), value.into());
        self
    }

    /// Value for a column, `None` when absent or explicitly null.
    pub fn get(&self, column: &str) -> Option<&FeatureValue> {
        match self.values.get(column) {
            Some(FeatureValue::Missing) | None => None,
            Some(v) => Some(v),
        }
    }
}

/// Which model family produced a risk series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionSource {
    Hybrid,
    TabularOnly,
    SequenceOnly,
    /// No model was usable; every value is the zero fallback.
    FallbackHeuristic,
}

impl PredictionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionSource::Hybrid => "hybrid",
            PredictionSource::TabularOnly => "tabular_only",
            PredictionSource::SequenceOnly => "sequence_only",
            PredictionSource::FallbackHeuristic => "fallback_heuristic",
        }
    }
}

/// Risk for a single date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskPoint {
    pub date: NaiveDate,
    /// Blended probability in [0, 1]
    pub probability: f64,
    /// Integer percentage in [0, 100]
    pub score: u8,
}

/// Per-date risk aligned with the input history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSeries {
    pub source: PredictionSource,
    pub points: Vec<RiskPoint>,
}

impl RiskSeries {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn latest(&self) -> Option<&RiskPoint> {
        self.points.last()
    }

    /// True when the series came from the zero fallback rather than a model.
    pub fn is_degraded(&self) -> bool {
        self.source == PredictionSource::FallbackHeuristic
    }
}

/// Scale a probability to an integer percentage, rounding half to even.
pub fn probability_to_score(probability: f64) -> u8 {
    let p = if probability.is_nan() {
        0.0
    } else {
        probability.clamp(0.0, 1.0)
    };
    (p * 100.0).round_ties_even() as u8
}

/// Display state for a risk score against a patient's alert threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Ok,
    Warn,
    Danger,
}

impl AlertLevel {
    /// Width of the warning band below the threshold.
    pub const WARN_MARGIN: f64 = 15.0;

    pub fn classify(score: f64, threshold: f64) -> Self {
        if score >= threshold {
            AlertLevel::Danger
        } else if score >= (threshold - Self::WARN_MARGIN).max(0.0) {
            AlertLevel::Warn
        } else {
            AlertLevel::Ok
        }
    }
}

/// Prediction request with an inline history
#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    #[serde(default)]
    pub patient_id: Option<String>,
    pub history: Vec<FeatureRow>,
    /// Alert threshold override (percentage)
    #[serde(default)]
    pub risk_threshold: Option<f64>,
}

/// Prediction response
#[derive(Debug, Serialize, Deserialize)]
pub struct PredictResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    pub source: PredictionSource,
    pub degraded: bool,
    pub risk: Vec<RiskPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_score: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<AlertLevel>,
}

impl PredictResponse {
    pub fn from_series(patient_id: Option<String>, series: RiskSeries, threshold: f64) -> Self {
        let latest_score = series.latest().map(|p| p.score);
        let alert = latest_score.map(|s| AlertLevel::classify(f64::from(s), threshold));
        Self {
            patient_id,
            source: series.source,
            degraded: series.is_degraded(),
            risk: series.points,
            latest_score,
            alert,
        }
    }
}

/// Response after recording a daily entry
#[derive(Debug, Serialize, Deserialize)]
pub struct EntryResponse {
    pub patient_id: String,
    pub days: usize,
    pub replaced: bool,
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Model info response
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelInfoResponse {
    pub bundle_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    pub seq_length: usize,
    pub blend_weight: f64,
    pub feature_columns: Vec<String>,
    pub numeric_features: Vec<String>,
    pub categorical_features: Vec<String>,
    pub encoded_width: usize,
    pub has_tabular_model: bool,
    pub has_sequence_model: bool,
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
