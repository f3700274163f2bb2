//! Shared fixtures for unit tests: a full-contract bundle and synthetic histories.

use chrono::{Duration, NaiveDate};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use crate::config::RECOGNIZED_COLUMNS;
use crate::contract::{FeatureContract, DEFAULT_CATEGORY};
use crate::preprocess::Preprocessor;
use crate::types::FeatureRow;

/// Nine scaled numeric columns plus three genotype indicators.
pub const ENCODED_WIDTH: usize = 12;

const MEANS: [f64; 9] = [9.5, 0.32, 6.0, 2100.0, 180.0, 420.0, 3.0, 3.0, 5.0];
const SCALES: [f64; 9] = [1.1, 0.05, 2.4, 300.0, 120.0, 60.0, 1.4, 1.4, 3.2];

fn numeric_columns() -> Vec<&'static str> {
    RECOGNIZED_COLUMNS[..9].to_vec()
}

pub fn preprocessor_json() -> Value {
    json!({
        "transformers": [
            {
                "kind": "standard_scaler",
                "columns": numeric_columns(),
                "mean": MEANS,
                "scale": SCALES
            },
            {
                "kind": "one_hot",
                "columns": ["genotype"],
                "categories": [["AS", "SC", "SS"]],
                "handle_unknown": "ignore"
            }
        ]
    })
}

pub fn test_preprocessor() -> Preprocessor {
    serde_json::from_value(preprocessor_json()).unwrap()
}

pub fn test_contract(window_length: usize) -> FeatureContract {
    let all: Vec<String> = RECOGNIZED_COLUMNS.iter().map(|s| s.to_string()).collect();
    FeatureContract::from_lists(
        &all,
        &all[..9],
        &all[9..],
        DEFAULT_CATEGORY,
        window_length,
    )
    .unwrap()
}

/// LSTM weights whose output is always `probability`.
pub fn lstm_json(probability: f64) -> Value {
    let units = 2;
    json!({
        "kernel": vec![vec![0.0; 4 * units]; ENCODED_WIDTH],
        "recurrent_kernel": vec![vec![0.0; 4 * units]; units],
        "bias": vec![0.0; 4 * units],
        "dense_kernel": vec![0.0; units],
        "dense_bias": (probability / (1.0 - probability)).ln()
    })
}

/// Single-leaf regression ensemble whose raw output is always `value`.
pub fn tabular_json(value: f64) -> Value {
    json!({
        "kind": "gradient_boosted_trees",
        "objective": "reg:squarederror",
        "base_score": 0.0,
        "trees": [{"nodes": [{"leaf": {"value": value}}]}]
    })
}

pub fn bundle_json(seq_length: usize, tabular: Option<f64>, sequence: Option<f64>) -> Value {
    let mut bundle = json!({
        "format_version": 1,
        "model_version": "test-bundle",
        "seq_length": seq_length,
        "feature_input_cols": RECOGNIZED_COLUMNS,
        "numeric_features": numeric_columns(),
        "categorical_features": ["genotype"],
        "preprocessor": preprocessor_json()
    });
    if let Some(v) = tabular {
        bundle["tabular_model"] = tabular_json(v);
    }
    if let Some(p) = sequence {
        let mut seq = lstm_json(p);
        seq["kind"] = json!("lstm");
        bundle["sequence_model"] = seq;
    }
    bundle
}

pub fn write_bundle(dir: &Path, bundle: &Value) -> PathBuf {
    let path = dir.join("bundle.json");
    std::fs::write(&path, serde_json::to_string_pretty(bundle).unwrap()).unwrap();
    path
}

pub fn day(offset: usize) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(offset as i64)
}

/// `n_days` consecutive days with varying measurements.
pub fn history(n_days: usize) -> Vec<FeatureRow> {
    (0..n_days)
        .map(|i| {
            FeatureRow::new(day(i))
                .with("hemoglobin_g_dl", 8.0 + (i % 7) as f64 * 0.5)
                .with("hematocrit_l_l", 0.30 + (i % 3) as f64 * 0.02)
                .with("hydration_glasses", (4 + i % 5) as f64)
                .with("kcal_total", 2000.0 + (i % 4) as f64 * 100.0)
                .with("kcal_exercise", 150.0)
                .with("sleep_minutes", 400.0 + (i % 6) as f64 * 10.0)
                .with("sleep_quality", (1 + i % 5) as f64)
                .with("stress_level", (1 + (i + 2) % 5) as f64)
                .with("pain_level", (i % 11) as f64)
                .with("genotype", "SS")
        })
        .collect()
}
