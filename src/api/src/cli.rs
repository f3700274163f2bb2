//! CLI commands for crisis-risk-api.
//!
//! Supports API server mode, one-shot scoring of a history file, and bundle inspection.

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

use crate::artifacts::{self, LoadOptions};
use crate::config::{AppConfig, RECOGNIZED_COLUMNS};
use crate::contract::ColumnKind;
use crate::predictor;
use crate::types::{FeatureRow, PredictRequest, PredictResponse};

#[derive(Parser)]
#[command(name = "crisis-risk-api")]
#[command(version, about = "Sickle-cell crisis risk scoring API and CLI", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the API server
    Serve {
        /// Host to bind to
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(short, long, default_value_t = 8080)]
        port: u16,
    },

    /// Score a patient history JSON file
    Predict {
        /// Path to history JSON (array of daily rows, or a predict request)
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Output format (json, table)
        #[arg(short, long, default_value = "json")]
        format: String,

        /// Bundle path override
        #[arg(short, long)]
        bundle: Option<PathBuf>,

        /// Standalone sequence model override
        #[arg(long)]
        sequence_model: Option<PathBuf>,

        /// Sequence model weight in the blend
        #[arg(long)]
        blend_weight: Option<f64>,

        /// Alert threshold (percentage)
        #[arg(short, long)]
        threshold: Option<f64>,
    },

    /// Print a summary of the artifact bundle
    Inspect {
        /// Bundle path override
        #[arg(short, long)]
        bundle: Option<PathBuf>,
    },
}

/// History file contents: a bare list of rows or a full request.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryFile {
    Rows(Vec<FeatureRow>),
    Request(PredictRequest),
}

impl HistoryFile {
    fn into_request(self) -> PredictRequest {
        match self {
            HistoryFile::Rows(history) => PredictRequest {
                patient_id: None,
                history,
                risk_threshold: None,
            },
            HistoryFile::Request(req) => req,
        }
    }
}

fn parse_history(json: &str) -> anyhow::Result<PredictRequest> {
    let file: HistoryFile = serde_json::from_str(json)
        .map_err(|e| anyhow::anyhow!("Unrecognized history file: {}", e))?;
    Ok(file.into_request())
}

/// Run CLI prediction from file.
pub async fn run_predict(
    input: PathBuf,
    format: String,
    bundle: Option<PathBuf>,
    sequence_model: Option<PathBuf>,
    blend_weight: Option<f64>,
    threshold: Option<f64>,
) -> anyhow::Result<()> {
    // Load configuration
    let mut config = AppConfig::load()?;

    if let Some(path) = bundle {
        config.model.bundle_path = path.to_string_lossy().to_string();
    }
    if let Some(path) = sequence_model {
        config.model.sequence_model_path = Some(path.to_string_lossy().to_string());
    }
    if let Some(alpha) = blend_weight {
        config.model.blend_weight = alpha;
    }

    eprintln!("Loading bundle from: {}", config.model.bundle_path);
    let model = artifacts::load(&LoadOptions::from(&config.model))?;
    eprintln!("Bundle loaded successfully");

    // Read input file
    let input_json = std::fs::read_to_string(&input)?;
    let req = parse_history(&input_json)?;

    let threshold = threshold
        .or(req.risk_threshold)
        .unwrap_or(config.alerts.risk_threshold);
    if !(0.0..=100.0).contains(&threshold) {
        anyhow::bail!("Threshold must be within [0, 100], got {}", threshold);
    }

    eprintln!("Days: {}", req.history.len());

    let series = predictor::predict(&req.history, &model);
    let response = PredictResponse::from_series(req.patient_id, series, threshold);

    // Output
    match format.as_str() {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        "table" => {
            print_table(&response);
        }
        _ => {
            eprintln!("Unknown format: {}. Using JSON.", format);
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    Ok(())
}

/// Print prediction results in table format.
fn print_table(response: &PredictResponse) {
    if let Some(ref id) = response.patient_id {
        println!("Patient: {}", id);
    }
    println!("Source: {}", response.source.as_str());
    if response.degraded {
        println!("(degraded: no blended model output)");
    }
    println!();

    println!("=== Daily Risk ===");
    for point in &response.risk {
        println!(
            "  {}  {:>3}  ({:.4})",
            point.date, point.score, point.probability
        );
    }
    println!();

    if let (Some(score), Some(alert)) = (response.latest_score, response.alert) {
        println!("Latest: {} -> {:?}", score, alert);
    }
}

/// Print what the bundle expects and provides.
pub async fn run_inspect(bundle: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = AppConfig::load()?;
    if let Some(path) = bundle {
        config.model.bundle_path = path.to_string_lossy().to_string();
    }

    let model = artifacts::load(&LoadOptions::from(&config.model))?;

    println!("Bundle: {}", config.model.bundle_path);
    if let Some(ref version) = model.model_version {
        println!("Version: {}", version);
    }
    println!("Window length: {}", model.window_length());
    println!("Blend weight: {}", model.blend_weight);
    println!("Encoded width: {}", model.preprocessor.output_width());
    println!(
        "Models: tabular={} sequence={}",
        model.has_tabular_model(),
        model.has_sequence_model()
    );
    println!();

    println!("=== Feature Contract ===");
    for column in model.contract.columns() {
        let kind = match column.kind {
            ColumnKind::Numeric => "numeric",
            ColumnKind::Categorical => "categorical",
        };
        let marker = if RECOGNIZED_COLUMNS.contains(&column.name.as_str()) {
            ""
        } else {
            "  (not supplied by daily entries)"
        };
        println!("  {:<20} {:<12}{}", column.name, kind, marker);
    }

    Ok(())
}
