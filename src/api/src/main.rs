//! Crisis-Risk Inference API
//!
//! REST API and CLI for hybrid sickle-cell crisis risk scoring.

mod artifacts;
mod cli;
mod config;
mod contract;
mod error;
mod gbt;
mod history;
mod lstm;
mod model;
mod predictor;
mod preprocess;
mod routes;
mod types;

#[cfg(test)]
mod testutil;

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::artifacts::LoadOptions;
use crate::cli::{Cli, Commands};
use crate::config::AppConfig;
use crate::history::HistoryStore;
use crate::routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    match cli.command {
        Commands::Serve { host, port } => run_server(Some(host), Some(port)).await,
        Commands::Predict {
            input,
            format,
            bundle,
            sequence_model,
            blend_weight,
            threshold,
        } => cli::run_predict(input, format, bundle, sequence_model, blend_weight, threshold).await,
        Commands::Inspect { bundle } => cli::run_inspect(bundle).await,
    }
}

/// Install the log subscriber for every subcommand. Logs go to stderr so
/// `predict --format json` keeps stdout clean.
fn init_tracing() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crisis_risk_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;
    Ok(())
}

/// Run the API server.
async fn run_server(host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    // Load configuration
    let mut config = AppConfig::load()?;

    // Override with CLI args
    if let Some(h) = host {
        config.server.host = h;
    }
    if let Some(p) = port {
        config.server.port = p;
    }

    tracing::info!("Configuration loaded");
    tracing::info!("Bundle path: {}", config.model.bundle_path);

    // Load artifacts once; every request shares this handle
    tracing::info!("Loading model bundle...");
    let model = artifacts::load(&LoadOptions::from(&config.model))?;
    tracing::info!(
        "Bundle loaded (tabular: {}, sequence: {}, window: {})",
        model.has_tabular_model(),
        model.has_sequence_model(),
        model.window_length()
    );

    // Create application state
    let state = Arc::new(AppState {
        model,
        config: config.clone(),
        history: HistoryStore::new(),
    });

    let app = routes::router(state);

    // Start server
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
