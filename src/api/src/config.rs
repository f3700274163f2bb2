//! Configuration for the crisis-risk service.

use serde::{Deserialize, Serialize};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Model artifact configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_bundle_path")]
    pub bundle_path: String,
    /// Sequence model file used when the bundle does not embed one
    #[serde(default)]
    pub sequence_model_path: Option<String>,
    /// Weight of the sequence model in the blend
    #[serde(default = "default_blend_weight")]
    pub blend_weight: f64,
    /// Directory the bundle must live under
    #[serde(default)]
    pub trusted_root: Option<String>,
    /// Hex SHA-256 the bundle bytes must match
    #[serde(default)]
    pub expected_sha256: Option<String>,
}

fn default_bundle_path() -> String {
    "data/models/hybrid_crisis_predictor.json".to_string()
}

fn default_blend_weight() -> f64 {
    crate::artifacts::DEFAULT_BLEND_WEIGHT
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            bundle_path: default_bundle_path(),
            sequence_model_path: None,
            blend_weight: default_blend_weight(),
            trusted_root: None,
            expected_sha256: None,
        }
    }
}

/// Alerting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Score (percentage) at or above which a day is flagged as danger
    #[serde(default = "default_risk_threshold")]
    pub risk_threshold: f64,
}

fn default_risk_threshold() -> f64 {
    70.0
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            risk_threshold: default_risk_threshold(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
}

impl AppConfig {
    /// Load configuration from environment and config file
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // Add config file if exists
            .add_source(config::File::with_name("config").required(false))
            // Override with environment variables (CRISIS_MODEL__BLEND_WEIGHT, etc.)
            .add_source(
                config::Environment::with_prefix("CRISIS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// Daily measurement columns understood by the feature supplier
pub const RECOGNIZED_COLUMNS: [&str; 10] = [
    "hemoglobin_g_dl",
    "hematocrit_l_l",
    "hydration_glasses",
    "kcal_total",
    "kcal_exercise",
    "sleep_minutes",
    "sleep_quality",
    "stress_level",
    "pain_level",
    "genotype",
];
