//! Error types for artifact loading and model inference.

use std::path::PathBuf;

use thiserror::Error;

/// Failure to load the artifact bundle. Fatal to that load attempt.
#[derive(Error, Debug)]
pub enum ArtifactLoadError {
    #[error("Artifact bundle not found: {0}")]
    NotFound(PathBuf),

    #[error("Artifact bundle {path} is outside the trusted root {root}")]
    Untrusted { path: PathBuf, root: PathBuf },

    #[error("Artifact bundle digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to deserialize artifact bundle: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Unsupported bundle format version {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid artifact bundle: {0}")]
    Invalid(String),

    #[error("Blend weight must be within [0, 1], got {0}")]
    InvalidBlendWeight(f64),

    #[error("Failed to load ONNX model {path}: {message}")]
    Onnx { path: PathBuf, message: String },
}

impl ArtifactLoadError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ArtifactLoadError::Invalid(msg.into())
    }
}

/// Failure of one model (or of the shared encoding step) during a single call.
///
/// Never surfaced to consumers of the risk series; the predictor degrades instead.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Encoding failed: {0}")]
    Encoding(String),

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Model runtime failure: {0}")]
    Runtime(String),
}

impl InferenceError {
    pub fn runtime(e: impl std::fmt::Display) -> Self {
        InferenceError::Runtime(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_messages() {
        let err = ArtifactLoadError::NotFound(PathBuf::from("models/bundle.json"));
        assert_eq!(err.to_string(), "Artifact bundle not found: models/bundle.json");

        let err = ArtifactLoadError::InvalidBlendWeight(1.5);
        assert!(err.to_string().contains("1.5"));
    }

    #[test]
    fn test_format_error_from_serde() {
        let serde_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: ArtifactLoadError = serde_err.into();
        assert!(matches!(err, ArtifactLoadError::Format(_)));
    }
}
