//! Artifact bundle loading.
//!
//! The bundle is a versioned JSON manifest kept in trusted storage. It carries
//! the feature contract, the fitted preprocessor and the optional tabular and
//! sequence models (inline weights or references to ONNX files next to it).

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::ModelConfig;
use crate::contract::{FeatureContract, DEFAULT_CATEGORY, DEFAULT_SEQ_LENGTH};
use crate::error::ArtifactLoadError;
use crate::gbt::TreeEnsemble;
use crate::lstm::{LstmModel, LstmSpec};
use crate::model::{OnnxSequenceModel, OnnxTabularModel, SequenceModel, TabularModel};
use crate::preprocess::Preprocessor;

/// Only bundle format this build understands.
pub const SUPPORTED_FORMAT_VERSION: u32 = 1;

/// Default weight of the sequence model in the blend.
pub const DEFAULT_BLEND_WEIGHT: f64 = 0.6;

fn default_seq_length() -> usize {
    DEFAULT_SEQ_LENGTH
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

/// Bundle contents once `format_version` has been checked.
#[derive(Debug, Deserialize)]
struct BundleManifest {
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default = "default_seq_length")]
    seq_length: usize,
    feature_input_cols: Vec<String>,
    #[serde(default)]
    numeric_features: Vec<String>,
    #[serde(default)]
    categorical_features: Vec<String>,
    #[serde(default = "default_category")]
    categorical_default: String,
    preprocessor: Preprocessor,
    #[serde(default)]
    tabular_model: Option<TabularModelSpec>,
    #[serde(default)]
    sequence_model: Option<SequenceModelSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum TabularModelSpec {
    GradientBoostedTrees(TreeEnsemble),
    Onnx {
        path: PathBuf,
        #[serde(default)]
        probability_output: bool,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum SequenceModelSpec {
    Lstm(LstmSpec),
    Onnx { path: PathBuf },
}

/// Where and how to load the bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    pub bundle_path: PathBuf,
    /// Sequence model used when the bundle does not embed one
    pub sequence_model_path: Option<PathBuf>,
    pub blend_weight: f64,
    /// Bundle must live under this directory when set
    pub trusted_root: Option<PathBuf>,
    /// Hex SHA-256 of the bundle bytes when set
    pub expected_sha256: Option<String>,
}

impl LoadOptions {
    pub fn new<P: Into<PathBuf>>(bundle_path: P) -> Self {
        Self {
            bundle_path: bundle_path.into(),
            sequence_model_path: None,
            blend_weight: DEFAULT_BLEND_WEIGHT,
            trusted_root: None,
            expected_sha256: None,
        }
    }

    pub fn with_sequence_model<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.sequence_model_path = Some(path.into());
        self
    }

    pub fn with_blend_weight(mut self, alpha: f64) -> Self {
        self.blend_weight = alpha;
        self
    }
}

impl From<&ModelConfig> for LoadOptions {
    fn from(config: &ModelConfig) -> Self {
        let mut options = Self::new(&config.bundle_path).with_blend_weight(config.blend_weight);
        if let Some(path) = &config.sequence_model_path {
            options = options.with_sequence_model(path);
        }
        options.trusted_root = config.trusted_root.as_ref().map(PathBuf::from);
        options.expected_sha256 = config.expected_sha256.clone();
        options
    }
}

/// Loaded, immutable artifacts.
pub struct HybridModel {
    pub contract: FeatureContract,
    pub preprocessor: Preprocessor,
    pub tabular: Option<Box<dyn TabularModel>>,
    pub sequence: Option<Box<dyn SequenceModel>>,
    pub blend_weight: f64,
    pub model_version: Option<String>,
    pub bundle_path: Option<PathBuf>,
}

impl fmt::Debug for HybridModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridModel")
            .field("window_length", &self.contract.window_length())
            .field("tabular", &self.tabular.as_ref().map(|m| m.kind()))
            .field("sequence", &self.sequence.as_ref().map(|m| m.kind()))
            .field("blend_weight", &self.blend_weight)
            .field("model_version", &self.model_version)
            .finish()
    }
}

impl HybridModel {
    pub fn has_tabular_model(&self) -> bool {
        self.tabular.is_some()
    }

    pub fn has_sequence_model(&self) -> bool {
        self.sequence.is_some()
    }

    pub fn window_length(&self) -> usize {
        self.contract.window_length()
    }
}

/// Shared handle to the loaded artifacts, passed to every prediction call.
#[derive(Clone, Debug)]
pub struct ModelHandle(Arc<HybridModel>);

impl Deref for ModelHandle {
    type Target = HybridModel;

    fn deref(&self) -> &HybridModel {
        &self.0
    }
}

fn check_blend_weight(alpha: f64) -> Result<(), ArtifactLoadError> {
    if alpha.is_nan() || !(0.0..=1.0).contains(&alpha) {
        return Err(ArtifactLoadError::InvalidBlendWeight(alpha));
    }
    Ok(())
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, ArtifactLoadError> {
    std::fs::read(path).map_err(|source| ArtifactLoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn ensure_trusted(path: &Path, root: &Path) -> Result<(), ArtifactLoadError> {
    if !root.exists() {
        return Err(ArtifactLoadError::NotFound(root.to_path_buf()));
    }
    let canonical = |p: &Path| {
        p.canonicalize().map_err(|source| ArtifactLoadError::Io {
            path: p.to_path_buf(),
            source,
        })
    };
    let (path, root) = (canonical(path)?, canonical(root)?);
    if !path.starts_with(&root) {
        return Err(ArtifactLoadError::Untrusted { path, root });
    }
    Ok(())
}

fn verify_digest(bytes: &[u8], expected: &str) -> Result<(), ArtifactLoadError> {
    let actual = format!("{:x}", Sha256::digest(bytes));
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(ArtifactLoadError::DigestMismatch {
            expected: expected.trim().to_lowercase(),
            actual,
        });
    }
    Ok(())
}

fn parse_manifest(bytes: &[u8]) -> Result<BundleManifest, ArtifactLoadError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    let version = value
        .get("format_version")
        .ok_or_else(|| ArtifactLoadError::invalid("missing required key 'format_version'"))?
        .as_u64()
        .ok_or_else(|| ArtifactLoadError::invalid("'format_version' must be an integer"))?;
    if version != u64::from(SUPPORTED_FORMAT_VERSION) {
        return Err(ArtifactLoadError::UnsupportedVersion(
            u32::try_from(version).unwrap_or(u32::MAX),
        ));
    }
    Ok(serde_json::from_value(value)?)
}

/// Sequence model stored outside the bundle: ONNX file or LSTM weights as JSON.
fn load_external_sequence(
    path: &Path,
    input_dim: usize,
) -> Result<Box<dyn SequenceModel>, ArtifactLoadError> {
    let is_json = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        let spec: LstmSpec = serde_json::from_slice(&read_file(path)?)?;
        Ok(Box::new(LstmModel::from_spec(&spec, input_dim)?))
    } else {
        Ok(Box::new(OnnxSequenceModel::lazy(path)?))
    }
}

#[cfg(test)]
impl ModelHandle {
    /// Assemble a handle from already-built parts.
    pub fn from_parts(
        contract: FeatureContract,
        preprocessor: Preprocessor,
        tabular: Option<Box<dyn TabularModel>>,
        sequence: Option<Box<dyn SequenceModel>>,
        blend_weight: f64,
    ) -> Result<Self, ArtifactLoadError> {
        check_blend_weight(blend_weight)?;
        preprocessor.validate(&contract)?;
        Ok(Self(Arc::new(HybridModel {
            contract,
            preprocessor,
            tabular,
            sequence,
            blend_weight,
            model_version: None,
            bundle_path: None,
        })))
    }
}

impl ModelHandle {
    /// Read and validate a bundle from storage. Never retried.
    pub fn load(options: &LoadOptions) -> Result<Self, ArtifactLoadError> {
        check_blend_weight(options.blend_weight)?;

        let path = options.bundle_path.as_path();
        if !path.exists() {
            return Err(ArtifactLoadError::NotFound(path.to_path_buf()));
        }
        if let Some(root) = &options.trusted_root {
            ensure_trusted(path, root)?;
        }

        let bytes = read_file(path)?;
        if let Some(expected) = &options.expected_sha256 {
            verify_digest(&bytes, expected)?;
        }
        let manifest = parse_manifest(&bytes)?;

        let contract = FeatureContract::from_lists(
            &manifest.feature_input_cols,
            &manifest.numeric_features,
            &manifest.categorical_features,
            &manifest.categorical_default,
            manifest.seq_length,
        )?;
        let preprocessor = manifest.preprocessor;
        preprocessor.validate(&contract)?;
        let width = preprocessor.output_width();

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        let tabular: Option<Box<dyn TabularModel>> = match manifest.tabular_model {
            Some(TabularModelSpec::GradientBoostedTrees(ensemble)) => {
                ensemble.validate(width)?;
                Some(Box::new(ensemble))
            }
            Some(TabularModelSpec::Onnx {
                path: model_path,
                probability_output,
            }) => {
                let model_path = resolve(base_dir, &model_path);
                Some(Box::new(OnnxTabularModel::load(&model_path, probability_output)?))
            }
            None => None,
        };

        let sequence: Option<Box<dyn SequenceModel>> = match manifest.sequence_model {
            Some(SequenceModelSpec::Lstm(spec)) => Some(Box::new(LstmModel::from_spec(&spec, width)?)),
            Some(SequenceModelSpec::Onnx { path: model_path }) => {
                Some(Box::new(OnnxSequenceModel::lazy(&resolve(base_dir, &model_path))?))
            }
            None => match &options.sequence_model_path {
                Some(fallback) if fallback.exists() => {
                    tracing::info!(
                        "Sequence model not embedded, loading from {}",
                        fallback.display()
                    );
                    Some(load_external_sequence(fallback, width)?)
                }
                Some(fallback) => {
                    tracing::warn!(
                        "Sequence model path {} does not exist, continuing tabular-only",
                        fallback.display()
                    );
                    None
                }
                None => None,
            },
        };

        tracing::info!(
            "Loaded artifact bundle {} (version: {}, L={}, encoded width={}, tabular={}, sequence={})",
            path.display(),
            manifest.model_version.as_deref().unwrap_or("unversioned"),
            contract.window_length(),
            width,
            tabular.as_ref().map(|m| m.kind()).unwrap_or("none"),
            sequence.as_ref().map(|m| m.kind()).unwrap_or("none"),
        );

        Ok(Self(Arc::new(HybridModel {
            contract,
            preprocessor,
            tabular,
            sequence,
            blend_weight: options.blend_weight,
            model_version: manifest.model_version,
            bundle_path: Some(path.to_path_buf()),
        })))
    }
}

/// Load-once cache for the model handle.
///
/// The first successful load wins; later calls get the same handle whatever
/// options they pass. A failed load leaves the cache empty.
pub struct ArtifactCache {
    cell: OnceLock<(LoadOptions, ModelHandle)>,
    init: Mutex<()>,
}

impl Default for ArtifactCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactCache {
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
            init: Mutex::new(()),
        }
    }

    pub fn get_or_load(&self, options: &LoadOptions) -> Result<ModelHandle, ArtifactLoadError> {
        if let Some(handle) = self.cached(options) {
            return Ok(handle);
        }

        // A poisoned guard only means another loader panicked; the cell is still consistent.
        let _guard = self.init.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = self.cached(options) {
            return Ok(handle);
        }

        let handle = ModelHandle::load(options)?;
        let (_, stored) = self.cell.get_or_init(|| (options.clone(), handle));
        Ok(stored.clone())
    }

    fn cached(&self, options: &LoadOptions) -> Option<ModelHandle> {
        let (loaded_with, handle) = self.cell.get()?;
        if loaded_with != options {
            tracing::debug!(
                "Returning cached artifacts loaded from {}; ignoring options for {}",
                loaded_with.bundle_path.display(),
                options.bundle_path.display()
            );
        }
        Some(handle.clone())
    }
}

static ARTIFACTS: ArtifactCache = ArtifactCache::new();

/// Process-wide load: reads storage on the first successful call only.
pub fn load(options: &LoadOptions) -> Result<ModelHandle, ArtifactLoadError> {
    ARTIFACTS.get_or_load(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{bundle_json, lstm_json, write_bundle, ENCODED_WIDTH};
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_load_full_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), &bundle_json(14, Some(0.3), Some(0.9)));

        let handle = ModelHandle::load(&LoadOptions::new(&path)).unwrap();

        assert!(handle.has_tabular_model());
        assert!(handle.has_sequence_model());
        assert_eq!(handle.window_length(), 14);
        assert_eq!(handle.preprocessor.output_width(), ENCODED_WIDTH);
        assert_eq!(handle.model_version.as_deref(), Some("test-bundle"));
        assert_eq!(handle.blend_weight, DEFAULT_BLEND_WEIGHT);
    }

    #[test]
    fn test_missing_bundle() {
        let err = ModelHandle::load(&LoadOptions::new("no/such/bundle.json")).unwrap_err();
        assert!(matches!(err, ArtifactLoadError::NotFound(_)));
    }

    #[test]
    fn test_corrupt_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.json");
        std::fs::write(&path, b"\x80\x04\x95 pickled bytes").unwrap();

        let err = ModelHandle::load(&LoadOptions::new(&path)).unwrap_err();
        assert!(matches!(err, ArtifactLoadError::Format(_)));
    }

    #[test]
    fn test_missing_required_keys() {
        let dir = tempfile::tempdir().unwrap();

        let mut bundle = bundle_json(14, Some(0.3), None);
        bundle.as_object_mut().unwrap().remove("preprocessor");
        let path = write_bundle(dir.path(), &bundle);
        let err = ModelHandle::load(&LoadOptions::new(&path)).unwrap_err();
        assert!(matches!(err, ArtifactLoadError::Format(_)));

        let mut bundle = bundle_json(14, Some(0.3), None);
        bundle.as_object_mut().unwrap().remove("format_version");
        let path = write_bundle(dir.path(), &bundle);
        let err = ModelHandle::load(&LoadOptions::new(&path)).unwrap_err();
        assert!(matches!(err, ArtifactLoadError::Invalid(_)));
    }

    #[test]
    fn test_unsupported_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut bundle = bundle_json(14, Some(0.3), None);
        bundle["format_version"] = serde_json::json!(7);
        let path = write_bundle(dir.path(), &bundle);

        let err = ModelHandle::load(&LoadOptions::new(&path)).unwrap_err();
        assert!(matches!(err, ArtifactLoadError::UnsupportedVersion(7)));

        bundle["format_version"] = serde_json::json!("1");
        let path = write_bundle(dir.path(), &bundle);
        let err = ModelHandle::load(&LoadOptions::new(&path)).unwrap_err();
        assert!(matches!(err, ArtifactLoadError::Invalid(_)));
    }

    #[test]
    fn test_invalid_blend_weight() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), &bundle_json(14, Some(0.3), None));

        for alpha in [-0.1, 1.5, f64::NAN] {
            let err = ModelHandle::load(&LoadOptions::new(&path).with_blend_weight(alpha));
            assert!(matches!(err, Err(ArtifactLoadError::InvalidBlendWeight(_))));
        }
    }

    #[test]
    fn test_fallback_sequence_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), &bundle_json(14, Some(0.3), None));
        let lstm_path = dir.path().join("sequence.json");
        std::fs::write(&lstm_path, lstm_json(0.9).to_string()).unwrap();

        let handle =
            ModelHandle::load(&LoadOptions::new(&path).with_sequence_model(&lstm_path)).unwrap();
        assert!(handle.has_sequence_model());

        let handle = ModelHandle::load(
            &LoadOptions::new(&path).with_sequence_model(dir.path().join("missing.keras")),
        )
        .unwrap();
        assert!(!handle.has_sequence_model());
        assert!(handle.has_tabular_model());
    }

    #[test]
    fn test_embedded_sequence_model_wins_over_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), &bundle_json(14, None, Some(0.9)));
        let bogus = dir.path().join("broken.json");
        std::fs::write(&bogus, b"{}").unwrap();

        let handle = ModelHandle::load(&LoadOptions::new(&path).with_sequence_model(&bogus)).unwrap();
        assert_eq!(handle.sequence.as_ref().map(|m| m.kind()), Some("lstm"));
    }

    #[test]
    fn test_trusted_root() {
        let trusted = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let path = write_bundle(elsewhere.path(), &bundle_json(14, Some(0.3), None));

        let mut options = LoadOptions::new(&path);
        options.trusted_root = Some(trusted.path().to_path_buf());
        let err = ModelHandle::load(&options).unwrap_err();
        assert!(matches!(err, ArtifactLoadError::Untrusted { .. }));

        options.trusted_root = Some(elsewhere.path().to_path_buf());
        assert!(ModelHandle::load(&options).is_ok());

        options.trusted_root = Some(elsewhere.path().join("gone"));
        assert!(matches!(
            ModelHandle::load(&options),
            Err(ArtifactLoadError::NotFound(_))
        ));
    }

    #[test]
    fn test_digest_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), &bundle_json(14, Some(0.3), None));
        let digest = format!("{:x}", Sha256::digest(std::fs::read(&path).unwrap()));

        let mut options = LoadOptions::new(&path);
        options.expected_sha256 = Some(digest.to_uppercase());
        assert!(ModelHandle::load(&options).is_ok());

        options.expected_sha256 = Some("00".repeat(32));
        assert!(matches!(
            ModelHandle::load(&options),
            Err(ArtifactLoadError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_tree_referencing_unknown_feature() {
        let dir = tempfile::tempdir().unwrap();
        let mut bundle = bundle_json(14, None, None);
        bundle["tabular_model"] = serde_json::json!({
            "kind": "gradient_boosted_trees",
            "objective": "reg:squarederror",
            "trees": [{"nodes": [
                {"split": {"feature": 99, "threshold": 0.0, "left": 1, "right": 2}},
                {"leaf": {"value": 0.1}},
                {"leaf": {"value": 0.2}}
            ]}]
        });
        let path = write_bundle(dir.path(), &bundle);
        assert!(matches!(
            ModelHandle::load(&LoadOptions::new(&path)),
            Err(ArtifactLoadError::Invalid(_))
        ));
    }

    #[test]
    fn test_cache_ignores_later_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_bundle(dir.path(), &bundle_json(14, Some(0.3), None));
        let cache = ArtifactCache::new();

        let a = cache.get_or_load(&LoadOptions::new(&first)).unwrap();
        std::fs::remove_file(&first).unwrap();
        let b = cache
            .get_or_load(&LoadOptions::new("elsewhere.json").with_blend_weight(0.1))
            .unwrap();

        assert!(Arc::ptr_eq(&a.0, &b.0));
        assert_eq!(b.blend_weight, DEFAULT_BLEND_WEIGHT);
    }

    #[test]
    fn test_cache_stays_empty_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new();

        assert!(cache.get_or_load(&LoadOptions::new(dir.path().join("x.json"))).is_err());
        assert!(cache.cell.get().is_none());

        let path = write_bundle(dir.path(), &bundle_json(14, Some(0.3), None));
        assert!(cache.get_or_load(&LoadOptions::new(&path)).is_ok());
        assert!(cache.cell.get().is_some());
    }

    #[test]
    fn test_cache_racing_initializers_share_one_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), &bundle_json(14, Some(0.3), Some(0.9)));
        let cache = Arc::new(ArtifactCache::new());
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                let options = LoadOptions::new(&path);
                thread::spawn(move || {
                    barrier.wait();
                    cache.get_or_load(&options).unwrap()
                })
            })
            .collect();

        let loaded: Vec<ModelHandle> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for h in &loaded[1..] {
            assert!(Arc::ptr_eq(&loaded[0].0, &h.0));
        }
    }
}
