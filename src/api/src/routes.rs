//! API route handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::artifacts::ModelHandle;
use crate::config::{AppConfig, RECOGNIZED_COLUMNS};
use crate::contract::ColumnKind;
use crate::history::HistoryStore;
use crate::predictor;
use crate::types::{
    EntryResponse, ErrorResponse, FeatureRow, HealthResponse, ModelInfoResponse, PredictRequest,
    PredictResponse,
};

/// Application state shared across handlers.
pub struct AppState {
    pub model: ModelHandle,
    pub config: AppConfig,
    pub history: HistoryStore,
}

/// Error type for API handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.status.to_string(),
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

/// Build the router with tracing and CORS layers.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/model/info", get(model_info))
        .route("/predict", post(predict))
        .route("/patients/:id/entries", put(put_entry))
        .route("/patients/:id/risk", get(patient_risk))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn resolve_threshold(requested: Option<f64>, config: &AppConfig) -> Result<f64, ApiError> {
    let threshold = requested.unwrap_or(config.alerts.risk_threshold);
    if !(0.0..=100.0).contains(&threshold) {
        return Err(ApiError::bad_request(format!(
            "risk_threshold must be within [0, 100], got {}",
            threshold
        )));
    }
    Ok(threshold)
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Model info endpoint.
pub async fn model_info(State(state): State<Arc<AppState>>) -> Json<ModelInfoResponse> {
    let model = &state.model;
    Json(ModelInfoResponse {
        bundle_path: model
            .bundle_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| state.config.model.bundle_path.clone()),
        model_version: model.model_version.clone(),
        seq_length: model.window_length(),
        blend_weight: model.blend_weight,
        feature_columns: model.contract.names(),
        numeric_features: model.contract.names_of(ColumnKind::Numeric),
        categorical_features: model.contract.names_of(ColumnKind::Categorical),
        encoded_width: model.preprocessor.output_width(),
        has_tabular_model: model.has_tabular_model(),
        has_sequence_model: model.has_sequence_model(),
    })
}

/// Prediction endpoint for an inline history.
pub async fn predict(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PredictRequest>,
) -> Result<Json<PredictResponse>, ApiError> {
    let threshold = resolve_threshold(req.risk_threshold, &state.config)?;

    let series = predictor::predict(&req.history, &state.model);
    tracing::debug!(
        "Scored {} days for {} via {}",
        series.len(),
        req.patient_id.as_deref().unwrap_or("anonymous history"),
        series.source.as_str()
    );

    Ok(Json(PredictResponse::from_series(
        req.patient_id,
        series,
        threshold,
    )))
}

/// Record (or re-submit) one day for a patient.
pub async fn put_entry(
    State(state): State<Arc<AppState>>,
    Path(patient_id): Path<String>,
    Json(row): Json<FeatureRow>,
) -> Result<Json<EntryResponse>, ApiError> {
    if patient_id.trim().is_empty() {
        return Err(ApiError::bad_request("Patient id must not be empty"));
    }

    let unrecognized: Vec<&str> = row
        .values
        .keys()
        .map(String::as_str)
        .filter(|k| !RECOGNIZED_COLUMNS.contains(k) && state.model.contract.column(k).is_none())
        .collect();
    if !unrecognized.is_empty() {
        tracing::debug!("Entry for {} carries unused columns: {:?}", patient_id, unrecognized);
    }

    let outcome = state.history.upsert_day(&patient_id, row);
    Ok(Json(EntryResponse {
        patient_id,
        days: outcome.days,
        replaced: outcome.replaced,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RiskQuery {
    #[serde(default)]
    pub threshold: Option<f64>,
}

/// Risk series for a stored patient history.
pub async fn patient_risk(
    State(state): State<Arc<AppState>>,
    Path(patient_id): Path<String>,
    Query(query): Query<RiskQuery>,
) -> Result<Json<PredictResponse>, ApiError> {
    let threshold = resolve_threshold(query.threshold, &state.config)?;
    let history = state
        .history
        .history(&patient_id)
        .ok_or_else(|| ApiError::not_found(format!("Unknown patient {}", patient_id)))?;

    let series = predictor::predict(&history, &state.model);
    Ok(Json(PredictResponse::from_series(
        Some(patient_id),
        series,
        threshold,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::LoadOptions;
    use crate::testutil::{bundle_json, history, write_bundle};
    use crate::types::{AlertLevel, PredictionSource};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn state(tabular: Option<f64>, sequence: Option<f64>) -> Arc<AppState> {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(dir.path(), &bundle_json(14, tabular, sequence));
        let model = ModelHandle::load(&LoadOptions::new(&path)).unwrap();
        Arc::new(AppState {
            model,
            config: AppConfig::default(),
            history: HistoryStore::new(),
        })
    }

    async fn body_json<T: serde::de::DeserializeOwned>(resp: Response) -> T {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let resp = router(state(Some(0.3), None))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let health: HealthResponse = body_json(resp).await;
        assert_eq!(health.status, "ok");
    }

    #[tokio::test]
    async fn test_model_info() {
        let resp = router(state(Some(0.3), Some(0.9)))
            .oneshot(Request::get("/model/info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let info: ModelInfoResponse = body_json(resp).await;
        assert_eq!(info.seq_length, 14);
        assert_eq!(info.encoded_width, 12);
        assert!(info.has_tabular_model && info.has_sequence_model);
        assert_eq!(info.categorical_features, vec!["genotype".to_string()]);
    }

    #[tokio::test]
    async fn test_predict_inline_history() {
        let body = serde_json::json!({
            "patient_id": "P1003",
            "history": serde_json::to_value(history(20)).unwrap(),
            "risk_threshold": 60.0
        });
        let resp = router(state(Some(0.3), Some(0.9)))
            .oneshot(json_request("POST", "/predict", body))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let pred: PredictResponse = body_json(resp).await;
        assert_eq!(pred.source, PredictionSource::Hybrid);
        assert_eq!(pred.risk.len(), 20);
        assert_eq!(pred.latest_score, Some(66));
        assert_eq!(pred.alert, Some(AlertLevel::Danger));
        assert!(!pred.degraded);
    }

    #[tokio::test]
    async fn test_predict_rejects_bad_threshold() {
        let body = serde_json::json!({"history": [], "risk_threshold": 150.0});
        let resp = router(state(Some(0.3), None))
            .oneshot(json_request("POST", "/predict", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_short_history_is_degraded_not_an_error() {
        let body = serde_json::json!({"history": serde_json::to_value(history(3)).unwrap()});
        let resp = router(state(Some(0.3), Some(0.9)))
            .oneshot(json_request("POST", "/predict", body))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let pred: PredictResponse = body_json(resp).await;
        assert!(pred.degraded);
        assert_eq!(pred.alert, Some(AlertLevel::Ok));
        assert!(pred.risk.iter().all(|p| p.score == 0));
    }

    #[tokio::test]
    async fn test_entries_then_risk() {
        let app = router(state(Some(0.3), None));

        for row in history(15) {
            let resp = app
                .clone()
                .oneshot(json_request(
                    "PUT",
                    "/patients/P1004/entries",
                    serde_json::to_value(&row).unwrap(),
                ))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        // re-submitting the last day replaces it
        let last = history(15).pop().unwrap().with("pain_level", 10.0);
        let resp = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/patients/P1004/entries",
                serde_json::to_value(&last).unwrap(),
            ))
            .await
            .unwrap();
        let entry: EntryResponse = body_json(resp).await;
        assert_eq!(entry.days, 15);
        assert!(entry.replaced);

        let resp = app
            .clone()
            .oneshot(
                Request::get("/patients/P1004/risk?threshold=25")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let pred: PredictResponse = body_json(resp).await;
        assert_eq!(pred.source, PredictionSource::TabularOnly);
        assert_eq!(pred.risk.len(), 15);
        assert_eq!(pred.latest_score, Some(30));
        assert_eq!(pred.alert, Some(AlertLevel::Danger));
    }

    #[tokio::test]
    async fn test_unknown_patient() {
        let resp = router(state(Some(0.3), None))
            .oneshot(
                Request::get("/patients/nobody/risk")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
