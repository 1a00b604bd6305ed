use axum::extract::State;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use super::{AppState, SUCCESS};

/// Response type for GET /.
#[derive(Debug, Serialize, ToSchema)]
pub struct IndexResponse {
    /// Always "success"
    pub status: String,
    /// Service banner
    pub message: String,
}

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Always "ok" while the process serves requests
    pub status: String,
    /// API version
    pub version: String,
    /// Whether the rainfall forecaster and its scaler are fitted
    pub rainfall_model_ready: bool,
    /// Whether the crop yield estimator and its scaler are fitted
    pub crop_yield_model_ready: bool,
}

/// Service banner.
#[utoipa::path(
    get,
    path = "/",
    tag = "Health",
    responses(
        (status = 200, description = "Service banner", body = IndexResponse),
    )
)]
pub async fn index() -> Json<IndexResponse> {
    Json(IndexResponse {
        status: SUCCESS.to_string(),
        message: "Rainfall Prediction and Crop Yield Analysis API".to_string(),
    })
}

/// Health check endpoint.
///
/// Always 200. Untrained models are reported through the readiness flags
/// rather than a failing status, since prediction routes answer 500 on
/// their own until training completes.
#[utoipa::path(
    get,
    path = "/api/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service status and model readiness", body = HealthResponse),
    )
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let rainfall_model_ready = state.registry.rainfall.snapshot().await.is_ready();
    let crop_yield_model_ready = state.registry.crop_yield.snapshot().await.is_ready();

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        rainfall_model_ready,
        crop_yield_model_ready,
    })
}

#[cfg(test)]
mod tests {
    use crate::routes::tests::{get, send, test_app};
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_index_banner() {
        let app = test_app(false);
        let (status, body) = send(&app.router, get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["message"], "Rainfall Prediction and Crop Yield Analysis API");
    }

    #[tokio::test]
    async fn test_health_reports_untrained_models() {
        let app = test_app(false);
        let (status, body) = send(&app.router, get("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["rainfall_model_ready"], false);
        assert_eq!(body["crop_yield_model_ready"], false);
    }

    #[tokio::test]
    async fn test_health_reports_trained_rainfall_model() {
        let app = test_app(true);
        let (_, body) = send(&app.router, get("/api/health")).await;
        assert_eq!(body["rainfall_model_ready"], true);
        assert_eq!(body["crop_yield_model_ready"], false);
    }
}
