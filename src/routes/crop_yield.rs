use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{missing_parameters, AppState, SUCCESS};
use crate::domain::{non_empty, DateRange, DateRangeBody, Location};
use crate::errors::{AppError, ErrorResponse};
use crate::services::crop_yield::YieldPrediction;

/// Request body for POST /api/crop-yield/predict.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CropYieldRequest {
    pub location: Option<Location>,
    /// Crop name, e.g. "maize"
    #[schema(example = "maize")]
    pub crop_type: Option<String>,
    /// Growing season; the scene is taken at `end_date`
    pub date_range: Option<DateRangeBody>,
}

/// Response type for POST /api/crop-yield/predict.
#[derive(Debug, Serialize, ToSchema)]
pub struct CropYieldResponse {
    pub status: String,
    pub prediction: YieldPrediction,
}

/// Estimate crop yield from imagery and seasonal rainfall.
#[utoipa::path(
    post,
    path = "/api/crop-yield/predict",
    tag = "Crop yield",
    request_body = CropYieldRequest,
    responses(
        (status = 200, description = "Fused yield estimate with per-branch contributions", body = CropYieldResponse),
        (status = 400, description = "Missing or malformed parameters", body = ErrorResponse),
        (status = 500, description = "Model not trained, input unavailable or upstream failure", body = ErrorResponse),
    )
)]
pub async fn predict_crop_yield(
    State(state): State<AppState>,
    payload: Result<Json<CropYieldRequest>, JsonRejection>,
) -> Result<Json<CropYieldResponse>, AppError> {
    let Json(request) = payload?;
    let (Some(location), Some(crop_type), Some(date_range)) = (
        request.location,
        non_empty(&request.crop_type),
        request.date_range.as_ref(),
    ) else {
        return Err(missing_parameters());
    };
    let range = DateRange::try_from(date_range)?;

    let prediction = state.crop_yield.predict(location, crop_type, range).await?;
    tracing::info!(
        crop_type,
        predicted_yield = prediction.predicted_yield,
        "Crop yield predicted"
    );
    Ok(Json(CropYieldResponse {
        status: SUCCESS.to_string(),
        prediction,
    }))
}

#[cfg(test)]
mod tests {
    use crate::routes::tests::{post_json, send, test_app, test_app_with};
    use axum::http::StatusCode;
    use std::sync::atomic::Ordering;

    const FULL_BODY: &str = r#"{
        "location": {"latitude": 40.7128, "longitude": -74.0060},
        "crop_type": "maize",
        "date_range": {"start_date": "2023-04-01", "end_date": "2023-08-31"}
    }"#;

    #[tokio::test]
    async fn test_location_only_is_400_without_upstream_calls() {
        let app = test_app(false);
        let body = r#"{"location": {"latitude": 40.7128, "longitude": -74.0060}}"#;
        let (status, json) = send(&app.router, post_json("/api/crop-yield/predict", body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Missing required parameters");
        assert_eq!(app.imagery.calls.load(Ordering::SeqCst), 0);
        assert!(app.history.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blank_crop_type_is_400() {
        let app = test_app(false);
        let body = FULL_BODY.replace("\"maize\"", "\"  \"");
        let (status, _) = send(&app.router, post_json("/api/crop-yield/predict", &body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_untrained_estimator_is_500_without_upstream_calls() {
        let app = test_app(false);
        let (status, json) = send(&app.router, post_json("/api/crop-yield/predict", FULL_BODY)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json["error"].is_string());
        assert_eq!(app.imagery.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_trained_estimator_fuses_branches() {
        let app = test_app_with(false, true);
        let (status, json) = send(&app.router, post_json("/api/crop-yield/predict", FULL_BODY)).await;
        assert_eq!(status, StatusCode::OK, "{}", json);
        assert_eq!(json["status"], "success");

        let prediction = &json["prediction"];
        let satellite = prediction["satellite_contribution"].as_f64().unwrap();
        let climate = prediction["climate_contribution"].as_f64().unwrap();
        let fused = prediction["predicted_yield"].as_f64().unwrap();
        assert!((fused - (satellite + climate) / 2.0).abs() < 1e-9);
        assert_eq!(prediction["confidence"], 0.9);

        assert_eq!(app.imagery.calls.load(Ordering::SeqCst), 1);
        assert_eq!(app.history.calls.lock().unwrap().len(), 1);
    }
}
