use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{missing_parameters, AppState, HistoricalQuery, SUCCESS};
use crate::domain::{DateRange, DateRangeBody, Location};
use crate::errors::{AppError, ErrorResponse};
use crate::services::rainfall::{HistoricalRainfall, RainfallPrediction};

/// Request body for POST /api/rainfall/predict.
#[derive(Debug, Deserialize, ToSchema)]
pub struct RainfallPredictRequest {
    pub location: Option<Location>,
    /// The prediction targets `date_range.start_date`
    pub date_range: Option<DateRangeBody>,
}

/// Response type for POST /api/rainfall/predict.
#[derive(Debug, Serialize, ToSchema)]
pub struct RainfallPredictResponse {
    pub status: String,
    pub prediction: RainfallPrediction,
}

/// Response type for GET /api/rainfall/historical.
#[derive(Debug, Serialize, ToSchema)]
pub struct HistoricalRainfallResponse {
    pub status: String,
    pub data: HistoricalRainfall,
}

/// Predict rainfall for the first day of the range.
///
/// The forecaster reads the observed days leading up to `start_date`.
#[utoipa::path(
    post,
    path = "/api/rainfall/predict",
    tag = "Rainfall",
    request_body = RainfallPredictRequest,
    responses(
        (status = 200, description = "Predicted rainfall in mm", body = RainfallPredictResponse),
        (status = 400, description = "Missing or malformed parameters", body = ErrorResponse),
        (status = 500, description = "Model not trained, history unavailable or provider failure", body = ErrorResponse),
    )
)]
pub async fn predict_rainfall(
    State(state): State<AppState>,
    payload: Result<Json<RainfallPredictRequest>, JsonRejection>,
) -> Result<Json<RainfallPredictResponse>, AppError> {
    let Json(request) = payload?;
    let (Some(location), Some(date_range)) = (request.location, request.date_range.as_ref()) else {
        return Err(missing_parameters());
    };
    let range = DateRange::try_from(date_range)?;

    let prediction = state.rainfall.predict(location, range).await?;
    tracing::info!(
        latitude = location.latitude,
        longitude = location.longitude,
        predicted_rainfall = prediction.predicted_rainfall,
        "Rainfall predicted"
    );
    Ok(Json(RainfallPredictResponse {
        status: SUCCESS.to_string(),
        prediction,
    }))
}

/// Observed daily rainfall for every day of an inclusive range.
#[utoipa::path(
    get,
    path = "/api/rainfall/historical",
    tag = "Rainfall",
    params(HistoricalQuery),
    responses(
        (status = 200, description = "One observation per day", body = HistoricalRainfallResponse),
        (status = 400, description = "Missing or malformed parameters", body = ErrorResponse),
        (status = 500, description = "Missing observations or provider failure", body = ErrorResponse),
    )
)]
pub async fn get_historical_rainfall(
    State(state): State<AppState>,
    query: Result<Query<HistoricalQuery>, QueryRejection>,
) -> Result<Json<HistoricalRainfallResponse>, AppError> {
    let Query(params) = query?;
    let (location, range) = params.parse()?;

    let data = state.rainfall.get_historical_data(location, range).await?;
    Ok(Json(HistoricalRainfallResponse {
        status: SUCCESS.to_string(),
        data,
    }))
}

#[cfg(test)]
mod tests {
    use crate::routes::tests::{get, post_json, send, test_app, with_query};
    use axum::http::StatusCode;

    const NYC: &str = r#"{"latitude":40.7128,"longitude":-74.0060}"#;

    #[tokio::test]
    async fn test_predict_reference_body() {
        let app = test_app(true);
        let body = r#"{
            "location": {"latitude": 40.7128, "longitude": -74.0060},
            "date_range": {"start_date": "2023-01-01", "end_date": "2023-01-31"}
        }"#;
        let (status, json) = send(&app.router, post_json("/api/rainfall/predict", body)).await;

        assert_eq!(status, StatusCode::OK, "{}", json);
        assert_eq!(json["status"], "success");
        assert!(json["prediction"]["predicted_rainfall"].as_f64().unwrap().is_finite());
        assert_eq!(json["prediction"]["confidence"], 0.85);
    }

    #[tokio::test]
    async fn test_predict_accepts_string_coordinates() {
        let app = test_app(true);
        let body = r#"{
            "location": {"latitude": "40.7128", "longitude": "-74.0060"},
            "date_range": {"start_date": "2023-01-01", "end_date": "2023-01-31"}
        }"#;
        let (status, _) = send(&app.router, post_json("/api/rainfall/predict", body)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_predict_without_date_range_is_400() {
        let app = test_app(true);
        let body = format!(r#"{{"location": {}}}"#, NYC);
        let (status, json) = send(&app.router, post_json("/api/rainfall/predict", &body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Missing required parameters");
        assert!(app.history.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_predict_malformed_json_is_400() {
        let app = test_app(true);
        let (status, json) = send(&app.router, post_json("/api/rainfall/predict", "{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().starts_with("Invalid JSON body"));
    }

    #[tokio::test]
    async fn test_predict_untrained_model_is_500() {
        let app = test_app(false);
        let body = format!(
            r#"{{"location": {}, "date_range": {{"start_date": "2023-01-01", "end_date": "2023-01-31"}}}}"#,
            NYC
        );
        let (status, json) = send(&app.router, post_json("/api/rainfall/predict", &body)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json["error"].is_string());
        assert!(app.history.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_predict_at_earliest_representable_date_is_400() {
        let app = test_app(true);
        let earliest = crate::helpers::format_date(chrono::NaiveDate::MIN);
        let body = format!(
            r#"{{"location": {}, "date_range": {{"start_date": "{}", "end_date": "{}"}}}}"#,
            NYC, earliest, earliest
        );
        let (status, json) = send(&app.router, post_json("/api/rainfall/predict", &body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", json);
        assert!(json["error"].as_str().unwrap().contains("too early"));
        assert!(app.history.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_historical_single_day() {
        let app = test_app(false);
        let uri = with_query(
            "/api/rainfall/historical",
            &[("location", NYC), ("start_date", "2023-03-05"), ("end_date", "2023-03-05")],
        );
        let (status, json) = send(&app.router, get(&uri)).await;

        assert_eq!(status, StatusCode::OK, "{}", json);
        assert_eq!(json["data"]["dates"], serde_json::json!(["2023-03-05"]));
        assert_eq!(json["data"]["rainfall"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_historical_week_is_seven_ordered_days() {
        let app = test_app(false);
        let uri = with_query(
            "/api/rainfall/historical",
            &[("location", NYC), ("start_date", "2023-02-25"), ("end_date", "2023-03-03")],
        );
        let (status, json) = send(&app.router, get(&uri)).await;
        assert_eq!(status, StatusCode::OK);

        let dates: Vec<&str> = json["data"]["dates"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d.as_str().unwrap())
            .collect();
        assert_eq!(dates.len(), 7);
        assert!(dates.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(dates[3], "2023-02-28");
    }

    #[tokio::test]
    async fn test_historical_missing_parameter_is_400() {
        let app = test_app(false);
        let uri = with_query("/api/rainfall/historical", &[("location", NYC), ("start_date", "2023-01-01")]);
        let (status, json) = send(&app.router, get(&uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Missing required parameters");
    }

    #[tokio::test]
    async fn test_historical_reversed_range_is_400() {
        let app = test_app(false);
        let uri = with_query(
            "/api/rainfall/historical",
            &[("location", NYC), ("start_date", "2023-01-10"), ("end_date", "2023-01-01")],
        );
        let (status, _) = send(&app.router, get(&uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(app.history.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_historical_bad_location_is_400() {
        let app = test_app(false);
        let uri = with_query(
            "/api/rainfall/historical",
            &[("location", "40.7,-74.0"), ("start_date", "2023-01-01"), ("end_date", "2023-01-02")],
        );
        let (status, json) = send(&app.router, get(&uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().starts_with("Invalid location"));
    }
}
