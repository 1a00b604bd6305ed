use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{missing_parameters, AppState, HistoricalQuery, SUCCESS};
use crate::domain::{non_empty, Location};
use crate::errors::{AppError, ErrorResponse};
use crate::helpers::parse_iso_date;
use crate::services::satellite::VegetationAnalysis;

/// Request body for POST /api/satellite/analyze.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SatelliteAnalyzeRequest {
    pub location: Option<Location>,
    /// Scene date, `YYYY-MM-DD`
    #[schema(example = "2023-06-15")]
    pub date: Option<String>,
}

/// Response type for POST /api/satellite/analyze.
#[derive(Debug, Serialize, ToSchema)]
pub struct SatelliteAnalyzeResponse {
    pub status: String,
    pub analysis: VegetationAnalysis,
}

/// Response type for GET /api/satellite/historical.
#[derive(Debug, Serialize, ToSchema)]
pub struct SatelliteHistoryResponse {
    pub status: String,
    /// One analysis per month end inside the range
    pub analyses: Vec<VegetationAnalysis>,
}

/// NDVI/EVI summary and vegetation health for one scene.
#[utoipa::path(
    post,
    path = "/api/satellite/analyze",
    tag = "Satellite",
    request_body = SatelliteAnalyzeRequest,
    responses(
        (status = 200, description = "Vegetation indices for the scene", body = SatelliteAnalyzeResponse),
        (status = 400, description = "Missing or malformed parameters", body = ErrorResponse),
        (status = 500, description = "No scene for the date or gateway failure", body = ErrorResponse),
    )
)]
pub async fn analyze_satellite_imagery(
    State(state): State<AppState>,
    payload: Result<Json<SatelliteAnalyzeRequest>, JsonRejection>,
) -> Result<Json<SatelliteAnalyzeResponse>, AppError> {
    let Json(request) = payload?;
    let (Some(location), Some(date)) = (request.location, non_empty(&request.date)) else {
        return Err(missing_parameters());
    };
    let date = parse_iso_date("date", date)?;

    let analysis = state.satellite.analyze(location, date).await?;
    Ok(Json(SatelliteAnalyzeResponse {
        status: SUCCESS.to_string(),
        analysis,
    }))
}

/// Monthly vegetation analyses over a date range.
#[utoipa::path(
    get,
    path = "/api/satellite/historical",
    tag = "Satellite",
    params(HistoricalQuery),
    responses(
        (status = 200, description = "Analyses at each month end, in date order", body = SatelliteHistoryResponse),
        (status = 400, description = "Missing or malformed parameters, or more than 120 month ends", body = ErrorResponse),
        (status = 500, description = "A scene is missing or gateway failure", body = ErrorResponse),
    )
)]
pub async fn get_historical_analysis(
    State(state): State<AppState>,
    query: Result<Query<HistoricalQuery>, QueryRejection>,
) -> Result<Json<SatelliteHistoryResponse>, AppError> {
    let Query(params) = query?;
    let (location, range) = params.parse()?;

    let analyses = state.satellite.historical_analysis(location, range).await?;
    tracing::debug!(count = analyses.len(), "Historical vegetation analyses computed");
    Ok(Json(SatelliteHistoryResponse {
        status: SUCCESS.to_string(),
        analyses,
    }))
}
