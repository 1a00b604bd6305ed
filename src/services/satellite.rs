//! Vegetation analysis of imagery scenes.

use std::sync::Arc;

use chrono::NaiveDate;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::{DateRange, Location};
use crate::errors::AppError;
use crate::helpers::{format_date, month_ends};
use crate::services::imagery::ImagerySource;
use crate::services::vegetation::{analyze_bands, HealthStatus, IndexSummary};

/// Scene requests in flight at once during a historical analysis.
pub const MAX_CONCURRENT_SCENE_FETCHES: usize = 4;

/// Longest historical analysis served, in month ends (ten years).
pub const MAX_HISTORY_MONTHS: usize = 120;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct VegetationAnalysis {
    pub ndvi: IndexSummary,
    pub evi: IndexSummary,
    pub health_status: HealthStatus,
    /// Requested date, `YYYY-MM-DD`
    pub image_date: String,
    pub location: Location,
}

#[derive(Clone)]
pub struct SatelliteService {
    imagery: Arc<dyn ImagerySource>,
}

impl SatelliteService {
    pub fn new(imagery: Arc<dyn ImagerySource>) -> Self {
        Self { imagery }
    }

    pub async fn analyze(&self, location: Location, date: NaiveDate) -> Result<VegetationAnalysis, AppError> {
        let scene = self.imagery.scene(location, date).await?;
        let report = analyze_bands(&scene.bands.red, &scene.bands.nir, &scene.bands.blue)?;
        tracing::debug!(
            scene_id = %scene.scene_id,
            mean_ndvi = report.ndvi.mean,
            "Scene analyzed"
        );
        Ok(VegetationAnalysis {
            ndvi: report.ndvi,
            evi: report.evi,
            health_status: report.health_status,
            image_date: format_date(date),
            location,
        })
    }

    /// One analysis per calendar month end inside `range`, in date order.
    pub async fn historical_analysis(
        &self,
        location: Location,
        range: DateRange,
    ) -> Result<Vec<VegetationAnalysis>, AppError> {
        let dates = month_ends(range.start, range.end);
        if dates.len() > MAX_HISTORY_MONTHS {
            return Err(AppError::BadRequest(format!(
                "Date range spans {} month ends, at most {} are allowed",
                dates.len(),
                MAX_HISTORY_MONTHS
            )));
        }
        stream::iter(dates)
            .map(|date| self.analyze(location, date))
            .buffered(MAX_CONCURRENT_SCENE_FETCHES)
            .try_collect()
            .await
    }
}
