//! Rainfall forecasting.
//!
//! `RainfallForecaster` owns the numeric state (stacked LSTM + min-max
//! scaler) and predicts the next day's rainfall from the preceding
//! `DEFAULT_SEQUENCE_LENGTH` daily observations. `RainfallService` is the
//! request-facing facade that pulls history from a [`RainfallHistory`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::{DateRange, Location};
use crate::errors::AppError;
use crate::helpers::{days_inclusive, format_date};
use crate::ml::artifacts::ArtifactStore;
use crate::ml::recurrent::{RecurrentConfig, RecurrentRegressor};
use crate::ml::scaler::MinMaxScaler;
use crate::ml::training::{TrainingConfig, TrainingReport};
use crate::ml::window::{latest_window, make_windows, DEFAULT_SEQUENCE_LENGTH};
use crate::ml::ModelError;
use crate::services::open_meteo::RainfallHistory;
use crate::services::registry::ModelHandle;

pub const RAINFALL_MODEL_ARTIFACT: &str = "rainfall_model.json";
pub const RAINFALL_SCALER_ARTIFACT: &str = "rainfall_scaler.json";

/// Fixed confidence reported with every rainfall prediction.
pub const RAINFALL_CONFIDENCE: f64 = 0.85;

/// Extra days of history requested beyond the window, to ride out provider lag.
const HISTORY_SLACK_DAYS: i64 = 14;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RainfallPrediction {
    /// Predicted precipitation for the first day of the range (mm)
    pub predicted_rainfall: f64,
    pub confidence: f64,
}

/// Daily rainfall for a date range; `rainfall[i]` belongs to `dates[i]`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HistoricalRainfall {
    /// `YYYY-MM-DD`, one per day, ascending
    pub dates: Vec<String>,
    /// Daily precipitation sums (mm)
    pub rainfall: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct RainfallForecaster {
    regressor: RecurrentRegressor,
    scaler: MinMaxScaler,
    sequence_length: usize,
}

impl RainfallForecaster {
    /// An untrained forecaster; `predict_next` fails until `train` succeeds.
    pub fn new(config: RecurrentConfig) -> Result<Self, ModelError> {
        Ok(Self {
            regressor: RecurrentRegressor::new(config)?,
            scaler: MinMaxScaler::new(),
            sequence_length: DEFAULT_SEQUENCE_LENGTH,
        })
    }

    pub fn untrained() -> Result<Self, ModelError> {
        Self::new(RecurrentConfig::default())
    }

    pub fn artifacts_present(store: &ArtifactStore) -> bool {
        store.exists_all(&[RAINFALL_MODEL_ARTIFACT, RAINFALL_SCALER_ARTIFACT])
    }

    pub fn load(store: &ArtifactStore) -> Result<Self, ModelError> {
        store.ensure_same_generation(&[RAINFALL_MODEL_ARTIFACT, RAINFALL_SCALER_ARTIFACT])?;
        let regressor: RecurrentRegressor = store.load(RAINFALL_MODEL_ARTIFACT)?;
        regressor.check_shape()?;
        Ok(Self {
            regressor,
            scaler: store.load(RAINFALL_SCALER_ARTIFACT)?,
            sequence_length: DEFAULT_SEQUENCE_LENGTH,
        })
    }

    pub fn save(&self, store: &ArtifactStore) -> Result<(), ModelError> {
        store
            .batch()
            .add(RAINFALL_MODEL_ARTIFACT, &self.regressor)?
            .add(RAINFALL_SCALER_ARTIFACT, &self.scaler)?
            .commit()
    }

    pub fn is_ready(&self) -> bool {
        self.scaler.is_fitted()
    }

    pub fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    /// Fit scaler and regressor on a raw daily series, then persist both.
    ///
    /// On error nothing is written; callers train a copy and discard it.
    pub fn train(
        &mut self,
        series: &[f64],
        config: &TrainingConfig,
        store: &ArtifactStore,
    ) -> Result<TrainingReport, ModelError> {
        let normalized = self.scaler.fit_transform(series)?;
        let windows = make_windows(&normalized, self.sequence_length);
        if windows.is_empty() {
            return Err(ModelError::InsufficientData {
                needed: self.sequence_length + 1,
                got: series.len(),
            });
        }

        let report = self.regressor.fit(&windows, config)?;
        self.save(store)?;
        Ok(report)
    }

    /// Predict the value following the last `sequence_length` entries of `recent`.
    pub fn predict_next(&self, recent: &[f64]) -> Result<f64, ModelError> {
        if !self.is_ready() {
            return Err(ModelError::Uninitialized("rainfall forecaster"));
        }
        let window = latest_window(recent, self.sequence_length)?;
        let normalized = self.scaler.transform(window)?;
        let scaled = self.regressor.predict(&normalized)?;
        let restored = self.scaler.inverse_transform(&[scaled])?;
        Ok(restored[0])
    }
}

/// Request-facing rainfall operations.
#[derive(Clone)]
pub struct RainfallService {
    forecaster: ModelHandle<RainfallForecaster>,
    history: Arc<dyn RainfallHistory>,
}

impl RainfallService {
    pub fn new(forecaster: ModelHandle<RainfallForecaster>, history: Arc<dyn RainfallHistory>) -> Self {
        Self { forecaster, history }
    }

    /// Predict rainfall for the first day of `range` from the days before it.
    pub async fn predict(
        &self,
        location: Location,
        range: DateRange,
    ) -> Result<RainfallPrediction, AppError> {
        let forecaster = self.forecaster.snapshot().await;
        if !forecaster.is_ready() {
            return Err(AppError::Uninitialized(
                "Rainfall model has not been trained".to_string(),
            ));
        }

        let lookback = forecaster.sequence_length() as i64 + HISTORY_SLACK_DAYS;
        let history_start = range
            .start
            .checked_sub_signed(Duration::days(lookback))
            .ok_or_else(|| {
                AppError::BadRequest(format!(
                    "start_date {} is too early to look back {} days",
                    format_date(range.start),
                    lookback
                ))
            })?;
        let history_end = range
            .start
            .pred_opt()
            .unwrap_or(range.start)
            .min(Utc::now().date_naive());
        if history_end < history_start {
            return Err(AppError::DataUnavailable(format!(
                "No rainfall history available before {}",
                format_date(range.start)
            )));
        }

        let series = self
            .history
            .daily_precipitation(location, history_start, history_end)
            .await?;
        let observed = series.observed();
        tracing::debug!(
            requested_days = series.dates.len(),
            observed_days = observed.len(),
            "Fetched rainfall history for prediction"
        );

        let predicted_rainfall = forecaster.predict_next(&observed)?;
        Ok(RainfallPrediction {
            predicted_rainfall,
            confidence: RAINFALL_CONFIDENCE,
        })
    }

    /// One observation per calendar day of `range`, inclusive.
    pub async fn get_historical_data(
        &self,
        location: Location,
        range: DateRange,
    ) -> Result<HistoricalRainfall, AppError> {
        let series = self
            .history
            .daily_precipitation(location, range.start, range.end)
            .await?;
        let by_day: BTreeMap<NaiveDate, f64> = series
            .dates
            .iter()
            .zip(&series.values)
            .filter_map(|(d, v)| v.map(|v| (*d, v)))
            .collect();

        let mut out = HistoricalRainfall {
            dates: Vec::new(),
            rainfall: Vec::new(),
        };
        for day in days_inclusive(range.start, range.end) {
            let value = by_day.get(&day).copied().ok_or_else(|| {
                AppError::DataUnavailable(format!(
                    "No rainfall observation for {}",
                    format_date(day)
                ))
            })?;
            out.dates.push(format_date(day));
            out.rainfall.push(value);
        }
        Ok(out)
    }
}
