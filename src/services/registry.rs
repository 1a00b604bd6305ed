//! Model registry: the process-wide owner of every fitted model.
//!
//! Each model sits behind a [`ModelHandle`] (`Arc<RwLock<Arc<M>>>`).
//! Inference clones the current snapshot under a short read lock and then
//! works lock-free. Retraining clones the snapshot, fits and persists the
//! copy on a blocking worker, and swaps it in under the write lock, so
//! readers never see half-updated parameters.

use std::sync::Arc;

use chrono::{Duration, Utc};
use ndarray::{Array2, Array3};
use tokio::sync::RwLock;

use crate::domain::Location;
use crate::errors::AppError;
use crate::ml::artifacts::ArtifactStore;
use crate::ml::training::{TrainingConfig, TrainingReport};
use crate::ml::ModelError;
use crate::services::crop_yield::{YieldFusionEstimator, YieldTrainingReport};
use crate::services::open_meteo::RainfallHistory;
use crate::services::rainfall::RainfallForecaster;

/// Shared, swappable reference to the current version of a model.
pub struct ModelHandle<M> {
    current: Arc<RwLock<Arc<M>>>,
}

impl<M> Clone for ModelHandle<M> {
    fn clone(&self) -> Self {
        Self {
            current: Arc::clone(&self.current),
        }
    }
}

impl<M> ModelHandle<M> {
    pub fn new(model: M) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(model))),
        }
    }

    pub async fn snapshot(&self) -> Arc<M> {
        Arc::clone(&*self.current.read().await)
    }

    pub async fn replace(&self, model: M) {
        *self.current.write().await = Arc::new(model);
    }
}

pub struct ModelRegistry {
    store: ArtifactStore,
    pub rainfall: ModelHandle<RainfallForecaster>,
    pub crop_yield: ModelHandle<YieldFusionEstimator>,
}

impl ModelRegistry {
    /// Load every model whose artifacts are all present; start the rest untrained.
    ///
    /// A present but unreadable artifact is an error.
    pub fn load_or_create(store: ArtifactStore) -> Result<Self, ModelError> {
        let rainfall = if RainfallForecaster::artifacts_present(&store) {
            tracing::info!("Loading rainfall model from {}", store.dir().display());
            RainfallForecaster::load(&store)?
        } else {
            tracing::warn!(
                "No rainfall model artifacts in {}; rainfall predictions are unavailable until it is trained",
                store.dir().display()
            );
            RainfallForecaster::untrained()?
        };

        let crop_yield = if YieldFusionEstimator::artifacts_present(&store) {
            tracing::info!("Loading crop yield model from {}", store.dir().display());
            YieldFusionEstimator::load(&store)?
        } else {
            tracing::warn!(
                "No crop yield model artifacts in {}; crop yield predictions are unavailable until it is trained",
                store.dir().display()
            );
            YieldFusionEstimator::untrained()?
        };

        Ok(Self {
            store,
            rainfall: ModelHandle::new(rainfall),
            crop_yield: ModelHandle::new(crop_yield),
        })
    }

    /// Retrain the rainfall forecaster on a raw daily series and swap it in.
    pub async fn retrain_rainfall(
        &self,
        series: Vec<f64>,
        config: TrainingConfig,
    ) -> Result<TrainingReport, AppError> {
        let current = self.rainfall.snapshot().await;
        let store = self.store.clone();
        let (trained, report) = tokio::task::spawn_blocking(move || {
            let mut next = (*current).clone();
            next.train(&series, &config, &store).map(|report| (next, report))
        })
        .await
        .map_err(|e| AppError::InternalError(format!("Rainfall training worker failed: {}", e)))??;

        tracing::info!(
            samples = report.train_samples,
            held_out = report.validation_samples,
            loss = report.final_loss,
            "Rainfall model retrained"
        );
        self.rainfall.replace(trained).await;
        Ok(report)
    }

    /// Retrain the yield estimator and swap it in.
    #[allow(dead_code)] // offline training entry point; no HTTP route trains models
    pub async fn retrain_crop_yield(
        &self,
        images: Vec<Array3<f64>>,
        climate_table: Array2<f64>,
        yields: Vec<f64>,
        config: TrainingConfig,
    ) -> Result<YieldTrainingReport, AppError> {
        let current = self.crop_yield.snapshot().await;
        let store = self.store.clone();
        let (trained, report) = tokio::task::spawn_blocking(move || {
            let mut next = (*current).clone();
            next.train(&images, &climate_table, &yields, &config, &store)
                .map(|report| (next, report))
        })
        .await
        .map_err(|e| {
            AppError::InternalError(format!("Crop yield training worker failed: {}", e))
        })??;

        tracing::info!(
            cnn_samples = report.cnn.train_samples,
            cnn_held_out = report.cnn.validation_samples,
            cnn_loss = report.cnn.final_loss,
            trees = report.forest_trees,
            "Crop yield model retrained"
        );
        self.crop_yield.replace(trained).await;
        Ok(report)
    }
}

/// Train the rainfall forecaster from provider history when no fitted model exists.
///
/// Should be spawned via `tokio::spawn(bootstrap_rainfall(...))`.
pub async fn bootstrap_rainfall(
    registry: Arc<ModelRegistry>,
    history: Arc<dyn RainfallHistory>,
    location: Location,
    days: u32,
    config: TrainingConfig,
) {
    if registry.rainfall.snapshot().await.is_ready() {
        tracing::info!("Rainfall model already trained, skipping bootstrap");
        return;
    }

    let end = Utc::now().date_naive() - Duration::days(1);
    let start = end - Duration::days(i64::from(days.max(1)) - 1);
    tracing::info!(
        "Bootstrapping rainfall model from {} to {} at ({}, {})",
        start,
        end,
        location.latitude,
        location.longitude
    );

    let series = match history.daily_precipitation(location, start, end).await {
        Ok(series) => series.observed(),
        Err(e) => {
            tracing::error!("Rainfall bootstrap could not fetch history: {}", e);
            return;
        }
    };

    match registry.retrain_rainfall(series, config).await {
        Ok(report) => tracing::info!(
            "Rainfall model bootstrapped: {} epochs, train loss {:.5}, validation loss {:?}",
            report.epochs,
            report.final_loss,
            report.final_validation_loss
        ),
        Err(e) => tracing::error!("Rainfall bootstrap training failed: {}", e),
    }
}
