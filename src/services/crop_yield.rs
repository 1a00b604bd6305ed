//! Crop yield estimation from imagery and climate.
//!
//! Two branches are fitted independently against the same yields:
//! a convolutional regressor over the resampled scene and a random forest
//! over standardised climate features. The final estimate is the plain
//! average of the two branch scores.

use std::sync::Arc;

use ndarray::{Array1, Array2, Array3, Axis};
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::{DateRange, Location};
use crate::errors::AppError;
use crate::ml::artifacts::ArtifactStore;
use crate::ml::conv::{ConvConfig, ConvRegressor};
use crate::ml::forest::{ForestConfig, RandomForestRegressor};
use crate::ml::scaler::StandardScaler;
use crate::ml::training::{TrainingConfig, TrainingReport};
use crate::ml::ModelError;
use crate::services::imagery::ImagerySource;
use crate::services::open_meteo::RainfallHistory;
use crate::services::registry::ModelHandle;

pub const CROP_YIELD_CNN_ARTIFACT: &str = "crop_yield_cnn.json";
pub const CROP_YIELD_FOREST_ARTIFACT: &str = "crop_yield_forest.json";
pub const CROP_YIELD_SCALER_ARTIFACT: &str = "crop_yield_scaler.json";

/// Fixed confidence reported with every yield prediction.
pub const YIELD_CONFIDENCE: f64 = 0.90;

pub const CLIMATE_FEATURE_COUNT: usize = 10;

/// A day with at least this much precipitation (mm) counts as rainy.
const RAINY_DAY_MM: f64 = 1.0;
/// A day with at least this much precipitation (mm) counts as heavy rain.
const HEAVY_RAIN_MM: f64 = 20.0;

const CROP_YIELD_MODEL_SEED: u64 = 42;

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct YieldPrediction {
    pub predicted_yield: f64,
    pub confidence: f64,
    /// Imagery branch score
    pub satellite_contribution: f64,
    /// Climate branch score
    pub climate_contribution: f64,
}

/// Combine the two branch scores with equal weight.
pub fn fuse(satellite: f64, climate: f64) -> YieldPrediction {
    YieldPrediction {
        predicted_yield: (satellite + climate) / 2.0,
        confidence: YIELD_CONFIDENCE,
        satellite_contribution: satellite,
        climate_contribution: climate,
    }
}

/// Tabular climate features of a daily precipitation series, in order:
/// total, mean, std, min, max, median, rainy-day fraction, longest dry spell,
/// longest wet spell, heavy-rain days.
pub fn climate_features(daily_mm: &[f64]) -> Result<[f64; CLIMATE_FEATURE_COUNT], ModelError> {
    if daily_mm.is_empty() {
        return Err(ModelError::InsufficientData { needed: 1, got: 0 });
    }
    let n = daily_mm.len() as f64;
    let total: f64 = daily_mm.iter().sum();
    let mean = total / n;
    let std = (daily_mm.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();

    let mut sorted = daily_mm.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    };

    let rainy = |v: &f64| *v >= RAINY_DAY_MM;
    let (mut dry_run, mut wet_run, mut longest_dry, mut longest_wet) = (0usize, 0usize, 0usize, 0usize);
    for v in daily_mm {
        if rainy(v) {
            wet_run += 1;
            dry_run = 0;
        } else {
            dry_run += 1;
            wet_run = 0;
        }
        longest_dry = longest_dry.max(dry_run);
        longest_wet = longest_wet.max(wet_run);
    }

    Ok([
        total,
        mean,
        std,
        sorted[0],
        sorted[sorted.len() - 1],
        median,
        daily_mm.iter().filter(|v| rainy(v)).count() as f64 / n,
        longest_dry as f64,
        longest_wet as f64,
        daily_mm.iter().filter(|v| **v >= HEAVY_RAIN_MM).count() as f64,
    ])
}

#[derive(Debug, Clone, Serialize)]
pub struct YieldTrainingReport {
    pub cnn: TrainingReport,
    pub forest_trees: usize,
}

#[derive(Debug, Clone)]
pub struct YieldFusionEstimator {
    cnn: ConvRegressor,
    forest: RandomForestRegressor,
    scaler: StandardScaler,
}

impl YieldFusionEstimator {
    pub fn new(
        conv_config: ConvConfig,
        forest_config: ForestConfig,
        seed: u64,
    ) -> Result<Self, ModelError> {
        Ok(Self {
            cnn: ConvRegressor::new(conv_config, seed)?,
            forest: RandomForestRegressor::new(forest_config)?,
            scaler: StandardScaler::new(),
        })
    }

    pub fn untrained() -> Result<Self, ModelError> {
        Self::new(
            ConvConfig::default(),
            ForestConfig::default(),
            CROP_YIELD_MODEL_SEED,
        )
    }

    pub fn artifacts_present(store: &ArtifactStore) -> bool {
        store.exists_all(&[
            CROP_YIELD_CNN_ARTIFACT,
            CROP_YIELD_FOREST_ARTIFACT,
            CROP_YIELD_SCALER_ARTIFACT,
        ])
    }

    pub fn load(store: &ArtifactStore) -> Result<Self, ModelError> {
        store.ensure_same_generation(&[
            CROP_YIELD_CNN_ARTIFACT,
            CROP_YIELD_FOREST_ARTIFACT,
            CROP_YIELD_SCALER_ARTIFACT,
        ])?;
        Ok(Self {
            cnn: store.load(CROP_YIELD_CNN_ARTIFACT)?,
            forest: store.load(CROP_YIELD_FOREST_ARTIFACT)?,
            scaler: store.load(CROP_YIELD_SCALER_ARTIFACT)?,
        })
    }

    pub fn save(&self, store: &ArtifactStore) -> Result<(), ModelError> {
        store
            .batch()
            .add(CROP_YIELD_CNN_ARTIFACT, &self.cnn)?
            .add(CROP_YIELD_FOREST_ARTIFACT, &self.forest)?
            .add(CROP_YIELD_SCALER_ARTIFACT, &self.scaler)?
            .commit()
    }

    pub fn is_ready(&self) -> bool {
        self.forest.is_fitted() && self.scaler.is_fitted()
    }

    /// Side length the imagery branch expects.
    pub fn image_size(&self) -> usize {
        self.cnn.config().image_size
    }

    /// Fit both branches on the same yields, then persist all three artifacts.
    pub fn train(
        &mut self,
        images: &[Array3<f64>],
        climate_table: &Array2<f64>,
        yields: &[f64],
        config: &TrainingConfig,
        store: &ArtifactStore,
    ) -> Result<YieldTrainingReport, ModelError> {
        if images.len() != yields.len() || climate_table.nrows() != yields.len() {
            return Err(ModelError::ShapeMismatch(format!(
                "{} images and {} climate rows for {} yields",
                images.len(),
                climate_table.nrows(),
                yields.len()
            )));
        }
        if climate_table.ncols() != CLIMATE_FEATURE_COUNT {
            return Err(ModelError::ShapeMismatch(format!(
                "expected {} climate features, got {}",
                CLIMATE_FEATURE_COUNT,
                climate_table.ncols()
            )));
        }

        let cnn = self.cnn.fit(images, yields, config)?;
        let scaled = self.scaler.fit_transform(climate_table)?;
        self.forest.fit(&scaled, yields)?;
        self.save(store)?;

        Ok(YieldTrainingReport {
            cnn,
            forest_trees: self.forest.n_trees(),
        })
    }

    pub fn predict(
        &self,
        image: &Array3<f64>,
        features: &[f64; CLIMATE_FEATURE_COUNT],
    ) -> Result<YieldPrediction, ModelError> {
        if !self.is_ready() {
            return Err(ModelError::Uninitialized("crop yield estimator"));
        }
        let satellite = self.cnn.predict(image)?;
        let row = Array1::from(features.to_vec()).insert_axis(Axis(0));
        let climate = self.forest.predict(&self.scaler.transform(&row)?)?[0];
        Ok(fuse(satellite, climate))
    }
}

/// Request-facing crop yield operations.
#[derive(Clone)]
pub struct CropYieldService {
    estimator: ModelHandle<YieldFusionEstimator>,
    imagery: Arc<dyn ImagerySource>,
    history: Arc<dyn RainfallHistory>,
}

impl CropYieldService {
    pub fn new(
        estimator: ModelHandle<YieldFusionEstimator>,
        imagery: Arc<dyn ImagerySource>,
        history: Arc<dyn RainfallHistory>,
    ) -> Self {
        Self {
            estimator,
            imagery,
            history,
        }
    }

    /// Estimate yield from the scene at the end of `range` and the range's rainfall.
    ///
    /// `crop_type` is accepted but does not influence the estimate yet.
    pub async fn predict(
        &self,
        location: Location,
        crop_type: &str,
        range: DateRange,
    ) -> Result<YieldPrediction, AppError> {
        let estimator = self.estimator.snapshot().await;
        if !estimator.is_ready() {
            return Err(AppError::Uninitialized(
                "Crop yield model has not been trained".to_string(),
            ));
        }

        let (scene, series) = futures::try_join!(
            self.imagery.scene(location, range.end),
            self.history
                .daily_precipitation(location, range.start, range.end),
        )?;
        tracing::debug!(
            crop_type,
            scene_id = %scene.scene_id,
            days = series.dates.len(),
            "Crop yield inputs fetched"
        );

        let tensor = scene.to_tensor(estimator.image_size())?;
        let features = climate_features(&series.observed())?;
        let prediction = tokio::task::spawn_blocking(move || estimator.predict(&tensor, &features))
            .await
            .map_err(|e| AppError::InternalError(format!("Crop yield inference failed: {}", e)))??;
        Ok(prediction)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::services::imagery::tests::uniform_scene;
    use crate::services::imagery::Scene;
    use crate::services::rainfall::tests::{scratch_store, FakeHistory};
    use chrono::NaiveDate;
    use futures::future::BoxFuture;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeImagery {
        scene: Option<Scene>,
        calls: AtomicUsize,
    }

    impl ImagerySource for FakeImagery {
        fn scene(
            &self,
            location: Location,
            date: NaiveDate,
        ) -> BoxFuture<'_, Result<Scene, AppError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = self.scene.clone().ok_or_else(|| {
                AppError::DataUnavailable(format!(
                    "No satellite scene for ({}, {}) on {}",
                    location.latitude, location.longitude, date
                ))
            });
            Box::pin(async move { result })
        }
    }

    fn tiny_estimator() -> YieldFusionEstimator {
        YieldFusionEstimator::new(
            ConvConfig {
                image_size: 18,
                channels: 3,
                filters: [2, 2, 2],
                dense_units: 4,
                dropout: 0.5,
            },
            ForestConfig {
                n_trees: 10,
                ..ForestConfig::default()
            },
            3,
        )
        .unwrap()
    }

    /// Fit the tiny estimator on a handful of synthetic fields.
    pub(crate) fn trained_estimator(store: &ArtifactStore) -> YieldFusionEstimator {
        let mut estimator = tiny_estimator();
        let images: Vec<Array3<f64>> = (0..10)
            .map(|i| uniform_scene(6, 6, 0.1, 0.3 + i as f64 * 0.05, 0.05).to_tensor(18).unwrap())
            .collect();
        let table = Array2::from_shape_fn((10, CLIMATE_FEATURE_COUNT), |(r, c)| (r * (c + 1)) as f64);
        let yields: Vec<f64> = (0..10).map(|i| 2.0 + i as f64 * 0.3).collect();
        let config = TrainingConfig {
            epochs: 3,
            batch_size: 4,
            ..TrainingConfig::default()
        };
        let report = estimator
            .train(&images, &table, &yields, &config, store)
            .unwrap();
        assert_eq!(report.forest_trees, 10);
        estimator
    }

    fn nyc() -> Location {
        Location {
            latitude: 40.7128,
            longitude: -74.006,
        }
    }

    #[test]
    fn test_climate_features() {
        let f = climate_features(&[0.0, 2.0, 25.0, 0.5, 0.0, 0.0, 4.0, 1.0]).unwrap();
        assert_eq!(f[0], 32.5);
        assert_eq!(f[1], 32.5 / 8.0);
        assert_eq!(f[3], 0.0);
        assert_eq!(f[4], 25.0);
        // sorted: 0 0 0 0.5 1 2 4 25
        assert_eq!(f[5], 0.75);
        assert_eq!(f[6], 4.0 / 8.0);
        assert_eq!(f[7], 3.0);
        assert_eq!(f[8], 2.0);
        assert_eq!(f[9], 1.0);

        let expected_std = {
            let m = 32.5 / 8.0;
            let v: f64 = [0.0, 2.0, 25.0, 0.5, 0.0, 0.0, 4.0, 1.0]
                .iter()
                .map(|x: &f64| (x - m).powi(2))
                .sum::<f64>()
                / 8.0;
            v.sqrt()
        };
        assert!((f[2] - expected_std).abs() < 1e-12);
    }

    #[test]
    fn test_climate_features_empty_is_insufficient() {
        assert!(matches!(
            climate_features(&[]),
            Err(ModelError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_untrained_estimator_is_uninitialized() {
        let estimator = tiny_estimator();
        assert!(!estimator.is_ready());
        let image = Array3::zeros((3, 18, 18));
        assert!(matches!(
            estimator.predict(&image, &[0.0; CLIMATE_FEATURE_COUNT]),
            Err(ModelError::Uninitialized(_))
        ));
    }

    #[test]
    fn test_train_rejects_mismatched_inputs() {
        let store = scratch_store();
        let mut estimator = tiny_estimator();
        let images = vec![Array3::zeros((3, 18, 18)); 2];
        let table = Array2::zeros((3, CLIMATE_FEATURE_COUNT));
        let result = estimator.train(&images, &table, &[1.0, 2.0], &TrainingConfig::default(), &store);
        assert!(matches!(result, Err(ModelError::ShapeMismatch(_))));
        assert!(!YieldFusionEstimator::artifacts_present(&store));
    }

    #[test]
    fn test_trained_estimator_fuses_branches_and_round_trips() {
        let store = scratch_store();
        let estimator = trained_estimator(&store);
        assert!(estimator.is_ready());

        let image = uniform_scene(6, 6, 0.1, 0.4, 0.05).to_tensor(18).unwrap();
        let features = [3.0; CLIMATE_FEATURE_COUNT];
        let prediction = estimator.predict(&image, &features).unwrap();
        assert_eq!(prediction.confidence, 0.90);
        assert_eq!(
            prediction.predicted_yield,
            (prediction.satellite_contribution + prediction.climate_contribution) / 2.0
        );

        let reloaded = YieldFusionEstimator::load(&store).unwrap();
        assert_eq!(reloaded.predict(&image, &features).unwrap(), prediction);
        std::fs::remove_dir_all(store.dir()).unwrap();
    }

    #[tokio::test]
    async fn test_service_predict_uses_scene_and_rainfall() {
        let store = scratch_store();
        let imagery = Arc::new(FakeImagery {
            scene: Some(uniform_scene(40, 30, 0.08, 0.5, 0.04)),
            calls: AtomicUsize::new(0),
        });
        let history = Arc::new(FakeHistory::new());
        let service = CropYieldService::new(
            ModelHandle::new(trained_estimator(&store)),
            imagery.clone(),
            history.clone(),
        );

        let range = DateRange::parse("2023-03-01", "2023-05-31").unwrap();
        let prediction = service.predict(nyc(), "wheat", range).await.unwrap();
        assert!(prediction.predicted_yield.is_finite());
        assert_eq!(imagery.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            history.calls.lock().unwrap().clone(),
            vec![(range.start, range.end)]
        );
        std::fs::remove_dir_all(store.dir()).unwrap();
    }

    #[tokio::test]
    async fn test_service_missing_scene_fails_whole_prediction() {
        let store = scratch_store();
        let service = CropYieldService::new(
            ModelHandle::new(trained_estimator(&store)),
            Arc::new(FakeImagery {
                scene: None,
                calls: AtomicUsize::new(0),
            }),
            Arc::new(FakeHistory::new()),
        );
        let range = DateRange::parse("2023-03-01", "2023-05-31").unwrap();
        assert!(matches!(
            service.predict(nyc(), "maize", range).await,
            Err(AppError::DataUnavailable(_))
        ));
        std::fs::remove_dir_all(store.dir()).unwrap();
    }

    #[tokio::test]
    async fn test_service_untrained_skips_upstreams() {
        let imagery = Arc::new(FakeImagery {
            scene: Some(uniform_scene(4, 4, 0.1, 0.2, 0.3)),
            calls: AtomicUsize::new(0),
        });
        let service = CropYieldService::new(
            ModelHandle::new(tiny_estimator()),
            imagery.clone(),
            Arc::new(FakeHistory::new()),
        );
        let range = DateRange::parse("2023-03-01", "2023-05-31").unwrap();
        assert!(matches!(
            service.predict(nyc(), "rice", range).await,
            Err(AppError::Uninitialized(_))
        ));
        assert_eq!(imagery.calls.load(Ordering::SeqCst), 0);
    }

    proptest! {
        #[test]
        fn prop_fusion_is_unweighted_average(a in -1e6f64..1e6, b in -1e6f64..1e6) {
            let p = fuse(a, b);
            prop_assert_eq!(p.predicted_yield, (a + b) / 2.0);
            prop_assert_eq!(p.satellite_contribution, a);
            prop_assert_eq!(p.climate_contribution, b);
            prop_assert_eq!(p.confidence, 0.90);
        }
    }
}
