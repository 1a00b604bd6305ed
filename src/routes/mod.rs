pub mod crop_yield;
pub mod health;
pub mod rainfall;
pub mod satellite;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use utoipa::IntoParams;

use crate::domain::{non_empty, DateRange, Location};
use crate::errors::AppError;
use crate::services::crop_yield::CropYieldService;
use crate::services::imagery::ImagerySource;
use crate::services::open_meteo::RainfallHistory;
use crate::services::rainfall::RainfallService;
use crate::services::registry::ModelRegistry;
use crate::services::satellite::SatelliteService;

/// Value of `status` in every successful response.
pub(crate) const SUCCESS: &str = "success";

/// Shared application state for all endpoints.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) registry: Arc<ModelRegistry>,
    pub(crate) rainfall: RainfallService,
    pub(crate) crop_yield: CropYieldService,
    pub(crate) satellite: SatelliteService,
}

impl AppState {
    pub(crate) fn new(
        registry: Arc<ModelRegistry>,
        history: Arc<dyn RainfallHistory>,
        imagery: Arc<dyn ImagerySource>,
    ) -> Self {
        Self {
            rainfall: RainfallService::new(registry.rainfall.clone(), history.clone()),
            crop_yield: CropYieldService::new(registry.crop_yield.clone(), imagery.clone(), history),
            satellite: SatelliteService::new(imagery),
            registry,
        }
    }
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health::index))
        .route("/api/health", get(health::health_check))
        .route("/api/rainfall/predict", post(rainfall::predict_rainfall))
        .route("/api/rainfall/historical", get(rainfall::get_historical_rainfall))
        .route("/api/crop-yield/predict", post(crop_yield::predict_crop_yield))
        .route("/api/satellite/analyze", post(satellite::analyze_satellite_imagery))
        .route("/api/satellite/historical", get(satellite::get_historical_analysis))
        .with_state(state)
}

pub(crate) fn missing_parameters() -> AppError {
    AppError::BadRequest("Missing required parameters".to_string())
}

// ---------------------------------------------------------------------------
// Shared query parameters
// ---------------------------------------------------------------------------

/// Query parameters of the historical GET endpoints.
#[derive(Debug, Deserialize, IntoParams)]
pub struct HistoricalQuery {
    /// JSON-encoded location, e.g. `{"latitude":40.7128,"longitude":-74.0060}`
    pub location: Option<String>,
    /// First day, `YYYY-MM-DD`
    pub start_date: Option<String>,
    /// Last day (inclusive), `YYYY-MM-DD`
    pub end_date: Option<String>,
}

impl HistoricalQuery {
    pub(crate) fn parse(&self) -> Result<(Location, DateRange), AppError> {
        match (
            non_empty(&self.location),
            non_empty(&self.start_date),
            non_empty(&self.end_date),
        ) {
            (Some(location), Some(start), Some(end)) => Ok((
                Location::from_query_json(location)?,
                DateRange::parse(start, end)?,
            )),
            _ => Err(missing_parameters()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ml::artifacts::ArtifactStore;
    use crate::services::crop_yield::tests::trained_estimator;
    use crate::services::imagery::tests::uniform_scene;
    use crate::services::imagery::Scene;
    use crate::services::rainfall::tests::{scratch_store, trained_forecaster, FakeHistory};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::NaiveDate;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    pub(crate) struct FakeImagery {
        pub(crate) scene: Scene,
        pub(crate) calls: AtomicUsize,
    }

    impl ImagerySource for FakeImagery {
        fn scene(&self, _location: Location, _date: NaiveDate) -> BoxFuture<'_, Result<Scene, AppError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let scene = self.scene.clone();
            Box::pin(async move { Ok(scene) })
        }
    }

    pub(crate) struct TestApp {
        pub(crate) router: Router,
        pub(crate) imagery: Arc<FakeImagery>,
        pub(crate) history: Arc<FakeHistory>,
        pub(crate) store: ArtifactStore,
    }

    impl Drop for TestApp {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(self.store.dir());
        }
    }

    /// Router over in-memory providers; the rainfall model is trained when `ready`.
    pub(crate) fn test_app(ready: bool) -> TestApp {
        test_app_with(ready, false)
    }

    pub(crate) fn test_app_with(rainfall_ready: bool, crop_yield_ready: bool) -> TestApp {
        let store = scratch_store();
        if rainfall_ready {
            trained_forecaster(&store);
        }
        if crop_yield_ready {
            trained_estimator(&store);
        }
        let registry = Arc::new(ModelRegistry::load_or_create(store.clone()).unwrap());
        let imagery = Arc::new(FakeImagery {
            scene: uniform_scene(8, 8, 0.05, 0.6, 0.03),
            calls: AtomicUsize::new(0),
        });
        let history = Arc::new(FakeHistory::new());
        let state = AppState::new(registry, history.clone(), imagery.clone());
        TestApp {
            router: build_router(state),
            imagery,
            history,
            store,
        }
    }

    pub(crate) async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    pub(crate) fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub(crate) fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    /// `path?query` with every parameter percent-encoded.
    pub(crate) fn with_query(path: &str, params: &[(&str, &str)]) -> String {
        let url = reqwest::Url::parse_with_params(&format!("http://localhost{}", path), params).unwrap();
        format!("{}?{}", url.path(), url.query().unwrap_or_default())
    }

    #[test]
    fn test_historical_query_requires_all_parameters() {
        let query = HistoricalQuery {
            location: Some(r#"{"latitude":1,"longitude":2}"#.to_string()),
            start_date: Some("2023-01-01".to_string()),
            end_date: None,
        };
        match query.parse() {
            Err(AppError::BadRequest(msg)) => assert_eq!(msg, "Missing required parameters"),
            other => panic!("expected BadRequest, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = test_app(false);
        let response = app.router.clone().oneshot(get("/api/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
