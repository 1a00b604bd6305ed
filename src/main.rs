// Rainfall API v0.1
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod config;
mod domain;
mod errors;
mod helpers;
mod ml;
mod routes;
mod services;

use config::AppConfig;
use domain::Location;
use ml::artifacts::ArtifactStore;
use ml::training::TrainingConfig;
use routes::AppState;
use services::imagery::ImageryClient;
use services::open_meteo::OpenMeteoClient;
use services::registry::ModelRegistry;

/// OpenAPI document for the Rainfall API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Rainfall Prediction and Crop Yield Analysis API",
        version = "0.1.0",
        description = "Forecasts next-day rainfall from a location's recent daily \
            precipitation, estimates crop yield by fusing an imagery model with a \
            climate-feature model, and summarises vegetation health (NDVI/EVI) \
            from multispectral scenes.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Health", description = "Service banner and model readiness"),
        (name = "Rainfall", description = "Rainfall prediction and observed history"),
        (name = "Crop yield", description = "Fused crop yield estimation"),
        (name = "Satellite", description = "Vegetation index analysis of imagery scenes"),
    ),
    paths(
        routes::health::index,
        routes::health::health_check,
        routes::rainfall::predict_rainfall,
        routes::rainfall::get_historical_rainfall,
        routes::crop_yield::predict_crop_yield,
        routes::satellite::analyze_satellite_imagery,
        routes::satellite::get_historical_analysis,
    ),
    components(
        schemas(
            routes::health::IndexResponse,
            routes::health::HealthResponse,
            routes::rainfall::RainfallPredictRequest,
            routes::rainfall::RainfallPredictResponse,
            routes::rainfall::HistoricalRainfallResponse,
            routes::crop_yield::CropYieldRequest,
            routes::crop_yield::CropYieldResponse,
            routes::satellite::SatelliteAnalyzeRequest,
            routes::satellite::SatelliteAnalyzeResponse,
            routes::satellite::SatelliteHistoryResponse,
            domain::Location,
            domain::DateRangeBody,
            services::rainfall::RainfallPrediction,
            services::rainfall::HistoricalRainfall,
            services::crop_yield::YieldPrediction,
            services::satellite::VegetationAnalysis,
            services::vegetation::IndexSummary,
            services::vegetation::HealthStatus,
            errors::ErrorResponse,
        )
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rainfall_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();

    // Load fitted models; a missing artifact set starts that model untrained
    let registry = Arc::new(
        ModelRegistry::load_or_create(ArtifactStore::new(config.model_dir.clone()))
            .expect("Failed to load model artifacts"),
    );
    tracing::info!(
        "Models loaded from {} (rainfall ready: {}, crop yield ready: {})",
        config.model_dir.display(),
        registry.rainfall.snapshot().await.is_ready(),
        registry.crop_yield.snapshot().await.is_ready()
    );

    let history = Arc::new(OpenMeteoClient::new(
        &config.open_meteo_archive_url,
        config.upstream_timeout,
    ));
    let imagery = Arc::new(ImageryClient::new(
        &config.imagery_api_url,
        config.imagery_api_key.clone(),
        config.upstream_timeout,
    ));

    // Train the rainfall model in the background if none was persisted
    if let Some((latitude, longitude)) = config.rainfall_bootstrap_location {
        tokio::spawn(services::registry::bootstrap_rainfall(
            registry.clone(),
            history.clone(),
            Location {
                latitude,
                longitude,
            },
            config.rainfall_bootstrap_days,
            TrainingConfig::default(),
        ));
    }

    let state = AppState::new(registry, history, imagery);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = routes::build_router(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("API server listening on {}", addr);
    tracing::info!(
        "Swagger UI available at http://localhost:{}/swagger-ui/",
        config.port
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind TCP listener");
    axum::serve(listener, app)
        .await
        .expect("Server terminated unexpectedly");
}
