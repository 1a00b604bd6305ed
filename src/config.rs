use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_OPEN_METEO_ARCHIVE_URL: &str = "https://archive-api.open-meteo.com/v1/archive";

/// Application configuration, parsed from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Directory holding the JSON model artifacts.
    pub model_dir: PathBuf,
    pub open_meteo_archive_url: String,
    pub imagery_api_url: String,
    pub imagery_api_key: Option<String>,
    /// Deadline for every call to the rainfall provider and imagery gateway.
    pub upstream_timeout: Duration,
    /// `(latitude, longitude)` to bootstrap the rainfall model from, if set.
    pub rainfall_bootstrap_location: Option<(f64, f64)>,
    pub rainfall_bootstrap_days: u32,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .expect("PORT must be a valid u16"),
            model_dir: std::env::var("MODEL_DIR")
                .unwrap_or_else(|_| "./models".to_string())
                .into(),
            open_meteo_archive_url: std::env::var("OPEN_METEO_ARCHIVE_URL")
                .unwrap_or_else(|_| DEFAULT_OPEN_METEO_ARCHIVE_URL.to_string()),
            imagery_api_url: std::env::var("IMAGERY_API_URL")
                .unwrap_or_else(|_| "http://localhost:8090".to_string()),
            imagery_api_key: std::env::var("IMAGERY_API_KEY")
                .ok()
                .filter(|key| !key.is_empty()),
            upstream_timeout: Duration::from_secs(
                std::env::var("UPSTREAM_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .expect("UPSTREAM_TIMEOUT_SECS must be a whole number of seconds"),
            ),
            rainfall_bootstrap_location: std::env::var("RAINFALL_BOOTSTRAP_LOCATION")
                .ok()
                .map(|raw| {
                    parse_lat_lon(&raw)
                        .expect("RAINFALL_BOOTSTRAP_LOCATION must look like '<lat>,<lon>'")
                }),
            rainfall_bootstrap_days: std::env::var("RAINFALL_BOOTSTRAP_DAYS")
                .unwrap_or_else(|_| "1095".to_string())
                .parse()
                .expect("RAINFALL_BOOTSTRAP_DAYS must be a positive integer"),
        }
    }
}

/// Parse `"<lat>,<lon>"` into finite coordinates.
fn parse_lat_lon(raw: &str) -> Option<(f64, f64)> {
    let (lat, lon) = raw.split_once(',')?;
    let lat: f64 = lat.trim().parse().ok()?;
    let lon: f64 = lon.trim().parse().ok()?;
    (lat.is_finite() && lon.is_finite()).then_some((lat, lon))
}
