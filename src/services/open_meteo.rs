//! Open-Meteo historical weather (archive) client.
//!
//! Fetches daily precipitation sums for a location and date range.
//! See: https://open-meteo.com/en/docs/historical-weather-api

use std::time::Duration;

use chrono::NaiveDate;
use futures::future::BoxFuture;
use serde::Deserialize;

use crate::domain::Location;
use crate::errors::AppError;
use crate::helpers::{format_date, DATE_FORMAT};

/// Daily observations as returned by a provider.
///
/// `values[i]` belongs to `dates[i]`; `None` means the provider has no
/// observation for that day (yet).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DailySeries {
    pub dates: Vec<NaiveDate>,
    pub values: Vec<Option<f64>>,
}

impl DailySeries {
    /// Observed values in date order, skipping missing days.
    pub fn observed(&self) -> Vec<f64> {
        self.values.iter().flatten().copied().collect()
    }
}

/// Source of daily precipitation history.
pub trait RainfallHistory: Send + Sync {
    /// Daily precipitation (mm) for every day in `[start, end]`.
    fn daily_precipitation(
        &self,
        location: Location,
        start: NaiveDate,
        end: NaiveDate,
    ) -> BoxFuture<'_, Result<DailySeries, AppError>>;
}

/// Client for the Open-Meteo archive API.
#[derive(Debug, Clone)]
pub struct OpenMeteoClient {
    client: reqwest::Client,
    base_url: String,
}

// --- Open-Meteo JSON response types ---

#[derive(Debug, Deserialize)]
struct ArchiveResponse {
    daily: ArchiveDaily,
}

#[derive(Debug, Deserialize)]
struct ArchiveDaily {
    time: Vec<String>,
    precipitation_sum: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct ArchiveError {
    reason: String,
}

impl OpenMeteoClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn fetch_daily_precipitation(
        &self,
        location: Location,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<DailySeries, AppError> {
        let query = [
            ("latitude", format!("{:.4}", location.latitude)),
            ("longitude", format!("{:.4}", location.longitude)),
            ("start_date", format_date(start)),
            ("end_date", format_date(end)),
            ("daily", "precipitation_sum".to_string()),
            ("timezone", "UTC".to_string()),
        ];

        let response = self
            .client
            .get(&self.base_url)
            .query(&query)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Open-Meteo request failed: {}", e);
                AppError::ExternalServiceError(format!("Open-Meteo request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let reason = response
                .json::<ArchiveError>()
                .await
                .map(|e| e.reason)
                .unwrap_or_default();
            tracing::warn!("Open-Meteo returned HTTP {}: {}", status, reason);
            return Err(AppError::ExternalServiceError(format!(
                "Open-Meteo returned HTTP {} {}",
                status, reason
            )));
        }

        let body: ArchiveResponse = response.json().await.map_err(|e| {
            AppError::ExternalServiceError(format!("Open-Meteo JSON parse error: {}", e))
        })?;
        parse_daily(body.daily)
    }
}

fn parse_daily(daily: ArchiveDaily) -> Result<DailySeries, AppError> {
    if daily.time.len() != daily.precipitation_sum.len() {
        return Err(AppError::ExternalServiceError(format!(
            "Open-Meteo returned {} dates but {} precipitation values",
            daily.time.len(),
            daily.precipitation_sum.len()
        )));
    }
    let dates = daily
        .time
        .iter()
        .map(|raw| {
            NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|_| {
                AppError::ExternalServiceError(format!("Open-Meteo returned invalid date '{}'", raw))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DailySeries {
        dates,
        values: daily.precipitation_sum,
    })
}

impl RainfallHistory for OpenMeteoClient {
    fn daily_precipitation(
        &self,
        location: Location,
        start: NaiveDate,
        end: NaiveDate,
    ) -> BoxFuture<'_, Result<DailySeries, AppError>> {
        Box::pin(self.fetch_daily_precipitation(location, start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn nyc() -> Location {
        Location {
            latitude: 40.7128,
            longitude: -74.006,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 1, d).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_parses_daily_series_with_gaps() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("latitude", "40.7128"))
            .and(query_param("longitude", "-74.0060"))
            .and(query_param("start_date", "2023-01-01"))
            .and(query_param("end_date", "2023-01-03"))
            .and(query_param("daily", "precipitation_sum"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "latitude": 40.71,
                "longitude": -74.0,
                "daily": {
                    "time": ["2023-01-01", "2023-01-02", "2023-01-03"],
                    "precipitation_sum": [1.2, null, 0.0]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenMeteoClient::new(&server.uri(), Duration::from_secs(5));
        let series = client
            .fetch_daily_precipitation(nyc(), day(1), day(3))
            .await
            .unwrap();

        assert_eq!(series.dates, vec![day(1), day(2), day(3)]);
        assert_eq!(series.values, vec![Some(1.2), None, Some(0.0)]);
        assert_eq!(series.observed(), vec![1.2, 0.0]);
    }

    #[tokio::test]
    async fn test_error_status_includes_reason() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": true,
                "reason": "Parameter 'start_date' is out of allowed range"
            })))
            .mount(&server)
            .await;

        let client = OpenMeteoClient::new(&server.uri(), Duration::from_secs(5));
        match client.fetch_daily_precipitation(nyc(), day(1), day(2)).await {
            Err(AppError::ExternalServiceError(msg)) => {
                assert!(msg.contains("400"));
                assert!(msg.contains("out of allowed range"));
            }
            other => panic!("expected ExternalServiceError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mismatched_arrays_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "daily": { "time": ["2023-01-01", "2023-01-02"], "precipitation_sum": [1.0] }
            })))
            .mount(&server)
            .await;

        let client = OpenMeteoClient::new(&server.uri(), Duration::from_secs(5));
        assert!(matches!(
            client.fetch_daily_precipitation(nyc(), day(1), day(2)).await,
            Err(AppError::ExternalServiceError(_))
        ));
    }

    #[tokio::test]
    async fn test_slow_upstream_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(500))
                    .set_body_json(serde_json::json!({
                        "daily": { "time": [], "precipitation_sum": [] }
                    })),
            )
            .mount(&server)
            .await;

        let client = OpenMeteoClient::new(&server.uri(), Duration::from_millis(50));
        assert!(matches!(
            client.fetch_daily_precipitation(nyc(), day(1), day(1)).await,
            Err(AppError::ExternalServiceError(_))
        ));
    }

    #[tokio::test]
    async fn test_trait_object_delegates_to_client() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "daily": { "time": ["2023-01-05"], "precipitation_sum": [3.5] }
            })))
            .mount(&server)
            .await;

        let provider: Box<dyn RainfallHistory> =
            Box::new(OpenMeteoClient::new(&server.uri(), Duration::from_secs(5)));
        let series = provider
            .daily_precipitation(nyc(), day(5), day(5))
            .await
            .unwrap();
        assert_eq!(series.observed(), vec![3.5]);
    }
}
