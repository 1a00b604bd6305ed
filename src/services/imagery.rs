//! Imagery gateway client.
//!
//! `GET {base}/scenes?lat=..&lon=..&date=YYYY-MM-DD` returns the scene closest
//! to the requested day as red / nir / blue reflectance bands. A 404 means
//! the gateway has no scene for that location and date.

use std::time::Duration;

use chrono::NaiveDate;
use futures::future::BoxFuture;
use ndarray::Array3;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;

use crate::domain::Location;
use crate::errors::AppError;
use crate::helpers::format_date;

/// Geographic bounding box of a scene, decimal degrees.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Bounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

/// Reflectance bands, row-major `height × width`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SceneBands {
    pub red: Vec<f64>,
    pub nir: Vec<f64>,
    pub blue: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Scene {
    pub scene_id: String,
    pub acquired: NaiveDate,
    pub width: usize,
    pub height: usize,
    pub bounds: Bounds,
    pub bands: SceneBands,
}

/// Nearest source index along an axis of `extent` pixels for each of `size` samples.
fn sample_indices(extent: usize, size: usize) -> Option<Vec<usize>> {
    let span = size.checked_mul(2)?;
    (0..size)
        .map(|i| {
            let scaled = (2 * i + 1).checked_mul(extent)?;
            Some((scaled / span).min(extent - 1))
        })
        .collect()
}

impl Scene {
    fn overflow(&self) -> AppError {
        AppError::ExternalServiceError(format!(
            "Scene {} has unusable dimensions {}x{}",
            self.scene_id, self.width, self.height
        ))
    }

    fn check_dimensions(&self) -> Result<(), AppError> {
        let expected = self
            .width
            .checked_mul(self.height)
            .ok_or_else(|| self.overflow())?;
        if expected == 0 {
            return Err(AppError::InternalError(format!(
                "Scene {} is empty ({}x{})",
                self.scene_id, self.width, self.height
            )));
        }
        for (name, band) in [
            ("red", &self.bands.red),
            ("nir", &self.bands.nir),
            ("blue", &self.bands.blue),
        ] {
            if band.len() != expected {
                return Err(AppError::InternalError(format!(
                    "Scene {} band '{}' has {} pixels, expected {}",
                    self.scene_id,
                    name,
                    band.len(),
                    expected
                )));
            }
        }
        Ok(())
    }

    /// Resample to a `(3, size, size)` tensor (red, nir, blue) by nearest neighbour.
    pub fn to_tensor(&self, size: usize) -> Result<Array3<f64>, AppError> {
        self.check_dimensions()?;
        let rows = sample_indices(self.height, size).ok_or_else(|| self.overflow())?;
        let cols = sample_indices(self.width, size).ok_or_else(|| self.overflow())?;
        let bands = [&self.bands.red, &self.bands.nir, &self.bands.blue];

        Ok(Array3::from_shape_fn((bands.len(), size, size), |(c, y, x)| {
            bands[c][rows[y] * self.width + cols[x]]
        }))
    }
}

/// Source of multispectral scenes.
pub trait ImagerySource: Send + Sync {
    fn scene(&self, location: Location, date: NaiveDate) -> BoxFuture<'_, Result<Scene, AppError>>;
}

/// Client for the imagery gateway.
#[derive(Debug, Clone)]
pub struct ImageryClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ImageryClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub async fn fetch_scene(&self, location: Location, date: NaiveDate) -> Result<Scene, AppError> {
        let url = format!("{}/scenes", self.base_url);

        let mut headers = HeaderMap::new();
        if let Some(key) = &self.api_key {
            headers.insert(
                "x-api-key",
                HeaderValue::from_str(key)
                    .map_err(|e| AppError::InternalError(format!("Invalid imagery API key: {}", e)))?,
            );
        }

        let response = self
            .client
            .get(&url)
            .headers(headers)
            .query(&[
                ("lat", format!("{:.4}", location.latitude)),
                ("lon", format!("{:.4}", location.longitude)),
                ("date", format_date(date)),
            ])
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Imagery request failed: {}", e);
                AppError::ExternalServiceError(format!("Imagery request failed: {}", e))
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::DataUnavailable(format!(
                "No satellite scene for ({}, {}) on {}",
                location.latitude,
                location.longitude,
                format_date(date)
            )));
        }
        if !response.status().is_success() {
            tracing::warn!("Imagery gateway returned HTTP {}", response.status());
            return Err(AppError::ExternalServiceError(format!(
                "Imagery gateway returned HTTP {}",
                response.status()
            )));
        }

        let scene: Scene = response.json().await.map_err(|e| {
            AppError::ExternalServiceError(format!("Imagery JSON parse error: {}", e))
        })?;
        tracing::debug!(
            scene_id = %scene.scene_id,
            acquired = %scene.acquired,
            width = scene.width,
            height = scene.height,
            "Fetched scene"
        );
        Ok(scene)
    }
}

impl ImagerySource for ImageryClient {
    fn scene(&self, location: Location, date: NaiveDate) -> BoxFuture<'_, Result<Scene, AppError>> {
        Box::pin(self.fetch_scene(location, date))
    }
}
