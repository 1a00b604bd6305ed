//! Vegetation indices over multispectral reflectance bands.
//!
//! - NDVI = (NIR − Red) / (NIR + Red)
//! - EVI  = 2.5 × (NIR − Red) / (NIR + 6·Red − 7.5·Blue + 1)
//!
//! A pixel whose denominator is exactly zero gets an index of 0.0, so the
//! summaries never contain NaN.

use serde::Serialize;
use utoipa::ToSchema;

use crate::errors::AppError;

/// Mean NDVI above this is `healthy`.
pub const HEALTHY_NDVI_THRESHOLD: f64 = 0.5;

#[derive(Debug, thiserror::Error)]
pub enum VegetationError {
    #[error("Image has no pixels")]
    EmptyImage,
    #[error("Band '{band}' has {got} pixels, expected {expected}")]
    BandMismatch {
        band: &'static str,
        expected: usize,
        got: usize,
    },
}

impl From<VegetationError> for AppError {
    fn from(err: VegetationError) -> Self {
        AppError::InternalError(format!("Vegetation index error: {}", err))
    }
}

fn check_band(band: &'static str, values: &[f64], expected: usize) -> Result<(), VegetationError> {
    if values.len() != expected {
        return Err(VegetationError::BandMismatch {
            band,
            expected,
            got: values.len(),
        });
    }
    Ok(())
}

fn ratio_or_zero(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

pub fn ndvi(red: &[f64], nir: &[f64]) -> Result<Vec<f64>, VegetationError> {
    check_band("nir", nir, red.len())?;
    Ok(red
        .iter()
        .zip(nir)
        .map(|(&r, &n)| ratio_or_zero(n - r, n + r))
        .collect())
}

pub fn evi(red: &[f64], nir: &[f64], blue: &[f64]) -> Result<Vec<f64>, VegetationError> {
    check_band("nir", nir, red.len())?;
    check_band("blue", blue, red.len())?;
    Ok(red
        .iter()
        .zip(nir)
        .zip(blue)
        .map(|((&r, &n), &b)| 2.5 * ratio_or_zero(n - r, n + 6.0 * r - 7.5 * b + 1.0))
        .collect())
}

/// Mean, minimum and maximum of an index over all pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct IndexSummary {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl IndexSummary {
    pub fn from_values(values: &[f64]) -> Result<Self, VegetationError> {
        if values.is_empty() {
            return Err(VegetationError::EmptyImage);
        }
        Ok(Self {
            mean: values.iter().sum::<f64>() / values.len() as f64,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Stressed,
}

impl HealthStatus {
    pub fn from_mean_ndvi(mean_ndvi: f64) -> Self {
        if mean_ndvi > HEALTHY_NDVI_THRESHOLD {
            HealthStatus::Healthy
        } else {
            HealthStatus::Stressed
        }
    }
}

/// Both index summaries plus the derived health classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexReport {
    pub ndvi: IndexSummary,
    pub evi: IndexSummary,
    pub health_status: HealthStatus,
}

pub fn analyze_bands(red: &[f64], nir: &[f64], blue: &[f64]) -> Result<IndexReport, VegetationError> {
    if red.is_empty() {
        return Err(VegetationError::EmptyImage);
    }
    let ndvi = IndexSummary::from_values(&ndvi(red, nir)?)?;
    let evi = IndexSummary::from_values(&evi(red, nir, blue)?)?;
    Ok(IndexReport {
        health_status: HealthStatus::from_mean_ndvi(ndvi.mean),
        ndvi,
        evi,
    })
}
