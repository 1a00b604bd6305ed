//! Request-level domain types shared by routes and services.

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use utoipa::ToSchema;

use crate::errors::AppError;
use crate::helpers::parse_iso_date;

/// A point on the earth's surface in decimal degrees.
///
/// Coordinates are accepted as JSON numbers or numeric strings (form inputs
/// send strings). Only finiteness is checked, not the coordinate range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Location {
    #[serde(deserialize_with = "finite_coordinate")]
    #[schema(example = 40.7128)]
    pub latitude: f64,
    #[serde(deserialize_with = "finite_coordinate")]
    #[schema(example = -74.0060)]
    pub longitude: f64,
}

impl Location {
    /// Parse the JSON-encoded `location` query parameter of the GET routes.
    pub fn from_query_json(raw: &str) -> Result<Self, AppError> {
        serde_json::from_str(raw)
            .map_err(|e| AppError::BadRequest(format!("Invalid location: {}", e)))
    }
}

fn finite_coordinate<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(f64),
        String(String),
    }

    let value = match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(v) => v,
        NumberOrString::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom(format!("'{}' is not a number", s)))?,
    };
    if !value.is_finite() {
        return Err(serde::de::Error::custom("coordinate must be finite"));
    }
    Ok(value)
}

/// `date_range` as it appears in request bodies.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct DateRangeBody {
    /// First day, `YYYY-MM-DD`
    #[schema(example = "2023-01-01")]
    pub start_date: Option<String>,
    /// Last day (inclusive), `YYYY-MM-DD`
    #[schema(example = "2023-01-31")]
    pub end_date: Option<String>,
}

/// An inclusive, validated range of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, AppError> {
        if end < start {
            return Err(AppError::BadRequest(format!(
                "end_date {} is before start_date {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, AppError> {
        Self::new(
            parse_iso_date("start_date", start)?,
            parse_iso_date("end_date", end)?,
        )
    }
}

impl TryFrom<&DateRangeBody> for DateRange {
    type Error = AppError;

    fn try_from(body: &DateRangeBody) -> Result<Self, AppError> {
        match (non_empty(&body.start_date), non_empty(&body.end_date)) {
            (Some(start), Some(end)) => DateRange::parse(start, end),
            _ => Err(AppError::BadRequest(
                "date_range requires start_date and end_date".to_string(),
            )),
        }
    }
}

/// `Some(s)` only for a present, non-blank string.
pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}
