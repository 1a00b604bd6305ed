//! Calendar-date helpers shared by the routes and services.
//!
//! All dates on the wire are ISO 8601 calendar dates (`YYYY-MM-DD`).

use chrono::{Datelike, Months, NaiveDate};

use crate::errors::AppError;

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";

/// Parse a `YYYY-MM-DD` date, naming the offending field on failure.
pub(crate) fn parse_iso_date(field: &str, raw: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).map_err(|_| {
        AppError::BadRequest(format!(
            "Invalid {}: '{}' is not a YYYY-MM-DD date",
            field, raw
        ))
    })
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Every calendar day in `[start, end]`, ascending. Empty when `end < start`.
pub(crate) fn days_inclusive(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start.iter_days().take_while(move |day| *day <= end)
}

fn month_end(date: NaiveDate) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?
        .checked_add_months(Months::new(1))?
        .pred_opt()
}

/// Last day of every month whose month end lies in `[start, end]`.
pub(crate) fn month_ends(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut cursor = month_end(start);
    while let Some(day) = cursor.filter(|d| *d <= end) {
        out.push(day);
        cursor = day.succ_opt().and_then(month_end);
    }
    out
}
