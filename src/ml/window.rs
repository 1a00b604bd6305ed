//! Sliding windows over a 1-D series.

use super::ModelError;

/// Number of past days the rainfall model looks at.
pub const DEFAULT_SEQUENCE_LENGTH: usize = 30;

/// One model input (`inputs`) and the value that immediately follows it.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub inputs: Vec<f64>,
    pub target: f64,
}

/// Build `n - w` overlapping (window, target) pairs.
///
/// `Window[i] = series[i..i + w]` and `Target[i] = series[i + w]`.
/// A series of length `n <= w` produces no pairs; callers that need at least
/// one pair decide whether that is an error.
pub fn make_windows(series: &[f64], window_len: usize) -> Vec<Window> {
    if window_len == 0 {
        return Vec::new();
    }
    series
        .windows(window_len + 1)
        .map(|slice| Window {
            inputs: slice[..window_len].to_vec(),
            target: slice[window_len],
        })
        .collect()
}

/// The most recent `window_len` values of `series`.
pub fn latest_window(series: &[f64], window_len: usize) -> Result<&[f64], ModelError> {
    if series.len() < window_len || window_len == 0 {
        return Err(ModelError::InsufficientData {
            needed: window_len.max(1),
            got: series.len(),
        });
    }
    Ok(&series[series.len() - window_len..])
}
