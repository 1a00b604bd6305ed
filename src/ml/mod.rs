//! Numeric building blocks shared by the prediction services.
//!
//! - `scaler`: min-max and standard scalers with invertible transforms
//! - `window`: fixed-length (window, target) pairs from a 1-D series
//! - `training`: epoch / mini-batch / validation loop and Adam for the CNN
//! - `recurrent`: stacked LSTM regressor on `rust_lstm`
//! - `conv`: convolutional image-to-scalar regressor
//! - `forest`: random forest of CART regression trees
//! - `artifacts`: versioned, atomic persistence of fitted models

pub mod artifacts;
pub mod conv;
pub mod forest;
pub mod recurrent;
pub mod scaler;
pub mod training;
pub mod window;

use thiserror::Error;

/// Errors raised by the numeric layer.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Transform, inverse or inference requested before anything was fitted.
    #[error("{0} has not been fitted")]
    Uninitialized(&'static str),

    #[error("Insufficient data: need at least {needed} values, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Training diverged at epoch {0} (non-finite loss)")]
    Diverged(usize),

    #[error("Artifact IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Artifact serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Artifacts {0} come from different saves")]
    MixedGenerations(String),

    #[error("Artifact '{name}' has format version {found}, expected {expected}")]
    IncompatibleArtifact {
        name: String,
        found: u32,
        expected: u32,
    },
}
