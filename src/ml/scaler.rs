//! Feature scalers.
//!
//! `MinMaxScaler` maps a 1-D series into [0, 1] using the bounds observed at
//! fit time; values outside those bounds extrapolate linearly (no clamping).
//! `StandardScaler` centres and scales each column of a feature table.
//!
//! Both use a unit scale when the observed spread is zero, so a constant
//! series still round-trips exactly.

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use super::ModelError;

/// Min-max scaler for a single series.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MinMaxScaler {
    bounds: Option<(f64, f64)>,
}

impl MinMaxScaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fitted(&self) -> bool {
        self.bounds.is_some()
    }

    /// Remember the min and max of `values`, replacing any previous fit.
    pub fn fit(&mut self, values: &[f64]) -> Result<(), ModelError> {
        if values.is_empty() {
            return Err(ModelError::InsufficientData { needed: 1, got: 0 });
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        self.bounds = Some((min, max));
        Ok(())
    }

    pub fn fit_transform(&mut self, values: &[f64]) -> Result<Vec<f64>, ModelError> {
        self.fit(values)?;
        self.transform(values)
    }

    /// `(x - min) / (max - min)`
    pub fn transform(&self, values: &[f64]) -> Result<Vec<f64>, ModelError> {
        let (min, scale) = self.min_and_scale()?;
        Ok(values.iter().map(|x| (x - min) / scale).collect())
    }

    /// `x * (max - min) + min`
    pub fn inverse_transform(&self, values: &[f64]) -> Result<Vec<f64>, ModelError> {
        let (min, scale) = self.min_and_scale()?;
        Ok(values.iter().map(|x| x * scale + min).collect())
    }

    fn min_and_scale(&self) -> Result<(f64, f64), ModelError> {
        let (min, max) = self
            .bounds
            .ok_or(ModelError::Uninitialized("Min-max scaler"))?;
        let range = max - min;
        Ok((min, if range == 0.0 { 1.0 } else { range }))
    }
}

/// Per-column standardisation: `(x - mean) / std` with population std.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StandardScaler {
    params: Option<StandardParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StandardParams {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl StandardScaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fitted(&self) -> bool {
        self.params.is_some()
    }

    pub fn fit(&mut self, table: &Array2<f64>) -> Result<(), ModelError> {
        if table.nrows() == 0 {
            return Err(ModelError::InsufficientData { needed: 1, got: 0 });
        }
        let mean = table
            .mean_axis(Axis(0))
            .ok_or(ModelError::InsufficientData { needed: 1, got: 0 })?;
        let scale = table
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s == 0.0 { 1.0 } else { s });
        self.params = Some(StandardParams { mean, scale });
        Ok(())
    }

    pub fn fit_transform(&mut self, table: &Array2<f64>) -> Result<Array2<f64>, ModelError> {
        self.fit(table)?;
        self.transform(table)
    }

    pub fn transform(&self, table: &Array2<f64>) -> Result<Array2<f64>, ModelError> {
        let params = self
            .params
            .as_ref()
            .ok_or(ModelError::Uninitialized("Standard scaler"))?;
        if table.ncols() != params.mean.len() {
            return Err(ModelError::ShapeMismatch(format!(
                "scaler fitted on {} columns, got {}",
                params.mean.len(),
                table.ncols()
            )));
        }
        Ok((table - &params.mean) / &params.scale)
    }
}
