//! Stacked LSTM regressor over univariate daily sequences.
//!
//! The network and its optimizer come from `rust_lstm`. Every window is fed
//! one value per step and trained against the value that follows each step,
//! so the output of the last step is the one-day-ahead forecast.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use ndarray::{arr2, Array2};
use rust_lstm::loss::MSELoss;
use rust_lstm::models::lstm_network::LSTMNetwork;
use rust_lstm::optimizers::Adam;
use rust_lstm::training::LSTMTrainer;
use serde::{Deserialize, Serialize};

use super::training::{TrainingConfig, TrainingReport};
use super::window::Window;
use super::ModelError;

/// Features per time step.
const INPUT_FEATURES: usize = 1;

/// Per-step inputs and per-step targets, each a `(1, 1)` column.
type Sequence = (Vec<Array2<f64>>, Vec<Array2<f64>>);

/// Topology of the recurrent regressor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrentConfig {
    /// Units in each LSTM layer.
    pub hidden_units: usize,
    pub layers: usize,
}

impl Default for RecurrentConfig {
    fn default() -> Self {
        Self {
            hidden_units: 50,
            layers: 2,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RecurrentRegressor {
    config: RecurrentConfig,
    #[serde(with = "network_serde")]
    network: LSTMNetwork,
}

/// `LSTMNetwork` has no serde impls; go through the crate's own
/// `SerializableLSTMNetwork`.
mod network_serde {
    use rust_lstm::models::lstm_network::LSTMNetwork;
    use rust_lstm::persistence::SerializableLSTMNetwork;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(network: &LSTMNetwork, serializer: S) -> Result<S::Ok, S::Error> {
        SerializableLSTMNetwork::from(network).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LSTMNetwork, D::Error> {
        SerializableLSTMNetwork::deserialize(deserializer).map(Into::into)
    }
}

impl fmt::Debug for RecurrentRegressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecurrentRegressor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn step(value: f64) -> Array2<f64> {
    arr2(&[[value]])
}

/// Inputs `w.inputs`, targets `w.inputs[1..]` followed by `w.target`.
fn to_sequence(window: &Window) -> Sequence {
    let inputs = window.inputs.iter().map(|v| step(*v)).collect();
    let targets = window
        .inputs
        .iter()
        .skip(1)
        .chain(std::iter::once(&window.target))
        .map(|v| step(*v))
        .collect();
    (inputs, targets)
}

fn last_output(outputs: &[Array2<f64>]) -> Option<f64> {
    outputs.last().and_then(|o| o.get([0, 0]).copied())
}

/// Mean squared error of the last step over `sequences`.
fn last_step_mse(trainer: &mut LSTMTrainer<MSELoss, Adam>, sequences: &[Sequence]) -> Option<f64> {
    if sequences.is_empty() {
        return None;
    }
    let total: f64 = sequences
        .iter()
        .map(|(inputs, targets)| {
            let predicted = last_output(&trainer.predict(inputs)).unwrap_or(f64::NAN);
            let target = last_output(targets).unwrap_or(f64::NAN);
            (predicted - target).powi(2)
        })
        .sum();
    Some(total / sequences.len() as f64)
}

impl RecurrentRegressor {
    pub fn new(config: RecurrentConfig) -> Result<Self, ModelError> {
        if config.hidden_units == 0 || config.layers == 0 {
            return Err(ModelError::InvalidConfig(format!(
                "LSTM needs at least one layer of one unit, got {} x {}",
                config.layers, config.hidden_units
            )));
        }
        Ok(Self {
            network: LSTMNetwork::new(INPUT_FEATURES, config.hidden_units, config.layers),
            config,
        })
    }

    fn trainer(&self, learning_rate: f64) -> LSTMTrainer<MSELoss, Adam> {
        LSTMTrainer::new(self.network.clone(), MSELoss, Adam::new(learning_rate))
    }

    /// Fit on normalized windows. The last `validation_split` of the windows
    /// is held out for monitoring only.
    pub fn fit(
        &mut self,
        windows: &[Window],
        config: &TrainingConfig,
    ) -> Result<TrainingReport, ModelError> {
        config.validate()?;
        let sequences: Vec<Sequence> = windows.iter().map(to_sequence).collect();
        let (train, validation) = sequences.split_at(config.split_index(sequences.len()));
        if train.is_empty() {
            return Err(ModelError::InsufficientData {
                needed: 1,
                got: train.len(),
            });
        }

        tracing::info!(
            train = train.len(),
            validation = validation.len(),
            epochs = config.epochs,
            "Training LSTM regressor"
        );
        let mut settings = rust_lstm::training::TrainingConfig::default();
        settings.epochs = config.epochs;
        settings.print_every = config.epochs;
        let mut trainer = self.trainer(config.learning_rate).with_config(settings);
        trainer.train(train, (!validation.is_empty()).then_some(validation));

        let final_loss = last_step_mse(&mut trainer, train).unwrap_or(f64::NAN);
        let final_validation_loss = last_step_mse(&mut trainer, validation);
        if !final_loss.is_finite() || final_validation_loss.is_some_and(|l| !l.is_finite()) {
            return Err(ModelError::Diverged(config.epochs));
        }
        tracing::debug!(final_loss, ?final_validation_loss, "LSTM regressor trained");

        self.network = trainer.network;
        Ok(TrainingReport {
            epochs: config.epochs,
            train_samples: train.len(),
            validation_samples: validation.len(),
            final_loss,
            final_validation_loss,
        })
    }

    /// Output of the last step for a normalized window.
    pub fn predict(&self, window: &[f64]) -> Result<f64, ModelError> {
        let inputs: Vec<Array2<f64>> = window.iter().map(|v| step(*v)).collect();
        last_output(&self.trainer(0.001).predict(&inputs)).ok_or_else(|| {
            ModelError::ShapeMismatch("LSTM network produced no output".to_string())
        })
    }

    /// Run one step through the network; a loaded network whose weights do
    /// not fit single-feature steps fails here instead of on a request.
    pub fn check_shape(&self) -> Result<(), ModelError> {
        match catch_unwind(AssertUnwindSafe(|| self.predict(&[0.0]))) {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(ModelError::ShapeMismatch(format!(
                "LSTM network does not accept {}-feature steps",
                INPUT_FEATURES
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::window::make_windows;

    fn small_model() -> RecurrentRegressor {
        RecurrentRegressor::new(RecurrentConfig {
            hidden_units: 4,
            layers: 2,
        })
        .unwrap()
    }

    fn quick() -> TrainingConfig {
        TrainingConfig {
            epochs: 2,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn test_rejects_invalid_topology() {
        for (hidden_units, layers) in [(0, 2), (4, 0)] {
            assert!(matches!(
                RecurrentRegressor::new(RecurrentConfig {
                    hidden_units,
                    layers
                }),
                Err(ModelError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_sequence_targets_are_next_values() {
        let window = Window {
            inputs: vec![0.1, 0.2, 0.3],
            target: 0.4,
        };
        let (inputs, targets) = to_sequence(&window);
        let flat = |steps: &[Array2<f64>]| steps.iter().map(|s| s[[0, 0]]).collect::<Vec<_>>();
        assert_eq!(flat(&inputs), vec![0.1, 0.2, 0.3]);
        assert_eq!(flat(&targets), vec![0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_fit_reports_split_and_finite_loss() {
        let series: Vec<f64> = (0..40).map(|i| ((i % 5) as f64) / 4.0).collect();
        let windows = make_windows(&series, 5);
        let mut model = small_model();

        let report = model.fit(&windows, &quick()).unwrap();
        assert_eq!(report.epochs, 2);
        assert_eq!(report.train_samples, 28);
        assert_eq!(report.validation_samples, 7);
        assert!(report.final_loss.is_finite());
        assert!(report.final_validation_loss.unwrap().is_finite());
        assert!(model.predict(&series[..5]).unwrap().is_finite());
    }

    #[test]
    fn test_fit_without_windows_is_insufficient() {
        let mut model = small_model();
        assert!(matches!(
            model.fit(&[], &quick()),
            Err(ModelError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_round_trips_through_json() {
        let model = small_model();
        let json = serde_json::to_string(&model).unwrap();
        let restored: RecurrentRegressor = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.config, model.config);

        let window = [0.2, 0.4, 0.6, 0.8];
        assert_eq!(
            restored.predict(&window).unwrap(),
            model.predict(&window).unwrap()
        );
        assert!(restored.check_shape().is_ok());
    }

    #[test]
    fn test_network_with_wrong_input_width_fails_shape_check() {
        let model = RecurrentRegressor {
            config: RecurrentConfig {
                hidden_units: 4,
                layers: 1,
            },
            network: LSTMNetwork::new(3, 4, 1),
        };
        assert!(matches!(
            model.check_shape(),
            Err(ModelError::ShapeMismatch(_))
        ));
    }
}
