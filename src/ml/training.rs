//! Mini-batch training loop of the convolutional regressor.
//!
//! Mirrors the usual Keras `fit` contract: the last `validation_split`
//! fraction of the samples is held out (not shuffled) and only used for
//! monitoring, the remaining samples are shuffled every epoch and consumed
//! in batches of `batch_size`. Loss is mean squared error, parameters are
//! updated with Adam.

use ndarray::{Array, Dimension, ShapeBuilder};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use super::ModelError;

/// Hyper-parameters of a training run.
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Fraction of samples (taken from the end) held out for validation.
    pub validation_split: f64,
    pub learning_rate: f64,
    /// Seeds parameter initialisation, shuffling and dropout masks.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 50,
            batch_size: 32,
            validation_split: 0.2,
            learning_rate: 0.001,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(ModelError::InvalidConfig(
                "epochs and batch_size must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(ModelError::InvalidConfig(format!(
                "validation_split must be in [0, 1), got {}",
                self.validation_split
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ModelError::InvalidConfig(
                "learning_rate must be a positive number".to_string(),
            ));
        }
        Ok(())
    }

    /// Index at which the validation tail starts.
    pub(crate) fn split_index(&self, n: usize) -> usize {
        (n as f64 * (1.0 - self.validation_split)) as usize
    }
}

/// Summary of a finished training run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub epochs: usize,
    pub train_samples: usize,
    pub validation_samples: usize,
    /// Mean squared error over the training samples in the last epoch.
    pub final_loss: f64,
    /// Mean squared error on the held-out samples after the last epoch.
    pub final_validation_loss: Option<f64>,
}

/// A regressor trained by back-propagation, one sample at a time.
pub trait GradientModel {
    type Input;
    type Gradients;

    /// Gradient buffers shaped like the model parameters, all zeros.
    fn zero_gradients(&self) -> Self::Gradients;

    /// Forward and backward pass in training mode (dropout active).
    ///
    /// Adds the gradient of the squared error into `grads` and returns the
    /// squared error itself.
    fn accumulate(
        &self,
        input: &Self::Input,
        target: f64,
        grads: &mut Self::Gradients,
        rng: &mut StdRng,
    ) -> f64;

    /// Apply accumulated gradients, averaged over `batch_len` samples.
    fn apply(&mut self, grads: &Self::Gradients, batch_len: usize, optimizer: &mut Adam);

    /// Inference-mode prediction (dropout disabled).
    fn predict_one(&self, input: &Self::Input) -> f64;
}

/// Fit `model` on `(inputs[i], targets[i])` pairs.
pub fn fit<M: GradientModel>(
    model: &mut M,
    inputs: &[M::Input],
    targets: &[f64],
    config: &TrainingConfig,
    label: &str,
) -> Result<TrainingReport, ModelError> {
    config.validate()?;
    if inputs.len() != targets.len() {
        return Err(ModelError::ShapeMismatch(format!(
            "{} inputs but {} targets",
            inputs.len(),
            targets.len()
        )));
    }

    let split_at = config.split_index(inputs.len());
    if split_at == 0 {
        return Err(ModelError::InsufficientData {
            needed: 1,
            got: split_at,
        });
    }
    let validation_samples = inputs.len() - split_at;

    tracing::info!(
        "Training {}: {} samples, {} held out, {} epochs",
        label,
        split_at,
        validation_samples,
        config.epochs
    );

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut optimizer = Adam::new(config.learning_rate);
    let mut order: Vec<usize> = (0..split_at).collect();
    let mut final_loss = f64::NAN;
    let mut final_validation_loss = None;

    for epoch in 1..=config.epochs {
        order.shuffle(&mut rng);

        let mut squared_error = 0.0;
        for batch in order.chunks(config.batch_size) {
            let mut grads = model.zero_gradients();
            for &i in batch {
                squared_error += model.accumulate(&inputs[i], targets[i], &mut grads, &mut rng);
            }
            optimizer.begin_step();
            model.apply(&grads, batch.len(), &mut optimizer);
        }

        final_loss = squared_error / split_at as f64;
        if !final_loss.is_finite() {
            return Err(ModelError::Diverged(epoch));
        }

        final_validation_loss = (validation_samples > 0).then(|| {
            inputs[split_at..]
                .iter()
                .zip(&targets[split_at..])
                .map(|(x, t)| (model.predict_one(x) - t).powi(2))
                .sum::<f64>()
                / validation_samples as f64
        });

        tracing::debug!(
            "{} epoch {}/{}: loss={:.6} val_loss={:?}",
            label,
            epoch,
            config.epochs,
            final_loss,
            final_validation_loss
        );
    }

    tracing::info!(
        "Training {} finished: loss={:.6} val_loss={:?}",
        label,
        final_loss,
        final_validation_loss
    );

    Ok(TrainingReport {
        epochs: config.epochs,
        train_samples: split_at,
        validation_samples,
        final_loss,
        final_validation_loss,
    })
}

/// Adam optimiser (Kingma & Ba) with Keras defaults for beta/epsilon.
///
/// Moment buffers are addressed by a caller-chosen slot per parameter tensor;
/// a model must use the same slot for the same tensor on every step.
#[derive(Debug)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    step: i32,
    moments: Vec<(Vec<f64>, Vec<f64>)>,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            step: 0,
            moments: Vec::new(),
        }
    }

    /// Advance the time step; call once per batch before the updates.
    pub fn begin_step(&mut self) {
        self.step += 1;
    }

    /// `param -= lr_t * m / (sqrt(v) + eps)` with `grad * scale` as gradient.
    pub fn update<D: Dimension>(
        &mut self,
        slot: usize,
        param: &mut Array<f64, D>,
        grad: &Array<f64, D>,
        scale: f64,
    ) {
        while self.moments.len() <= slot {
            self.moments.push((Vec::new(), Vec::new()));
        }
        let (m, v) = &mut self.moments[slot];
        if m.len() != param.len() {
            *m = vec![0.0; param.len()];
            *v = vec![0.0; param.len()];
        }

        let t = self.step.max(1);
        let lr_t = self.learning_rate * (1.0 - self.beta2.powi(t)).sqrt()
            / (1.0 - self.beta1.powi(t));

        for (((p, g), m), v) in param
            .iter_mut()
            .zip(grad.iter())
            .zip(m.iter_mut())
            .zip(v.iter_mut())
        {
            let g = g * scale;
            *m = self.beta1 * *m + (1.0 - self.beta1) * g;
            *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
            *p -= lr_t * *m / (v.sqrt() + self.epsilon);
        }
    }
}

/// Glorot (Xavier) uniform initialisation, the Keras default for kernels.
pub fn glorot_uniform<Sh, D>(shape: Sh, fan_in: usize, fan_out: usize, rng: &mut StdRng) -> Array<f64, D>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
{
    let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
    Array::from_shape_simple_fn(shape, || rng.gen_range(-limit..limit))
}

/// Inverted dropout mask: zero with probability `rate`, otherwise `1 / (1 - rate)`.
pub fn dropout_mask(len: usize, rate: f64, rng: &mut StdRng) -> Vec<f64> {
    if rate <= 0.0 {
        return vec![1.0; len];
    }
    let keep = 1.0 / (1.0 - rate);
    (0..len)
        .map(|_| if rng.gen::<f64>() < rate { 0.0 } else { keep })
        .collect()
}
