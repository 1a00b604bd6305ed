//! Convolutional image-to-scalar regressor (imagery branch of the yield model).
//!
//! Topology, all convolutions 3×3 "valid" with ReLU:
//! Conv(f1) → MaxPool 2 → Conv(f2) → MaxPool 2 → Conv(f3) → Flatten →
//! Dense(units, ReLU) → Dropout → Dense(1).
//!
//! Tensors are `(channels, height, width)`.

use ndarray::{Array1, Array2, Array3, Array4, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::training::{
    self, dropout_mask, glorot_uniform, Adam, GradientModel, TrainingConfig, TrainingReport,
};
use super::ModelError;

const KERNEL: usize = 3;
const POOL: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvConfig {
    /// Input images are `image_size × image_size`.
    pub image_size: usize,
    pub channels: usize,
    pub filters: [usize; 3],
    pub dense_units: usize,
    pub dropout: f64,
}

impl Default for ConvConfig {
    fn default() -> Self {
        Self {
            image_size: 64,
            channels: 3,
            filters: [32, 64, 64],
            dense_units: 64,
            dropout: 0.5,
        }
    }
}

impl ConvConfig {
    /// Side length of the last convolution's output, if the image is large enough.
    fn final_side(&self) -> Option<usize> {
        let conv = |s: usize| s.checked_sub(KERNEL - 1).filter(|&v| v > 0);
        let pool = |s: usize| Some(s / POOL).filter(|&v| v > 0);
        conv(self.image_size)
            .and_then(pool)
            .and_then(conv)
            .and_then(pool)
            .and_then(conv)
    }

    fn validate(&self) -> Result<usize, ModelError> {
        if self.channels == 0 || self.dense_units == 0 || self.filters.contains(&0) {
            return Err(ModelError::InvalidConfig(
                "channels, filters and dense_units must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ModelError::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        self.final_side().ok_or_else(|| {
            ModelError::InvalidConfig(format!(
                "image_size {} is too small for three 3x3 convolutions",
                self.image_size
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Conv2d {
    /// `(out_channels, in_channels, 3, 3)`
    weights: Array4<f64>,
    bias: Array1<f64>,
}

#[derive(Debug, Clone)]
struct Conv2dGradients {
    weights: Array4<f64>,
    bias: Array1<f64>,
}

impl Conv2d {
    fn new(in_channels: usize, out_channels: usize, rng: &mut StdRng) -> Self {
        let area = KERNEL * KERNEL;
        Self {
            weights: glorot_uniform(
                (out_channels, in_channels, KERNEL, KERNEL),
                in_channels * area,
                out_channels * area,
                rng,
            ),
            bias: Array1::zeros(out_channels),
        }
    }

    fn zero_gradients(&self) -> Conv2dGradients {
        Conv2dGradients {
            weights: Array4::zeros(self.weights.raw_dim()),
            bias: Array1::zeros(self.bias.len()),
        }
    }

    /// Pre-activation output of a valid 3×3 convolution.
    fn forward(&self, input: &Array3<f64>) -> Array3<f64> {
        let (out_channels, in_channels, _, _) = self.weights.dim();
        let (_, height, width) = input.dim();
        let (oh, ow) = (height + 1 - KERNEL, width + 1 - KERNEL);

        let mut out = Array3::zeros((out_channels, oh, ow));
        for o in 0..out_channels {
            for y in 0..oh {
                for x in 0..ow {
                    let mut acc = self.bias[o];
                    for c in 0..in_channels {
                        for ky in 0..KERNEL {
                            for kx in 0..KERNEL {
                                acc += self.weights[[o, c, ky, kx]] * input[[c, y + ky, x + kx]];
                            }
                        }
                    }
                    out[[o, y, x]] = acc;
                }
            }
        }
        out
    }

    /// Accumulate parameter gradients; return the input gradient when asked.
    fn backward(
        &self,
        input: &Array3<f64>,
        d_out: &Array3<f64>,
        grads: &mut Conv2dGradients,
        propagate: bool,
    ) -> Option<Array3<f64>> {
        let (out_channels, in_channels, _, _) = self.weights.dim();
        let (_, oh, ow) = d_out.dim();
        let mut d_input = propagate.then(|| Array3::zeros(input.raw_dim()));

        for o in 0..out_channels {
            for y in 0..oh {
                for x in 0..ow {
                    let d = d_out[[o, y, x]];
                    if d == 0.0 {
                        continue;
                    }
                    grads.bias[o] += d;
                    for c in 0..in_channels {
                        for ky in 0..KERNEL {
                            for kx in 0..KERNEL {
                                grads.weights[[o, c, ky, kx]] += d * input[[c, y + ky, x + kx]];
                                if let Some(d_in) = d_input.as_mut() {
                                    d_in[[c, y + ky, x + kx]] += d * self.weights[[o, c, ky, kx]];
                                }
                            }
                        }
                    }
                }
            }
        }
        d_input
    }
}

fn relu(t: &Array3<f64>) -> Array3<f64> {
    t.mapv(|v| v.max(0.0))
}

/// Zero the gradient wherever the pre-activation was not positive.
fn relu_backward(pre: &Array3<f64>, grad: &Array3<f64>) -> Array3<f64> {
    let mut out = grad.clone();
    out.zip_mut_with(pre, |g, &p| {
        if p <= 0.0 {
            *g = 0.0;
        }
    });
    out
}

/// 2×2 max pooling with stride 2; trailing odd rows/columns are dropped.
fn max_pool(input: &Array3<f64>) -> Array3<f64> {
    let (channels, height, width) = input.dim();
    Array3::from_shape_fn((channels, height / POOL, width / POOL), |(c, y, x)| {
        let mut best = f64::NEG_INFINITY;
        for dy in 0..POOL {
            for dx in 0..POOL {
                best = best.max(input[[c, y * POOL + dy, x * POOL + dx]]);
            }
        }
        best
    })
}

/// Route each pooled gradient to the first maximal element of its window.
fn max_pool_backward(input: &Array3<f64>, d_out: &Array3<f64>) -> Array3<f64> {
    let mut d_input = Array3::zeros(input.raw_dim());
    for ((c, y, x), &d) in d_out.indexed_iter() {
        let mut best = (y * POOL, x * POOL);
        for dy in 0..POOL {
            for dx in 0..POOL {
                let (iy, ix) = (y * POOL + dy, x * POOL + dx);
                if input[[c, iy, ix]] > input[[c, best.0, best.1]] {
                    best = (iy, ix);
                }
            }
        }
        d_input[[c, best.0, best.1]] += d;
    }
    d_input
}

/// Intermediate activations of one forward pass.
struct Activations {
    a1: Array3<f64>,
    r1: Array3<f64>,
    p1: Array3<f64>,
    a2: Array3<f64>,
    r2: Array3<f64>,
    p2: Array3<f64>,
    a3: Array3<f64>,
    flat: Array1<f64>,
    hidden_pre: Array1<f64>,
    hidden: Array1<f64>,
}

/// Gradient buffers for [`ConvRegressor`].
#[derive(Debug, Clone)]
pub struct ConvGradients {
    convs: [Conv2dGradients; 3],
    dense_weights: Array2<f64>,
    dense_bias: Array1<f64>,
    out_weights: Array1<f64>,
    out_bias: Array1<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvRegressor {
    config: ConvConfig,
    convs: [Conv2d; 3],
    dense_weights: Array2<f64>,
    dense_bias: Array1<f64>,
    out_weights: Array1<f64>,
    out_bias: Array1<f64>,
}

impl ConvRegressor {
    pub fn new(config: ConvConfig, seed: u64) -> Result<Self, ModelError> {
        let side = config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let [f1, f2, f3] = config.filters;
        let convs = [
            Conv2d::new(config.channels, f1, &mut rng),
            Conv2d::new(f1, f2, &mut rng),
            Conv2d::new(f2, f3, &mut rng),
        ];
        let flat_len = f3 * side * side;
        let dense_weights = glorot_uniform(
            (config.dense_units, flat_len),
            flat_len,
            config.dense_units,
            &mut rng,
        );
        let out_weights = glorot_uniform(config.dense_units, config.dense_units, 1, &mut rng);

        Ok(Self {
            dense_bias: Array1::zeros(config.dense_units),
            config,
            convs,
            dense_weights,
            out_weights,
            out_bias: Array1::zeros(1),
        })
    }

    pub fn config(&self) -> &ConvConfig {
        &self.config
    }

    fn check_shape(&self, image: &Array3<f64>) -> Result<(), ModelError> {
        let expected = (self.config.channels, self.config.image_size, self.config.image_size);
        if image.dim() != expected {
            return Err(ModelError::ShapeMismatch(format!(
                "expected image tensor {:?}, got {:?}",
                expected,
                image.dim()
            )));
        }
        Ok(())
    }

    pub fn fit(
        &mut self,
        images: &[Array3<f64>],
        targets: &[f64],
        config: &TrainingConfig,
    ) -> Result<TrainingReport, ModelError> {
        for image in images {
            self.check_shape(image)?;
        }
        training::fit(self, images, targets, config, "convolutional regressor")
    }

    pub fn predict(&self, image: &Array3<f64>) -> Result<f64, ModelError> {
        self.check_shape(image)?;
        Ok(self.infer(image))
    }

    fn infer(&self, image: &Array3<f64>) -> f64 {
        let acts = self.forward(image);
        self.out_weights.dot(&acts.hidden) + self.out_bias[0]
    }

    fn forward(&self, image: &Array3<f64>) -> Activations {
        let a1 = self.convs[0].forward(image);
        let r1 = relu(&a1);
        let p1 = max_pool(&r1);
        let a2 = self.convs[1].forward(&p1);
        let r2 = relu(&a2);
        let p2 = max_pool(&r2);
        let a3 = self.convs[2].forward(&p2);
        let flat: Array1<f64> = relu(&a3).iter().copied().collect();
        let hidden_pre = self.dense_weights.dot(&flat) + &self.dense_bias;
        let hidden = hidden_pre.mapv(|v| v.max(0.0));
        Activations {
            a1,
            r1,
            p1,
            a2,
            r2,
            p2,
            a3,
            flat,
            hidden_pre,
            hidden,
        }
    }
}

impl GradientModel for ConvRegressor {
    type Input = Array3<f64>;
    type Gradients = ConvGradients;

    fn zero_gradients(&self) -> ConvGradients {
        ConvGradients {
            convs: [
                self.convs[0].zero_gradients(),
                self.convs[1].zero_gradients(),
                self.convs[2].zero_gradients(),
            ],
            dense_weights: Array2::zeros(self.dense_weights.raw_dim()),
            dense_bias: Array1::zeros(self.dense_bias.len()),
            out_weights: Array1::zeros(self.out_weights.len()),
            out_bias: Array1::zeros(1),
        }
    }

    fn accumulate(
        &self,
        image: &Array3<f64>,
        target: f64,
        grads: &mut ConvGradients,
        rng: &mut StdRng,
    ) -> f64 {
        let acts = self.forward(image);
        let mask = Array1::from(dropout_mask(acts.hidden.len(), self.config.dropout, rng));
        let hidden_dropped = &acts.hidden * &mask;

        let err = self.out_weights.dot(&hidden_dropped) + self.out_bias[0] - target;
        let d_pred = 2.0 * err;
        grads.out_weights.scaled_add(d_pred, &hidden_dropped);
        grads.out_bias[0] += d_pred;

        let mut d_hidden_pre = &self.out_weights * d_pred * &mask;
        d_hidden_pre.zip_mut_with(&acts.hidden_pre, |g, &p| {
            if p <= 0.0 {
                *g = 0.0;
            }
        });
        grads.dense_weights += &d_hidden_pre
            .view()
            .insert_axis(Axis(1))
            .dot(&acts.flat.view().insert_axis(Axis(0)));
        grads.dense_bias += &d_hidden_pre;

        let d_flat = self.dense_weights.t().dot(&d_hidden_pre);
        let (_, side, _) = acts.a3.dim();
        let d_r3 = Array3::from_shape_fn(acts.a3.raw_dim(), |(c, y, x)| {
            d_flat[(c * side + y) * side + x]
        });

        let d_a3 = relu_backward(&acts.a3, &d_r3);
        let [g1, g2, g3] = &mut grads.convs;
        let d_p2 = self.convs[2]
            .backward(&acts.p2, &d_a3, g3, true)
            .unwrap_or_else(|| Array3::zeros(acts.p2.raw_dim()));
        let d_a2 = relu_backward(&acts.a2, &max_pool_backward(&acts.r2, &d_p2));
        let d_p1 = self.convs[1]
            .backward(&acts.p1, &d_a2, g2, true)
            .unwrap_or_else(|| Array3::zeros(acts.p1.raw_dim()));
        let d_a1 = relu_backward(&acts.a1, &max_pool_backward(&acts.r1, &d_p1));
        self.convs[0].backward(image, &d_a1, g1, false);

        err * err
    }

    fn apply(&mut self, grads: &ConvGradients, batch_len: usize, optimizer: &mut Adam) {
        let scale = 1.0 / batch_len as f64;
        for (k, (conv, g)) in self.convs.iter_mut().zip(&grads.convs).enumerate() {
            optimizer.update(2 * k, &mut conv.weights, &g.weights, scale);
            optimizer.update(2 * k + 1, &mut conv.bias, &g.bias, scale);
        }
        optimizer.update(6, &mut self.dense_weights, &grads.dense_weights, scale);
        optimizer.update(7, &mut self.dense_bias, &grads.dense_bias, scale);
        optimizer.update(8, &mut self.out_weights, &grads.out_weights, scale);
        optimizer.update(9, &mut self.out_bias, &grads.out_bias, scale);
    }

    fn predict_one(&self, image: &Array3<f64>) -> f64 {
        self.infer(image)
    }
}
