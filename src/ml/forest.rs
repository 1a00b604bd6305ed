//! Random forest of CART regression trees (climate branch of the yield model).
//!
//! Each tree is grown on a bootstrap resample of the rows, splitting on the
//! threshold that most reduces squared error. Thresholds sit halfway between
//! adjacent distinct feature values. The forest predicts the mean of its trees.

use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ModelError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestConfig {
    pub n_trees: usize,
    /// `None` grows each tree until its leaves are pure or too small to split.
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    /// Features considered per split; `None` means all of them.
    pub max_features: Option<usize>,
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: None,
            min_samples_split: 2,
            max_features: None,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// A fitted tree; node 0 is the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    fn predict(&self, row: ArrayView1<f64>) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if row[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    score: f64,
}

/// Grows one tree over a (possibly repeated) set of row indices.
struct TreeBuilder<'a> {
    features: &'a Array2<f64>,
    targets: &'a [f64],
    config: &'a ForestConfig,
    rng: StdRng,
    nodes: Vec<Node>,
}

impl<'a> TreeBuilder<'a> {
    fn build(mut self, rows: Vec<usize>) -> RegressionTree {
        self.grow(rows, 0);
        RegressionTree { nodes: self.nodes }
    }

    fn grow(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let id = self.nodes.len();
        let mean = rows.iter().map(|&r| self.targets[r]).sum::<f64>() / rows.len() as f64;
        self.nodes.push(Node::Leaf { value: mean });

        let depth_reached = self.config.max_depth.is_some_and(|max| depth >= max);
        let pure = rows.iter().all(|&r| self.targets[r] == self.targets[rows[0]]);
        if depth_reached || pure || rows.len() < self.config.min_samples_split {
            return id;
        }

        let Some(split) = self.best_split(&rows) else {
            return id;
        };
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|&r| self.features[[r, split.feature]] <= split.threshold);

        let left = self.grow(left_rows, depth + 1);
        let right = self.grow(right_rows, depth + 1);
        self.nodes[id] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        id
    }

    fn candidate_features(&mut self) -> Vec<usize> {
        let n = self.features.ncols();
        match self.config.max_features {
            Some(k) if k < n => sample(&mut self.rng, n, k).into_vec(),
            _ => (0..n).collect(),
        }
    }

    /// Maximises `sum_l² / n_l + sum_r² / n_r`, which minimises the children's SSE.
    fn best_split(&mut self, rows: &[usize]) -> Option<BestSplit> {
        let total: f64 = rows.iter().map(|&r| self.targets[r]).sum();
        let n = rows.len() as f64;
        let baseline = total * total / n;
        let mut best: Option<BestSplit> = None;

        for feature in self.candidate_features() {
            let mut sorted = rows.to_vec();
            sorted.sort_by(|&a, &b| {
                self.features[[a, feature]].total_cmp(&self.features[[b, feature]])
            });

            let mut left_sum = 0.0;
            for i in 0..sorted.len() - 1 {
                left_sum += self.targets[sorted[i]];
                let here = self.features[[sorted[i], feature]];
                let next = self.features[[sorted[i + 1], feature]];
                if here == next {
                    continue;
                }
                let left_n = (i + 1) as f64;
                let right_sum = total - left_sum;
                let score =
                    left_sum * left_sum / left_n + right_sum * right_sum / (n - left_n);
                if score > baseline + 1e-12 && best.as_ref().map_or(true, |b| score > b.score) {
                    best = Some(BestSplit {
                        feature,
                        threshold: here + (next - here) / 2.0,
                        score,
                    });
                }
            }
        }
        best
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForestRegressor {
    config: ForestConfig,
    n_features: Option<usize>,
    trees: Vec<RegressionTree>,
}

impl RandomForestRegressor {
    pub fn new(config: ForestConfig) -> Result<Self, ModelError> {
        if config.n_trees == 0 {
            return Err(ModelError::InvalidConfig(
                "forest needs at least one tree".to_string(),
            ));
        }
        if config.min_samples_split < 2 {
            return Err(ModelError::InvalidConfig(format!(
                "min_samples_split must be at least 2, got {}",
                config.min_samples_split
            )));
        }
        if config.max_features == Some(0) {
            return Err(ModelError::InvalidConfig(
                "max_features must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            config,
            n_features: None,
            trees: Vec::new(),
        })
    }

    pub fn is_fitted(&self) -> bool {
        !self.trees.is_empty()
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Fit on `features` (one row per sample). Replaces any previous fit.
    pub fn fit(&mut self, features: &Array2<f64>, targets: &[f64]) -> Result<(), ModelError> {
        let rows = features.nrows();
        if rows != targets.len() {
            return Err(ModelError::ShapeMismatch(format!(
                "{} feature rows but {} targets",
                rows,
                targets.len()
            )));
        }
        if rows == 0 || features.ncols() == 0 {
            return Err(ModelError::InsufficientData {
                needed: 1,
                got: rows,
            });
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut trees = Vec::with_capacity(self.config.n_trees);
        for _ in 0..self.config.n_trees {
            let mut tree_rng = StdRng::seed_from_u64(rng.gen());
            let bootstrap: Vec<usize> = (0..rows).map(|_| tree_rng.gen_range(0..rows)).collect();
            let builder = TreeBuilder {
                features,
                targets,
                config: &self.config,
                rng: tree_rng,
                nodes: Vec::new(),
            };
            trees.push(builder.build(bootstrap));
        }

        debug!(
            trees = trees.len(),
            rows,
            nodes = trees.iter().map(|t| t.nodes.len()).sum::<usize>(),
            "Random forest fitted"
        );
        self.trees = trees;
        self.n_features = Some(features.ncols());
        Ok(())
    }

    /// One prediction per row of `features`.
    pub fn predict(&self, features: &Array2<f64>) -> Result<Vec<f64>, ModelError> {
        let n_features = self
            .n_features
            .filter(|_| self.is_fitted())
            .ok_or(ModelError::Uninitialized("random forest"))?;
        if features.ncols() != n_features {
            return Err(ModelError::ShapeMismatch(format!(
                "expected {} feature columns, got {}",
                n_features,
                features.ncols()
            )));
        }
        Ok(features
            .rows()
            .into_iter()
            .map(|row| {
                self.trees.iter().map(|t| t.predict(row)).sum::<f64>() / self.trees.len() as f64
            })
            .collect())
    }
}
