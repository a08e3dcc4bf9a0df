//! Random-forest regression.
//!
//! [`RandomForestRegressor`] is the unfitted estimator: it holds the
//! hyperparameters and nothing else. [`RandomForestRegressor::fit`] consumes a
//! training split and returns a [`RandomForest`], the only type that can
//! predict or be persisted.
//!
//! Each tree is grown on a bootstrap resample of the training rows with its
//! own RNG seeded from `random_state`, so a fixed seed gives an identical
//! forest on every run. Predictions are the mean of the tree outputs.

pub mod params;
pub mod tree;

pub use params::{ForestParams, MaxFeatures};
pub use tree::{Node, RegressionTree};

use crate::data::{DataSplit, FeatureMatrix};
use crate::error::MlError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;
use tree::TreeLimits;

/// Unfitted random-forest regressor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RandomForestRegressor {
    params: ForestParams,
}

impl RandomForestRegressor {
    pub fn new(params: ForestParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    /// Fit the forest on a training split.
    pub fn fit(&self, train: &DataSplit) -> Result<RandomForest, MlError> {
        self.params.validate()?;
        train.validate()?;
        if train.is_empty() {
            return Err(MlError::training("cannot fit on an empty split"));
        }
        if train.n_features() == 0 {
            return Err(MlError::training("cannot fit on a split with no features"));
        }
        if !train.is_finite() {
            return Err(MlError::training(
                "training split contains NaN or infinite values",
            ));
        }

        let n = train.len();
        let limits = TreeLimits {
            max_depth: self.params.max_depth,
            min_samples_split: self.params.min_samples_split,
            min_samples_leaf: self.params.min_samples_leaf,
            max_features: self.params.max_features.resolve(train.n_features()),
        };

        let mut seeder = StdRng::seed_from_u64(self.params.random_state);
        let mut trees = Vec::with_capacity(self.params.n_estimators);
        for i in 0..self.params.n_estimators {
            let mut rng = StdRng::seed_from_u64(seeder.r#gen());
            let indices: Vec<usize> = if self.params.bootstrap {
                (0..n).map(|_| rng.gen_range(0..n)).collect()
            } else {
                (0..n).collect()
            };
            let tree = RegressionTree::fit(&train.features, &train.target, indices, limits, &mut rng);
            debug!(tree = i, nodes = tree.n_nodes(), depth = tree.depth(), "Grew tree");
            trees.push(tree);
        }

        Ok(RandomForest {
            params: self.params.clone(),
            n_features: train.n_features(),
            trees,
        })
    }
}

/// A fitted random forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    params: ForestParams,
    n_features: usize,
    trees: Vec<RegressionTree>,
}

impl RandomForest {
    /// Predict a single sample.
    pub fn predict(&self, sample: &[f64]) -> Result<f64, MlError> {
        if sample.len() != self.n_features {
            return Err(MlError::invalid_input(format!(
                "expected {} features, got {}",
                self.n_features,
                sample.len()
            )));
        }
        let total: f64 = self.trees.iter().map(|t| t.predict(sample)).sum();
        Ok(total / self.trees.len() as f64)
    }

    /// Predict every row of a matrix.
    pub fn predict_batch(&self, features: &FeatureMatrix) -> Result<Vec<f64>, MlError> {
        if features.n_cols() != self.n_features {
            return Err(MlError::invalid_input(format!(
                "expected {} features, got {}",
                self.n_features,
                features.n_cols()
            )));
        }
        features.rows().map(|row| self.predict(row)).collect()
    }

    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    /// Check a decoded forest before it is used to predict.
    pub fn validate(&self) -> Result<(), MlError> {
        if self.n_features == 0 {
            return Err(MlError::model("forest has no features"));
        }
        if self.trees.is_empty() {
            return Err(MlError::model("forest has no trees"));
        }
        for (i, tree) in self.trees.iter().enumerate() {
            if tree.n_features() != self.n_features {
                return Err(MlError::model(format!(
                    "tree {i} expects {} features, forest expects {}",
                    tree.n_features(),
                    self.n_features
                )));
            }
            tree.check()?;
        }
        Ok(())
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    /// Average tree depth across the forest.
    pub fn avg_depth(&self) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let total: usize = self.trees.iter().map(RegressionTree::depth).sum();
        total as f64 / self.trees.len() as f64
    }

    /// Mean of the per-tree normalised impurity importances.
    pub fn feature_importances(&self) -> Vec<f64> {
        let mut out = vec![0.0; self.n_features];
        for tree in &self.trees {
            for (acc, v) in out.iter_mut().zip(tree.feature_importances()) {
                *acc += v;
            }
        }
        let n = self.trees.len() as f64;
        out.iter_mut().for_each(|v| *v /= n);
        out
    }
}
