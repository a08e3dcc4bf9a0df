//! Random-forest hyperparameters.

use crate::error::MlError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How many features each split considers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxFeatures {
    All,
    Sqrt,
    Log2,
    Fraction(f64),
}

impl MaxFeatures {
    /// Number of candidate features for a matrix with `n_features` columns.
    pub fn resolve(&self, n_features: usize) -> usize {
        let n = n_features as f64;
        let k = match self {
            Self::All => n_features,
            Self::Sqrt => n.sqrt().floor() as usize,
            Self::Log2 => n.log2().floor() as usize,
            Self::Fraction(f) => (f * n).floor() as usize,
        };
        k.clamp(1, n_features.max(1))
    }
}

impl fmt::Display for MaxFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "1.0"),
            Self::Sqrt => write!(f, "sqrt"),
            Self::Log2 => write!(f, "log2"),
            Self::Fraction(v) => write!(f, "{v}"),
        }
    }
}

/// Hyperparameters of [`super::RandomForestRegressor`].
///
/// The defaults are the fixed configuration the trainer uses: 100 trees,
/// depth bounded at 10, seed 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub max_features: MaxFeatures,
    pub bootstrap: bool,
    pub random_state: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: Some(10),
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: MaxFeatures::All,
            bootstrap: true,
            random_state: 0,
        }
    }
}

impl ForestParams {
    pub fn validate(&self) -> Result<(), MlError> {
        if self.n_estimators == 0 {
            return Err(MlError::invalid_input("n_estimators must be at least 1"));
        }
        if self.max_depth == Some(0) {
            return Err(MlError::invalid_input("max_depth must be at least 1"));
        }
        if self.min_samples_split < 2 {
            return Err(MlError::invalid_input("min_samples_split must be at least 2"));
        }
        if self.min_samples_leaf == 0 {
            return Err(MlError::invalid_input("min_samples_leaf must be at least 1"));
        }
        if let MaxFeatures::Fraction(f) = self.max_features {
            if !(f > 0.0 && f <= 1.0) {
                return Err(MlError::invalid_input(format!(
                    "max_features fraction must be in (0, 1], got {f}"
                )));
            }
        }
        Ok(())
    }

    /// Parameter names and rendered values, in the order they are logged.
    pub fn to_param_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("bootstrap", self.bootstrap.to_string()),
            (
                "max_depth",
                self.max_depth
                    .map_or_else(|| "None".to_string(), |d| d.to_string()),
            ),
            ("max_features", self.max_features.to_string()),
            ("min_samples_leaf", self.min_samples_leaf.to_string()),
            ("min_samples_split", self.min_samples_split.to_string()),
            ("n_estimators", self.n_estimators.to_string()),
            ("random_state", self.random_state.to_string()),
        ]
    }
}
