//! In-memory dataset splits: a row-major feature matrix paired with a target vector.

use crate::error::MlError;
use serde::{Deserialize, Serialize};

/// Dense row-major `f64` matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    n_rows: usize,
    n_cols: usize,
    values: Vec<f64>,
}

impl FeatureMatrix {
    /// Build a matrix from flat row-major values.
    pub fn new(n_rows: usize, n_cols: usize, values: Vec<f64>) -> Result<Self, MlError> {
        let expected = n_rows.checked_mul(n_cols).ok_or_else(|| {
            MlError::dataset(format!("matrix shape {n_rows}x{n_cols} overflows"))
        })?;
        if values.len() != expected {
            return Err(MlError::dataset(format!(
                "matrix shape {n_rows}x{n_cols} needs {expected} values, got {}",
                values.len()
            )));
        }
        Ok(Self {
            n_rows,
            n_cols,
            values,
        })
    }

    /// Build a matrix from a list of rows. All rows must have the same length.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, MlError> {
        let n_cols = rows.first().map_or(0, Vec::len);
        let mut values = Vec::with_capacity(rows.len() * n_cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != n_cols {
                return Err(MlError::dataset(format!(
                    "row {i} has {} columns, expected {n_cols}",
                    row.len()
                )));
            }
            values.extend_from_slice(row);
        }
        Self::new(rows.len(), n_cols, values)
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Borrow one row.
    ///
    /// # Panics
    ///
    /// Panics if `i >= n_rows`.
    pub fn row(&self, i: usize) -> &[f64] {
        let start = i * self.n_cols;
        &self.values[start..start + self.n_cols]
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.n_cols + col]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        (0..self.n_rows).map(move |i| self.row(i))
    }

    /// Shape check applied to values that came from outside (e.g. a decoded file).
    pub(crate) fn check_shape(&self) -> Result<(), MlError> {
        if self.n_rows.checked_mul(self.n_cols) != Some(self.values.len()) {
            return Err(MlError::dataset(format!(
                "matrix declares {}x{} but holds {} values",
                self.n_rows,
                self.n_cols,
                self.values.len()
            )));
        }
        Ok(())
    }
}

/// A feature matrix with its regression target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSplit {
    pub features: FeatureMatrix,
    pub target: Vec<f64>,
}

impl DataSplit {
    pub fn new(features: FeatureMatrix, target: Vec<f64>) -> Result<Self, MlError> {
        let split = Self { features, target };
        split.validate()?;
        Ok(split)
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.features.n_cols()
    }

    /// Features and target must agree on the number of samples.
    pub fn validate(&self) -> Result<(), MlError> {
        self.features.check_shape()?;
        if self.features.n_rows() != self.target.len() {
            return Err(MlError::dataset(format!(
                "feature matrix has {} rows but target has {} values",
                self.features.n_rows(),
                self.target.len()
            )));
        }
        Ok(())
    }

    /// True when every feature and target value is finite.
    pub fn is_finite(&self) -> bool {
        self.features.values().iter().all(|v| v.is_finite())
            && self.target.iter().all(|v| v.is_finite())
    }
}
