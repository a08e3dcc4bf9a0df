//! Regression metrics.

use crate::error::MlError;
use serde::{Deserialize, Serialize};

fn check_inputs(y_true: &[f64], y_pred: &[f64]) -> Result<(), MlError> {
    if y_true.len() != y_pred.len() {
        return Err(MlError::evaluation(format!(
            "y_true has {} values but y_pred has {}",
            y_true.len(),
            y_pred.len()
        )));
    }
    if y_true.is_empty() {
        return Err(MlError::evaluation("cannot score an empty prediction set"));
    }
    Ok(())
}

pub fn mean_squared_error(y_true: &[f64], y_pred: &[f64]) -> Result<f64, MlError> {
    check_inputs(y_true, y_pred)?;
    let sum: f64 = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    Ok(sum / y_true.len() as f64)
}

/// Root-mean-squared error; the validation score of a training run.
pub fn root_mean_squared_error(y_true: &[f64], y_pred: &[f64]) -> Result<f64, MlError> {
    Ok(mean_squared_error(y_true, y_pred)?.sqrt())
}

pub fn mean_absolute_error(y_true: &[f64], y_pred: &[f64]) -> Result<f64, MlError> {
    check_inputs(y_true, y_pred)?;
    let sum: f64 = y_true.iter().zip(y_pred).map(|(t, p)| (t - p).abs()).sum();
    Ok(sum / y_true.len() as f64)
}

/// Coefficient of determination.
///
/// A constant target scores 1.0 when predicted exactly and 0.0 otherwise.
pub fn r2_score(y_true: &[f64], y_pred: &[f64]) -> Result<f64, MlError> {
    check_inputs(y_true, y_pred)?;
    let mean = y_true.iter().sum::<f64>() / y_true.len() as f64;
    let ss_tot: f64 = y_true.iter().map(|t| (t - mean).powi(2)).sum();
    let ss_res: f64 = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    if ss_tot == 0.0 {
        return Ok(if ss_res == 0.0 { 1.0 } else { 0.0 });
    }
    Ok(1.0 - ss_res / ss_tot)
}

/// Regression metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub mse: f64,
    pub rmse: f64,
    pub mae: f64,
    pub r_squared: f64,
}

impl RegressionMetrics {
    pub fn compute(y_true: &[f64], y_pred: &[f64]) -> Result<Self, MlError> {
        let mse = mean_squared_error(y_true, y_pred)?;
        Ok(Self {
            mse,
            rmse: mse.sqrt(),
            mae: mean_absolute_error(y_true, y_pred)?,
            r_squared: r2_score(y_true, y_pred)?,
        })
    }

    /// Metric names and values with a prefix, e.g. `training_mean_squared_error`.
    pub fn named(&self, prefix: &str) -> Vec<(String, f64)> {
        vec![
            (format!("{prefix}mean_squared_error"), self.mse),
            (format!("{prefix}root_mean_squared_error"), self.rmse),
            (format!("{prefix}mean_absolute_error"), self.mae),
            (format!("{prefix}r2_score"), self.r_squared),
            (format!("{prefix}score"), self.r_squared),
        ]
    }
}
