//! Automatic logging of a fitted regressor: params, training metrics, tags and the model.

use crate::data::DataSplit;
use crate::error::MlError;
use crate::forest::RandomForest;
use crate::training::metrics::RegressionMetrics;
use crate::tracking::ActiveRun;
use std::path::Path;
use tracing::debug;

pub const ESTIMATOR_NAME: &str = "RandomForestRegressor";

pub const ESTIMATOR_CLASS: &str = "forestrun_ml.forest.RandomForestRegressor";

/// Artifact directory the autologged model lands in.
pub const MODEL_ARTIFACT_PATH: &str = "model";

/// Log everything known about `forest` after it was fitted on `train`.
///
/// `model_file` is the already saved forest; it is logged under
/// [`MODEL_ARTIFACT_PATH`]. Returns the training metrics that were recorded.
pub async fn log_fitted(
    run: &ActiveRun<'_>,
    forest: &RandomForest,
    train: &DataSplit,
    model_file: &Path,
) -> Result<RegressionMetrics, MlError> {
    run.log_params(forest.params().to_param_pairs()).await?;

    let predictions = forest.predict_batch(&train.features)?;
    let metrics = RegressionMetrics::compute(&train.target, &predictions)?;
    run.log_metrics(metrics.named("training_")).await?;

    run.set_tag("estimator_name", ESTIMATOR_NAME).await?;
    run.set_tag("estimator_class", ESTIMATOR_CLASS).await?;

    run.log_artifact(model_file, Some(MODEL_ARTIFACT_PATH)).await?;

    debug!(
        run_id = run.run_id(),
        training_rmse = metrics.rmse,
        "Autologged fitted estimator"
    );
    Ok(metrics)
}
