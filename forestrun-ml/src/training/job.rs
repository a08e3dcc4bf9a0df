//! The training job: fit a forest on the training split, score it on the
//! validation split and record everything as one tracked run.

use crate::data::{DataSplit, hash_file, load_splits_named};
use crate::error::MlError;
use crate::forest::{ForestParams, RandomForest, RandomForestRegressor};
use crate::model::save_model;
use crate::tracking::{ActiveRun, RunStatus, TrackingClient};
use crate::training::autolog;
use crate::training::metrics::{RegressionMetrics, root_mean_squared_error};
use forestrun_core::config::{ForestrunConfig, TrackingConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Name of the validation RMSE metric on the run.
pub const VALID_RMSE_METRIC: &str = "valid_rmse";

/// Outcome of a finished training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub run_id: String,
    pub experiment_id: String,
    pub valid_rmse: f64,
    pub model_path: PathBuf,
    pub model_sha256: String,
    /// Where the model artifact was logged.
    pub artifact_uri: String,
    /// Present when autologging was on.
    pub training_metrics: Option<RegressionMetrics>,
}

/// Everything produced inside the run, before it is closed.
struct RunOutcome {
    valid_rmse: f64,
    model_sha256: String,
    artifact_uri: String,
    training_metrics: Option<RegressionMetrics>,
}

/// A configured training job.
pub struct TrainingJob<'a> {
    tracking: &'a TrackingConfig,
    model_path: &'a Path,
    params: ForestParams,
    tags: Vec<(String, String)>,
}

impl<'a> TrainingJob<'a> {
    pub fn new(tracking: &'a TrackingConfig, model_path: &'a Path) -> Self {
        Self {
            tracking,
            model_path,
            params: ForestParams::default(),
            tags: Vec::new(),
        }
    }

    /// Override the forest hyperparameters.
    pub fn with_params(mut self, params: ForestParams) -> Self {
        self.params = params;
        self
    }

    /// Extra tags set on the run as soon as it starts.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    /// Run the job. Once the run has started, any failure marks it `FAILED`
    /// before the error is returned.
    pub async fn run(&self, train: &DataSplit, valid: &DataSplit) -> Result<TrainingReport, MlError> {
        self.params.validate()?;
        valid.validate()?;
        if !valid.is_finite() {
            return Err(MlError::dataset(
                "validation split contains NaN or infinite values",
            ));
        }

        let mut client = TrackingClient::from_config(self.tracking)?;
        let experiment_id = client
            .set_experiment(&self.tracking.experiment_name)
            .await?
            .experiment_id
            .clone();
        let run = client.start_run(None).await?;
        let run_id = run.run_id().to_string();

        let outcome = self.execute(&run, train, valid).await;
        match outcome {
            Ok(outcome) => {
                run.end(RunStatus::Finished).await?;
                info!(
                    %run_id,
                    valid_rmse = outcome.valid_rmse,
                    model = %self.model_path.display(),
                    "Training run finished"
                );
                Ok(TrainingReport {
                    run_id,
                    experiment_id,
                    valid_rmse: outcome.valid_rmse,
                    model_path: self.model_path.to_path_buf(),
                    model_sha256: outcome.model_sha256,
                    artifact_uri: outcome.artifact_uri,
                    training_metrics: outcome.training_metrics,
                })
            }
            Err(err) => {
                warn!(%run_id, error = %err, "Training run failed");
                if let Err(end_err) = run.end(RunStatus::Failed).await {
                    warn!(%run_id, error = %end_err, "Could not mark run as FAILED");
                }
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        run: &ActiveRun<'_>,
        train: &DataSplit,
        valid: &DataSplit,
    ) -> Result<RunOutcome, MlError> {
        for (key, value) in &self.tags {
            run.set_tag(key, value).await?;
        }

        let forest = self.fit(train)?;

        let saved = save_model(self.model_path, &forest)?;
        run.set_tag("model_sha256", &saved.sha256).await?;

        let training_metrics = if self.tracking.autolog {
            Some(autolog::log_fitted(run, &forest, train, self.model_path).await?)
        } else {
            None
        };

        let predictions = forest.predict_batch(&valid.features)?;
        let valid_rmse = root_mean_squared_error(&valid.target, &predictions)?;
        run.log_metric(VALID_RMSE_METRIC, valid_rmse, 0).await?;

        let artifact_uri = run
            .log_artifact(self.model_path, Some(&self.tracking.artifact_path))
            .await?;

        Ok(RunOutcome {
            valid_rmse,
            model_sha256: saved.sha256,
            artifact_uri,
            training_metrics,
        })
    }

    fn fit(&self, train: &DataSplit) -> Result<RandomForest, MlError> {
        let regressor = RandomForestRegressor::new(self.params.clone());
        let started = std::time::Instant::now();
        let forest = regressor.fit(train)?;
        info!(
            rows = train.len(),
            features = train.n_features(),
            trees = forest.n_trees(),
            avg_depth = forest.avg_depth(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fitted random forest"
        );
        Ok(forest)
    }
}

/// Train with the default hyperparameters and record the run.
pub async fn run(
    train: &DataSplit,
    valid: &DataSplit,
    tracking: &TrackingConfig,
    model_path: &Path,
) -> Result<TrainingReport, MlError> {
    TrainingJob::new(tracking, model_path).run(train, valid).await
}

/// Load the splits named by `config` and train on them.
pub async fn run_from_config(config: &ForestrunConfig) -> Result<TrainingReport, MlError> {
    let data = &config.data;
    let (train, valid) = load_splits_named(&data.data_path, &data.train_file, &data.valid_file)?;
    info!(
        data_path = %data.data_path.display(),
        train_rows = train.len(),
        valid_rows = valid.len(),
        "Loaded splits"
    );
    let train_sha = hash_file(&data.train_path())?;
    let valid_sha = hash_file(&data.valid_path())?;

    TrainingJob::new(&config.tracking, &config.model.model_path)
        .with_tag("data_path", data.data_path.display().to_string())
        .with_tag("train_sha256", train_sha)
        .with_tag("valid_sha256", valid_sha)
        .run(&train, &valid)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FeatureMatrix;
    use crate::model::load_model;
    use crate::tracking::TrackingStore;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn linear_split(n: usize, offset: f64) -> DataSplit {
        let rows: Vec<Vec<f64>> = (0..n)
            .map(|i| vec![i as f64 + offset, (i % 3) as f64])
            .collect();
        let target = rows.iter().map(|r| 2.0 * r[0] + r[1]).collect();
        DataSplit::new(FeatureMatrix::from_rows(&rows).unwrap(), target).unwrap()
    }

    fn small_params() -> ForestParams {
        ForestParams {
            n_estimators: 5,
            ..ForestParams::default()
        }
    }

    fn tracking(dir: &TempDir) -> TrackingConfig {
        TrackingConfig {
            tracking_uri: format!("sqlite:///{}", dir.path().join("db/taxi.db").display()),
            artifact_root: Some(dir.path().join("mlruns")),
            ..TrackingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_job_saves_fitted_model_and_finishes_run() {
        let dir = TempDir::new().unwrap();
        let tracking = tracking(&dir);
        let model_path = dir.path().join("models/random_forest_reg.bin");

        let report = TrainingJob::new(&tracking, &model_path)
            .with_params(small_params())
            .run(&linear_split(40, 0.0), &linear_split(10, 0.5))
            .await
            .unwrap();

        assert!(report.valid_rmse.is_finite() && report.valid_rmse >= 0.0);
        let model = load_model(&model_path).unwrap();
        assert_eq!(model.forest.n_trees(), 5);
        assert!(model.predict(&[3.0, 0.0]).unwrap().is_finite());
        assert!(Path::new(&report.artifact_uri).ends_with("models_bin/random_forest_reg.bin"));

        let client = TrackingClient::from_config(&tracking).unwrap();
        let run = client.store().get_run(&report.run_id).await.unwrap();
        assert_eq!(run.info.status, RunStatus::Finished);
        assert_eq!(run.data.params["max_depth"], "10");
        assert_eq!(run.data.params["random_state"], "0");
        assert_eq!(run.data.metrics[VALID_RMSE_METRIC].value, report.valid_rmse);
        assert!(run.data.metrics.contains_key("training_r2_score"));
        assert_eq!(run.data.tags["estimator_name"], autolog::ESTIMATOR_NAME);
        assert_eq!(run.data.tags["model_sha256"], report.model_sha256);
    }

    #[tokio::test]
    async fn test_autolog_off_skips_training_metrics() {
        let dir = TempDir::new().unwrap();
        let tracking = TrackingConfig {
            autolog: false,
            ..tracking(&dir)
        };
        let model_path = dir.path().join("model.bin");
        let report = TrainingJob::new(&tracking, &model_path)
            .with_params(small_params())
            .run(&linear_split(20, 0.0), &linear_split(5, 0.0))
            .await
            .unwrap();
        assert!(report.training_metrics.is_none());

        let client = TrackingClient::from_config(&tracking).unwrap();
        let run = client.store().get_run(&report.run_id).await.unwrap();
        assert!(run.data.params.is_empty());
        assert!(run.data.metrics.contains_key(VALID_RMSE_METRIC));
    }

    #[tokio::test]
    async fn test_failure_marks_run_failed() {
        let dir = TempDir::new().unwrap();
        let tracking = tracking(&dir);
        let model_path = dir.path().join("model.bin");
        let narrow = DataSplit::new(
            FeatureMatrix::from_rows(&[vec![1.0], vec![2.0]]).unwrap(),
            vec![1.0, 2.0],
        )
        .unwrap();

        let err = TrainingJob::new(&tracking, &model_path)
            .with_params(small_params())
            .run(&linear_split(20, 0.0), &narrow)
            .await
            .unwrap_err();
        assert!(matches!(err, MlError::InvalidInput(_)));
        // the fitted model was written before validation failed
        assert!(model_path.is_file());

        let conn = rusqlite::Connection::open(dir.path().join("db/taxi.db")).unwrap();
        let (status, end_time): (String, Option<i64>) = conn
            .query_row("SELECT status, end_time FROM runs", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(status, "FAILED");
        assert!(end_time.is_some());
    }

    #[tokio::test]
    async fn test_non_finite_validation_rejected_before_run() {
        let dir = TempDir::new().unwrap();
        let tracking = tracking(&dir);
        let model_path = dir.path().join("model.bin");
        let valid = DataSplit::new(
            FeatureMatrix::from_rows(&[vec![1.0, 0.0], vec![2.0, 1.0], vec![3.0, 2.0]]).unwrap(),
            vec![1.0, f64::NAN, 2.0],
        )
        .unwrap();

        let err = TrainingJob::new(&tracking, &model_path)
            .with_params(small_params())
            .run(&linear_split(20, 0.0), &valid)
            .await
            .unwrap_err();
        assert!(matches!(err, MlError::Dataset(_)), "got {err}");
        assert!(!model_path.exists());
        assert!(!dir.path().join("db/taxi.db").exists());
    }

    #[tokio::test]
    async fn test_run_from_config_missing_split() {
        let dir = TempDir::new().unwrap();
        let mut config = ForestrunConfig::default();
        config.data.data_path = dir.path().join("output");
        config.tracking = tracking(&dir);
        config.model.model_path = dir.path().join("model.bin");

        let err = run_from_config(&config).await.unwrap_err();
        assert!(matches!(err, MlError::NotFound(_)));
        assert!(!config.model.model_path.exists());
    }
}
