//! End-to-end: split files on disk, config, training run, model file, tracked run.

use forestrun_core::config::ForestrunConfig;
use forestrun_ml::data::{DataSplit, FeatureMatrix, TRAIN_FILE, VALID_FILE, save_split};
use forestrun_ml::tracking::{FileStore, RunStatus, TrackingStore};
use forestrun_ml::{MlError, load_model, run_from_config};
use pretty_assertions::assert_eq;
use std::path::Path;
use tempfile::TempDir;

/// Trip duration in minutes from (distance, hour of day).
fn trips(n: usize, seed: u64) -> DataSplit {
    let rows: Vec<Vec<f64>> = (0..n)
        .map(|i| {
            let k = (i as u64).wrapping_mul(2654435761).wrapping_add(seed) % 1000;
            vec![k as f64 / 100.0, (k % 24) as f64]
        })
        .collect();
    let target = rows
        .iter()
        .map(|r| 3.0 + 2.5 * r[0] + if (7.0..10.0).contains(&r[1]) { 6.0 } else { 0.0 })
        .collect();
    DataSplit::new(FeatureMatrix::from_rows(&rows).unwrap(), target).unwrap()
}

fn write_splits(dir: &Path) {
    save_split(&dir.join(TRAIN_FILE), &trips(120, 1)).unwrap();
    save_split(&dir.join(VALID_FILE), &trips(40, 7)).unwrap();
}

fn config(root: &TempDir, tracking_uri: String) -> ForestrunConfig {
    let mut config = ForestrunConfig::default();
    config.data.data_path = root.path().join("output");
    config.tracking.tracking_uri = tracking_uri;
    config.tracking.artifact_root = Some(root.path().join("mlruns"));
    config.model.model_path = root.path().join("models/random_forest_reg.bin");
    config
}

#[tokio::test]
async fn test_train_with_sqlite_tracking() {
    let root = TempDir::new().unwrap();
    let uri = format!("sqlite:///{}", root.path().join("db-mlflow/taxi.db").display());
    let config = config(&root, uri);
    write_splits(&config.data.data_path);

    let report = run_from_config(&config).await.unwrap();

    assert!(report.valid_rmse.is_finite() && report.valid_rmse >= 0.0);
    assert!(root.path().join("db-mlflow/taxi.db").is_file());

    let model = load_model(&config.model.model_path).unwrap();
    assert_eq!(model.forest.n_trees(), 100);
    assert_eq!(model.forest.n_features(), 2);
    let pred = model.predict(&[5.0, 12.0]).unwrap();
    assert!(pred.is_finite());
    let metrics = report.training_metrics.unwrap();
    assert!(metrics.r_squared > 0.8);
}

#[tokio::test]
async fn test_train_with_file_tracking() {
    let root = TempDir::new().unwrap();
    let mlruns = root.path().join("mlruns");
    let config = config(&root, mlruns.display().to_string());
    write_splits(&config.data.data_path);

    let report = run_from_config(&config).await.unwrap();

    let store = FileStore::open(&mlruns).unwrap();
    let run = store.get_run(&report.run_id).await.unwrap();
    assert_eq!(run.info.status, RunStatus::Finished);
    assert_eq!(run.info.experiment_id, report.experiment_id);
    assert_eq!(run.data.params["n_estimators"], "100");
    assert_eq!(run.data.tags["estimator_class"], "forestrun_ml.forest.RandomForestRegressor");
    assert!(run.data.tags.contains_key("train_sha256"));
    for key in [
        "training_mean_squared_error",
        "training_root_mean_squared_error",
        "training_mean_absolute_error",
        "training_r2_score",
        "training_score",
        "valid_rmse",
    ] {
        assert!(run.data.metrics.contains_key(key), "missing metric {key}");
    }

    let artifacts = mlruns
        .join(&report.experiment_id)
        .join(&report.run_id)
        .join("artifacts");
    assert!(artifacts.join("models_bin/random_forest_reg.bin").is_file());
    assert!(artifacts.join("model/random_forest_reg.bin").is_file());
}

#[tokio::test]
async fn test_same_seed_same_rmse() {
    let root = TempDir::new().unwrap();
    let uri = format!("sqlite:///{}", root.path().join("t.db").display());
    let config = config(&root, uri);
    write_splits(&config.data.data_path);

    let first = run_from_config(&config).await.unwrap();
    let second = run_from_config(&config).await.unwrap();
    assert_eq!(first.valid_rmse, second.valid_rmse);
    assert_eq!(first.experiment_id, second.experiment_id);
    assert!(first.run_id != second.run_id);
}

#[tokio::test]
async fn test_missing_validation_file_fails() {
    let root = TempDir::new().unwrap();
    let uri = format!("sqlite:///{}", root.path().join("t.db").display());
    let config = config(&root, uri);
    save_split(&config.data.data_path.join(TRAIN_FILE), &trips(10, 1)).unwrap();

    let err = run_from_config(&config).await.unwrap_err();
    assert!(matches!(err, MlError::NotFound(_)), "got {err}");
    assert!(!config.model.model_path.exists());
}
