//! High-level tracking API: pick a store, select an experiment, record a run.

use super::{
    ArtifactRepository, Experiment, FileStore, Metric, Param, RestStore, Run, RunInfo, RunStatus,
    RunTag, SqliteStore, TrackingStore, TrackingUri, MAX_PARAM_VAL_LENGTH, MAX_TAG_VAL_LENGTH,
    now_millis, truncate_value, validate_key,
};
use crate::error::MlError;
use forestrun_core::config::TrackingConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Tag holding the human-readable run name.
pub const RUN_NAME_TAG: &str = "mlflow.runName";

/// Artifact root used by the SQLite store when none is configured.
const DEFAULT_ARTIFACT_ROOT: &str = "mlruns";

/// Records runs against one tracking store.
pub struct TrackingClient {
    store: Box<dyn TrackingStore>,
    /// HTTP client and server URL, kept for resolving `mlflow-artifacts:` URIs.
    server: Option<(reqwest::Client, Url)>,
    experiment: Option<Experiment>,
}

impl TrackingClient {
    pub fn new(store: Box<dyn TrackingStore>) -> Self {
        Self {
            store,
            server: None,
            experiment: None,
        }
    }

    /// Build a client from the `[tracking]` section of the configuration.
    pub fn from_config(config: &TrackingConfig) -> Result<Self, MlError> {
        let uri = TrackingUri::parse(&config.tracking_uri)?;
        let client = match uri {
            TrackingUri::Sqlite(db) => {
                let root = config
                    .artifact_root
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACT_ROOT));
                Self::new(Box::new(SqliteStore::open(&db, &root)?))
            }
            TrackingUri::File(root) => Self::new(Box::new(FileStore::open(&root)?)),
            TrackingUri::Rest(url) => {
                let store =
                    RestStore::new(url, Duration::from_secs(config.request_timeout_secs))?;
                let server = (store.client().clone(), store.base().clone());
                Self {
                    store: Box::new(store),
                    server: Some(server),
                    experiment: None,
                }
            }
        };
        info!(
            uri = %config.tracking_uri,
            store = client.store.name(),
            "Tracking client ready"
        );
        Ok(client)
    }

    pub fn store(&self) -> &dyn TrackingStore {
        self.store.as_ref()
    }

    pub fn experiment(&self) -> Option<&Experiment> {
        self.experiment.as_ref()
    }

    /// Make `name` the active experiment, creating it if needed.
    pub async fn set_experiment(&mut self, name: &str) -> Result<&Experiment, MlError> {
        if name.trim().is_empty() {
            return Err(MlError::invalid_input("experiment name is empty"));
        }
        let experiment = self.store.get_or_create_experiment(name).await?;
        debug!(
            experiment_id = %experiment.experiment_id,
            name = %experiment.name,
            "Active experiment set"
        );
        Ok(self.experiment.insert(experiment))
    }

    /// Start a run in the active experiment.
    pub async fn start_run(&self, run_name: Option<&str>) -> Result<ActiveRun<'_>, MlError> {
        let experiment = self
            .experiment
            .as_ref()
            .ok_or_else(|| MlError::tracking("no active experiment; call set_experiment first"))?;
        let run_name = match run_name {
            Some(name) => name.to_string(),
            None => default_run_name(),
        };
        let tags = [RunTag {
            key: RUN_NAME_TAG.to_string(),
            value: run_name.clone(),
        }];
        let info = self
            .store
            .create_run(&experiment.experiment_id, &run_name, now_millis(), &tags)
            .await?;
        info!(
            run_id = %info.run_id,
            run_name = %info.run_name,
            experiment = %experiment.name,
            "Run started"
        );
        Ok(ActiveRun {
            client: self,
            info,
            ended: false,
        })
    }

    fn artifact_repository(&self, artifact_uri: &str) -> Result<ArtifactRepository, MlError> {
        ArtifactRepository::resolve(
            artifact_uri,
            self.server.as_ref().map(|(client, url)| (client, url)),
        )
    }
}

fn default_run_name() -> String {
    format!("run-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S"))
}

/// Handle for a run that is in progress.
///
/// Call [`ActiveRun::end`] to close it. A handle dropped without ending
/// leaves the run `RUNNING` on the tracker.
pub struct ActiveRun<'a> {
    client: &'a TrackingClient,
    info: RunInfo,
    ended: bool,
}

impl ActiveRun<'_> {
    pub fn info(&self) -> &RunInfo {
        &self.info
    }

    pub fn run_id(&self) -> &str {
        &self.info.run_id
    }

    pub async fn log_param(&self, key: &str, value: &str) -> Result<(), MlError> {
        validate_key("param", key)?;
        let param = Param {
            key: key.to_string(),
            value: truncate_value(value, MAX_PARAM_VAL_LENGTH),
        };
        if param.value.len() < value.len() {
            warn!(key, "Param value truncated to {MAX_PARAM_VAL_LENGTH} characters");
        }
        self.client.store.log_param(&self.info.run_id, &param).await
    }

    pub async fn log_params<K, V>(&self, params: impl IntoIterator<Item = (K, V)>) -> Result<(), MlError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in params {
            self.log_param(key.as_ref(), value.as_ref()).await?;
        }
        Ok(())
    }

    pub async fn log_metric(&self, key: &str, value: f64, step: i64) -> Result<(), MlError> {
        validate_key("metric", key)?;
        let metric = Metric {
            key: key.to_string(),
            value,
            timestamp: now_millis(),
            step,
        };
        self.client.store.log_metric(&self.info.run_id, &metric).await
    }

    pub async fn log_metrics<K: AsRef<str>>(
        &self,
        metrics: impl IntoIterator<Item = (K, f64)>,
    ) -> Result<(), MlError> {
        for (key, value) in metrics {
            self.log_metric(key.as_ref(), value, 0).await?;
        }
        Ok(())
    }

    pub async fn set_tag(&self, key: &str, value: &str) -> Result<(), MlError> {
        validate_key("tag", key)?;
        let tag = RunTag {
            key: key.to_string(),
            value: truncate_value(value, MAX_TAG_VAL_LENGTH),
        };
        self.client.store.set_tag(&self.info.run_id, &tag).await
    }

    /// Store `local_path` under `artifact_path` in the run's artifact location.
    pub async fn log_artifact(
        &self,
        local_path: &Path,
        artifact_path: Option<&str>,
    ) -> Result<String, MlError> {
        let repo = self.client.artifact_repository(&self.info.artifact_uri)?;
        let location = repo.log_artifact(local_path, artifact_path).await?;
        info!(
            run_id = %self.info.run_id,
            source = %local_path.display(),
            %location,
            "Logged artifact"
        );
        Ok(location)
    }

    pub async fn get_run(&self) -> Result<Run, MlError> {
        self.client.store.get_run(&self.info.run_id).await
    }

    /// Close the run with a terminal `status`.
    pub async fn end(mut self, status: RunStatus) -> Result<RunInfo, MlError> {
        if !status.is_terminal() {
            return Err(MlError::invalid_input(format!(
                "cannot end a run with non-terminal status {status}"
            )));
        }
        let end_time = now_millis();
        self.client
            .store
            .update_run(&self.info.run_id, status, Some(end_time))
            .await?;
        self.ended = true;
        self.info.status = status;
        self.info.end_time = Some(end_time);
        info!(run_id = %self.info.run_id, %status, "Run ended");
        Ok(self.info.clone())
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        if !self.ended {
            warn!(run_id = %self.info.run_id, "Run handle dropped without end(); run stays RUNNING");
        }
    }
}
