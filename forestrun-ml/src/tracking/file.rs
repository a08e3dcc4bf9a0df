//! Directory-tree tracking store.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/<experiment_id>/meta.yaml
//! <root>/<experiment_id>/<run_id>/meta.yaml
//! <root>/<experiment_id>/<run_id>/params/<key>
//! <root>/<experiment_id>/<run_id>/metrics/<key>      "<timestamp> <value> <step>" per line
//! <root>/<experiment_id>/<run_id>/tags/<key>
//! <root>/<experiment_id>/<run_id>/artifacts/
//! ```

use super::{
    Experiment, Metric, Param, Run, RunData, RunInfo, RunStatus, RunTag, TrackingStore,
    now_millis,
};
use crate::error::MlError;
use async_trait::async_trait;
use forestrun_core::persistence::atomic_write;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const META_FILE: &str = "meta.yaml";

#[derive(Debug, Serialize, Deserialize)]
struct ExperimentMeta {
    experiment_id: String,
    name: String,
    artifact_location: String,
    lifecycle_stage: String,
    creation_time: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunMeta {
    run_id: String,
    experiment_id: String,
    run_name: String,
    status: RunStatus,
    start_time: i64,
    end_time: Option<i64>,
    artifact_uri: String,
    lifecycle_stage: String,
}

impl From<RunMeta> for RunInfo {
    fn from(meta: RunMeta) -> Self {
        Self {
            run_id: meta.run_id,
            experiment_id: meta.experiment_id,
            run_name: meta.run_name,
            status: meta.status,
            start_time: meta.start_time,
            end_time: meta.end_time,
            artifact_uri: meta.artifact_uri,
        }
    }
}

/// Tracking store that writes plain files under a root directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: &Path) -> Result<Self, MlError> {
        std::fs::create_dir_all(root)?;
        let root = std::path::absolute(root)?;
        debug!(root = %root.display(), "Opened file tracking store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn experiment_dirs(&self) -> Result<Vec<PathBuf>, MlError> {
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.join(META_FILE).is_file() {
                dirs.push(path);
            }
        }
        Ok(dirs)
    }

    fn read_experiment(dir: &Path) -> Result<ExperimentMeta, MlError> {
        let content = std::fs::read_to_string(dir.join(META_FILE))?;
        Ok(serde_yaml::from_str(&content)?)
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf, MlError> {
        // Run ids are generated uuids; anything else cannot name a run directory.
        if run_id.is_empty() || !run_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(MlError::not_found(format!("run {run_id}")));
        }
        for exp_dir in self.experiment_dirs()? {
            let candidate = exp_dir.join(run_id);
            if candidate.join(META_FILE).is_file() {
                return Ok(candidate);
            }
        }
        Err(MlError::not_found(format!("run {run_id}")))
    }

    fn read_run_meta(run_dir: &Path) -> Result<RunMeta, MlError> {
        let content = std::fs::read_to_string(run_dir.join(META_FILE))?;
        Ok(serde_yaml::from_str(&content)?)
    }

    fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), MlError> {
        let yaml = serde_yaml::to_string(value)?;
        atomic_write(path, yaml.as_bytes())?;
        Ok(())
    }

    /// Read every file below `dir` as `relative/key -> content`.
    fn read_key_files(dir: &Path) -> Result<Vec<(String, String)>, MlError> {
        fn walk(base: &Path, dir: &Path, out: &mut Vec<(String, String)>) -> Result<(), MlError> {
            if !dir.is_dir() {
                return Ok(());
            }
            for entry in std::fs::read_dir(dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    walk(base, &path, out)?;
                } else {
                    let key = path
                        .strip_prefix(base)
                        .map_err(|e| MlError::tracking(e.to_string()))?
                        .to_string_lossy()
                        .replace('\\', "/");
                    out.push((key, std::fs::read_to_string(&path)?));
                }
            }
            Ok(())
        }
        let mut out = Vec::new();
        walk(dir, dir, &mut out)?;
        Ok(out)
    }
}

#[async_trait]
impl TrackingStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>, MlError> {
        for dir in self.experiment_dirs()? {
            let meta = Self::read_experiment(&dir)?;
            if meta.name == name && meta.lifecycle_stage == "active" {
                return Ok(Some(Experiment {
                    experiment_id: meta.experiment_id,
                    name: meta.name,
                    artifact_location: meta.artifact_location,
                }));
            }
        }
        Ok(None)
    }

    async fn create_experiment(&self, name: &str) -> Result<String, MlError> {
        if self.get_experiment_by_name(name).await?.is_some() {
            return Err(MlError::invalid_input(format!(
                "experiment '{name}' already exists"
            )));
        }
        let next_id = self
            .experiment_dirs()?
            .iter()
            .filter_map(|d| d.file_name()?.to_str()?.parse::<u64>().ok())
            .max()
            .map_or(1, |max| max + 1);
        let id = next_id.to_string();
        let dir = self.root.join(&id);
        std::fs::create_dir_all(&dir)?;

        let meta = ExperimentMeta {
            experiment_id: id.clone(),
            name: name.to_string(),
            artifact_location: dir.to_string_lossy().into_owned(),
            lifecycle_stage: "active".into(),
            creation_time: now_millis(),
        };
        Self::write_yaml(&dir.join(META_FILE), &meta)?;
        Ok(id)
    }

    async fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        start_time: i64,
        tags: &[RunTag],
    ) -> Result<RunInfo, MlError> {
        let exp_dir = self.root.join(experiment_id);
        if experiment_id.parse::<u64>().is_err() || !exp_dir.join(META_FILE).is_file() {
            return Err(MlError::not_found(format!("experiment {experiment_id}")));
        }
        let exp = Self::read_experiment(&exp_dir)?;

        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let run_dir = exp_dir.join(&run_id);
        for sub in ["params", "metrics", "tags", "artifacts"] {
            std::fs::create_dir_all(run_dir.join(sub))?;
        }
        let meta = RunMeta {
            run_id: run_id.clone(),
            experiment_id: experiment_id.to_string(),
            run_name: run_name.to_string(),
            status: RunStatus::Running,
            start_time,
            end_time: None,
            artifact_uri: format!("{}/{run_id}/artifacts", exp.artifact_location),
            lifecycle_stage: "active".into(),
        };
        Self::write_yaml(&run_dir.join(META_FILE), &meta)?;
        for tag in tags {
            atomic_write(&run_dir.join("tags").join(&tag.key), tag.value.as_bytes())?;
        }
        Ok(meta.into())
    }

    async fn log_param(&self, run_id: &str, param: &Param) -> Result<(), MlError> {
        let path = self.run_dir(run_id)?.join("params").join(&param.key);
        if path.is_file() {
            let old = std::fs::read_to_string(&path)?;
            if old == param.value {
                return Ok(());
            }
            return Err(MlError::invalid_input(format!(
                "param '{}' already logged as '{old}', refusing to change it to '{}'",
                param.key, param.value
            )));
        }
        atomic_write(&path, param.value.as_bytes())?;
        Ok(())
    }

    async fn log_metric(&self, run_id: &str, metric: &Metric) -> Result<(), MlError> {
        let path = self.run_dir(run_id)?.join("metrics").join(&metric.key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        writeln!(file, "{} {} {}", metric.timestamp, metric.value, metric.step)?;
        Ok(())
    }

    async fn set_tag(&self, run_id: &str, tag: &RunTag) -> Result<(), MlError> {
        let path = self.run_dir(run_id)?.join("tags").join(&tag.key);
        atomic_write(&path, tag.value.as_bytes())?;
        Ok(())
    }

    async fn update_run(
        &self,
        run_id: &str,
        status: RunStatus,
        end_time: Option<i64>,
    ) -> Result<(), MlError> {
        let run_dir = self.run_dir(run_id)?;
        let mut meta = Self::read_run_meta(&run_dir)?;
        meta.status = status;
        if end_time.is_some() {
            meta.end_time = end_time;
        }
        Self::write_yaml(&run_dir.join(META_FILE), &meta)
    }

    async fn get_run(&self, run_id: &str) -> Result<Run, MlError> {
        let run_dir = self.run_dir(run_id)?;
        let info: RunInfo = Self::read_run_meta(&run_dir)?.into();
        let mut data = RunData::default();

        data.params
            .extend(Self::read_key_files(&run_dir.join("params"))?);
        data.tags.extend(Self::read_key_files(&run_dir.join("tags"))?);

        for (key, content) in Self::read_key_files(&run_dir.join("metrics"))? {
            let mut latest: Option<Metric> = None;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                let fields: Vec<&str> = line.split_whitespace().collect();
                let [ts, value, step] = fields.as_slice() else {
                    return Err(MlError::tracking(format!(
                        "malformed metric line '{line}' for '{key}'"
                    )));
                };
                let parse_err =
                    |what: &str| MlError::tracking(format!("bad {what} in metric '{key}': '{line}'"));
                let metric = Metric {
                    key: key.clone(),
                    timestamp: ts.parse().map_err(|_| parse_err("timestamp"))?,
                    value: value.parse().map_err(|_| parse_err("value"))?,
                    step: step.parse().map_err(|_| parse_err("step"))?,
                };
                let newer = latest
                    .as_ref()
                    .is_none_or(|l| (metric.step, metric.timestamp) >= (l.step, l.timestamp));
                if newer {
                    latest = Some(metric);
                }
            }
            if let Some(metric) = latest {
                data.metrics.insert(key, metric);
            }
        }

        Ok(Run { info, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_layout_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(&dir.path().join("mlruns")).unwrap();
        let exp = store.create_experiment("taxi").await.unwrap();
        assert_eq!(exp, "1");
        let info = store.create_run(&exp, "r", 10, &[]).await.unwrap();

        let run_dir = store.root().join(&exp).join(&info.run_id);
        assert!(run_dir.join("meta.yaml").is_file());
        assert!(run_dir.join("artifacts").is_dir());
        assert_eq!(
            PathBuf::from(&info.artifact_uri),
            run_dir.join("artifacts")
        );

        store
            .log_param(
                &info.run_id,
                &Param {
                    key: "n_estimators".into(),
                    value: "100".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(run_dir.join("params/n_estimators")).unwrap(),
            "100"
        );
    }

    #[tokio::test]
    async fn test_metrics_latest_wins_and_nested_keys() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let exp = store.create_experiment("e").await.unwrap();
        let info = store.create_run(&exp, "r", 10, &[]).await.unwrap();

        for (step, value) in [(0, 5.0), (2, 1.0), (1, 3.0)] {
            store
                .log_metric(
                    &info.run_id,
                    &Metric {
                        key: "valid/rmse".into(),
                        value,
                        timestamp: 100,
                        step,
                    },
                )
                .await
                .unwrap();
        }
        let run = store.get_run(&info.run_id).await.unwrap();
        let m = &run.data.metrics["valid/rmse"];
        assert_eq!(m.value, 1.0);
        assert_eq!(m.step, 2);
    }

    #[tokio::test]
    async fn test_status_update_and_ids_increment() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let a = store.create_experiment("a").await.unwrap();
        let b = store.create_experiment("b").await.unwrap();
        assert_eq!((a.as_str(), b.as_str()), ("1", "2"));
        assert!(store.create_experiment("a").await.is_err());

        let info = store.create_run(&b, "r", 10, &[]).await.unwrap();
        store
            .update_run(&info.run_id, RunStatus::Failed, Some(20))
            .await
            .unwrap();
        let run = store.get_run(&info.run_id).await.unwrap();
        assert_eq!(run.info.status, RunStatus::Failed);
        assert_eq!(run.info.end_time, Some(20));
    }

    #[tokio::test]
    async fn test_bad_run_id() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.get_run("../etc").await,
            Err(MlError::NotFound(_))
        ));
    }
}
