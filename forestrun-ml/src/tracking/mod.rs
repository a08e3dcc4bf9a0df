//! Experiment tracking client.
//!
//! A run is recorded through a [`TrackingStore`] chosen from the tracking URI:
//!
//! | URI | store |
//! |---|---|
//! | `sqlite:///relative.db`, `sqlite:////abs/path.db` | [`SqliteStore`] |
//! | `file:///abs/path`, `file:rel/path`, bare path | [`FileStore`] |
//! | `http://host`, `https://host` | [`RestStore`] |
//!
//! The file store layout and the REST calls follow MLflow's, so an MLflow UI
//! or server can read runs recorded through them. The SQLite schema is
//! forestrun's own and is not an MLflow backend database.

pub mod artifacts;
pub mod client;
pub mod file;
pub mod rest;
pub mod sqlite;

pub use artifacts::ArtifactRepository;
pub use client::{ActiveRun, TrackingClient};
pub use file::FileStore;
pub use rest::RestStore;
pub use sqlite::SqliteStore;

use crate::error::MlError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

/// Longest param value a store accepts; longer values are truncated.
pub const MAX_PARAM_VAL_LENGTH: usize = 6000;

/// Longest tag value a store accepts; longer values are truncated.
pub const MAX_TAG_VAL_LENGTH: usize = 8000;

/// Longest param, metric or tag key.
pub const MAX_KEY_LENGTH: usize = 250;

/// Where runs are recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingUri {
    Sqlite(PathBuf),
    File(PathBuf),
    Rest(Url),
}

impl TrackingUri {
    pub fn parse(uri: &str) -> Result<Self, MlError> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(MlError::Config("tracking URI is empty".into()));
        }
        if let Some(rest) = uri.strip_prefix("sqlite://") {
            // sqlite:///rel.db -> "rel.db", sqlite:////abs.db -> "/abs.db"
            let path = rest.strip_prefix('/').ok_or_else(|| {
                MlError::Config(format!("sqlite URI must be sqlite:///<path>, got '{uri}'"))
            })?;
            if path.is_empty() {
                return Err(MlError::Config(format!("sqlite URI '{uri}' has no path")));
            }
            return Ok(Self::Sqlite(PathBuf::from(path)));
        }
        if let Some(rest) = uri.strip_prefix("file:") {
            // file:./mlruns and file:mlruns have no authority and stay relative
            if !rest.starts_with("//") {
                if rest.is_empty() {
                    return Err(MlError::Config(format!("file URI '{uri}' has no path")));
                }
                return Ok(Self::File(PathBuf::from(rest)));
            }
            let url = Url::parse(uri)
                .map_err(|e| MlError::Config(format!("invalid file URI '{uri}': {e}")))?;
            let path = url
                .to_file_path()
                .map_err(|()| MlError::Config(format!("file URI '{uri}' is not a local path")))?;
            return Ok(Self::File(path));
        }
        if uri.starts_with("http://") || uri.starts_with("https://") {
            let url = Url::parse(uri)
                .map_err(|e| MlError::Config(format!("invalid tracking URL '{uri}': {e}")))?;
            return Ok(Self::Rest(url));
        }
        match uri.split_once("://") {
            Some((scheme, _)) => Err(MlError::Config(format!(
                "unsupported tracking URI scheme '{scheme}'"
            ))),
            None => Ok(Self::File(PathBuf::from(uri))),
        }
    }
}

impl FromStr for TrackingUri {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TrackingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(path) => write!(f, "sqlite:///{}", path.display()),
            Self::File(path) if path.is_absolute() => write!(f, "file://{}", path.display()),
            Self::File(path) => write!(f, "file:{}", path.display()),
            Self::Rest(url) => write!(f, "{url}"),
        }
    }
}

/// A named group of runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment_id: String,
    pub name: String,
    pub artifact_location: String,
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Scheduled,
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Scheduled => "SCHEDULED",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Killed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "SCHEDULED" => Ok(Self::Scheduled),
            "FINISHED" => Ok(Self::Finished),
            "FAILED" => Ok(Self::Failed),
            "KILLED" => Ok(Self::Killed),
            other => Err(MlError::tracking(format!("unknown run status '{other}'"))),
        }
    }
}

/// Run metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment_id: String,
    pub run_name: String,
    pub status: RunStatus,
    /// Milliseconds since the Unix epoch.
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub artifact_uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTag {
    pub key: String,
    pub value: String,
}

/// One metric observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub key: String,
    pub value: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub step: i64,
}

/// Logged contents of a run. Metrics hold the latest observation per key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunData {
    pub params: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, Metric>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub info: RunInfo,
    pub data: RunData,
}

/// Backend that persists experiments and runs.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    fn name(&self) -> &str;

    async fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>, MlError>;

    /// Create an experiment and return its id.
    async fn create_experiment(&self, name: &str) -> Result<String, MlError>;

    async fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        start_time: i64,
        tags: &[RunTag],
    ) -> Result<RunInfo, MlError>;

    async fn log_param(&self, run_id: &str, param: &Param) -> Result<(), MlError>;

    async fn log_metric(&self, run_id: &str, metric: &Metric) -> Result<(), MlError>;

    async fn set_tag(&self, run_id: &str, tag: &RunTag) -> Result<(), MlError>;

    async fn update_run(
        &self,
        run_id: &str,
        status: RunStatus,
        end_time: Option<i64>,
    ) -> Result<(), MlError>;

    async fn get_run(&self, run_id: &str) -> Result<Run, MlError>;

    /// Look up `name`, creating the experiment when it does not exist yet.
    async fn get_or_create_experiment(&self, name: &str) -> Result<Experiment, MlError> {
        if let Some(experiment) = self.get_experiment_by_name(name).await? {
            return Ok(experiment);
        }
        self.create_experiment(name).await?;
        self.get_experiment_by_name(name)
            .await?
            .ok_or_else(|| MlError::tracking(format!("experiment '{name}' vanished after create")))
    }
}

/// Reject keys that are empty, too long, use unexpected characters or try to
/// escape the run directory.
pub fn validate_key(kind: &str, key: &str) -> Result<(), MlError> {
    if key.is_empty() {
        return Err(MlError::invalid_input(format!("{kind} key is empty")));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(MlError::invalid_input(format!(
            "{kind} key '{key}' exceeds {MAX_KEY_LENGTH} characters"
        )));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || "_-./ ".contains(c);
    if !key.chars().all(allowed) {
        return Err(MlError::invalid_input(format!(
            "{kind} key '{key}' may only contain alphanumerics, '_', '-', '.', '/' and spaces"
        )));
    }
    if key.starts_with('/') || key.split('/').any(|seg| seg == "." || seg == "..") {
        return Err(MlError::invalid_input(format!(
            "{kind} key '{key}' must be a relative path without '.' or '..' segments"
        )));
    }
    Ok(())
}

/// Truncate `value` to at most `max` characters.
pub fn truncate_value(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
