//! Configuration system for forestrun.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from `~/.config/forestrun/config.toml` and/or `forestrun.toml`
//! in the working directory.

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the workspace-local config file.
pub const WORKSPACE_CONFIG_FILE: &str = "forestrun.toml";

/// Prefix for environment overrides (`FORESTRUN_TRACKING__EXPERIMENT_NAME`, ...).
pub const ENV_PREFIX: &str = "FORESTRUN_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForestrunConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub model: ModelConfig,
}

/// Where the prepared splits live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory holding the train and validation split files.
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default = "default_train_file")]
    pub train_file: String,
    #[serde(default = "default_valid_file")]
    pub valid_file: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            train_file: default_train_file(),
            valid_file: default_valid_file(),
        }
    }
}

fn default_data_path() -> PathBuf {
    PathBuf::from("./output")
}

fn default_train_file() -> String {
    "train.bin".to_string()
}

fn default_valid_file() -> String {
    "valid.bin".to_string()
}

/// Experiment tracking configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Tracking backend location (`sqlite:///...`, `file:///...`, `http://...`).
    #[serde(default = "default_tracking_uri")]
    pub tracking_uri: String,
    /// Experiment the run is recorded under. Created on first use.
    #[serde(default = "default_experiment_name")]
    pub experiment_name: String,
    /// Root for run artifacts when the backend does not dictate one.
    #[serde(default)]
    pub artifact_root: Option<PathBuf>,
    /// Artifact sub-path the local model file is logged under.
    #[serde(default = "default_artifact_path")]
    pub artifact_path: String,
    /// Log estimator params, training metrics and the model automatically.
    #[serde(default = "default_true")]
    pub autolog: bool,
    /// Timeout for requests to a remote tracking server (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            tracking_uri: default_tracking_uri(),
            experiment_name: default_experiment_name(),
            artifact_root: None,
            artifact_path: default_artifact_path(),
            autolog: true,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_tracking_uri() -> String {
    "sqlite:///db-mlflow/taxi.db".to_string()
}

fn default_experiment_name() -> String {
    "nyc-taxi-experiment".to_string()
}

fn default_artifact_path() -> String {
    "models_bin".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Local model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
        }
    }
}

fn default_model_path() -> PathBuf {
    PathBuf::from("models/random_forest_reg.bin")
}

impl DataConfig {
    pub fn train_path(&self) -> PathBuf {
        self.data_path.join(&self.train_file)
    }

    pub fn valid_path(&self) -> PathBuf {
        self.data_path.join(&self.valid_file)
    }
}

impl ForestrunConfig {
    /// Reject configurations that cannot produce a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tracking.tracking_uri.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "tracking.tracking_uri".into(),
            });
        }
        if self.tracking.experiment_name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "tracking.experiment_name".into(),
            });
        }
        if self.model.model_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingField {
                field: "model.model_path".into(),
            });
        }
        if self.data.train_file == self.data.valid_file {
            return Err(ConfigError::Invalid {
                message: format!(
                    "train and validation splits point at the same file '{}'",
                    self.data.train_file
                ),
            });
        }
        Ok(())
    }
}

/// Values supplied on the command line. `None` leaves the lower layers untouched.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub data_path: Option<PathBuf>,
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (command-line flags)
/// 2. Environment variables (prefixed with `FORESTRUN_`)
/// 3. `config_file` if given, otherwise `./forestrun.toml`
/// 4. User config (`~/.config/forestrun/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    config_file: Option<&Path>,
    overrides: &ConfigOverrides,
) -> Result<ForestrunConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(ForestrunConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "forestrun", "forestrun") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            tracing::debug!(path = %user_config.display(), "Merging user config");
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    match config_file {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Toml::file(path));
        }
        None => {
            let local = Path::new(WORKSPACE_CONFIG_FILE);
            if local.exists() {
                tracing::debug!(path = %local.display(), "Merging workspace config");
                figment = figment.merge(Toml::file(local));
            }
        }
    }

    // FORESTRUN_TRACKING__TRACKING_URI, FORESTRUN_DATA__DATA_PATH, ...
    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    if let Some(data_path) = &overrides.data_path {
        figment = figment.merge(Serialized::default("data.data_path", data_path));
    }

    let config: ForestrunConfig = figment.extract().map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}
