//! Training: the job that fits and records a forest, its metrics and autologging.

pub mod autolog;
pub mod job;
pub mod metrics;

pub use job::{TrainingJob, TrainingReport, VALID_RMSE_METRIC, run, run_from_config};
pub use metrics::RegressionMetrics;
