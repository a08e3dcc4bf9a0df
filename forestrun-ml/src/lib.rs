//! # forestrun-ml — random-forest training with experiment tracking
//!
//! Loads a training and a validation split, fits a random-forest regressor,
//! saves the fitted model and records the run (params, metrics, tags and
//! artifacts) in an MLflow-compatible tracking store.
//!
//! ## Layout
//! - [`data`] — split files and the in-memory feature matrix
//! - [`forest`] — CART regression trees and the forest built from them
//! - [`model`] — model files
//! - [`metrics`] — regression error metrics
//! - [`tracking`] — SQLite, file and REST tracking stores, artifact upload
//! - [`training`] — the training job and autologging

pub mod data;
pub mod error;
pub mod forest;
pub mod model;
pub mod tracking;
pub mod training;

pub use training::metrics;

// Re-exports
pub use data::{DataSplit, FeatureMatrix, load_split, load_splits};
pub use error::MlError;
pub use forest::{ForestParams, MaxFeatures, RandomForest, RandomForestRegressor};
pub use model::{ModelArtifact, load_model, save_model};
pub use tracking::{ActiveRun, RunStatus, TrackingClient, TrackingStore, TrackingUri};
pub use training::{TrainingJob, TrainingReport, run, run_from_config};
