//! # forestrun-core
//!
//! Configuration and persistence helpers shared by the forestrun crates.

pub mod config;
pub mod error;
pub mod persistence;

pub use config::{ConfigOverrides, ForestrunConfig, load_config};
pub use error::ConfigError;
