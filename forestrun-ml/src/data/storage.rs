//! On-disk split files.
//!
//! A split file is the `bincode` encoding of [`SplitFile`]: a format version
//! followed by the feature matrix and the target vector.

use super::split::{DataSplit, FeatureMatrix};
use crate::error::MlError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

/// Current split file format version.
pub const SPLIT_FORMAT_VERSION: u32 = 1;

/// File name of the training split inside a data directory.
pub const TRAIN_FILE: &str = "train.bin";

/// File name of the validation split inside a data directory.
pub const VALID_FILE: &str = "valid.bin";

#[derive(Debug, Serialize, Deserialize)]
struct SplitFile {
    format_version: u32,
    features: FeatureMatrix,
    target: Vec<f64>,
}

/// Deserialize one split file.
pub fn load_split(path: &Path) -> Result<DataSplit, MlError> {
    if !path.is_file() {
        return Err(MlError::not_found(format!(
            "split file {}",
            path.display()
        )));
    }
    let bytes = std::fs::read(path)?;
    let file: SplitFile = bincode::deserialize(&bytes).map_err(|e| {
        MlError::dataset(format!("{} is not a valid split file: {e}", path.display()))
    })?;
    if file.format_version != SPLIT_FORMAT_VERSION {
        return Err(MlError::dataset(format!(
            "{} has split format version {}, expected {SPLIT_FORMAT_VERSION}",
            path.display(),
            file.format_version
        )));
    }
    let split = DataSplit {
        features: file.features,
        target: file.target,
    };
    split
        .validate()
        .map_err(|e| MlError::dataset(format!("{}: {e}", path.display())))?;
    debug!(
        path = %path.display(),
        rows = split.len(),
        cols = split.n_features(),
        "Loaded split"
    );
    Ok(split)
}

/// Load the training and validation splits from `dir`.
pub fn load_splits(dir: &Path) -> Result<(DataSplit, DataSplit), MlError> {
    load_splits_named(dir, TRAIN_FILE, VALID_FILE)
}

/// Load the training and validation splits from `dir` under custom file names.
pub fn load_splits_named(
    dir: &Path,
    train_file: &str,
    valid_file: &str,
) -> Result<(DataSplit, DataSplit), MlError> {
    let train = load_split(&dir.join(train_file))?;
    let valid = load_split(&dir.join(valid_file))?;
    if train.n_features() != valid.n_features() {
        return Err(MlError::dataset(format!(
            "train split has {} features but validation split has {}",
            train.n_features(),
            valid.n_features()
        )));
    }
    Ok((train, valid))
}

/// Serialize a split to `path` (atomic write, parent directories created).
pub fn save_split(path: &Path, split: &DataSplit) -> Result<(), MlError> {
    split.validate()?;
    let file = SplitFile {
        format_version: SPLIT_FORMAT_VERSION,
        features: split.features.clone(),
        target: split.target.clone(),
    };
    let bytes = bincode::serialize(&file)?;
    forestrun_core::persistence::atomic_write(path, &bytes)?;
    Ok(())
}

/// Compute SHA-256 hash of file contents.
pub fn hash_file(path: &Path) -> Result<String, MlError> {
    let content = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(format!("{:x}", hasher.finalize()))
}
