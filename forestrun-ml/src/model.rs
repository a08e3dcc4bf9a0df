//! Fitted-model persistence.
//!
//! A model file is the `bincode` encoding of [`ModelArtifact`]. Only a fitted
//! [`RandomForest`] can be saved.

use crate::data::FeatureMatrix;
use crate::error::MlError;
use crate::forest::RandomForest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::info;

/// Current model file format version.
pub const MODEL_FORMAT_VERSION: u32 = 1;

/// Persisted model plus provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub estimator_class: String,
    pub forest: RandomForest,
}

impl ModelArtifact {
    pub fn new(forest: RandomForest) -> Self {
        Self {
            format_version: MODEL_FORMAT_VERSION,
            created_at: Utc::now(),
            estimator_class: crate::training::autolog::ESTIMATOR_CLASS.to_string(),
            forest,
        }
    }

    pub fn predict(&self, sample: &[f64]) -> Result<f64, MlError> {
        self.forest.predict(sample)
    }

    pub fn predict_batch(&self, features: &FeatureMatrix) -> Result<Vec<f64>, MlError> {
        self.forest.predict_batch(features)
    }
}

/// Where and what was written by [`save_model`].
#[derive(Debug, Clone)]
pub struct SavedModel {
    pub sha256: String,
    pub size_bytes: u64,
}

/// Serialize a fitted forest to `path`, creating parent directories.
pub fn save_model(path: &Path, forest: &RandomForest) -> Result<SavedModel, MlError> {
    let artifact = ModelArtifact::new(forest.clone());
    let bytes = bincode::serialize(&artifact)?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = format!("{:x}", hasher.finalize());

    forestrun_core::persistence::atomic_write(path, &bytes)?;
    info!(
        path = %path.display(),
        bytes = bytes.len(),
        trees = forest.n_trees(),
        "Saved model"
    );
    Ok(SavedModel {
        sha256,
        size_bytes: bytes.len() as u64,
    })
}

/// Load a model file written by [`save_model`].
pub fn load_model(path: &Path) -> Result<ModelArtifact, MlError> {
    if !path.is_file() {
        return Err(MlError::not_found(format!("model file {}", path.display())));
    }
    let bytes = std::fs::read(path)?;
    let artifact: ModelArtifact = bincode::deserialize(&bytes)
        .map_err(|e| MlError::model(format!("{} is not a model file: {e}", path.display())))?;
    if artifact.format_version != MODEL_FORMAT_VERSION {
        return Err(MlError::model(format!(
            "{} has model format version {}, expected {MODEL_FORMAT_VERSION}",
            path.display(),
            artifact.format_version
        )));
    }
    artifact.forest.validate().map_err(|e| match e {
        MlError::Model(msg) => MlError::model(format!("{}: {msg}", path.display())),
        other => other,
    })?;
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataSplit;
    use crate::data::hash_file;
    use crate::forest::{ForestParams, RandomForestRegressor};
    use tempfile::TempDir;

    fn fitted() -> RandomForest {
        let rows: Vec<Vec<f64>> = (0..20).map(|i| vec![i as f64]).collect();
        let target: Vec<f64> = (0..20).map(|i| i as f64 * 0.5).collect();
        let split = DataSplit::new(FeatureMatrix::from_rows(&rows).unwrap(), target).unwrap();
        RandomForestRegressor::new(ForestParams {
            n_estimators: 5,
            ..Default::default()
        })
        .fit(&split)
        .unwrap()
    }

    #[test]
    fn test_saved_model_predicts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("models").join("rf.bin");
        let forest = fitted();

        let saved = save_model(&path, &forest).unwrap();
        assert!(path.exists());
        assert_eq!(saved.sha256, hash_file(&path).unwrap());

        let loaded = load_model(&path).unwrap();
        assert_eq!(loaded.forest, forest);
        assert_eq!(
            loaded.predict(&[3.0]).unwrap(),
            forest.predict(&[3.0]).unwrap()
        );
    }

    #[test]
    fn test_load_missing() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            load_model(&dir.path().join("nope.bin")),
            Err(MlError::NotFound(_))
        ));
    }

    #[test]
    fn test_load_rejects_tree_without_nodes() {
        // Same field order as ModelArtifact so bincode decodes it as one.
        #[derive(Serialize)]
        struct Tree {
            nodes: Vec<crate::forest::Node>,
            n_features: usize,
        }
        #[derive(Serialize)]
        struct Forest {
            params: ForestParams,
            n_features: usize,
            trees: Vec<Tree>,
        }
        #[derive(Serialize)]
        struct Artifact {
            format_version: u32,
            created_at: DateTime<Utc>,
            estimator_class: String,
            forest: Forest,
        }

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hollow.bin");
        let artifact = Artifact {
            format_version: MODEL_FORMAT_VERSION,
            created_at: Utc::now(),
            estimator_class: "forestrun_ml.forest.RandomForestRegressor".into(),
            forest: Forest {
                params: ForestParams::default(),
                n_features: 1,
                trees: vec![Tree {
                    nodes: Vec::new(),
                    n_features: 1,
                }],
            },
        };
        std::fs::write(&path, bincode::serialize(&artifact).unwrap()).unwrap();

        let err = load_model(&path).unwrap_err();
        assert!(matches!(err, MlError::Model(_)), "got {err}");
    }

    #[test]
    fn test_load_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.bin");
        std::fs::write(&path, [0u8; 3]).unwrap();
        assert!(matches!(load_model(&path), Err(MlError::Model(_))));
    }
}
