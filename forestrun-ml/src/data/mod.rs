//! Prepared dataset splits and their on-disk format.

pub mod split;
pub mod storage;

pub use split::{DataSplit, FeatureMatrix};
pub use storage::{
    TRAIN_FILE, VALID_FILE, hash_file, load_split, load_splits, load_splits_named, save_split,
};
