//! Dataset module for dermoscopy image data
//!
//! This module provides functionality for:
//! - Scanning `root/<class>/<image>` trees into labelled samples
//! - Keras-style random affine augmentation for training
//! - Lazy, optionally shuffled and prefetched batch iteration for Burn
//!
//! Labels are assigned from the sorted class directory names, so the same
//! tree always yields the same mapping. Evaluation splits reuse the mapping
//! of the training split.

pub mod augmentation;
pub mod burn_dataset;
pub mod loader;

pub use augmentation::{AugmentationConfig, Augmenter};
pub use burn_dataset::{
    BatchIter, BatchOptions, LesionBatch, LesionBatcher, LesionBurnDataset, LesionItem,
    Normalization, SkipCounter,
};
pub use loader::{ClassMapping, DatasetStats, ImageSample, LesionDataset};

/// Fraction of unreadable samples above which a pass logs a warning
pub const DEFAULT_MAX_SKIP_FRACTION: f64 = 0.05;

/// Default class directory names of the two-class lesion datasets
pub const BINARY_CLASS_NAMES: [&str; 2] = ["benign", "malignant"];
