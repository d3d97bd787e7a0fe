//! Training module
//!
//! This module provides:
//! - The epoch loop with early stopping and plateau LR reduction
//! - Loss functions for the two output modes
//! - Training policies (class weights, stop signal, OOM retry)
//! - Checkpoints with a JSON sidecar
//! - The end-to-end training pipeline used by the CLI

pub mod checkpoint;
pub mod pipeline;
pub mod policy;
pub mod scheduler;
pub mod trainer;

// Re-export main types for convenience
pub use checkpoint::{CheckpointManager, CheckpointMetadata};
pub use pipeline::{load_splits, run_training, DataSplits, RunSummary};
pub use policy::{
    ClassWeighting, EarlyStopping, EarlyStoppingVerdict, HalveBatchSize, NoRetry, RetryPolicy,
    StopSignal,
};
pub use scheduler::{LrSchedule, ReduceLrOnPlateau, ReduceLrOnPlateauConfig};
pub use trainer::{
    adam_optimizer, classification_loss, AdamOptimizer, EpochRecord, StopReason, Trainer,
    TrainingContext, TrainingOutcome,
};

// Re-export TrainingConfig from model::config where it's defined
pub use crate::model::config::TrainingConfig;

/// Default number of training epochs
pub const DEFAULT_EPOCHS: usize = 20;

/// Default batch size
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Default learning rate
pub const DEFAULT_LEARNING_RATE: f64 = 0.001;
