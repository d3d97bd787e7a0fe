//! Inference module: evaluation and prediction
//!
//! This module provides:
//! - Whole-dataset evaluation producing a `Metrics` record
//! - Checkpoint loading and per-image prediction

pub mod evaluator;
pub mod predictor;

pub use evaluator::{EvaluationResult, Evaluator};
pub use predictor::{evaluate_checkpoint, LoadedModel, PredictionResult, Predictor};
