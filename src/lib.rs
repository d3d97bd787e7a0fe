//! # Lesion Fusion
//!
//! Binary classification of dermoscopic skin-lesion images (benign vs.
//! malignant) with the Burn framework. The main model fuses a
//! convolutional embedding with a window-attention transformer embedding
//! and classifies the concatenation; a single-backbone sigmoid variant is
//! also provided.
//!
//! ## Modules
//!
//! - `dataset`: directory scanning, augmentation and lazy batch iteration
//! - `model`: backbones, the fusion and single-branch classifiers, run configuration
//! - `training`: training loop, policies (early stopping, LR reduction, retry), checkpoints
//! - `inference`: evaluation to a metrics record and per-image prediction
//! - `utils`: errors, logging, metrics, reports and training curves
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lesion_fusion::backend::{default_device, TrainingBackend};
//! use lesion_fusion::training::{run_training, StopSignal};
//! use lesion_fusion::RunConfig;
//!
//! let config = RunConfig::from_toml_file("run.toml".as_ref())?;
//! let summary = run_training::<TrainingBackend>(&config, &default_device(), StopSignal::new())?;
//! println!("{}", summary.evaluation.metrics.classification_report());
//! ```

pub mod backend;
pub mod dataset;
pub mod inference;
pub mod model;
pub mod training;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use dataset::{LesionBurnDataset, LesionDataset};
pub use inference::{EvaluationResult, Evaluator, Predictor};
pub use model::config::{ModelConfig, RunConfig};
pub use model::{FusionClassifier, LesionClassifier, OutputMode, SingleBranchClassifier};
pub use training::{Trainer, TrainingConfig, TrainingContext};
pub use utils::error::{LesionError, Result};
pub use utils::metrics::{ConfusionMatrix, Metrics};

/// Width of the convolutional embedding
pub const CNN_EMBED_DIM: usize = 1280;

/// Channels of the transformer feature map
pub const SWIN_EMBED_DIM: usize = 768;

/// Default input size of the fusion model
pub const FUSION_IMAGE_SIZE: usize = 224;

/// Default input size of the single-branch model
pub const SINGLE_IMAGE_SIZE: usize = 150;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
