//! Run Configuration Module
//!
//! Defines the serde/TOML configuration of a training or evaluation run:
//! data locations and preprocessing, model architecture, training
//! hyperparameters and augmentation. Every section has defaults, so a
//! config file only needs the values it changes. CLI flags are applied on
//! top of the loaded file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dataset::{AugmentationConfig, Normalization, DEFAULT_MAX_SKIP_FRACTION};
use crate::model::fusion::{FusionClassifierConfig, OutputMode, DEFAULT_THRESHOLD};
use crate::model::single::SingleBranchClassifierConfig;
use crate::model::{ConvBackboneConfig, SwinBackboneConfig};
use crate::training::policy::ClassWeighting;
use crate::training::scheduler::{LrSchedule, ReduceLrOnPlateauConfig};
use crate::utils::error::{LesionError, Result};
use crate::{FUSION_IMAGE_SIZE, SINGLE_IMAGE_SIZE};

/// Complete configuration of a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub data: DataConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub augmentation: AugmentationConfig,
}

impl RunConfig {
    /// Load from a TOML file; missing keys keep their defaults
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            LesionError::config(format!("cannot read config {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| LesionError::Serialization(e.to_string()))
    }

    /// Reject inconsistent settings before any data is touched
    pub fn validate(&self) -> Result<()> {
        self.data.validate()?;
        self.training.validate()?;
        if self.model.threshold <= 0.0 || self.model.threshold >= 1.0 {
            return Err(LesionError::config(format!(
                "threshold must lie in (0, 1), got {}",
                self.model.threshold
            )));
        }
        if self.model.architecture == Architecture::Fusion && !self.model.tiny {
            let swin = SwinBackboneConfig::swin_tiny().with_image_size(self.data.image_size);
            swin.validate()?;
        }
        Ok(())
    }

    /// Output mode for a dataset with `num_classes` classes
    pub fn output_mode(&self, num_classes: usize) -> Result<OutputMode> {
        let mode = match self.model.output {
            OutputKind::MultiClass => OutputMode::multi_class(num_classes),
            OutputKind::BinarySigmoid => {
                if num_classes != 2 {
                    return Err(LesionError::config(format!(
                        "sigmoid output needs exactly 2 classes, dataset has {}",
                        num_classes
                    )));
                }
                OutputMode::BinarySigmoid {
                    threshold: self.model.threshold,
                }
            }
        };
        mode.validate()?;
        Ok(mode)
    }

    /// Fusion model configuration for this run
    pub fn fusion_config(&self, output: OutputMode) -> FusionClassifierConfig {
        if self.model.tiny {
            FusionClassifierConfig::tiny(output)
        } else {
            let mut config = FusionClassifierConfig::standard(output);
            config.swin.image_size = self.data.image_size;
            config
        }
    }

    /// Single-branch model configuration for this run
    pub fn single_config(&self, output: OutputMode) -> SingleBranchClassifierConfig {
        let backbone = if self.model.tiny {
            ConvBackboneConfig::tiny(8)
        } else {
            ConvBackboneConfig::efficientnet_b0()
        };
        SingleBranchClassifierConfig::new(backbone)
            .with_output(output)
            .with_image_size(self.data.image_size)
            .with_hidden_units(self.model.hidden_units)
            .with_dropout(self.model.dropout)
            .with_l2(self.model.l2)
    }
}

/// Data locations and preprocessing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Root with one subdirectory per class
    pub train_dir: PathBuf,

    /// Separate validation root; when absent the training root is split
    pub val_dir: Option<PathBuf>,

    /// Held-out evaluation root
    pub test_dir: Option<PathBuf>,

    /// Fraction of the training root used for validation without `val_dir`
    pub validation_split: f64,

    /// Side length images are resized to
    pub image_size: usize,

    pub normalization: Normalization,

    pub batch_size: usize,

    /// Batches decoded ahead of the training step (0 = decode inline)
    pub prefetch: usize,

    /// Skip rate above which a warning is logged
    pub max_skip_fraction: f64,

    pub seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_dir: PathBuf::from("data/train"),
            val_dir: None,
            test_dir: None,
            validation_split: 0.2,
            image_size: FUSION_IMAGE_SIZE,
            normalization: Normalization::ImageNet,
            batch_size: crate::training::DEFAULT_BATCH_SIZE,
            prefetch: 2,
            max_skip_fraction: DEFAULT_MAX_SKIP_FRACTION,
            seed: 42,
        }
    }
}

impl DataConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(LesionError::config("batch_size must be greater than 0"));
        }
        if self.image_size == 0 {
            return Err(LesionError::config("image_size must be greater than 0"));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(LesionError::config(format!(
                "validation_split must be in [0, 1), got {}",
                self.validation_split
            )));
        }
        if !(0.0..=1.0).contains(&self.max_skip_fraction) {
            return Err(LesionError::config("max_skip_fraction must be in [0, 1]"));
        }
        Ok(())
    }
}

/// Which classifier to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// Convolutional + transformer branches
    #[default]
    Fusion,
    /// Frozen convolutional backbone + dense head
    SingleBranch,
}

/// Which head and loss to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    #[default]
    MultiClass,
    BinarySigmoid,
}

/// Model architecture settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub architecture: Architecture,
    pub output: OutputKind,

    /// Probability cut-off of the sigmoid output
    pub threshold: f64,

    /// Use the small test layouts instead of the full backbones
    pub tiny: bool,

    /// Hidden units of the single-branch head
    pub hidden_units: usize,

    /// Dropout of the single-branch head
    pub dropout: f64,

    /// L2 factor on the single-branch head weights
    pub l2: f64,

    /// Burn record with convolutional backbone weights
    pub pretrained_cnn: Option<PathBuf>,

    /// Burn record with transformer backbone weights
    pub pretrained_swin: Option<PathBuf>,

    /// When set, backbones are frozen except for their last `n` layers
    pub unfrozen_layers: Option<usize>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architecture: Architecture::Fusion,
            output: OutputKind::MultiClass,
            threshold: DEFAULT_THRESHOLD,
            tiny: false,
            hidden_units: 256,
            dropout: 0.5,
            l2: 0.0,
            pretrained_cnn: None,
            pretrained_swin: None,
            unfrozen_layers: None,
        }
    }
}

impl ModelConfig {
    /// Settings of the single-branch sigmoid variant
    pub fn single_branch() -> Self {
        Self {
            architecture: Architecture::SingleBranch,
            output: OutputKind::BinarySigmoid,
            ..Default::default()
        }
    }

    pub fn default_image_size(&self) -> usize {
        match self.architecture {
            Architecture::Fusion => FUSION_IMAGE_SIZE,
            Architecture::SingleBranch => SINGLE_IMAGE_SIZE,
        }
    }
}

/// Training hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,

    pub learning_rate: f64,

    /// Adam weight decay (0 disables it)
    pub weight_decay: f64,

    pub class_weighting: ClassWeighting,

    /// Epochs without validation-loss improvement before stopping
    pub early_stopping_patience: usize,

    pub early_stopping_min_delta: f64,

    /// Restore the best parameters when training ends
    pub restore_best: bool,

    pub plateau: ReduceLrOnPlateauConfig,

    /// Base epoch schedule, combined with plateau reductions
    pub lr_schedule: LrSchedule,

    /// Second phase with partially unfrozen backbones (0 skips it)
    pub fine_tune_epochs: usize,

    /// Backbone layers unfrozen for the fine-tuning phase
    pub fine_tune_layers: usize,

    /// Learning rate divisor of the fine-tuning phase
    pub fine_tune_lr_divisor: f64,

    /// Where `best`/`latest` checkpoints are written
    pub checkpoint_dir: Option<PathBuf>,

    /// Where reports and curves are written
    pub output_dir: PathBuf,

    /// Halve the batch size and retry an epoch that ran out of memory
    pub retry_on_oom: bool,

    pub min_batch_size: usize,

    pub max_retries: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: crate::training::DEFAULT_EPOCHS,
            learning_rate: crate::training::DEFAULT_LEARNING_RATE,
            weight_decay: 0.0,
            class_weighting: ClassWeighting::Balanced,
            early_stopping_patience: 5,
            early_stopping_min_delta: 0.0,
            restore_best: true,
            plateau: ReduceLrOnPlateauConfig::default(),
            lr_schedule: LrSchedule::Constant,
            fine_tune_epochs: 0,
            fine_tune_layers: crate::model::DEFAULT_UNFROZEN_LAYERS,
            fine_tune_lr_divisor: 10.0,
            checkpoint_dir: Some(PathBuf::from("output/checkpoints")),
            output_dir: PathBuf::from("output"),
            retry_on_oom: false,
            min_batch_size: 4,
            max_retries: 2,
        }
    }
}

impl TrainingConfig {
    /// Short run for debugging and tests
    pub fn debug() -> Self {
        Self {
            epochs: 2,
            early_stopping_patience: 2,
            checkpoint_dir: None,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(LesionError::config("epochs must be greater than 0"));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(LesionError::config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.weight_decay < 0.0 {
            return Err(LesionError::config("weight_decay must not be negative"));
        }
        if self.early_stopping_patience == 0 {
            return Err(LesionError::config("early_stopping_patience must be at least 1"));
        }
        if self.fine_tune_lr_divisor <= 0.0 {
            return Err(LesionError::config("fine_tune_lr_divisor must be positive"));
        }
        self.plateau.validate()?;
        self.class_weighting.validate()
    }
}
