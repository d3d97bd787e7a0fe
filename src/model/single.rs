//! Single-Branch Classifier
//!
//! A frozen convolutional backbone followed by a small dense head
//! (`Linear -> ReLU -> Dropout -> Linear`). Uses the sigmoid output by
//! default and supports an L2 penalty on the head weights.

use burn::{
    config::Config,
    module::Module,
    nn::{Dropout, DropoutConfig, Linear, LinearConfig, Relu},
    tensor::{backend::Backend, Tensor},
};

use super::{ConvBackbone, ConvBackboneConfig, FeatureExtractor, LesionClassifier, OutputMode};
use crate::utils::error::{LesionError, Result};

/// Configuration for the single-branch classifier
#[derive(Config, Debug)]
pub struct SingleBranchClassifierConfig {
    pub backbone: ConvBackboneConfig,

    #[config(default = "OutputMode::BinarySigmoid { threshold: 0.5 }")]
    pub output: OutputMode,

    #[config(default = "150")]
    pub image_size: usize,

    #[config(default = "256")]
    pub hidden_units: usize,

    #[config(default = "0.5")]
    pub dropout: f64,

    /// L2 penalty factor on the head weights (0 disables it)
    #[config(default = "0.0")]
    pub l2: f64,
}

impl SingleBranchClassifierConfig {
    pub fn validate(&self) -> Result<()> {
        self.output.validate()?;
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(LesionError::config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.l2 < 0.0 {
            return Err(LesionError::config("l2 factor must not be negative"));
        }
        if self.hidden_units == 0 || self.image_size == 0 {
            return Err(LesionError::config("hidden_units and image_size must be positive"));
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<SingleBranchClassifier<B>> {
        self.validate()?;
        SingleBranchClassifier::from_backbone(self.backbone.init(device), self, device)
    }
}

/// Frozen backbone + dense head
#[derive(Module, Debug)]
pub struct SingleBranchClassifier<B: Backend> {
    pub backbone: ConvBackbone<B>,
    pub hidden: Linear<B>,
    pub dropout: Dropout,
    pub output: Linear<B>,
    num_outputs: usize,
    threshold: f64,
    image_size: usize,
    l2: f64,
}

impl<B: Backend> SingleBranchClassifier<B> {
    pub fn from_backbone(
        backbone: ConvBackbone<B>,
        config: &SingleBranchClassifierConfig,
        device: &B::Device,
    ) -> Result<Self> {
        config.validate()?;
        let backbone = backbone.freeze();

        Ok(Self {
            hidden: LinearConfig::new(backbone.embedding_dim(), config.hidden_units).init(device),
            dropout: DropoutConfig::new(config.dropout).init(),
            output: LinearConfig::new(config.hidden_units, config.output.num_outputs())
                .init(device),
            backbone,
            num_outputs: config.output.num_outputs(),
            threshold: config.output.threshold(),
            image_size: config.image_size,
            l2: config.l2,
        })
    }

    /// Leave the last `n` backbone layers trainable
    pub fn unfreeze_last(mut self, n: usize) -> Self {
        self.backbone = self.backbone.unfreeze_last(n);
        self
    }
}

impl<B: Backend> LesionClassifier<B> for SingleBranchClassifier<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.backbone.embed(images);
        let x = Relu::new().forward(self.hidden.forward(x));
        let x = self.dropout.forward(x);
        self.output.forward(x)
    }

    fn output_mode(&self) -> OutputMode {
        OutputMode::from_head(self.num_outputs, self.threshold)
    }

    fn image_size(&self) -> usize {
        self.image_size
    }

    fn regularization(&self) -> Option<Tensor<B, 1>> {
        if self.l2 <= 0.0 {
            return None;
        }
        let hidden = self.hidden.weight.val().powf_scalar(2.0).sum();
        let output = self.output.weight.val().powf_scalar(2.0).sum();
        Some((hidden + output).mul_scalar(self.l2))
    }
}
