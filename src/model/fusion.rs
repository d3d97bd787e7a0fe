//! Two-Branch Fusion Classifier
//!
//! Concatenates the convolutional embedding with a linear projection of
//! the flattened transformer map and maps the fused vector to logits:
//!
//! ```text
//! images ─┬─ ConvBackbone ─────────────────── [N, 1280] ─┐
//!         └─ SwinBackbone ─ swin_fc (→768) ── [N, 768] ──┴─ concat [N, 2048] ─ fc ─ logits
//! ```
//!
//! The head has no activation; the loss and the prediction rule depend on
//! the `OutputMode`.

use burn::{
    config::Config,
    module::Module,
    nn::{Linear, LinearConfig},
    tensor::{activation, backend::Backend, Int, Tensor},
};
use serde::{Deserialize, Serialize};

use super::{
    ConvBackbone, ConvBackboneConfig, FeatureExtractor, LesionClassifier, SwinBackbone,
    SwinBackboneConfig,
};
use crate::utils::error::{LesionError, Result};
use crate::{FUSION_IMAGE_SIZE, SWIN_EMBED_DIM};

/// Default probability above which the sigmoid output predicts class 1
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// How logits are turned into losses and predictions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputMode {
    /// One logit per class, softmax cross-entropy, argmax prediction
    MultiClass { num_classes: usize },
    /// One logit, binary cross-entropy on the sigmoid, thresholded prediction
    BinarySigmoid { threshold: f64 },
}

impl Default for OutputMode {
    fn default() -> Self {
        Self::MultiClass { num_classes: 2 }
    }
}

impl OutputMode {
    pub fn multi_class(num_classes: usize) -> Self {
        Self::MultiClass { num_classes }
    }

    pub fn binary() -> Self {
        Self::BinarySigmoid {
            threshold: DEFAULT_THRESHOLD,
        }
    }

    /// Rebuild from a head width and threshold
    pub fn from_head(num_outputs: usize, threshold: f64) -> Self {
        if num_outputs == 1 {
            Self::BinarySigmoid { threshold }
        } else {
            Self::MultiClass {
                num_classes: num_outputs,
            }
        }
    }

    /// Width of the classifier head
    pub fn num_outputs(&self) -> usize {
        match self {
            Self::MultiClass { num_classes } => *num_classes,
            Self::BinarySigmoid { .. } => 1,
        }
    }

    /// Number of classes predictions range over
    pub fn num_classes(&self) -> usize {
        match self {
            Self::MultiClass { num_classes } => *num_classes,
            Self::BinarySigmoid { .. } => 2,
        }
    }

    pub fn threshold(&self) -> f64 {
        match self {
            Self::MultiClass { .. } => DEFAULT_THRESHOLD,
            Self::BinarySigmoid { threshold } => *threshold,
        }
    }

    pub fn is_sigmoid(&self) -> bool {
        matches!(self, Self::BinarySigmoid { .. })
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::MultiClass { num_classes } if *num_classes < 2 => Err(LesionError::config(
                format!("multi-class output needs at least 2 classes, got {}", num_classes),
            )),
            Self::BinarySigmoid { threshold } if !(*threshold > 0.0 && *threshold < 1.0) => {
                Err(LesionError::config(format!(
                    "sigmoid threshold must lie in (0, 1), got {}",
                    threshold
                )))
            }
            _ => Ok(()),
        }
    }

    /// Predicted class per row of `logits`
    pub fn predict<B: Backend>(&self, logits: Tensor<B, 2>) -> Tensor<B, 1, Int> {
        let [batch_size, _] = logits.dims();
        match self {
            Self::MultiClass { .. } => logits.argmax(1).reshape([batch_size]),
            Self::BinarySigmoid { threshold } => activation::sigmoid(logits)
                .greater_elem(*threshold)
                .int()
                .reshape([batch_size]),
        }
    }

    /// Class probabilities `[N, num_classes]`
    pub fn probabilities<B: Backend>(&self, logits: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            Self::MultiClass { .. } => activation::softmax(logits, 1),
            Self::BinarySigmoid { .. } => {
                let positive = activation::sigmoid(logits);
                let negative = positive.ones_like() - positive.clone();
                Tensor::cat(vec![negative, positive], 1)
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::MultiClass { num_classes } => format!("multi-class ({} logits)", num_classes),
            Self::BinarySigmoid { threshold } => format!("sigmoid (threshold {})", threshold),
        }
    }
}

/// Configuration for the fusion classifier
#[derive(Config, Debug)]
pub struct FusionClassifierConfig {
    pub cnn: ConvBackboneConfig,
    pub swin: SwinBackboneConfig,
    pub output: OutputMode,

    /// Width of the projected transformer features
    #[config(default = "768")]
    pub swin_projection_dim: usize,

    /// Width of the concatenated vector fed to the head
    #[config(default = "2048")]
    pub fusion_dim: usize,
}

impl FusionClassifierConfig {
    /// B0 + Swin-T at 224x224
    pub fn standard(output: OutputMode) -> Self {
        Self::new(
            ConvBackboneConfig::efficientnet_b0(),
            SwinBackboneConfig::swin_tiny().with_image_size(FUSION_IMAGE_SIZE),
            output,
        )
        .with_swin_projection_dim(SWIN_EMBED_DIM)
    }

    /// Small branches at 16x16, for tests and smoke runs
    pub fn tiny(output: OutputMode) -> Self {
        Self::new(
            ConvBackboneConfig::tiny(12),
            SwinBackboneConfig::tiny(16),
            output,
        )
        .with_swin_projection_dim(4)
        .with_fusion_dim(16)
    }

    pub fn image_size(&self) -> usize {
        self.swin.image_size
    }

    pub fn validate(&self) -> Result<()> {
        self.output.validate()?;
        self.swin.validate()?;
        check_fusion_width(self.cnn.embedding_dim, self.swin_projection_dim, self.fusion_dim)
    }

    /// Initialize both branches with random weights
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<FusionClassifier<B>> {
        self.validate()?;
        let cnn = self.cnn.init(device);
        let swin = self.swin.init(device)?;
        FusionClassifier::from_backbones(cnn, swin, self, device)
    }
}

fn check_fusion_width(cnn_dim: usize, swin_dim: usize, fusion_dim: usize) -> Result<()> {
    if cnn_dim + swin_dim != fusion_dim {
        return Err(LesionError::config(format!(
            "fusion width {} does not match cnn embedding {} + projected swin features {}",
            fusion_dim, cnn_dim, swin_dim
        )));
    }
    Ok(())
}

/// Two-branch classifier over concatenated embeddings
#[derive(Module, Debug)]
pub struct FusionClassifier<B: Backend> {
    pub cnn: ConvBackbone<B>,
    pub swin: SwinBackbone<B>,
    pub swin_fc: Linear<B>,
    pub fc: Linear<B>,
    num_outputs: usize,
    threshold: f64,
    image_size: usize,
}

impl<B: Backend> FusionClassifier<B> {
    /// Assemble from existing (possibly pretrained) backbones
    pub fn from_backbones(
        cnn: ConvBackbone<B>,
        swin: SwinBackbone<B>,
        config: &FusionClassifierConfig,
        device: &B::Device,
    ) -> Result<Self> {
        config.output.validate()?;
        check_fusion_width(cnn.embedding_dim(), config.swin_projection_dim, config.fusion_dim)?;

        let swin_fc = LinearConfig::new(swin.embedding_dim(), config.swin_projection_dim).init(device);
        let fc = LinearConfig::new(config.fusion_dim, config.output.num_outputs()).init(device);

        Ok(Self {
            cnn,
            swin,
            swin_fc,
            fc,
            num_outputs: config.output.num_outputs(),
            threshold: config.output.threshold(),
            image_size: config.image_size(),
        })
    }

    /// Fused feature vector `[N, fusion_dim]`
    pub fn fused_features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let cnn_features = self.cnn.embed(images.clone());
        let swin_features = self.swin_fc.forward(self.swin.embed(images));
        Tensor::cat(vec![cnn_features, swin_features], 1)
    }

    /// Freeze both backbones entirely
    pub fn freeze_backbones(mut self) -> Self {
        self.cnn = self.cnn.freeze();
        self.swin = self.swin.freeze();
        self
    }

    /// Leave the last `n` layers of each backbone trainable
    pub fn unfreeze_last(mut self, n: usize) -> Self {
        self.cnn = self.cnn.unfreeze_last(n);
        self.swin = self.swin.unfreeze_last(n);
        self
    }
}

impl<B: Backend> LesionClassifier<B> for FusionClassifier<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.fc.forward(self.fused_features(images))
    }

    fn output_mode(&self) -> OutputMode {
        OutputMode::from_head(self.num_outputs, self.threshold)
    }

    fn image_size(&self) -> usize {
        self.image_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_standard_dimensions() {
        let config = FusionClassifierConfig::standard(OutputMode::multi_class(2));
        assert!(config.validate().is_ok());
        assert_eq!(config.cnn.embedding_dim, 1280);
        assert_eq!(config.swin.feature_map_len(), 7 * 7 * 768);
        assert_eq!(config.image_size(), 224);
    }

    #[test]
    fn test_forward_shapes_per_mode() {
        let device = Default::default();
        let images = Tensor::<TestBackend, 4>::zeros([3, 3, 16, 16], &device);

        let multi = FusionClassifierConfig::tiny(OutputMode::multi_class(2))
            .init::<TestBackend>(&device)
            .unwrap();
        assert_eq!(multi.forward(images.clone()).dims(), [3, 2]);
        assert_eq!(multi.output_mode(), OutputMode::multi_class(2));

        let sigmoid = FusionClassifierConfig::tiny(OutputMode::binary())
            .init::<TestBackend>(&device)
            .unwrap();
        assert_eq!(sigmoid.forward(images).dims(), [3, 1]);
        assert_eq!(sigmoid.output_mode(), OutputMode::binary());
    }

    #[test]
    fn test_width_mismatch_rejected() {
        let device = Default::default();
        let config = FusionClassifierConfig::tiny(OutputMode::multi_class(2)).with_fusion_dim(20);
        let err = config.init::<TestBackend>(&device).unwrap_err();
        assert!(matches!(err, LesionError::Configuration(_)));
    }

    #[test]
    fn test_single_class_rejected() {
        let config = FusionClassifierConfig::tiny(OutputMode::multi_class(1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_prediction_rules() {
        let device = Default::default();

        let logits = Tensor::<TestBackend, 2>::from_floats([[0.1, 2.0], [3.0, -1.0]], &device);
        let preds = OutputMode::multi_class(2).predict(logits);
        assert_eq!(preds.into_data().iter::<i64>().collect::<Vec<_>>(), vec![1, 0]);

        // sigmoid(0) = 0.5 is not above the threshold
        let logits = Tensor::<TestBackend, 2>::from_floats([[0.0], [0.3], [-2.0]], &device);
        let preds = OutputMode::binary().predict(logits.clone());
        assert_eq!(preds.into_data().iter::<i64>().collect::<Vec<_>>(), vec![0, 1, 0]);

        let probs = OutputMode::binary().probabilities(logits);
        assert_eq!(probs.dims(), [3, 2]);
        let values = probs.into_data().to_vec::<f32>().unwrap();
        assert!((values[0] - 0.5).abs() < 1e-6);
        assert!((values[0] + values[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_output_mode_serde() {
        let json = serde_json::to_string(&OutputMode::binary()).unwrap();
        assert!(json.contains("binary_sigmoid"));
        let back: OutputMode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, OutputMode::binary());
    }
}
