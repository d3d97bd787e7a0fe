//! Convolutional Backbone
//!
//! EfficientNet-style feature extractor built from MBConv blocks
//! (expand 1x1, depthwise 3x3, project 1x1) followed by a 1x1 head
//! convolution and global average pooling. The default configuration
//! mirrors the B0 stage layout and yields a 1280-wide embedding.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    tensor::{activation::silu, backend::Backend, Tensor},
};

use super::{freeze_boundary, FeatureExtractor};
use crate::CNN_EMBED_DIM;

/// Configuration for the convolutional backbone
#[derive(Config, Debug)]
pub struct ConvBackboneConfig {
    /// Channels produced by the stem convolution
    pub stem_channels: usize,

    /// One entry per stage: `[out_channels, num_blocks, stride, expand_ratio]`
    pub stages: Vec<[usize; 4]>,

    /// Width of the head convolution, which is also the embedding width
    #[config(default = "1280")]
    pub embedding_dim: usize,

    #[config(default = "3")]
    pub in_channels: usize,
}

impl ConvBackboneConfig {
    /// B0 stage layout with a 1280-wide head
    pub fn efficientnet_b0() -> Self {
        Self::new(
            32,
            vec![
                [16, 1, 1, 1],
                [24, 2, 2, 6],
                [40, 2, 2, 6],
                [80, 3, 2, 6],
                [112, 3, 1, 6],
                [192, 4, 2, 6],
                [320, 1, 1, 6],
            ],
        )
        .with_embedding_dim(CNN_EMBED_DIM)
    }

    /// Small layout for tests and smoke runs
    pub fn tiny(embedding_dim: usize) -> Self {
        Self::new(8, vec![[8, 1, 1, 1], [16, 1, 2, 2]]).with_embedding_dim(embedding_dim)
    }

    /// Initialize a backbone with random weights
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBackbone<B> {
        let stem = ConvBnAct::new(self.in_channels, self.stem_channels, 3, 2, 1, device);

        let mut blocks = Vec::new();
        let mut in_channels = self.stem_channels;
        for &[out_channels, num_blocks, stride, expand_ratio] in &self.stages {
            for i in 0..num_blocks {
                let stride = if i == 0 { stride } else { 1 };
                blocks.push(MbConvBlock::new(
                    in_channels,
                    out_channels,
                    stride,
                    expand_ratio,
                    device,
                ));
                in_channels = out_channels;
            }
        }

        let head = ConvBnAct::new(in_channels, self.embedding_dim, 1, 1, 1, device);

        ConvBackbone {
            stem,
            blocks,
            head,
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            embedding_dim: self.embedding_dim,
            frozen_layers: 0,
        }
    }
}

/// Conv2d + BatchNorm + SiLU
#[derive(Module, Debug)]
pub struct ConvBnAct<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B>,
}

impl<B: Backend> ConvBnAct<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        let padding = kernel_size / 2;
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(groups)
            .with_bias(false)
            .init(device);

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        silu(self.bn.forward(self.conv.forward(x)))
    }
}

/// Inverted residual block
#[derive(Module, Debug)]
pub struct MbConvBlock<B: Backend> {
    pub expand: Option<ConvBnAct<B>>,
    pub depthwise: ConvBnAct<B>,
    pub project: Conv2d<B>,
    pub project_bn: BatchNorm<B>,
    residual: bool,
}

impl<B: Backend> MbConvBlock<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        expand_ratio: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expand_ratio.max(1);
        let expand = (expand_ratio > 1).then(|| ConvBnAct::new(in_channels, hidden, 1, 1, 1, device));
        let depthwise = ConvBnAct::new(hidden, hidden, 3, stride, hidden, device);
        let project = Conv2dConfig::new([hidden, out_channels], [1, 1])
            .with_bias(false)
            .init(device);

        Self {
            expand,
            depthwise,
            project,
            project_bn: BatchNormConfig::new(out_channels).init(device),
            residual: stride == 1 && in_channels == out_channels,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => expand.forward(input.clone()),
            None => input.clone(),
        };
        let x = self.depthwise.forward(x);
        let x = self.project_bn.forward(self.project.forward(x));

        if self.residual {
            x + input
        } else {
            x
        }
    }
}

/// Convolutional feature extractor producing `[N, embedding_dim]`
#[derive(Module, Debug)]
pub struct ConvBackbone<B: Backend> {
    pub stem: ConvBnAct<B>,
    pub blocks: Vec<MbConvBlock<B>>,
    pub head: ConvBnAct<B>,
    pub global_pool: AdaptiveAvgPool2d,
    embedding_dim: usize,
    /// Number of leading layers (stem, blocks, head) excluded from training
    frozen_layers: usize,
}

impl<B: Backend> ConvBackbone<B> {
    /// Layers in forward order: stem, every MBConv block, head
    pub fn num_layers(&self) -> usize {
        self.blocks.len() + 2
    }

    pub fn frozen_layers(&self) -> usize {
        self.frozen_layers
    }

    /// Feature map before pooling, `[N, embedding_dim, h, w]`
    pub fn forward_features(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = freeze_boundary(self.stem.forward(images), 0, self.frozen_layers);
        for (i, block) in self.blocks.iter().enumerate() {
            x = freeze_boundary(block.forward(x), i + 1, self.frozen_layers);
        }
        freeze_boundary(self.head.forward(x), self.blocks.len() + 1, self.frozen_layers)
    }
}

impl<B: Backend> FeatureExtractor<B> for ConvBackbone<B> {
    fn embed(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.global_pool.forward(self.forward_features(images));
        let [batch_size, channels, _, _] = x.dims();
        x.reshape([batch_size, channels])
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    fn num_layers(&self) -> usize {
        ConvBackbone::num_layers(self)
    }

    fn with_frozen_layers(mut self, frozen: usize) -> Self {
        self.frozen_layers = frozen.min(ConvBackbone::num_layers(&self));
        self
    }
}
