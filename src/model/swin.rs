//! Window-Attention Transformer Backbone
//!
//! A hierarchical vision transformer in the Swin layout: 4x4 patch
//! embedding, stages of pre-norm transformer blocks whose self-attention
//! is restricted to non-overlapping `window_size` x `window_size` windows,
//! and 2x2 patch merging between stages (halving resolution, doubling
//! channels). With the tiny layout at 224x224 input the final map is
//! 7x7x768, returned flattened in row-major, channels-last order.

use burn::{
    config::Config,
    module::Module,
    nn::{
        attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig},
        conv::{Conv2d, Conv2dConfig},
        LayerNorm, LayerNormConfig, Linear, LinearConfig,
    },
    tensor::{activation::gelu, backend::Backend, Tensor},
};

use super::{freeze_boundary, FeatureExtractor};
use crate::utils::error::{LesionError, Result};

/// Configuration for the transformer backbone
#[derive(Config, Debug)]
pub struct SwinBackboneConfig {
    /// Transformer blocks per stage
    pub depths: Vec<usize>,

    /// Attention heads per stage
    pub num_heads: Vec<usize>,

    #[config(default = "224")]
    pub image_size: usize,

    #[config(default = "4")]
    pub patch_size: usize,

    #[config(default = "7")]
    pub window_size: usize,

    /// Channels after patch embedding; doubled by every merge
    #[config(default = "96")]
    pub embed_dim: usize,

    #[config(default = "4")]
    pub mlp_ratio: usize,

    #[config(default = "3")]
    pub in_channels: usize,
}

impl SwinBackboneConfig {
    /// Swin-T layout: depths [2, 2, 6, 2], 96 channels, 7x7x768 output at 224
    pub fn swin_tiny() -> Self {
        Self::new(vec![2, 2, 6, 2], vec![3, 6, 12, 24])
    }

    /// Two small stages for tests and smoke runs
    pub fn tiny(image_size: usize) -> Self {
        Self::new(vec![1, 1], vec![1, 2])
            .with_image_size(image_size)
            .with_patch_size(2)
            .with_window_size(2)
            .with_embed_dim(8)
            .with_mlp_ratio(2)
    }

    pub fn num_stages(&self) -> usize {
        self.depths.len()
    }

    /// Channels of the final feature map
    pub fn output_channels(&self) -> usize {
        self.embed_dim << self.num_stages().saturating_sub(1)
    }

    /// Side length of the final feature map
    pub fn output_grid(&self) -> usize {
        self.image_size / (self.patch_size << self.num_stages().saturating_sub(1))
    }

    /// Width of the flattened final feature map
    pub fn feature_map_len(&self) -> usize {
        self.output_grid() * self.output_grid() * self.output_channels()
    }

    /// Check that every stage tiles into whole windows and heads divide channels
    pub fn validate(&self) -> Result<()> {
        if self.depths.is_empty() || self.depths.len() != self.num_heads.len() {
            return Err(LesionError::config(format!(
                "depths {:?} and num_heads {:?} must be non-empty and of equal length",
                self.depths, self.num_heads
            )));
        }
        if self.patch_size == 0 || self.window_size == 0 {
            return Err(LesionError::config("patch_size and window_size must be positive"));
        }

        let divisor = self.patch_size * self.window_size * (1 << (self.num_stages() - 1));
        if self.image_size == 0 || self.image_size % divisor != 0 {
            return Err(LesionError::config(format!(
                "image size {} is not divisible by patch_size * window_size * 2^(stages-1) = {}",
                self.image_size, divisor
            )));
        }

        for (stage, &heads) in self.num_heads.iter().enumerate() {
            let channels = self.embed_dim << stage;
            if heads == 0 || channels % heads != 0 {
                return Err(LesionError::config(format!(
                    "stage {} has {} channels, not divisible into {} heads",
                    stage, channels, heads
                )));
            }
        }

        Ok(())
    }

    /// Initialize a backbone with random weights
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<SwinBackbone<B>> {
        self.validate()?;

        let patch_embed = PatchEmbed {
            proj: Conv2dConfig::new(
                [self.in_channels, self.embed_dim],
                [self.patch_size, self.patch_size],
            )
            .with_stride([self.patch_size, self.patch_size])
            .init(device),
            norm: LayerNormConfig::new(self.embed_dim).init(device),
        };

        let stages = self
            .depths
            .iter()
            .zip(&self.num_heads)
            .enumerate()
            .map(|(stage, (&depth, &heads))| {
                let channels = self.embed_dim << stage;
                let merge = (stage > 0).then(|| PatchMerging::new(channels / 2, device));
                let blocks = (0..depth)
                    .map(|_| {
                        WindowBlock::new(channels, heads, self.window_size, self.mlp_ratio, device)
                    })
                    .collect();
                SwinStage { merge, blocks }
            })
            .collect();

        Ok(SwinBackbone {
            patch_embed,
            stages,
            norm: LayerNormConfig::new(self.output_channels()).init(device),
            input_grid: self.image_size / self.patch_size,
            output_channels: self.output_channels(),
            feature_map_len: self.feature_map_len(),
            frozen_layers: 0,
        })
    }
}

/// Non-overlapping patch projection
#[derive(Module, Debug)]
pub struct PatchEmbed<B: Backend> {
    pub proj: Conv2d<B>,
    pub norm: LayerNorm<B>,
}

impl<B: Backend> PatchEmbed<B> {
    /// `[N, 3, H, W]` -> tokens `[N, (H/p)*(W/p), C]`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 3> {
        let x = self.proj.forward(images);
        let [batch_size, channels, height, width] = x.dims();
        let x = x
            .reshape([batch_size, channels, height * width])
            .swap_dims(1, 2);
        self.norm.forward(x)
    }
}

/// 2x2 neighbourhood concatenation followed by a linear reduction
#[derive(Module, Debug)]
pub struct PatchMerging<B: Backend> {
    pub norm: LayerNorm<B>,
    pub reduction: Linear<B>,
}

impl<B: Backend> PatchMerging<B> {
    pub fn new(in_channels: usize, device: &B::Device) -> Self {
        Self {
            norm: LayerNormConfig::new(4 * in_channels).init(device),
            reduction: LinearConfig::new(4 * in_channels, 2 * in_channels)
                .with_bias(false)
                .init(device),
        }
    }

    /// Tokens on a `grid` x `grid` map -> tokens on a `grid/2` x `grid/2` map
    pub fn forward(&self, x: Tensor<B, 3>, grid: usize) -> Tensor<B, 3> {
        let [batch_size, _, channels] = x.dims();
        let half = grid / 2;
        let x = x
            .reshape([batch_size, half, 2, half, 2, channels])
            .swap_dims(2, 3)
            .reshape([batch_size, half * half, 4 * channels]);
        self.reduction.forward(self.norm.forward(x))
    }
}

/// Pre-norm transformer block with window-local self-attention
#[derive(Module, Debug)]
pub struct WindowBlock<B: Backend> {
    pub norm1: LayerNorm<B>,
    pub attn: MultiHeadAttention<B>,
    pub norm2: LayerNorm<B>,
    pub fc1: Linear<B>,
    pub fc2: Linear<B>,
    window_size: usize,
}

impl<B: Backend> WindowBlock<B> {
    pub fn new(
        channels: usize,
        num_heads: usize,
        window_size: usize,
        mlp_ratio: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            norm1: LayerNormConfig::new(channels).init(device),
            attn: MultiHeadAttentionConfig::new(channels, num_heads)
                .with_dropout(0.0)
                .init(device),
            norm2: LayerNormConfig::new(channels).init(device),
            fc1: LinearConfig::new(channels, channels * mlp_ratio).init(device),
            fc2: LinearConfig::new(channels * mlp_ratio, channels).init(device),
            window_size,
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, grid: usize) -> Tensor<B, 3> {
        let [batch_size, tokens, channels] = x.dims();
        let ws = self.window_size;
        let windows_per_side = grid / ws;

        // [N, L, C] -> [N * nW, ws * ws, C]
        let windows = self
            .norm1
            .forward(x.clone())
            .reshape([batch_size, windows_per_side, ws, windows_per_side, ws, channels])
            .swap_dims(2, 3)
            .reshape([
                batch_size * windows_per_side * windows_per_side,
                ws * ws,
                channels,
            ]);

        let attended = self.attn.forward(MhaInput::self_attn(windows)).context;

        let attended = attended
            .reshape([batch_size, windows_per_side, windows_per_side, ws, ws, channels])
            .swap_dims(2, 3)
            .reshape([batch_size, tokens, channels]);

        let x = x + attended;
        let hidden = gelu(self.fc1.forward(self.norm2.forward(x.clone())));
        x + self.fc2.forward(hidden)
    }
}

/// Optional patch merging followed by window blocks
#[derive(Module, Debug)]
pub struct SwinStage<B: Backend> {
    pub merge: Option<PatchMerging<B>>,
    pub blocks: Vec<WindowBlock<B>>,
}

/// Transformer feature extractor producing the flattened final map
#[derive(Module, Debug)]
pub struct SwinBackbone<B: Backend> {
    pub patch_embed: PatchEmbed<B>,
    pub stages: Vec<SwinStage<B>>,
    pub norm: LayerNorm<B>,
    input_grid: usize,
    output_channels: usize,
    feature_map_len: usize,
    /// Number of leading layers (patch embed, merges, blocks, final norm) excluded from training
    frozen_layers: usize,
}

impl<B: Backend> SwinBackbone<B> {
    /// Layers in forward order: patch embedding, each merge and block, final norm
    pub fn num_layers(&self) -> usize {
        let staged: usize = self
            .stages
            .iter()
            .map(|s| s.blocks.len() + usize::from(s.merge.is_some()))
            .sum();
        staged + 2
    }

    pub fn frozen_layers(&self) -> usize {
        self.frozen_layers
    }

    pub fn output_channels(&self) -> usize {
        self.output_channels
    }

    /// Width of the flattened final map returned by `embed`
    pub fn feature_map_len(&self) -> usize {
        self.feature_map_len
    }

    /// Final tokens `[N, grid * grid, output_channels]`
    pub fn forward_tokens(&self, images: Tensor<B, 4>) -> Tensor<B, 3> {
        let frozen = self.frozen_layers;
        let mut layer = 0;
        let mut grid = self.input_grid;

        let mut x = freeze_boundary(self.patch_embed.forward(images), layer, frozen);
        for stage in &self.stages {
            if let Some(merge) = &stage.merge {
                layer += 1;
                x = freeze_boundary(merge.forward(x, grid), layer, frozen);
                grid /= 2;
            }
            for block in &stage.blocks {
                layer += 1;
                x = freeze_boundary(block.forward(x, grid), layer, frozen);
            }
        }

        freeze_boundary(self.norm.forward(x), layer + 1, frozen)
    }
}

impl<B: Backend> FeatureExtractor<B> for SwinBackbone<B> {
    fn embed(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.forward_tokens(images);
        let [batch_size, tokens, channels] = x.dims();
        x.reshape([batch_size, tokens * channels])
    }

    fn embedding_dim(&self) -> usize {
        self.feature_map_len
    }

    fn num_layers(&self) -> usize {
        SwinBackbone::num_layers(self)
    }

    fn with_frozen_layers(mut self, frozen: usize) -> Self {
        self.frozen_layers = frozen.min(SwinBackbone::num_layers(&self));
        self
    }
}
