//! Model module: feature extractors and classifiers built with Burn
//!
//! This module provides:
//! - A convolutional backbone (`cnn`) producing a 1280-wide embedding
//! - A window-attention transformer backbone (`swin`) producing a 7x7x768 map
//! - The two-branch `FusionClassifier` and the `SingleBranchClassifier`
//! - The serde/TOML run configuration (`config`)
//!
//! ## Freezing
//!
//! Backbones are frozen layer-wise. A frozen prefix of `k` layers is cut
//! from the autodiff graph after its last layer, so no gradients reach
//! those parameters and the optimizer leaves them untouched.

pub mod cnn;
pub mod config;
pub mod fusion;
pub mod single;
pub mod swin;

use std::path::Path;

use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::{backend::Backend, Tensor};
use tracing::info;

use crate::utils::error::{LesionError, Result};

pub use cnn::{ConvBackbone, ConvBackboneConfig};
pub use config::RunConfig;
pub use fusion::{FusionClassifier, FusionClassifierConfig, OutputMode};
pub use single::{SingleBranchClassifier, SingleBranchClassifierConfig};
pub use swin::{SwinBackbone, SwinBackboneConfig};

/// Number of trailing backbone layers left trainable when fine-tuning
pub const DEFAULT_UNFROZEN_LAYERS: usize = 4;

/// A backbone mapping images `[N, 3, H, W]` to embeddings `[N, D]`
pub trait FeatureExtractor<B: Backend>: Module<B> + Sized {
    fn embed(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Width `D` of the embedding returned by `embed`
    fn embedding_dim(&self) -> usize;

    /// Number of freezable layers, in forward order
    fn num_layers(&self) -> usize;

    /// Exclude the first `frozen` layers from training
    fn with_frozen_layers(self, frozen: usize) -> Self;

    fn freeze(self) -> Self {
        let layers = self.num_layers();
        self.with_frozen_layers(layers)
    }

    /// Keep only the last `n` layers trainable
    fn unfreeze_last(self, n: usize) -> Self {
        let frozen = self.num_layers().saturating_sub(n);
        self.with_frozen_layers(frozen)
    }
}

/// A model mapping images to logits under a fixed output mode
pub trait LesionClassifier<B: Backend> {
    /// Raw logits `[N, out]`, no activation applied
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    fn output_mode(&self) -> OutputMode;

    /// Side length of the square input images
    fn image_size(&self) -> usize;

    /// Extra loss term added during training (weight penalties)
    fn regularization(&self) -> Option<Tensor<B, 1>> {
        None
    }
}

/// Cut the autodiff graph after the last frozen layer
pub(crate) fn freeze_boundary<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    layer: usize,
    frozen_layers: usize,
) -> Tensor<B, D> {
    if layer + 1 == frozen_layers {
        x.detach()
    } else {
        x
    }
}

/// Load backbone weights from a Burn record file
///
/// Without a path the module keeps its random initialization.
pub fn load_pretrained<B: Backend, M: Module<B>>(
    module: M,
    path: Option<&Path>,
    device: &B::Device,
) -> Result<M> {
    let Some(path) = path else {
        info!("No pretrained weights given, using random initialization");
        return Ok(module);
    };

    if !path.exists() {
        return Err(LesionError::config(format!(
            "pretrained weights not found: {:?}",
            path
        )));
    }

    info!("Loading pretrained weights from {:?}", path);
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    module
        .load_file(path.to_path_buf(), &recorder, device)
        .map_err(|e| LesionError::Checkpoint(format!("{:?}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::record::Recorder;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    #[test]
    fn test_load_pretrained_round_trip() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let source = ConvBackboneConfig::tiny(8).init::<TestBackend>(&device);

        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let path = dir.path().join("cnn");
        recorder
            .record(source.clone().into_record(), path.clone())
            .unwrap();

        let target = ConvBackboneConfig::tiny(8).init::<TestBackend>(&device);
        let loaded = load_pretrained(target, Some(&path.with_extension("mpk")), &device).unwrap();

        let images = Tensor::<TestBackend, 4>::ones([1, 3, 8, 8], &device);
        let expected = source.embed(images.clone()).into_data().to_vec::<f32>().unwrap();
        let actual = loaded.embed(images).into_data().to_vec::<f32>().unwrap();
        for (a, e) in actual.iter().zip(&expected) {
            assert!((a - e).abs() < 1e-5);
        }
    }

    #[test]
    fn test_load_pretrained_missing_file() {
        let device = Default::default();
        let module = ConvBackboneConfig::tiny(8).init::<TestBackend>(&device);
        let err = load_pretrained(module, Some(Path::new("/nonexistent/weights.mpk")), &device)
            .unwrap_err();
        assert!(matches!(err, LesionError::Configuration(_)));
    }
}
