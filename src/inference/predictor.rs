//! Inference Predictor Module
//!
//! Restores a classifier from a checkpoint and runs it on image files.
//! The checkpoint sidecar records the model settings, output mode, image
//! size and class names, so a checkpoint is usable without the config of
//! the run that produced it.

use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dataset::burn_dataset::decode_image;
use crate::dataset::{
    AugmentationConfig, Augmenter, ClassMapping, LesionBatch, LesionBatcher, LesionBurnDataset,
    LesionDataset, LesionItem, Normalization,
};
use crate::inference::evaluator::{EvaluationResult, Evaluator};
use crate::model::config::{Architecture, RunConfig};
use crate::model::{FusionClassifier, LesionClassifier, OutputMode, SingleBranchClassifier};
use crate::training::checkpoint::{load_checkpoint, load_metadata, CheckpointMetadata};
use crate::utils::error::{LesionError, Result};

/// A classifier restored from a checkpoint
#[derive(Debug)]
pub enum LoadedModel<B: Backend> {
    Fusion(FusionClassifier<B>),
    SingleBranch(SingleBranchClassifier<B>),
}

impl<B: Backend> LoadedModel<B> {
    /// Rebuild the architecture described by the sidecar and load its weights
    pub fn load(checkpoint: &Path, device: &B::Device) -> Result<(Self, CheckpointMetadata)> {
        let metadata = load_metadata(checkpoint)?;

        let mut config = RunConfig::default();
        config.model = metadata.model.clone();
        config.data.image_size = metadata.image_size;
        let output = metadata.output_mode;

        let model = match metadata.architecture() {
            Architecture::Fusion => {
                let model = config.fusion_config(output).init::<B>(device)?;
                Self::Fusion(load_checkpoint::<B, _>(model, checkpoint, device)?)
            }
            Architecture::SingleBranch => {
                let model = config.single_config(output).init::<B>(device)?;
                Self::SingleBranch(load_checkpoint::<B, _>(model, checkpoint, device)?)
            }
        };

        if model.image_size() != metadata.image_size {
            return Err(LesionError::Checkpoint(format!(
                "checkpoint records {}px images but its model takes {}px",
                metadata.image_size,
                model.image_size()
            )));
        }

        info!(
            "Loaded {:?} model from {:?} (epoch {}, {})",
            metadata.architecture(),
            checkpoint,
            metadata.epoch,
            output.describe()
        );
        Ok((model, metadata))
    }
}

impl<B: Backend> LesionClassifier<B> for LoadedModel<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            Self::Fusion(model) => model.forward(images),
            Self::SingleBranch(model) => model.forward(images),
        }
    }

    fn output_mode(&self) -> OutputMode {
        match self {
            Self::Fusion(model) => model.output_mode(),
            Self::SingleBranch(model) => model.output_mode(),
        }
    }

    fn image_size(&self) -> usize {
        match self {
            Self::Fusion(model) => model.image_size(),
            Self::SingleBranch(model) => model.image_size(),
        }
    }
}

/// Result of a single prediction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    /// Path to the input image (if applicable)
    pub image_path: Option<PathBuf>,

    /// Predicted class index
    pub predicted_class: usize,

    /// Predicted class name
    pub class_name: String,

    /// Probability of the predicted class
    pub confidence: f32,

    /// Probability per class
    pub probabilities: Vec<f32>,

    /// Share of the batch forward time, in milliseconds
    pub inference_time_ms: f64,
}

impl PredictionResult {
    /// Pretty print the prediction result
    pub fn display(&self) -> String {
        let mut output = String::new();

        if let Some(path) = &self.image_path {
            output.push_str(&format!("Image: {:?}\n", path));
        }

        output.push_str(&format!(
            "Prediction: {} (class {})\n",
            self.class_name, self.predicted_class
        ));
        output.push_str(&format!("Confidence: {:.2}%\n", self.confidence * 100.0));
        output.push_str(&format!("Inference time: {:.2} ms\n", self.inference_time_ms));
        output
    }
}

/// Runs a classifier on image files
pub struct Predictor<B: Backend, M: LesionClassifier<B>> {
    model: M,
    class_names: Vec<String>,
    normalization: Normalization,
    batch_size: usize,
    device: B::Device,
}

impl<B: Backend> Predictor<B, LoadedModel<B>> {
    /// Predictor backed by a checkpoint
    pub fn from_checkpoint(checkpoint: &Path, device: &B::Device) -> Result<Self> {
        let (model, metadata) = LoadedModel::load(checkpoint, device)?;
        Ok(Self::new(model, metadata.class_names, device.clone()))
    }
}

impl<B: Backend, M: LesionClassifier<B>> Predictor<B, M> {
    pub fn new(model: M, class_names: Vec<String>, device: B::Device) -> Self {
        Self {
            model,
            class_names,
            normalization: Normalization::default(),
            batch_size: 16,
            device,
        }
    }

    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    /// Configure batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    /// Load, resize and rescale an image (CHW, values in [0, 1])
    pub fn load_and_preprocess(&self, path: &Path) -> Result<Vec<f32>> {
        let image = decode_image(&path.to_path_buf())?;
        let augmenter = Augmenter::no_augmentation(self.model.image_size() as u32);
        Ok(augmenter.preprocess(&image, None))
    }

    /// Predict on an image from a file path
    pub fn predict_file(&self, path: &Path) -> Result<PredictionResult> {
        let mut results = self.predict_batch(&[path.to_path_buf()])?;
        results
            .pop()
            .ok_or_else(|| LesionError::config("no prediction produced"))
    }

    /// Predict on multiple images, `batch_size` at a time
    ///
    /// Any unreadable file fails the whole call.
    pub fn predict_batch(&self, paths: &[PathBuf]) -> Result<Vec<PredictionResult>> {
        let mode = self.model.output_mode();
        let batcher = LesionBatcher::new(self.model.image_size(), self.normalization);
        let mut results = Vec::with_capacity(paths.len());

        for chunk in paths.chunks(self.batch_size) {
            let items = chunk
                .iter()
                .enumerate()
                .map(|(index, path)| {
                    Ok(LesionItem {
                        image: self.load_and_preprocess(path)?,
                        label: 0,
                        index,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let batch: LesionBatch<B> = batcher.batch(items, &self.device);
            let start = Instant::now();
            let logits = self.model.forward(batch.images);
            let predicted = mode.predict(logits.clone()).into_data();
            let probabilities = mode.probabilities(logits).into_data();
            let per_image_ms = start.elapsed().as_secs_f64() * 1000.0 / chunk.len() as f64;

            let predicted: Vec<usize> = predicted.iter::<i64>().map(|p| p as usize).collect();
            let probabilities: Vec<f32> = probabilities.iter::<f32>().collect();
            let num_classes = mode.num_classes();

            for (row, path) in chunk.iter().enumerate() {
                let probabilities = probabilities[row * num_classes..(row + 1) * num_classes].to_vec();
                let predicted_class = predicted[row];
                results.push(PredictionResult {
                    image_path: Some(path.clone()),
                    predicted_class,
                    class_name: self.class_name(predicted_class),
                    confidence: probabilities[predicted_class],
                    probabilities,
                    inference_time_ms: per_image_ms,
                });
            }
            debug!("Predicted {} image(s), {:.2} ms each", chunk.len(), per_image_ms);
        }

        Ok(results)
    }

    fn class_name(&self, class: usize) -> String {
        self.class_names
            .get(class)
            .cloned()
            .unwrap_or_else(|| format!("class {}", class))
    }
}

/// Evaluate a checkpoint on a labelled directory tree
///
/// Class subdirectories are matched against the class names stored with
/// the checkpoint.
pub fn evaluate_checkpoint<B: Backend>(
    checkpoint: &Path,
    data_dir: &Path,
    batch_size: usize,
    normalization: Normalization,
    device: &B::Device,
) -> Result<(EvaluationResult, CheckpointMetadata)> {
    let (model, metadata) = LoadedModel::<B>::load(checkpoint, device)?;
    let classes = ClassMapping::new(metadata.class_names.clone())?;
    let dataset = LesionDataset::open_with_classes(data_dir, &classes)?;
    let dataset = LesionBurnDataset::new(&dataset, metadata.image_size, AugmentationConfig::none());

    let result = Evaluator::new(batch_size)
        .with_normalization(normalization)
        .with_class_names(metadata.class_names.clone())
        .evaluate::<B, _>(&model, &dataset, device)?;
    Ok((result, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::BINARY_CLASS_NAMES;
    use crate::model::config::ModelConfig;
    use crate::model::FusionClassifierConfig;
    use crate::testing::{write_class_tree, write_corrupt_image};
    use crate::training::checkpoint::save_checkpoint;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn names() -> Vec<String> {
        BINARY_CLASS_NAMES.iter().map(|s| s.to_string()).collect()
    }

    fn save_tiny_fusion(dir: &Path, output: OutputMode) -> (FusionClassifier<TestBackend>, PathBuf) {
        let model = FusionClassifierConfig::tiny(output)
            .init::<TestBackend>(&Default::default())
            .unwrap();
        let metadata = CheckpointMetadata::new(
            ModelConfig {
                tiny: true,
                ..Default::default()
            },
            output,
            model.image_size(),
            names(),
        );
        let path = save_checkpoint::<TestBackend, _>(&model, &dir.join("best"), &metadata).unwrap();
        (model, path)
    }

    #[test]
    fn test_loaded_model_matches_saved_model() {
        let dir = TempDir::new().unwrap();
        let (model, path) = save_tiny_fusion(dir.path(), OutputMode::multi_class(2));

        let (loaded, metadata) = LoadedModel::<TestBackend>::load(&path, &Default::default()).unwrap();
        assert!(matches!(loaded, LoadedModel::Fusion(_)));
        assert_eq!(metadata.class_names, names());

        let images = Tensor::<TestBackend, 4>::ones([1, 3, 16, 16], &Default::default());
        let expected = model.forward(images.clone()).into_data().to_vec::<f32>().unwrap();
        let actual = loaded.forward(images).into_data().to_vec::<f32>().unwrap();
        for (a, e) in actual.iter().zip(&expected) {
            assert!((a - e).abs() <= 1e-5);
        }
    }

    #[test]
    fn test_predictions_are_probability_distributions() {
        let dir = TempDir::new().unwrap();
        write_class_tree(&dir.path().join("images"), &[("benign", 2), ("malignant", 1)]);
        let (_, path) = save_tiny_fusion(dir.path(), OutputMode::binary());

        let predictor = Predictor::<TestBackend, _>::from_checkpoint(&path, &Default::default())
            .unwrap()
            .with_batch_size(2);
        let paths: Vec<PathBuf> = ["benign/000.png", "benign/001.png", "malignant/000.png"]
            .iter()
            .map(|p| dir.path().join("images").join(p))
            .collect();
        let results = predictor.predict_batch(&paths).unwrap();

        assert_eq!(results.len(), 3);
        for result in &results {
            assert_eq!(result.probabilities.len(), 2);
            let total: f32 = result.probabilities.iter().sum();
            assert!((total - 1.0).abs() < 1e-4);
            assert_eq!(result.confidence, result.probabilities[result.predicted_class]);
            assert_eq!(result.class_name, names()[result.predicted_class]);
            // sigmoid mode picks malignant exactly when its probability exceeds 0.5
            assert_eq!(result.predicted_class == 1, result.probabilities[1] > 0.5);
        }
        assert!(results[0].display().contains("Prediction:"));
    }

    #[test]
    fn test_unreadable_file_is_a_data_load_error() {
        let dir = TempDir::new().unwrap();
        let (_, path) = save_tiny_fusion(dir.path(), OutputMode::multi_class(2));
        let broken = dir.path().join("broken.png");
        write_corrupt_image(&broken);

        let predictor = Predictor::<TestBackend, _>::from_checkpoint(&path, &Default::default()).unwrap();
        let err = predictor.predict_file(&broken).unwrap_err();
        assert!(matches!(err, LesionError::DataLoad { .. }));
    }

    #[test]
    fn test_evaluate_checkpoint_uses_stored_classes() {
        let dir = TempDir::new().unwrap();
        write_class_tree(&dir.path().join("test"), &[("benign", 2), ("malignant", 2)]);
        let (_, path) = save_tiny_fusion(dir.path(), OutputMode::multi_class(2));

        let (result, metadata) = evaluate_checkpoint::<TestBackend>(
            &path,
            &dir.path().join("test"),
            3,
            Normalization::ImageNet,
            &Default::default(),
        )
        .unwrap();

        assert_eq!(result.num_evaluated(), 4);
        assert_eq!(result.targets, vec![0, 0, 1, 1]);
        assert_eq!(metadata.image_size, 16);
        assert_eq!(
            result.metrics.per_class[0].class_name.as_deref(),
            Some("benign")
        );
    }
}
