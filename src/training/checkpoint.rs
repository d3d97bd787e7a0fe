//! Checkpoint Module
//!
//! A checkpoint is a named MessagePack record of the model parameters
//! (`<name>.mpk`, full precision, so a reload reproduces the same logits)
//! plus a JSON sidecar (`<name>.json`) describing the run state it was
//! taken at. Both files are written through a temporary file and an atomic
//! rename; a failed write never leaves a truncated checkpoint behind.

use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder};
use burn::tensor::backend::Backend;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::config::{Architecture, ModelConfig};
use crate::model::OutputMode;
use crate::utils::error::{LesionError, Result};
use crate::utils::report::write_atomic;

/// File extension of parameter records
pub const RECORD_EXTENSION: &str = "mpk";

/// Name of the checkpoint holding the best validation loss
pub const BEST_CHECKPOINT: &str = "best";

/// Name of the checkpoint of the last completed epoch
pub const LATEST_CHECKPOINT: &str = "latest";

type CheckpointRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

/// Run state stored next to a parameter record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// 1-based epoch the parameters belong to
    pub epoch: usize,
    pub learning_rate: f64,
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
    pub class_names: Vec<String>,
    pub output_mode: OutputMode,
    /// Settings the parameters were created with
    pub model: ModelConfig,
    pub image_size: usize,
    pub saved_at: DateTime<Local>,
}

impl CheckpointMetadata {
    pub fn new(
        model: ModelConfig,
        output_mode: OutputMode,
        image_size: usize,
        class_names: Vec<String>,
    ) -> Self {
        Self {
            epoch: 0,
            learning_rate: 0.0,
            val_loss: None,
            val_accuracy: None,
            class_names,
            output_mode,
            model,
            image_size,
            saved_at: Local::now(),
        }
    }

    pub fn architecture(&self) -> Architecture {
        self.model.architecture
    }

    /// Copy stamped with an epoch's results
    pub fn for_epoch(&self, epoch: usize, learning_rate: f64, val_loss: f64, val_accuracy: f64) -> Self {
        Self {
            epoch,
            learning_rate,
            val_loss: Some(val_loss),
            val_accuracy: Some(val_accuracy),
            saved_at: Local::now(),
            ..self.clone()
        }
    }
}

/// Path of the parameter record for a checkpoint path or stem
pub fn record_path(path: &Path) -> PathBuf {
    path.with_extension(RECORD_EXTENSION)
}

/// Path of the metadata sidecar for a checkpoint path or stem
pub fn metadata_path(path: &Path) -> PathBuf {
    path.with_extension("json")
}

/// Serialize module parameters to bytes
pub fn model_to_bytes<B: Backend, M: Module<B>>(model: &M) -> Result<Vec<u8>> {
    let recorder = CheckpointRecorder::default();
    let bytes = <CheckpointRecorder as Recorder<B>>::record(&recorder, model.clone().into_record(), ())?;
    Ok(bytes)
}

/// Load parameters from bytes into an initialized module
pub fn model_from_bytes<B: Backend, M: Module<B>>(
    model: M,
    bytes: Vec<u8>,
    device: &B::Device,
) -> Result<M> {
    let recorder = CheckpointRecorder::default();
    let record = <CheckpointRecorder as Recorder<B>>::load(&recorder, bytes, device)?;
    Ok(model.load_record(record))
}

/// Write `<stem>.mpk` and `<stem>.json`; returns the record path
pub fn save_checkpoint<B: Backend, M: Module<B>>(
    model: &M,
    stem: &Path,
    metadata: &CheckpointMetadata,
) -> Result<PathBuf> {
    let bytes = model_to_bytes::<B, M>(model)?;
    let record = record_path(stem);
    write_atomic(&record, &bytes)?;

    let json = serde_json::to_string_pretty(metadata)?;
    write_atomic(&metadata_path(stem), json.as_bytes())?;

    debug!("Checkpoint written to {:?} ({} bytes)", record, bytes.len());
    Ok(record)
}

/// Restore parameters saved by `save_checkpoint`
pub fn load_checkpoint<B: Backend, M: Module<B>>(
    model: M,
    path: &Path,
    device: &B::Device,
) -> Result<M> {
    let record = record_path(path);
    let bytes = std::fs::read(&record).map_err(|e| {
        LesionError::Checkpoint(format!("cannot read {:?}: {}", record, e))
    })?;
    model_from_bytes::<B, M>(model, bytes, device)
}

/// Read the sidecar of a checkpoint
pub fn load_metadata(path: &Path) -> Result<CheckpointMetadata> {
    let sidecar = metadata_path(path);
    let json = std::fs::read_to_string(&sidecar).map_err(|e| {
        LesionError::Checkpoint(format!("cannot read {:?}: {}", sidecar, e))
    })?;
    Ok(serde_json::from_str(&json)?)
}

/// Writes the `best` and `latest` checkpoints of a run
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    last_saved: Option<PathBuf>,
}

impl CheckpointManager {
    /// The directory is created on the first save
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            last_saved: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn best_path(&self) -> PathBuf {
        record_path(&self.dir.join(BEST_CHECKPOINT))
    }

    pub fn latest_path(&self) -> PathBuf {
        record_path(&self.dir.join(LATEST_CHECKPOINT))
    }

    /// Most recent checkpoint written by this manager
    pub fn last_saved(&self) -> Option<&Path> {
        self.last_saved.as_deref()
    }

    pub fn save_best<B: Backend, M: Module<B>>(
        &mut self,
        model: &M,
        metadata: &CheckpointMetadata,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = save_checkpoint::<B, M>(model, &self.dir.join(BEST_CHECKPOINT), metadata)?;
        info!(
            "Best checkpoint saved (epoch {}, val loss {:.4})",
            metadata.epoch,
            metadata.val_loss.unwrap_or(f64::NAN)
        );
        self.last_saved = Some(path.clone());
        Ok(path)
    }

    pub fn save_latest<B: Backend, M: Module<B>>(
        &mut self,
        model: &M,
        metadata: &CheckpointMetadata,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = save_checkpoint::<B, M>(model, &self.dir.join(LATEST_CHECKPOINT), metadata)?;
        self.last_saved = Some(path.clone());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FusionClassifierConfig, LesionClassifier};
    use burn::tensor::{Distribution, Tensor};
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn metadata() -> CheckpointMetadata {
        CheckpointMetadata::new(
            ModelConfig {
                tiny: true,
                ..Default::default()
            },
            OutputMode::multi_class(2),
            16,
            vec!["benign".to_string(), "malignant".to_string()],
        )
    }

    #[test]
    fn test_round_trip_reproduces_logits() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let config = FusionClassifierConfig::tiny(OutputMode::multi_class(2));
        let model = config.init::<TestBackend>(&device).unwrap();

        let stem = dir.path().join("model");
        let path = save_checkpoint::<TestBackend, _>(&model, &stem, &metadata()).unwrap();
        assert_eq!(path, dir.path().join("model.mpk"));

        let fresh = config.init::<TestBackend>(&device).unwrap();
        let restored = load_checkpoint::<TestBackend, _>(fresh, &path, &device).unwrap();

        let images = Tensor::<TestBackend, 4>::random([2, 3, 16, 16], Distribution::Default, &device);
        let expected = model.forward(images.clone()).into_data().to_vec::<f32>().unwrap();
        let actual = restored.forward(images).into_data().to_vec::<f32>().unwrap();
        assert_eq!(expected.len(), actual.len());
        for (a, e) in actual.iter().zip(&expected) {
            assert!((a - e).abs() <= 1e-5, "{} != {}", a, e);
        }
    }

    #[test]
    fn test_sidecar_round_trip() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let model = FusionClassifierConfig::tiny(OutputMode::binary())
            .init::<TestBackend>(&device)
            .unwrap();

        let meta = metadata().for_epoch(3, 5e-4, 0.42, 0.81);
        let path = save_checkpoint::<TestBackend, _>(&model, &dir.path().join("best"), &meta).unwrap();

        let loaded = load_metadata(&path).unwrap();
        assert_eq!(loaded.epoch, 3);
        assert_eq!(loaded.val_loss, Some(0.42));
        assert_eq!(loaded.class_names, meta.class_names);
        assert_eq!(loaded.output_mode, OutputMode::multi_class(2));
        assert_eq!(loaded.architecture(), Architecture::Fusion);
        assert!(loaded.model.tiny);
    }

    #[test]
    fn test_missing_checkpoint_is_an_error() {
        let device = Default::default();
        let model = FusionClassifierConfig::tiny(OutputMode::binary())
            .init::<TestBackend>(&device)
            .unwrap();
        let err = load_checkpoint::<TestBackend, _>(model, Path::new("/nonexistent/best"), &device)
            .unwrap_err();
        assert!(matches!(err, LesionError::Checkpoint(_)));
    }

    #[test]
    fn test_manager_tracks_last_saved() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let model = FusionClassifierConfig::tiny(OutputMode::binary())
            .init::<TestBackend>(&device)
            .unwrap();

        let mut manager = CheckpointManager::new(dir.path().join("ckpt"));
        assert!(manager.last_saved().is_none());
        assert!(!dir.path().join("ckpt").exists());

        manager.save_best::<TestBackend, _>(&model, &metadata()).unwrap();
        assert_eq!(manager.last_saved(), Some(manager.best_path().as_path()));
        assert!(manager.best_path().exists());

        manager.save_latest::<TestBackend, _>(&model, &metadata()).unwrap();
        assert!(manager.latest_path().exists());
        assert!(dir.path().join("ckpt").join("latest.json").exists());
    }
}
