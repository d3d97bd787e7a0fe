//! Training Loop
//!
//! `Trainer::fit` drives a `TrainingContext` through the epochs:
//! - Shuffled, augmented batches -> forward -> weighted loss
//! - Non-finite loss check before any update is applied
//! - Backward pass and Adam step
//! - Validation pass through the `Evaluator` on the inference-mode model
//! - Early stopping, plateau learning-rate reduction and checkpoints at
//!   epoch boundaries
//!
//! The stop signal is checked before every step, so an interrupted run
//! always holds the parameters of the last completed update.

use std::marker::PhantomData;
use std::path::PathBuf;

use burn::{
    module::{AutodiffModule, Module},
    nn::loss::CrossEntropyLossConfig,
    optim::{adaptor::OptimizerAdaptor, decay::WeightDecayConfig, Adam, AdamConfig, GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, backend::Backend, ElementConversion, Int, Tensor, TensorData},
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dataset::{BatchOptions, LesionBurnDataset, Normalization, DEFAULT_MAX_SKIP_FRACTION};
use crate::inference::Evaluator;
use crate::model::config::TrainingConfig;
use crate::model::{LesionClassifier, OutputMode};
use crate::training::checkpoint::{CheckpointManager, CheckpointMetadata};
use crate::training::policy::{
    catch_resource_exhaustion, EarlyStopping, EarlyStoppingVerdict, HalveBatchSize, NoRetry,
    RetryPolicy, StopSignal,
};
use crate::training::scheduler::ReduceLrOnPlateau;
use crate::utils::error::{LesionError, Result};
use crate::utils::logging::TrainingLogger;

/// Adam as returned by `AdamConfig::init`
pub type AdamOptimizer<B, M> = OptimizerAdaptor<Adam, M, B>;

/// Adam with an optional L2 weight decay
pub fn adam_optimizer<B: AutodiffBackend, M: AutodiffModule<B>>(weight_decay: f64) -> AdamOptimizer<B, M> {
    let config = if weight_decay > 0.0 {
        AdamConfig::new().with_weight_decay(Some(WeightDecayConfig::new(weight_decay as f32)))
    } else {
        AdamConfig::new()
    };
    config.init()
}

/// Summary of one completed epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 0-based epoch index over the whole run
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
}

/// Why `fit` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// All configured epochs ran
    Completed,
    /// Validation loss stopped improving
    EarlyStopping,
    /// The stop signal was raised
    Interrupted,
}

/// Result of a `fit` call; the trained model stays in the context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingOutcome {
    /// Records of the epochs completed by this call
    pub history: Vec<EpochRecord>,
    /// Epoch whose parameters had the lowest validation loss
    pub best_epoch: Option<usize>,
    pub best_val_loss: f64,
    pub stopped_early: bool,
    pub stop_reason: StopReason,
    /// Whether the best parameters were put back into the model
    pub restored_best: bool,
    /// Training samples skipped because they could not be decoded
    pub skipped_samples: usize,
    /// Last checkpoint written, if any
    pub last_checkpoint: Option<PathBuf>,
}

impl TrainingOutcome {
    pub fn epochs_run(&self) -> usize {
        self.history.len()
    }
}

/// Mutable state of a run, passed to `Trainer::fit` by reference
pub struct TrainingContext<B: AutodiffBackend, M: AutodiffModule<B>, O: Optimizer<M, B>> {
    model: M,
    optimizer: O,
    learning_rate: f64,
    epoch: usize,
    history: Vec<EpochRecord>,
    class_weights: Vec<f64>,
    skipped_samples: usize,
    best: Option<BestSnapshot<<M as Module<B>>::Record>>,
    _backend: PhantomData<B>,
}

/// Lowest validation loss of the run so far and the parameters behind it
///
/// Held as a record: cloning a module shares its batch-norm running
/// statistics with the original, a record copies them.
struct BestSnapshot<R> {
    epoch: usize,
    loss: f64,
    record: R,
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> TrainingContext<B, M, AdamOptimizer<B, M>> {
    /// Context with a fresh Adam optimizer
    pub fn with_adam(model: M, learning_rate: f64, weight_decay: f64) -> Self {
        Self::new(model, adam_optimizer(weight_decay), learning_rate)
    }
}

impl<B: AutodiffBackend, M: AutodiffModule<B>, O: Optimizer<M, B>> TrainingContext<B, M, O> {
    pub fn new(model: M, optimizer: O, learning_rate: f64) -> Self {
        Self {
            model,
            optimizer,
            learning_rate,
            epoch: 0,
            history: Vec::new(),
            class_weights: Vec::new(),
            skipped_samples: 0,
            best: None,
            _backend: PhantomData,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Transform the model in place (freezing, loading weights)
    pub fn map_model(&mut self, f: impl FnOnce(M) -> M) {
        let model = self.model.clone();
        self.model = f(model);
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    /// Number of epochs completed so far
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Every epoch record of the run, across `fit` calls
    pub fn history(&self) -> &[EpochRecord] {
        &self.history
    }

    pub fn class_weights(&self) -> &[f64] {
        &self.class_weights
    }

    pub fn skipped_samples(&self) -> usize {
        self.skipped_samples
    }

    /// 0-based epoch with the lowest validation loss over all `fit` calls
    pub fn best_epoch(&self) -> Option<usize> {
        self.best.as_ref().map(|best| best.epoch)
    }

    pub fn into_model(self) -> M {
        self.model
    }
}

/// Mean classification loss of a batch
///
/// Multi-class heads use cross-entropy on the softmax, sigmoid heads use
/// binary cross-entropy on the single logit. With class weights every
/// sample counts with the weight of its true class and the sum is divided
/// by the total weight.
pub fn classification_loss<B: Backend>(
    mode: &OutputMode,
    logits: Tensor<B, 2>,
    labels: &[usize],
    class_weights: Option<&[f64]>,
) -> Tensor<B, 1> {
    let device = logits.device();
    let [batch_size, _] = logits.dims();

    match mode {
        OutputMode::MultiClass { .. } => {
            let targets = Tensor::<B, 1, Int>::from_data(
                TensorData::new(
                    labels.iter().map(|&l| l as i64).collect::<Vec<_>>(),
                    [batch_size],
                ),
                &device,
            );
            CrossEntropyLossConfig::new()
                .with_weights(class_weights.map(|w| w.iter().map(|&x| x as f32).collect()))
                .init(&device)
                .forward(logits, targets)
        }
        OutputMode::BinarySigmoid { .. } => {
            let x = logits.reshape([batch_size]);
            let y = Tensor::<B, 1>::from_floats(
                TensorData::new(
                    labels.iter().map(|&l| l as f32).collect::<Vec<_>>(),
                    [batch_size],
                ),
                &device,
            );
            // max(x, 0) - x * y + log(1 + exp(-|x|))
            let per_sample = x.clone().clamp_min(0.0) - x.clone() * y + x.abs().neg().exp().log1p();

            let weights: Vec<f32> = labels
                .iter()
                .map(|&label| {
                    class_weights
                        .and_then(|w| w.get(label))
                        .copied()
                        .unwrap_or(1.0) as f32
                })
                .collect();
            let weights = Tensor::<B, 1>::from_floats(TensorData::new(weights, [batch_size]), &device);

            (per_sample * weights.clone()).sum() / weights.sum()
        }
    }
}

/// Outcome of one pass over the training data
enum EpochProgress {
    Completed { loss: f64, accuracy: f64 },
    Interrupted,
}

/// Runs the training loop
pub struct Trainer {
    config: TrainingConfig,
    batch_size: usize,
    seed: u64,
    prefetch: usize,
    normalization: Normalization,
    max_skip_fraction: f64,
    stop: StopSignal,
    retry: Box<dyn RetryPolicy>,
    checkpoints: Option<CheckpointManager>,
    metadata: Option<CheckpointMetadata>,
    show_progress: bool,
}

impl Trainer {
    pub fn new(config: TrainingConfig, batch_size: usize) -> Self {
        let retry: Box<dyn RetryPolicy> = if config.retry_on_oom {
            Box::new(HalveBatchSize {
                min_batch_size: config.min_batch_size,
                max_retries: config.max_retries,
            })
        } else {
            Box::new(NoRetry)
        };
        let checkpoints = config.checkpoint_dir.clone().map(CheckpointManager::new);

        Self {
            config,
            batch_size: batch_size.max(1),
            seed: 42,
            prefetch: 0,
            normalization: Normalization::default(),
            max_skip_fraction: DEFAULT_MAX_SKIP_FRACTION,
            stop: StopSignal::new(),
            retry,
            checkpoints,
            metadata: None,
            show_progress: true,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn with_max_skip_fraction(mut self, fraction: f64) -> Self {
        self.max_skip_fraction = fraction;
        self
    }

    /// Share an existing stop flag
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_retry_policy(mut self, retry: Box<dyn RetryPolicy>) -> Self {
        self.retry = retry;
        self
    }

    /// Sidecar template written next to every checkpoint
    pub fn with_checkpoint_metadata(mut self, metadata: CheckpointMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Epoch budget of the next `fit` call
    pub fn set_epochs(&mut self, epochs: usize) {
        self.config.epochs = epochs;
    }

    /// Batch size in use; lowered after an out-of-memory retry
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn checkpoints(&self) -> Option<&CheckpointManager> {
        self.checkpoints.as_ref()
    }

    fn last_checkpoint(&self) -> Option<PathBuf> {
        self.checkpoints
            .as_ref()
            .and_then(|c| c.last_saved())
            .map(PathBuf::from)
    }

    /// Train `ctx.model` for up to `config.epochs` epochs
    ///
    /// Early stopping continues from the best epoch of earlier `fit` calls
    /// on the same context, so a later phase only replaces the `best`
    /// checkpoint when it beats every epoch before it.
    ///
    /// Fails with `Configuration` before touching any data when the class
    /// weights cannot be computed or a split is empty.
    pub fn fit<B, M, O>(
        &mut self,
        ctx: &mut TrainingContext<B, M, O>,
        train: &LesionBurnDataset,
        val: &LesionBurnDataset,
        device: &B::Device,
    ) -> Result<TrainingOutcome>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + LesionClassifier<B>,
        M::InnerModule: LesionClassifier<B::InnerBackend>,
        O: Optimizer<M, B>,
    {
        self.config.validate()?;
        if train.samples().is_empty() {
            return Err(LesionError::config("training set is empty"));
        }
        if val.samples().is_empty() {
            return Err(LesionError::config("validation set is empty"));
        }
        let mode = ctx.model.output_mode();
        if train.num_classes() != mode.num_classes() {
            return Err(LesionError::config(format!(
                "training set has {} classes but the model predicts {}",
                train.num_classes(),
                mode.num_classes()
            )));
        }
        ctx.class_weights = self.config.class_weighting.weights(&train.class_counts())?;
        info!("Class weights: {:?}", ctx.class_weights);
        info!(
            "{}",
            self.config.lr_schedule.description(ctx.learning_rate)
        );

        let evaluator = Evaluator::new(self.batch_size)
            .with_normalization(self.normalization)
            .with_prefetch(self.prefetch)
            .with_max_skip_fraction(self.max_skip_fraction);
        let mut early_stopping: EarlyStopping<<M as Module<B>>::Record> = EarlyStopping::new(
            self.config.early_stopping_patience,
            self.config.early_stopping_min_delta,
        );
        if let Some(best) = ctx.best.take() {
            early_stopping = early_stopping.with_best(best.epoch, best.loss, best.record);
        }
        let mut plateau = ReduceLrOnPlateau::new(self.config.plateau.clone());
        let mut logger = TrainingLogger::new(self.config.epochs);

        let base_lr = ctx.learning_rate;
        let history_start = ctx.history.len();
        let mut stop_reason = StopReason::Completed;

        for epoch in 0..self.config.epochs {
            if self.stop.is_stop_requested() {
                stop_reason = StopReason::Interrupted;
                break;
            }

            let lr = plateau.apply(self.config.lr_schedule.lr_at(base_lr, epoch));
            ctx.learning_rate = lr;
            logger.start_epoch(epoch);

            let skipped_before = train.skips().skipped();
            let progress = self.run_epoch(ctx, train, device)?;
            ctx.skipped_samples += train.skips().skipped().saturating_sub(skipped_before);
            train.skips().report("training", self.max_skip_fraction);

            let (train_loss, train_accuracy) = match progress {
                EpochProgress::Completed { loss, accuracy } => (loss, accuracy),
                EpochProgress::Interrupted => {
                    stop_reason = StopReason::Interrupted;
                    break;
                }
            };

            let valid_model = ctx.model.valid();
            let evaluation = evaluator.evaluate::<B::InnerBackend, _>(&valid_model, val, device)?;
            let val_loss = evaluation.average_loss;
            let val_accuracy = evaluation.accuracy();

            let record = EpochRecord {
                epoch: ctx.epoch,
                train_loss,
                train_accuracy,
                val_loss,
                val_accuracy,
                learning_rate: lr,
            };
            ctx.history.push(record);
            let global_epoch = ctx.epoch;
            ctx.epoch += 1;
            logger.end_epoch(train_loss, val_loss, val_accuracy, lr);

            let verdict =
                early_stopping.observe(global_epoch, val_loss, || ctx.model.clone().into_record());

            if let (Some(manager), Some(template)) = (self.checkpoints.as_mut(), self.metadata.as_ref()) {
                let metadata = template.for_epoch(global_epoch + 1, lr, val_loss, val_accuracy);
                if verdict == EarlyStoppingVerdict::Improved {
                    manager.save_best::<B::InnerBackend, _>(&valid_model, &metadata)?;
                }
                manager.save_latest::<B::InnerBackend, _>(&valid_model, &metadata)?;
            }

            plateau.step(val_loss, lr);

            match verdict {
                EarlyStoppingVerdict::Improved => debug!("Validation loss improved to {:.4}", val_loss),
                EarlyStoppingVerdict::Waiting { epochs } => debug!(
                    "No improvement for {} epoch(s) (best {:.4})",
                    epochs,
                    early_stopping.best_loss()
                ),
                EarlyStoppingVerdict::Stop => {
                    logger.log_early_stop(
                        early_stopping.patience(),
                        early_stopping.best_epoch().unwrap_or(global_epoch),
                    );
                    stop_reason = StopReason::EarlyStopping;
                    break;
                }
            }
        }

        if stop_reason == StopReason::Interrupted {
            warn!("Training interrupted after {} epoch(s)", ctx.history.len() - history_start);
        }

        let best_epoch = early_stopping.best_epoch();
        let best_val_loss = early_stopping.best_loss();
        let mut restored_best = false;
        if let (Some(epoch), Some(mut record)) = (best_epoch, early_stopping.take_best()) {
            if self.config.restore_best {
                ctx.model = ctx.model.clone().load_record(record);
                record = ctx.model.clone().into_record();
                restored_best = true;
                info!("Restored parameters of epoch {}", epoch + 1);
            }
            ctx.best = Some(BestSnapshot {
                epoch,
                loss: best_val_loss,
                record,
            });
        }

        let history = ctx.history[history_start..].to_vec();
        logger.log_complete(history.len(), best_val_loss);

        Ok(TrainingOutcome {
            history,
            best_epoch,
            best_val_loss,
            stopped_early: stop_reason == StopReason::EarlyStopping,
            stop_reason,
            restored_best,
            skipped_samples: ctx.skipped_samples,
            last_checkpoint: self.last_checkpoint(),
        })
    }

    /// One epoch, retried from its starting parameters after memory exhaustion
    fn run_epoch<B, M, O>(
        &mut self,
        ctx: &mut TrainingContext<B, M, O>,
        train: &LesionBurnDataset,
        device: &B::Device,
    ) -> Result<EpochProgress>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + LesionClassifier<B>,
        O: Optimizer<M, B>,
    {
        let mut start = ctx.model.clone().into_record();
        let mut batch_size = self.batch_size;
        let mut failures = 0;

        loop {
            match self.train_epoch(ctx, train, batch_size, device) {
                Err(LesionError::ResourceExhaustion(message)) => {
                    failures += 1;
                    ctx.model = ctx.model.clone().load_record(start);
                    start = ctx.model.clone().into_record();
                    match self.retry.next_batch_size(batch_size, failures) {
                        Some(next) => {
                            warn!(
                                "Epoch {} ran out of memory with batch size {}, retrying with {}",
                                ctx.epoch + 1,
                                batch_size,
                                next
                            );
                            batch_size = next;
                        }
                        None => return Err(LesionError::ResourceExhaustion(message)),
                    }
                }
                Ok(progress) => {
                    self.batch_size = batch_size;
                    return Ok(progress);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn train_epoch<B, M, O>(
        &self,
        ctx: &mut TrainingContext<B, M, O>,
        train: &LesionBurnDataset,
        batch_size: usize,
        device: &B::Device,
    ) -> Result<EpochProgress>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + LesionClassifier<B>,
        O: Optimizer<M, B>,
    {
        let mode = ctx.model.output_mode();
        let options = BatchOptions::training(batch_size, self.seed).with_prefetch(self.prefetch);
        let num_batches = train.samples().len().div_ceil(batch_size);
        let progress = self.progress_bar(num_batches);

        let mut total_loss = 0.0;
        let mut correct = 0usize;
        let mut total = 0usize;
        let mut steps = 0usize;

        for (batch_idx, batch) in train
            .iter_batches::<B>(options, ctx.epoch, self.normalization, device)
            .enumerate()
        {
            if self.stop.is_stop_requested() {
                progress.abandon();
                info!("Stop requested, leaving epoch {} after {} steps", ctx.epoch + 1, steps);
                return Ok(EpochProgress::Interrupted);
            }

            let (loss, logits, loss_value) = catch_resource_exhaustion(|| {
                let logits = ctx.model.forward(batch.images.clone());
                let mut loss = classification_loss(
                    &mode,
                    logits.clone(),
                    &batch.labels,
                    Some(&ctx.class_weights),
                );
                if let Some(penalty) = ctx.model.regularization() {
                    loss = loss + penalty;
                }
                let value: f64 = loss.clone().into_scalar().elem();
                (loss, logits, value)
            })?;

            if !loss_value.is_finite() {
                progress.abandon();
                return Err(LesionError::NumericDivergence {
                    epoch: ctx.epoch + 1,
                    batch: batch_idx + 1,
                    loss: loss_value,
                    last_checkpoint: self.last_checkpoint(),
                });
            }

            let grads = catch_resource_exhaustion(|| {
                GradientsParams::from_grads(loss.backward(), &ctx.model)
            })?;
            ctx.model = ctx.optimizer.step(ctx.learning_rate, ctx.model.clone(), grads);

            let predicted = mode.predict(logits).into_data();
            correct += predicted
                .iter::<i64>()
                .zip(&batch.labels)
                .filter(|(p, l)| *p as usize == **l)
                .count();
            total += batch.len();
            total_loss += loss_value;
            steps += 1;

            progress.inc(1);
            progress.set_message(format!("loss {:.4}", loss_value));
            if (batch_idx + 1) % 10 == 0 {
                debug!(
                    "  Batch {}/{}: loss = {:.4}, acc = {:.2}%",
                    batch_idx + 1,
                    num_batches,
                    loss_value,
                    100.0 * correct as f64 / total.max(1) as f64
                );
            }
        }
        progress.finish_and_clear();

        if steps == 0 {
            return Err(LesionError::config(
                "training set contains no readable samples",
            ));
        }

        Ok(EpochProgress::Completed {
            loss: total_loss / steps as f64,
            accuracy: correct as f64 / total as f64,
        })
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} batches ({eta}) {msg}")
                .map(|style| style.progress_chars("=>-"))
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{AugmentationConfig, LesionDataset};
    use crate::model::{FusionClassifier, FusionClassifierConfig};
    use crate::testing::write_class_tree;
    use crate::training::checkpoint::load_metadata;
    use crate::training::scheduler::ReduceLrOnPlateauConfig;
    use burn::backend::Autodiff;
    use burn::module::Param;
    use burn_ndarray::NdArray;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    fn datasets(root: &Path, counts: (usize, usize)) -> (LesionBurnDataset, LesionBurnDataset) {
        write_class_tree(&root.join("train"), &[("benign", counts.0), ("malignant", counts.1)]);
        write_class_tree(&root.join("val"), &[("benign", 2), ("malignant", 2)]);
        let train = LesionDataset::open(root.join("train")).unwrap();
        let val = LesionDataset::open_with_classes(root.join("val"), &train.classes).unwrap();
        (
            LesionBurnDataset::new(&train, 16, AugmentationConfig::light()),
            LesionBurnDataset::new(&val, 16, AugmentationConfig::none()),
        )
    }

    fn context(
        mode: OutputMode,
        lr: f64,
    ) -> TrainingContext<TestBackend, FusionClassifier<TestBackend>, AdamOptimizer<TestBackend, FusionClassifier<TestBackend>>> {
        let model = FusionClassifierConfig::tiny(mode)
            .init::<TestBackend>(&Default::default())
            .unwrap();
        TrainingContext::with_adam(model, lr, 0.0)
    }

    fn config(epochs: usize, checkpoint_dir: Option<PathBuf>) -> TrainingConfig {
        TrainingConfig {
            epochs,
            checkpoint_dir,
            ..TrainingConfig::debug()
        }
    }

    fn metadata() -> CheckpointMetadata {
        CheckpointMetadata::new(
            crate::model::config::ModelConfig {
                tiny: true,
                ..Default::default()
            },
            OutputMode::multi_class(2),
            16,
            vec!["benign".into(), "malignant".into()],
        )
    }

    #[test]
    fn test_fit_records_history_and_checkpoints() {
        let dir = TempDir::new().unwrap();
        let (train, val) = datasets(dir.path(), (4, 2));
        let ckpt = dir.path().join("ckpt");
        let mut trainer = Trainer::new(config(2, Some(ckpt.clone())), 3)
            .with_checkpoint_metadata(metadata())
            .with_progress(false);
        let mut ctx = context(OutputMode::multi_class(2), 1e-3);

        let outcome = trainer.fit(&mut ctx, &train, &val, &Default::default()).unwrap();

        assert!(!outcome.history.is_empty());
        assert_eq!(ctx.epoch(), outcome.epochs_run());
        assert_eq!(outcome.history[0].epoch, 0);
        assert!(outcome.history.iter().all(|r| r.train_loss.is_finite()));
        assert!(outcome.best_epoch.is_some());
        assert!(ckpt.join("best.mpk").exists());
        assert!(ckpt.join("latest.json").exists());
        assert_eq!(outcome.last_checkpoint, Some(ckpt.join("latest.mpk")));

        // counts 4 / 2: balanced weights 0.75 / 1.5
        let weights = ctx.class_weights();
        assert!((weights[1] - 2.0 * weights[0]).abs() < 1e-12);
    }

    #[test]
    fn test_stop_signal_interrupts_before_first_step() {
        let dir = TempDir::new().unwrap();
        let (train, val) = datasets(dir.path(), (3, 3));
        let stop = StopSignal::new();
        let mut trainer = Trainer::new(config(3, None), 2)
            .with_stop_signal(stop.clone())
            .with_progress(false);
        let mut ctx = context(OutputMode::binary(), 1e-3);

        stop.request_stop();
        let outcome = trainer.fit(&mut ctx, &train, &val, &Default::default()).unwrap();

        assert_eq!(outcome.stop_reason, StopReason::Interrupted);
        assert_eq!(outcome.epochs_run(), 0);
        assert!(!outcome.stopped_early);
        assert!(outcome.best_epoch.is_none());
    }

    #[test]
    fn test_empty_class_fails_before_any_artifact() {
        let dir = TempDir::new().unwrap();
        let (_, val) = datasets(dir.path(), (2, 2));
        let scanned = LesionDataset::open(dir.path().join("val")).unwrap();
        let malignant_only = scanned
            .samples
            .iter()
            .filter(|s| s.label == 1)
            .cloned()
            .collect();
        let train = LesionBurnDataset::from_samples(malignant_only, 2, 16, AugmentationConfig::none());
        assert_eq!(train.class_counts(), vec![0, 2]);

        let ckpt = dir.path().join("ckpt");
        let mut trainer = Trainer::new(config(2, Some(ckpt.clone())), 2)
            .with_checkpoint_metadata(metadata())
            .with_progress(false);
        let mut ctx = context(OutputMode::multi_class(2), 1e-3);

        let err = trainer.fit(&mut ctx, &train, &val, &Default::default()).unwrap_err();
        assert!(matches!(err, LesionError::Configuration(_)));
        assert!(!ckpt.exists());
        assert!(ctx.history().is_empty());
    }

    #[test]
    fn test_divergence_aborts_before_update() {
        let dir = TempDir::new().unwrap();
        let (train, val) = datasets(dir.path(), (3, 3));
        let mut trainer = Trainer::new(config(2, None), 2).with_progress(false);
        let mut ctx = context(OutputMode::multi_class(2), 1e-3);
        // NaN head weights make the very first loss non-finite
        ctx.map_model(|mut model| {
            model.fc.weight = Param::from_tensor(model.fc.weight.val().mul_scalar(f32::NAN));
            model
        });

        let err = trainer.fit(&mut ctx, &train, &val, &Default::default()).unwrap_err();
        match err {
            LesionError::NumericDivergence {
                epoch,
                batch,
                loss,
                last_checkpoint,
            } => {
                assert_eq!((epoch, batch), (1, 1));
                assert!(!loss.is_finite());
                assert!(last_checkpoint.is_none());
            }
            other => panic!("expected divergence, got {:?}", other),
        }
        assert!(ctx.history().is_empty());
        assert_eq!(ctx.epoch(), 0);
    }

    #[test]
    fn test_weighted_cross_entropy() {
        type B = NdArray;
        let device = Default::default();
        // Equal logits: per-sample loss is ln 2 whatever the weights
        let logits = Tensor::<B, 2>::zeros([3, 2], &device);
        let loss: f64 = classification_loss(
            &OutputMode::multi_class(2),
            logits,
            &[0, 1, 1],
            Some(&[1.0, 4.0]),
        )
        .into_scalar()
        .elem();
        assert!((loss - std::f64::consts::LN_2).abs() < 1e-5);

        // Confident correct on class 0, confident wrong on class 1
        let logits = Tensor::<B, 2>::from_floats([[10.0, 0.0], [10.0, 0.0]], &device);
        let unweighted: f64 = classification_loss(&OutputMode::multi_class(2), logits.clone(), &[0, 1], None)
            .into_scalar()
            .elem();
        let weighted: f64 = classification_loss(
            &OutputMode::multi_class(2),
            logits,
            &[0, 1],
            Some(&[1.0, 4.0]),
        )
        .into_scalar()
        .elem();
        assert!((unweighted - 5.0).abs() < 1e-3);
        assert!((weighted - 8.0).abs() < 1e-3);
    }

    #[test]
    fn test_binary_cross_entropy_with_logits() {
        type B = NdArray;
        let device = Default::default();
        let logits = Tensor::<B, 2>::from_floats([[0.0], [2.0], [-3.0]], &device);
        let loss: f64 = classification_loss(&OutputMode::binary(), logits, &[1, 1, 0], None)
            .into_scalar()
            .elem();

        let bce = |x: f64, y: f64| {
            let p = 1.0 / (1.0 + (-x).exp());
            -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
        };
        let expected = (bce(0.0, 1.0) + bce(2.0, 1.0) + bce(-3.0, 0.0)) / 3.0;
        assert!((loss - expected).abs() < 1e-5);

        // Large logits stay finite
        let logits = Tensor::<B, 2>::from_floats([[80.0], [-80.0]], &device);
        let loss: f64 = classification_loss(&OutputMode::binary(), logits, &[0, 1], None)
            .into_scalar()
            .elem();
        assert!((loss - 80.0).abs() < 1e-3);
    }

    /// Fresh module with the same weights and its own batch-norm statistics
    fn copy_of(model: &FusionClassifier<TestBackend>) -> FusionClassifier<TestBackend> {
        FusionClassifierConfig::tiny(model.output_mode())
            .init::<TestBackend>(&Default::default())
            .unwrap()
            .load_record(model.clone().into_record())
    }

    fn logits_on_ones(model: &FusionClassifier<TestBackend>) -> Vec<f32> {
        let images = Tensor::<NdArray, 4>::ones([2, 3, 16, 16], &Default::default());
        model.valid().forward(images).into_data().to_vec::<f32>().unwrap()
    }

    fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
    }

    #[test]
    fn test_fit_restores_best_epoch_and_reduces_lr_on_plateau() {
        let dir = TempDir::new().unwrap();
        let (train, val) = datasets(dir.path(), (3, 3));
        let model = FusionClassifierConfig::tiny(OutputMode::multi_class(2))
            .init::<TestBackend>(&Default::default())
            .unwrap();

        // A huge min_delta makes the first epoch the only improvement
        let plateau_run = TrainingConfig {
            epochs: 5,
            early_stopping_patience: 2,
            early_stopping_min_delta: 1e9,
            plateau: ReduceLrOnPlateauConfig {
                factor: 0.5,
                patience: 1,
                min_lr: 0.0,
                min_delta: 1e9,
            },
            ..TrainingConfig::debug()
        };

        let mut ctx = TrainingContext::with_adam(copy_of(&model), 1e-3, 0.0);
        let mut trainer = Trainer::new(plateau_run.clone(), 2).with_progress(false);
        let outcome = trainer.fit(&mut ctx, &train, &val, &Default::default()).unwrap();

        assert_eq!(outcome.stop_reason, StopReason::EarlyStopping);
        assert_eq!(outcome.epochs_run(), 3);
        assert_eq!(outcome.best_epoch, Some(0));
        assert!(outcome.restored_best);
        assert_eq!(ctx.best_epoch(), Some(0));

        let lrs: Vec<f64> = outcome.history.iter().map(|r| r.learning_rate).collect();
        assert!((lrs[0] - 1e-3).abs() < 1e-15);
        assert!((lrs[1] - 1e-3).abs() < 1e-15);
        assert!((lrs[2] - 5e-4).abs() < 1e-15);

        // Same start, one epoch only: the parameters the run should end with
        let mut reference = TrainingContext::with_adam(copy_of(&model), 1e-3, 0.0);
        Trainer::new(config(1, None), 2)
            .with_progress(false)
            .fit(&mut reference, &train, &val, &Default::default())
            .unwrap();

        // Same start, no restore: the parameters of the last epoch
        let mut last = TrainingContext::with_adam(copy_of(&model), 1e-3, 0.0);
        Trainer::new(
            TrainingConfig {
                restore_best: false,
                ..plateau_run
            },
            2,
        )
        .with_progress(false)
        .fit(&mut last, &train, &val, &Default::default())
        .unwrap();

        let restored = logits_on_ones(ctx.model());
        assert!(max_abs_diff(&restored, &logits_on_ones(reference.model())) < 1e-5);
        assert!(max_abs_diff(&restored, &logits_on_ones(last.model())) > 1e-5);
    }

    #[test]
    fn test_later_fit_keeps_earlier_best() {
        let dir = TempDir::new().unwrap();
        let (train, val) = datasets(dir.path(), (3, 3));
        let ckpt = dir.path().join("ckpt");
        let device = Default::default();
        let mut trainer = Trainer::new(config(2, Some(ckpt.clone())), 2)
            .with_checkpoint_metadata(metadata())
            .with_progress(false);
        let mut ctx = context(OutputMode::multi_class(2), 1e-3);

        let first = trainer.fit(&mut ctx, &train, &val, &device).unwrap();
        let first_best = first.best_epoch.unwrap();

        // Every image is now confidently benign, half the validation set is wrong
        ctx.map_model(|mut model| {
            model.fc.weight = Param::from_tensor(model.fc.weight.val().zeros_like());
            model.fc.bias = model.fc.bias.map(|bias| {
                Param::from_tensor(Tensor::from_floats([50.0, -50.0], &bias.val().device()))
            });
            model
        });
        ctx.set_learning_rate(1e-9);
        trainer.set_epochs(1);
        let second = trainer.fit(&mut ctx, &train, &val, &device).unwrap();

        assert!(second.history[0].val_loss > first.best_val_loss);
        assert_eq!(second.best_epoch, Some(first_best));
        assert!((second.best_val_loss - first.best_val_loss).abs() < 1e-12);

        let best = load_metadata(&ckpt.join("best.mpk")).unwrap();
        assert_eq!(best.epoch, first_best + 1);
        assert!((best.val_loss.unwrap() - first.best_val_loss).abs() < 1e-12);
        let latest = load_metadata(&ckpt.join("latest.mpk")).unwrap();
        assert_eq!(latest.epoch, ctx.epoch());

        // The restored model is the first call's best, not the perturbed one
        let evaluation = Evaluator::new(2)
            .evaluate::<NdArray, _>(&ctx.model().valid(), &val, &device)
            .unwrap();
        assert!((evaluation.average_loss - first.best_val_loss).abs() < 1e-5);
    }

    static FORWARD_CALLS: AtomicUsize = AtomicUsize::new(0);

    /// Runs out of device memory on the second forward pass
    #[derive(Module, Debug)]
    struct FlakyClassifier<B: Backend> {
        inner: FusionClassifier<B>,
    }

    impl<B: Backend> LesionClassifier<B> for FlakyClassifier<B> {
        fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
            if FORWARD_CALLS.fetch_add(1, Ordering::SeqCst) == 1 {
                panic!("simulated allocation failure: out of memory");
            }
            self.inner.forward(images)
        }

        fn output_mode(&self) -> OutputMode {
            self.inner.output_mode()
        }

        fn image_size(&self) -> usize {
            self.inner.image_size()
        }
    }

    #[test]
    fn test_out_of_memory_epoch_is_retried_with_smaller_batches() {
        let dir = TempDir::new().unwrap();
        let (train, val) = datasets(dir.path(), (2, 2));
        let device = Default::default();
        let flaky = || FlakyClassifier {
            inner: FusionClassifierConfig::tiny(OutputMode::multi_class(2))
                .init::<TestBackend>(&device)
                .unwrap(),
        };

        // Without a retry policy the epoch fails and nothing is recorded
        FORWARD_CALLS.store(0, Ordering::SeqCst);
        let mut ctx = TrainingContext::with_adam(flaky(), 1e-3, 0.0);
        let mut trainer = Trainer::new(config(1, None), 2).with_progress(false);
        let err = trainer.fit(&mut ctx, &train, &val, &device).unwrap_err();
        assert!(matches!(err, LesionError::ResourceExhaustion(_)));
        assert!(ctx.history().is_empty());

        // With halving the epoch restarts from its first batch at size 1
        FORWARD_CALLS.store(0, Ordering::SeqCst);
        let mut ctx = TrainingContext::with_adam(flaky(), 1e-3, 0.0);
        let start = ctx.model().inner.fc.weight.val().into_data().to_vec::<f32>().unwrap();
        let mut trainer = Trainer::new(
            TrainingConfig {
                retry_on_oom: true,
                min_batch_size: 1,
                max_retries: 2,
                ..config(1, None)
            },
            2,
        )
        .with_progress(false);
        let outcome = trainer.fit(&mut ctx, &train, &val, &device).unwrap();

        assert_eq!(outcome.epochs_run(), 1);
        assert_eq!(trainer.batch_size(), 1);
        let trained = ctx.model().inner.fc.weight.val().into_data().to_vec::<f32>().unwrap();
        assert!(max_abs_diff(&start, &trained) > 0.0);
    }
}
