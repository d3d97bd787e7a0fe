//! Training Pipeline
//!
//! End-to-end run driven by a `RunConfig`: open the dataset splits, build
//! the configured classifier, train it (optionally followed by a
//! fine-tuning phase with more backbone layers unfrozen), then write the
//! training curves, the final model and a metrics report.

use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use colored::Colorize;
use tracing::{info, warn};

use crate::dataset::{AugmentationConfig, LesionBurnDataset, LesionDataset};
use crate::inference::{EvaluationResult, Evaluator};
use crate::model::config::{Architecture, DataConfig, RunConfig};
use crate::model::{load_pretrained, FusionClassifier, LesionClassifier, OutputMode, SingleBranchClassifier};
use crate::training::checkpoint::{save_checkpoint, CheckpointMetadata};
use crate::training::policy::StopSignal;
use crate::training::trainer::{EpochRecord, StopReason, Trainer, TrainingContext, TrainingOutcome};
use crate::utils::charts::save_training_curves;
use crate::utils::format_duration;
use crate::utils::error::{LesionError, Result};
use crate::utils::report::MetricsReport;

/// Stem of the final model checkpoint inside the output directory
pub const FINAL_MODEL: &str = "model";

/// Scanned train / validation / test sets sharing one class mapping
#[derive(Debug, Clone)]
pub struct DataSplits {
    pub train: LesionDataset,
    pub val: LesionDataset,
    pub test: Option<LesionDataset>,
}

impl DataSplits {
    pub fn class_names(&self) -> Vec<String> {
        self.train.classes.names().to_vec()
    }
}

/// Open the splits described by `config`
///
/// Without a validation directory the training root is split
/// stratified by class. Labels always come from the training root.
pub fn load_splits(config: &DataConfig) -> Result<DataSplits> {
    let (train, val) = match &config.val_dir {
        Some(val_dir) => {
            let train = LesionDataset::open(&config.train_dir)?;
            let val = LesionDataset::open_with_classes(val_dir, &train.classes)?;
            (train, val)
        }
        None => {
            if config.validation_split <= 0.0 {
                return Err(LesionError::config(
                    "no val_dir given and validation_split is 0",
                ));
            }
            let full = LesionDataset::open(&config.train_dir)?;
            full.split(config.validation_split, config.seed)?
        }
    };

    let test = config
        .test_dir
        .as_ref()
        .map(|dir| LesionDataset::open_with_classes(dir, &train.classes))
        .transpose()?;

    Ok(DataSplits { train, val, test })
}

/// What a training run produced
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// One outcome per phase (training, then fine-tuning when enabled)
    pub phases: Vec<TrainingOutcome>,
    pub history: Vec<EpochRecord>,
    pub class_names: Vec<String>,
    /// Final evaluation (test set when present, validation set otherwise)
    pub evaluation: EvaluationResult,
    pub model_path: PathBuf,
    pub report_paths: (PathBuf, PathBuf),
    pub curve_paths: Vec<PathBuf>,
}

impl RunSummary {
    pub fn interrupted(&self) -> bool {
        self.phases
            .iter()
            .any(|p| p.stop_reason == StopReason::Interrupted)
    }
}

/// Fusion classifier with optional pretrained backbones
///
/// Both backbones are frozen unless `unfrozen_layers` leaves some of
/// their last layers trainable.
pub fn build_fusion<B: AutodiffBackend>(
    config: &RunConfig,
    output: OutputMode,
    device: &B::Device,
) -> Result<FusionClassifier<B>> {
    let mut model = config.fusion_config(output).init::<B>(device)?;
    model.cnn = load_pretrained::<B, _>(model.cnn, config.model.pretrained_cnn.as_deref(), device)?;
    model.swin = load_pretrained::<B, _>(model.swin, config.model.pretrained_swin.as_deref(), device)?;
    model = match config.model.unfrozen_layers {
        Some(layers) => model.unfreeze_last(layers),
        None => model.freeze_backbones(),
    };
    Ok(model)
}

/// Single-branch classifier with an optional pretrained backbone
pub fn build_single<B: AutodiffBackend>(
    config: &RunConfig,
    output: OutputMode,
    device: &B::Device,
) -> Result<SingleBranchClassifier<B>> {
    let mut model = config.single_config(output).init::<B>(device)?;
    model.backbone = load_pretrained::<B, _>(model.backbone, config.model.pretrained_cnn.as_deref(), device)?;
    if let Some(layers) = config.model.unfrozen_layers {
        model = model.unfreeze_last(layers);
    }
    Ok(model)
}

/// Run a complete training job
pub fn run_training<B: AutodiffBackend>(
    config: &RunConfig,
    device: &B::Device,
    stop: StopSignal,
) -> Result<RunSummary> {
    config.validate()?;

    println!("{}", "Loading Dataset...".cyan());
    let splits = load_splits(&config.data)?;
    let class_names = splits.class_names();
    let output = config.output_mode(class_names.len())?;

    println!();
    println!("{}", "Dataset Splits:".cyan().bold());
    println!("  Classes:            {}", class_names.join(", "));
    println!("  Training samples:   {}", splits.train.len());
    println!("  Validation samples: {}", splits.val.len());
    if let Some(test) = &splits.test {
        println!("  Test samples:       {}", test.len());
    }
    println!();

    match config.model.architecture {
        Architecture::Fusion => {
            let model = build_fusion::<B>(config, output, device)?;
            train_model(config, model, &splits, device, stop, |m, n| m.unfreeze_last(n))
        }
        Architecture::SingleBranch => {
            let model = build_single::<B>(config, output, device)?;
            train_model(config, model, &splits, device, stop, |m, n| m.unfreeze_last(n))
        }
    }
}

fn train_model<B, M>(
    config: &RunConfig,
    model: M,
    splits: &DataSplits,
    device: &B::Device,
    stop: StopSignal,
    unfreeze: impl Fn(M, usize) -> M,
) -> Result<RunSummary>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + LesionClassifier<B>,
    M::InnerModule: LesionClassifier<B::InnerBackend>,
{
    let data = &config.data;
    let training = &config.training;
    let image_size = model.image_size();
    let class_names = splits.class_names();
    let output_dir = training.output_dir.clone();

    let train_set = LesionBurnDataset::new(&splits.train, image_size, config.augmentation.clone());
    let val_set = LesionBurnDataset::new(&splits.val, image_size, AugmentationConfig::none());

    let metadata = CheckpointMetadata::new(
        config.model.clone(),
        model.output_mode(),
        image_size,
        class_names.clone(),
    );
    let mut trainer = Trainer::new(training.clone(), data.batch_size)
        .with_seed(data.seed)
        .with_prefetch(data.prefetch)
        .with_normalization(data.normalization)
        .with_max_skip_fraction(data.max_skip_fraction)
        .with_stop_signal(stop)
        .with_checkpoint_metadata(metadata.clone());

    println!("{}", "Training Configuration:".cyan().bold());
    println!("  Architecture:  {:?}", config.model.architecture);
    println!("  Output:        {}", model.output_mode().describe());
    println!("  Image size:    {}", image_size);
    println!("  Epochs:        {}", training.epochs);
    println!("  Batch size:    {}", data.batch_size);
    println!("  Learning rate: {}", training.learning_rate);
    println!("  Device:        {:?}", device);
    println!();
    println!("{}", "Starting Training...".green().bold());

    let start = Instant::now();
    let mut ctx = TrainingContext::with_adam(model, training.learning_rate, training.weight_decay);
    let mut phases = Vec::new();

    let outcome = fit_phase(&mut trainer, &mut ctx, &train_set, &val_set, device, &output_dir)?;
    print_phase("Training", &outcome);
    let run_fine_tune = training.fine_tune_epochs > 0 && outcome.stop_reason != StopReason::Interrupted;
    phases.push(outcome);

    if run_fine_tune {
        let lr = training.learning_rate / training.fine_tune_lr_divisor;
        println!();
        println!(
            "{} unfreezing the last {} backbone layers, lr = {:.2e}",
            "Fine-tuning:".green().bold(),
            training.fine_tune_layers,
            lr
        );
        ctx.map_model(|m| unfreeze(m, training.fine_tune_layers));
        ctx.set_learning_rate(lr);
        trainer.set_epochs(training.fine_tune_epochs);

        let outcome = fit_phase(&mut trainer, &mut ctx, &train_set, &val_set, device, &output_dir)?;
        print_phase("Fine-tuning", &outcome);
        phases.push(outcome);
    }

    let history = ctx.history().to_vec();
    info!(
        "Training finished in {}",
        format_duration(start.elapsed().as_secs_f64())
    );
    let curve_paths = save_training_curves(&history, &output_dir)?;

    let model = ctx.into_model().valid();
    let final_metadata = match history.last() {
        Some(last) => metadata.for_epoch(last.epoch + 1, last.learning_rate, last.val_loss, last.val_accuracy),
        None => metadata,
    };
    let model_path = save_checkpoint::<B::InnerBackend, _>(
        &model,
        &output_dir.join(FINAL_MODEL),
        &final_metadata,
    )?;
    info!("Final model saved to {:?}", model_path);

    let (eval_set, eval_root) = match &splits.test {
        Some(test) => (
            LesionBurnDataset::new(test, image_size, AugmentationConfig::none()),
            test.root_dir.clone(),
        ),
        None => (val_set, splits.val.root_dir.clone()),
    };
    let evaluation = Evaluator::new(data.batch_size)
        .with_normalization(data.normalization)
        .with_prefetch(data.prefetch)
        .with_max_skip_fraction(data.max_skip_fraction)
        .with_class_names(class_names.clone())
        .evaluate::<B::InnerBackend, _>(&model, &eval_set, device)?;

    let report = MetricsReport::new(
        model_path.display().to_string(),
        eval_root.display().to_string(),
        class_names.clone(),
        evaluation.skipped,
        evaluation.metrics.clone(),
    );
    let report_paths = report.save(&output_dir)?;

    println!();
    println!("{}", "Training Complete!".green().bold());
    print!("{}", evaluation.metrics.summary());
    println!("  Model:   {:?}", model_path);
    println!("  Report:  {:?}", report_paths.1);

    Ok(RunSummary {
        phases,
        history,
        class_names,
        evaluation,
        model_path,
        report_paths,
        curve_paths,
    })
}

/// One `fit` call; on failure the curves of the completed epochs are kept
fn fit_phase<B, M, O>(
    trainer: &mut Trainer,
    ctx: &mut TrainingContext<B, M, O>,
    train: &LesionBurnDataset,
    val: &LesionBurnDataset,
    device: &B::Device,
    output_dir: &Path,
) -> Result<TrainingOutcome>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + LesionClassifier<B>,
    M::InnerModule: LesionClassifier<B::InnerBackend>,
    O: burn::optim::Optimizer<M, B>,
{
    match trainer.fit(ctx, train, val, device) {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            if !ctx.history().is_empty() {
                warn!(
                    "Run failed after {} epoch(s), writing partial training curves",
                    ctx.history().len()
                );
                if let Err(curve_err) = save_training_curves(ctx.history(), output_dir) {
                    warn!("Could not write partial curves: {}", curve_err);
                }
            }
            Err(err)
        }
    }
}

fn print_phase(name: &str, outcome: &TrainingOutcome) {
    for record in &outcome.history {
        let best = if Some(record.epoch) == outcome.best_epoch {
            " (best)".green().to_string()
        } else {
            String::new()
        };
        println!(
            "  Epoch {:>3} {} loss {:.4} acc {:.2}% | val loss {:.4} acc {:.2}% | lr {:.2e}{}",
            record.epoch + 1,
            "→".cyan(),
            record.train_loss,
            record.train_accuracy * 100.0,
            record.val_loss,
            record.val_accuracy * 100.0,
            record.learning_rate,
            best
        );
    }
    let reason = match outcome.stop_reason {
        StopReason::Completed => "completed".green(),
        StopReason::EarlyStopping => "stopped early".yellow(),
        StopReason::Interrupted => "interrupted".red(),
    };
    println!(
        "{} {} after {} epoch(s), best val loss {:.4}",
        format!("{}:", name).bold(),
        reason,
        outcome.epochs_run(),
        outcome.best_val_loss
    );
}
