//! Lesion Fusion CLI
//!
//! Train, evaluate and run the skin-lesion classifiers from the command line.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tokio::signal;
use tracing::{info, warn};

use lesion_fusion::backend::{backend_name, default_device, DefaultBackend, TrainingBackend};
use lesion_fusion::dataset::{LesionDataset, Normalization};
use lesion_fusion::inference::{evaluate_checkpoint, Predictor};
use lesion_fusion::model::config::{Architecture, ModelConfig, OutputKind};
use lesion_fusion::training::checkpoint::{BEST_CHECKPOINT, LATEST_CHECKPOINT, RECORD_EXTENSION};
use lesion_fusion::training::{run_training, StopSignal};
use lesion_fusion::utils::logging::{init_logging, LogConfig};
use lesion_fusion::utils::report::MetricsReport;
use lesion_fusion::{LesionClassifier, LesionError, RunConfig};

/// Skin lesion classification with CNN + transformer feature fusion
#[derive(Parser, Debug)]
#[command(name = "lesion_fusion")]
#[command(version)]
#[command(about = "Benign/malignant skin lesion classification with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ArchitectureArg {
    Fusion,
    Single,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train a classifier
    ///
    /// Ctrl+C stops after the current step; the final model, curves and
    /// report are still written. A second Ctrl+C exits immediately.
    Train {
        /// TOML run configuration (defaults are used when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Training data root, one subdirectory per class
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Validation data root (otherwise split from the training data)
        #[arg(long)]
        val_dir: Option<PathBuf>,

        /// Test data root used for the final report
        #[arg(long)]
        test_dir: Option<PathBuf>,

        /// Model architecture
        #[arg(short, long, value_enum)]
        architecture: Option<ArchitectureArg>,

        /// Use the single sigmoid output instead of one logit per class
        #[arg(long, default_value = "false")]
        sigmoid: bool,

        /// Number of training epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Batch size for training
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Learning rate
        #[arg(short, long)]
        learning_rate: Option<f64>,

        /// Epochs of the fine-tuning phase (0 disables it)
        #[arg(long)]
        fine_tune_epochs: Option<usize>,

        /// Output directory for reports, curves and the final model
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Random seed for reproducibility
        #[arg(long)]
        seed: Option<u64>,

        /// Halve the batch size and retry an epoch that runs out of memory
        #[arg(long, default_value = "false")]
        retry_on_oom: bool,

        /// Use the tiny test layouts (fast smoke runs)
        #[arg(long, default_value = "false")]
        tiny: bool,
    },

    /// Evaluate a checkpoint on a labelled directory
    Evaluate {
        /// Checkpoint (`.mpk` file or stem)
        #[arg(short, long)]
        model: PathBuf,

        /// Data root, one subdirectory per class
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Batch size for evaluation
        #[arg(short, long, default_value = "32")]
        batch_size: usize,

        /// Only rescale pixels, without ImageNet normalization
        #[arg(long, default_value = "false")]
        rescale_only: bool,

        /// Where to write metrics.json / metrics.txt
        #[arg(short, long, default_value = "output/evaluation")]
        output_dir: PathBuf,
    },

    /// Classify a single image or every image in a directory
    Predict {
        /// Path to input image or directory
        #[arg(short, long)]
        input: PathBuf,

        /// Checkpoint (`.mpk` file or stem)
        #[arg(short, long)]
        model: PathBuf,

        /// Only rescale pixels, without ImageNet normalization
        #[arg(long, default_value = "false")]
        rescale_only: bool,
    },

    /// Show dataset statistics
    Inspect {
        /// Path to the dataset directory
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Also show the stratified train/validation split
        #[arg(long)]
        validation_split: Option<f64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };

    let _ = init_logging(&log_config);

    print_banner();

    match cli.command {
        Commands::Train {
            config,
            data_dir,
            val_dir,
            test_dir,
            architecture,
            sigmoid,
            epochs,
            batch_size,
            learning_rate,
            fine_tune_epochs,
            output_dir,
            seed,
            retry_on_oom,
            tiny,
        } => {
            let mut run = match &config {
                Some(path) => RunConfig::from_toml_file(path)
                    .with_context(|| format!("loading {:?}", path))?,
                None => RunConfig::default(),
            };

            if let Some(architecture) = architecture {
                run.model = match architecture {
                    ArchitectureArg::Fusion => ModelConfig::default(),
                    ArchitectureArg::Single => ModelConfig::single_branch(),
                };
                run.data.image_size = run.model.default_image_size();
            }
            if sigmoid {
                run.model.output = OutputKind::BinarySigmoid;
            }
            if tiny {
                run.model.tiny = true;
                if run.model.architecture == Architecture::Fusion {
                    run.data.image_size = 16;
                }
            }
            if let Some(dir) = data_dir {
                run.data.train_dir = dir;
            }
            if val_dir.is_some() {
                run.data.val_dir = val_dir;
            }
            if test_dir.is_some() {
                run.data.test_dir = test_dir;
            }
            if let Some(epochs) = epochs {
                run.training.epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                run.data.batch_size = batch_size;
            }
            if let Some(lr) = learning_rate {
                run.training.learning_rate = lr;
            }
            if let Some(n) = fine_tune_epochs {
                run.training.fine_tune_epochs = n;
            }
            if let Some(dir) = output_dir {
                run.training.checkpoint_dir = Some(dir.join("checkpoints"));
                run.training.output_dir = dir;
            }
            if let Some(seed) = seed {
                run.data.seed = seed;
            }
            run.training.retry_on_oom |= retry_on_oom;

            cmd_train(&run)?;
        }

        Commands::Evaluate {
            model,
            data_dir,
            batch_size,
            rescale_only,
            output_dir,
        } => {
            cmd_evaluate(&model, &data_dir, batch_size, normalization(rescale_only), &output_dir)?;
        }

        Commands::Predict {
            input,
            model,
            rescale_only,
        } => {
            cmd_predict(&input, &model, normalization(rescale_only))?;
        }

        Commands::Inspect {
            data_dir,
            validation_split,
        } => {
            cmd_inspect(&data_dir, validation_split)?;
        }
    }

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
 ╔══════════════════════════════════════════════════════════════╗
 ║   Lesion Fusion                                              ║
 ║   Skin Lesion Classification with Burn + Rust                ║
 ╚══════════════════════════════════════════════════════════════╝
  "#
        .green()
    );
}

fn normalization(rescale_only: bool) -> Normalization {
    if rescale_only {
        Normalization::Rescale
    } else {
        Normalization::ImageNet
    }
}

fn cmd_train(config: &RunConfig) -> Result<()> {
    info!("Training on backend: {}", backend_name());
    let started = SystemTime::now();

    let stop = StopSignal::new();
    install_interrupt_handler(stop.clone())?;

    match run_training::<TrainingBackend>(config, &default_device(), stop) {
        Ok(summary) => {
            if summary.interrupted() {
                println!("{}", "Training was interrupted before completion".yellow());
            }
            Ok(())
        }
        Err(err) => {
            report_training_failure(config, &err, started);
            Err(err.into())
        }
    }
}

/// Raise `stop` on the first Ctrl+C and exit on the second
fn install_interrupt_handler(stop: StopSignal) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build the signal runtime")?;

    std::thread::spawn(move || {
        runtime.block_on(async move {
            if signal::ctrl_c().await.is_err() {
                warn!("Could not listen for Ctrl+C, training cannot be interrupted");
                return;
            }
            warn!("Received Ctrl+C, stopping after the current step");
            stop.request_stop();

            if signal::ctrl_c().await.is_ok() {
                warn!("Received a second Ctrl+C, exiting");
                std::process::exit(130);
            }
        });
    });
    Ok(())
}

/// Tell apart a run that produced nothing from one that left a usable checkpoint
fn report_training_failure(config: &RunConfig, err: &LesionError, started: SystemTime) {
    let last_checkpoint = match err {
        LesionError::NumericDivergence {
            last_checkpoint: Some(path),
            ..
        } => Some(path.clone()),
        _ => config.training.checkpoint_dir.as_ref().and_then(|dir| {
            [LATEST_CHECKPOINT, BEST_CHECKPOINT]
                .iter()
                .map(|name| dir.join(name).with_extension(RECORD_EXTENSION))
                .find(|path| written_since(path, started))
        }),
    };

    println!();
    match last_checkpoint {
        Some(path) => {
            println!("{} {}", "Training degraded mid-run:".yellow().bold(), err);
            println!("  Last good checkpoint: {:?}", path);
            let history = config.training.output_dir.join("training_history.csv");
            if history.exists() {
                println!("  Partial history:      {:?}", history);
            }
        }
        None => {
            println!("{} {}", "Training failed before any epoch completed:".red().bold(), err);
            println!("  No model artifact was written");
        }
    }
}

fn written_since(path: &Path, since: SystemTime) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|modified| modified >= since)
        .unwrap_or(false)
}

fn cmd_evaluate(
    model: &Path,
    data_dir: &Path,
    batch_size: usize,
    normalization: Normalization,
    output_dir: &Path,
) -> Result<()> {
    println!("{}", "Evaluating Model...".cyan().bold());
    println!("  Model:   {:?}", model);
    println!("  Data:    {:?}", data_dir);
    println!("  Backend: {}", backend_name());
    println!();

    let (result, metadata) = evaluate_checkpoint::<DefaultBackend>(
        model,
        data_dir,
        batch_size,
        normalization,
        &default_device(),
    )?;

    let report = MetricsReport::new(
        model.display().to_string(),
        data_dir.display().to_string(),
        metadata.class_names.clone(),
        result.skipped,
        result.metrics.clone(),
    );
    let (json_path, text_path) = report.save(output_dir)?;

    print!("{}", report.to_text());
    println!();
    println!("{}", "Report written:".green().bold());
    println!("  {:?}", json_path);
    println!("  {:?}", text_path);
    Ok(())
}

fn cmd_predict(input: &Path, model: &Path, normalization: Normalization) -> Result<()> {
    let predictor = Predictor::<DefaultBackend, _>::from_checkpoint(model, &default_device())?
        .with_normalization(normalization);

    let paths: Vec<PathBuf> = if input.is_dir() {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(input)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        paths.sort();
        paths
    } else {
        vec![input.to_path_buf()]
    };

    if paths.is_empty() {
        println!("{} no images found in {:?}", "Warning:".yellow(), input);
        return Ok(());
    }

    let sigmoid = predictor.model().output_mode().is_sigmoid();
    for path in &paths {
        match predictor.predict_file(path) {
            Ok(result) => {
                print!("{}", result.display());
                if sigmoid {
                    let verdict = if result.predicted_class == 1 {
                        "Malignant".red().bold()
                    } else {
                        "Benign".green().bold()
                    };
                    println!(
                        "Verdict: {} (p = {:.3})",
                        verdict,
                        result.probabilities.get(1).copied().unwrap_or(0.0)
                    );
                }
                println!();
            }
            Err(err) if !err.is_fatal() => println!("{} {:?}: {}", "Skipped".yellow(), path, err),
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn cmd_inspect(data_dir: &Path, validation_split: Option<f64>) -> Result<()> {
    info!("Computing dataset statistics for: {:?}", data_dir);

    let dataset = LesionDataset::open(data_dir)?;
    dataset.stats().print();

    if let Some(fraction) = validation_split {
        let (train, val) = dataset.split(fraction, 42)?;
        println!();
        println!("{}", "Stratified Split:".yellow().bold());
        for (name, (t, v)) in dataset
            .classes
            .names()
            .iter()
            .zip(train.class_counts().into_iter().zip(val.class_counts()))
        {
            println!("  {:24} train {:6}  val {:6}", name, t, v);
        }
    }
    Ok(())
}
