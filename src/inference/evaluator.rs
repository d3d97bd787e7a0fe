//! Evaluation Module
//!
//! Runs a classifier over a dataset in inference mode and turns the
//! accumulated (true, predicted) pairs into a `Metrics` record. The pass
//! walks the data source until it is exhausted, in a fixed order and
//! without augmentation, so repeated evaluations of the same model give the
//! same result.

use burn::prelude::*;
use burn::tensor::ElementConversion;
use tracing::{debug, info};

use crate::dataset::{BatchOptions, LesionBurnDataset, Normalization, DEFAULT_MAX_SKIP_FRACTION};
use crate::model::LesionClassifier;
use crate::training::classification_loss;
use crate::utils::error::{LesionError, Result};
use crate::utils::metrics::Metrics;

/// Everything one evaluation pass produced
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub metrics: Metrics,
    /// Mean per-sample loss, without class weights
    pub average_loss: f64,
    pub predictions: Vec<usize>,
    pub targets: Vec<usize>,
    /// Dataset positions, aligned with `predictions`
    pub indices: Vec<usize>,
    /// Samples that could not be decoded during this pass
    pub skipped: usize,
}

impl EvaluationResult {
    pub fn accuracy(&self) -> f64 {
        self.metrics.accuracy
    }

    pub fn num_evaluated(&self) -> usize {
        self.predictions.len()
    }
}

/// Inference-mode evaluation over a whole dataset
#[derive(Debug, Clone)]
pub struct Evaluator {
    batch_size: usize,
    normalization: Normalization,
    prefetch: usize,
    max_skip_fraction: f64,
    class_names: Option<Vec<String>>,
}

impl Evaluator {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            normalization: Normalization::default(),
            prefetch: 0,
            max_skip_fraction: DEFAULT_MAX_SKIP_FRACTION,
            class_names: None,
        }
    }

    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_max_skip_fraction(mut self, fraction: f64) -> Self {
        self.max_skip_fraction = fraction;
        self
    }

    pub fn with_class_names(mut self, names: Vec<String>) -> Self {
        self.class_names = Some(names);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Evaluate `model` on every readable sample of `dataset`
    ///
    /// The model must already be in inference mode (a `valid()` copy when
    /// coming from an autodiff backend).
    pub fn evaluate<B: Backend, M: LesionClassifier<B>>(
        &self,
        model: &M,
        dataset: &LesionBurnDataset,
        device: &B::Device,
    ) -> Result<EvaluationResult> {
        let mode = model.output_mode();
        if dataset.num_classes() != mode.num_classes() {
            return Err(LesionError::config(format!(
                "dataset has {} classes but the model predicts {}",
                dataset.num_classes(),
                mode.num_classes()
            )));
        }
        if dataset.image_size() != model.image_size() {
            return Err(LesionError::config(format!(
                "dataset images are {}px but the model expects {}px",
                dataset.image_size(),
                model.image_size()
            )));
        }

        let skipped_before = dataset.skips().skipped();
        let options = BatchOptions::evaluation(self.batch_size).with_prefetch(self.prefetch);

        let mut predictions = Vec::with_capacity(dataset.samples().len());
        let mut targets = Vec::with_capacity(dataset.samples().len());
        let mut indices = Vec::with_capacity(dataset.samples().len());
        let mut loss_sum = 0.0;

        for (batch_idx, batch) in dataset
            .iter_batches::<B>(options, 0, self.normalization, device)
            .enumerate()
        {
            let logits = model.forward(batch.images);
            let loss: f64 = classification_loss(&mode, logits.clone(), &batch.labels, None)
                .into_scalar()
                .elem();
            loss_sum += loss * batch.labels.len() as f64;

            let predicted = mode.predict(logits).into_data();
            predictions.extend(predicted.iter::<i64>().map(|p| p as usize));
            targets.extend_from_slice(&batch.labels);
            indices.extend_from_slice(&batch.indices);

            debug!(
                "  Eval batch {}: {} samples, loss = {:.4}",
                batch_idx + 1,
                batch.labels.len(),
                loss
            );
        }

        let skipped = dataset.skips().skipped().saturating_sub(skipped_before);
        dataset.skips().report("evaluation", self.max_skip_fraction);

        if predictions.is_empty() {
            return Err(LesionError::config(
                "evaluation set contains no readable samples",
            ));
        }

        let average_loss = loss_sum / predictions.len() as f64;
        let mut metrics = Metrics::from_predictions(&predictions, &targets, mode.num_classes())?
            .with_loss(average_loss);
        if let Some(names) = &self.class_names {
            metrics = metrics.with_class_names(names);
        }

        info!(
            "Evaluation: loss = {:.4}, accuracy = {:.2}%, samples = {}",
            average_loss,
            metrics.accuracy * 100.0,
            predictions.len()
        );

        Ok(EvaluationResult {
            metrics,
            average_loss,
            predictions,
            targets,
            indices,
            skipped,
        })
    }
}
