//! Training Policies
//!
//! Small policy objects consulted by the trainer at epoch and step
//! boundaries:
//! - `EarlyStopping`: stop when the validation loss stops improving and
//!   keep a snapshot of the best parameters
//! - `ClassWeighting`: per-class loss weights from class counts
//! - `StopSignal`: cooperative cancellation shared with other threads
//! - `RetryPolicy`: what to do when a step runs out of device memory

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::utils::error::{LesionError, Result};

/// Outcome of observing one epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarlyStoppingVerdict {
    /// New best loss, snapshot taken
    Improved,
    /// No improvement for `epochs` epochs, keep going
    Waiting { epochs: usize },
    /// Patience exhausted
    Stop,
}

/// Early stopping on the validation loss
///
/// Improvement means `loss < best - min_delta`. After `patience`
/// consecutive epochs without improvement the verdict is `Stop`.
#[derive(Debug, Clone)]
pub struct EarlyStopping<S> {
    patience: usize,
    min_delta: f64,
    best_loss: f64,
    best_epoch: Option<usize>,
    wait: usize,
    best_snapshot: Option<S>,
}

impl<S> EarlyStopping<S> {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience: patience.max(1),
            min_delta,
            best_loss: f64::INFINITY,
            best_epoch: None,
            wait: 0,
            best_snapshot: None,
        }
    }

    /// Continue from a best epoch observed earlier in the run
    ///
    /// The patience counter starts at zero again.
    pub fn with_best(mut self, epoch: usize, loss: f64, snapshot: S) -> Self {
        self.best_loss = loss;
        self.best_epoch = Some(epoch);
        self.best_snapshot = Some(snapshot);
        self
    }

    /// Record an epoch's validation loss; `snapshot` is only called on improvement
    pub fn observe(
        &mut self,
        epoch: usize,
        loss: f64,
        snapshot: impl FnOnce() -> S,
    ) -> EarlyStoppingVerdict {
        if loss < self.best_loss - self.min_delta {
            self.best_loss = loss;
            self.best_epoch = Some(epoch);
            self.best_snapshot = Some(snapshot());
            self.wait = 0;
            return EarlyStoppingVerdict::Improved;
        }

        self.wait += 1;
        if self.wait >= self.patience {
            EarlyStoppingVerdict::Stop
        } else {
            EarlyStoppingVerdict::Waiting { epochs: self.wait }
        }
    }

    pub fn patience(&self) -> usize {
        self.patience
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn best_snapshot(&self) -> Option<&S> {
        self.best_snapshot.as_ref()
    }

    pub fn take_best(&mut self) -> Option<S> {
        self.best_snapshot.take()
    }
}

/// Per-class loss weights
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassWeighting {
    /// Every class weighs 1
    None,
    /// `total / (num_classes * count[c])`
    #[default]
    Balanced,
    /// Explicit weight per class
    Manual(Vec<f64>),
}

impl ClassWeighting {
    pub fn validate(&self) -> Result<()> {
        if let Self::Manual(weights) = self {
            if weights.is_empty() || weights.iter().any(|w| !w.is_finite() || *w <= 0.0) {
                return Err(LesionError::config(format!(
                    "manual class weights must be positive and finite: {:?}",
                    weights
                )));
            }
        }
        Ok(())
    }

    /// Weights for a training set with the given class counts
    pub fn weights(&self, counts: &[usize]) -> Result<Vec<f64>> {
        match self {
            Self::None => Ok(vec![1.0; counts.len()]),
            Self::Balanced => balanced_weights(counts),
            Self::Manual(weights) => {
                self.validate()?;
                if weights.len() != counts.len() {
                    return Err(LesionError::config(format!(
                        "{} manual class weights given for {} classes",
                        weights.len(),
                        counts.len()
                    )));
                }
                Ok(weights.clone())
            }
        }
    }
}

/// Inverse-frequency weights, as in scikit-learn's "balanced" mode
pub fn balanced_weights(counts: &[usize]) -> Result<Vec<f64>> {
    if counts.is_empty() {
        return Err(LesionError::config("cannot weight an empty class list"));
    }
    if let Some(empty) = counts.iter().position(|&c| c == 0) {
        return Err(LesionError::config(format!(
            "class {} has no training samples, balanced weights are undefined",
            empty
        )));
    }

    let total: usize = counts.iter().sum();
    let num_classes = counts.len() as f64;
    Ok(counts
        .iter()
        .map(|&count| total as f64 / (num_classes * count as f64))
        .collect())
}

/// Cooperative stop flag, checked between training steps
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Decides whether an epoch that exhausted device resources is retried
pub trait RetryPolicy: Send {
    /// Batch size for the next attempt, or `None` to give up
    ///
    /// `failures` counts the failed attempts of the current epoch so far.
    fn next_batch_size(&mut self, current_batch_size: usize, failures: usize) -> Option<usize>;
}

/// Never retry
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn next_batch_size(&mut self, _current_batch_size: usize, _failures: usize) -> Option<usize> {
        None
    }
}

/// Retry with half the batch size, down to `min_batch_size`
#[derive(Debug, Clone, Copy)]
pub struct HalveBatchSize {
    pub min_batch_size: usize,
    pub max_retries: usize,
}

impl RetryPolicy for HalveBatchSize {
    fn next_batch_size(&mut self, current_batch_size: usize, failures: usize) -> Option<usize> {
        if failures > self.max_retries {
            return None;
        }
        let next = current_batch_size / 2;
        if next < self.min_batch_size.max(1) {
            return None;
        }
        info!(
            "Retrying epoch with batch size {} (attempt {})",
            next,
            failures + 1
        );
        Some(next)
    }
}

/// Whether a panic or error message reports device memory exhaustion
pub fn is_out_of_memory(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("out of memory")
        || lower.contains("outofmemory")
        || lower.contains("out_of_memory")
        || lower.contains("failed to allocate")
}

/// Run a device step, turning an out-of-memory panic into `ResourceExhaustion`
///
/// Any other panic is propagated unchanged.
pub fn catch_resource_exhaustion<T>(step: impl FnOnce() -> T) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(step)) {
        Ok(value) => Ok(value),
        Err(payload) => {
            let message = payload
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_default();
            if is_out_of_memory(&message) {
                warn!("Device step ran out of memory: {}", message);
                Err(LesionError::ResourceExhaustion(message))
            } else {
                panic::resume_unwind(payload)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_early_stopping_restores_best_epoch() {
        let losses = [0.5, 0.4, 0.41, 0.42, 0.3];
        let mut early = EarlyStopping::<usize>::new(2, 0.0);

        let mut stopped_after = None;
        for (i, &loss) in losses.iter().enumerate() {
            let epoch = i + 1;
            if early.observe(epoch, loss, || epoch) == EarlyStoppingVerdict::Stop {
                stopped_after = Some(epoch);
                break;
            }
        }

        assert_eq!(stopped_after, Some(4));
        assert_eq!(early.best_epoch(), Some(2));
        assert_eq!(early.take_best(), Some(2));
        assert!((early.best_loss() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_early_stopping_min_delta() {
        let mut early = EarlyStopping::<()>::new(3, 0.05);
        assert_eq!(early.observe(1, 1.0, || ()), EarlyStoppingVerdict::Improved);
        assert_eq!(
            early.observe(2, 0.97, || ()),
            EarlyStoppingVerdict::Waiting { epochs: 1 }
        );
        assert_eq!(early.observe(3, 0.9, || ()), EarlyStoppingVerdict::Improved);
    }

    #[test]
    fn test_snapshot_only_taken_on_improvement() {
        let mut early = EarlyStopping::<usize>::new(5, 0.0);
        let mut taken = 0;
        for (epoch, loss) in [(1, 1.0), (2, 2.0), (3, 0.5), (4, 0.6)] {
            early.observe(epoch, loss, || {
                taken += 1;
                epoch
            });
        }
        assert_eq!(taken, 2);
        assert_eq!(early.best_snapshot(), Some(&3));
    }

    #[test]
    fn test_seeded_best_must_be_beaten() {
        let mut early = EarlyStopping::<usize>::new(3, 0.0).with_best(1, 0.6, 1);
        assert_eq!(
            early.observe(2, 0.9, || 2),
            EarlyStoppingVerdict::Waiting { epochs: 1 }
        );
        assert_eq!(early.best_epoch(), Some(1));
        assert_eq!(early.observe(3, 0.5, || 3), EarlyStoppingVerdict::Improved);
        assert_eq!(early.take_best(), Some(3));
    }

    #[test]
    fn test_balanced_weights_ratio() {
        let weights = ClassWeighting::Balanced.weights(&[80, 20]).unwrap();
        assert!((weights[1] - 4.0 * weights[0]).abs() < 1e-12);
        assert!((weights[0] - 0.625).abs() < 1e-12);
        assert!((weights[1] - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_balanced_weights_empty_class() {
        let err = ClassWeighting::Balanced.weights(&[10, 0]).unwrap_err();
        assert!(matches!(err, LesionError::Configuration(_)));
    }

    #[test]
    fn test_manual_and_uniform_weights() {
        assert_eq!(ClassWeighting::None.weights(&[3, 7]).unwrap(), vec![1.0, 1.0]);
        let manual = ClassWeighting::Manual(vec![1.0, 3.0]);
        assert_eq!(manual.weights(&[3, 7]).unwrap(), vec![1.0, 3.0]);
        assert!(manual.weights(&[1, 1, 1]).is_err());
        assert!(ClassWeighting::Manual(vec![1.0, -1.0]).validate().is_err());
    }

    #[test]
    fn test_stop_signal_shared_between_clones() {
        let signal = StopSignal::new();
        let other = signal.clone();
        assert!(!signal.is_stop_requested());

        std::thread::spawn(move || other.request_stop())
            .join()
            .unwrap();
        assert!(signal.is_stop_requested());

        signal.reset();
        assert!(!signal.is_stop_requested());
    }

    #[test]
    fn test_retry_policies() {
        assert_eq!(NoRetry.next_batch_size(32, 1), None);

        let mut halve = HalveBatchSize {
            min_batch_size: 8,
            max_retries: 2,
        };
        assert_eq!(halve.next_batch_size(32, 1), Some(16));
        assert_eq!(halve.next_batch_size(16, 2), Some(8));
        assert_eq!(halve.next_batch_size(8, 2), None);
        assert_eq!(halve.next_batch_size(64, 3), None);
    }

    #[test]
    fn test_out_of_memory_panic_is_converted() {
        let result: Result<()> =
            catch_resource_exhaustion(|| panic!("CUDA error: out of memory while allocating"));
        assert!(matches!(result, Err(LesionError::ResourceExhaustion(_))));

        assert_eq!(catch_resource_exhaustion(|| 7).unwrap(), 7);
    }

    #[test]
    #[should_panic(expected = "unrelated")]
    fn test_other_panics_propagate() {
        let _ = catch_resource_exhaustion(|| panic!("unrelated failure"));
    }

    #[test]
    fn test_class_weighting_serde() {
        let json = serde_json::to_string(&ClassWeighting::Balanced).unwrap();
        assert_eq!(json, "\"balanced\"");
        let manual: ClassWeighting = serde_json::from_str(r#"{"manual":[1.0,2.0]}"#).unwrap();
        assert_eq!(manual, ClassWeighting::Manual(vec![1.0, 2.0]));
    }
}
