//! Learning Rate Scheduler Module
//!
//! Two layers of learning-rate control:
//! - `LrSchedule`: a base value per epoch (constant, step decay, cosine)
//! - `ReduceLrOnPlateau`: multiplicative reductions when the validation
//!   loss stops improving, applied on top of the base schedule

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::utils::error::{LesionError, Result};

/// Base learning rate as a function of the epoch
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    /// Constant learning rate (no scheduling)
    #[default]
    Constant,

    /// Multiply by `decay_factor` at each listed epoch
    StepDecay {
        decay_factor: f64,
        step_epochs: Vec<usize>,
    },

    /// Cosine annealing from the initial rate down to `min_lr`
    CosineAnnealing { min_lr: f64, total_epochs: usize },
}

impl LrSchedule {
    /// Create a step decay schedule
    pub fn step_decay(decay_factor: f64, step_epochs: Vec<usize>) -> Self {
        Self::StepDecay {
            decay_factor,
            step_epochs,
        }
    }

    /// Create a cosine annealing schedule
    pub fn cosine_annealing(min_lr: f64, total_epochs: usize) -> Self {
        Self::CosineAnnealing {
            min_lr,
            total_epochs,
        }
    }

    /// Learning rate for a 0-based epoch
    pub fn lr_at(&self, initial_lr: f64, epoch: usize) -> f64 {
        match self {
            Self::Constant => initial_lr,

            Self::StepDecay {
                decay_factor,
                step_epochs,
            } => {
                let steps = step_epochs.iter().filter(|&&step| epoch >= step).count();
                initial_lr * decay_factor.powi(steps as i32)
            }

            Self::CosineAnnealing {
                min_lr,
                total_epochs,
            } => {
                let progress = (epoch as f64 / (*total_epochs).max(1) as f64).min(1.0);
                let cosine_factor = (1.0 + (std::f64::consts::PI * progress).cos()) / 2.0;
                min_lr + (initial_lr - min_lr) * cosine_factor
            }
        }
    }

    /// Get a description of the schedule
    pub fn description(&self, initial_lr: f64) -> String {
        match self {
            Self::Constant => format!("Constant LR: {:.6}", initial_lr),
            Self::StepDecay {
                decay_factor,
                step_epochs,
            } => format!(
                "Step Decay: initial={:.6}, factor={}, steps={:?}",
                initial_lr, decay_factor, step_epochs
            ),
            Self::CosineAnnealing {
                min_lr,
                total_epochs,
            } => format!(
                "Cosine Annealing: initial={:.6}, min={:.6}, epochs={}",
                initial_lr, min_lr, total_epochs
            ),
        }
    }
}

/// Settings of the plateau reduction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReduceLrOnPlateauConfig {
    /// Multiplier applied on each reduction
    pub factor: f64,
    /// Non-improving epochs before a reduction
    pub patience: usize,
    /// Learning rate floor
    pub min_lr: f64,
    /// Minimum decrease that counts as improvement
    pub min_delta: f64,
}

impl Default for ReduceLrOnPlateauConfig {
    fn default() -> Self {
        Self {
            factor: 0.5,
            patience: 3,
            min_lr: 1e-6,
            min_delta: 0.0,
        }
    }
}

impl ReduceLrOnPlateauConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.factor > 0.0 && self.factor < 1.0) {
            return Err(LesionError::config(format!(
                "plateau factor must lie in (0, 1), got {}",
                self.factor
            )));
        }
        if self.patience == 0 {
            return Err(LesionError::config("plateau patience must be at least 1"));
        }
        if self.min_lr < 0.0 || self.min_delta < 0.0 {
            return Err(LesionError::config("plateau min_lr and min_delta must not be negative"));
        }
        Ok(())
    }
}

/// Plateau state, stepped once per epoch with the validation loss
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    config: ReduceLrOnPlateauConfig,
    best_metric: f64,
    epochs_without_improvement: usize,
    scale: f64,
    reductions: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(config: ReduceLrOnPlateauConfig) -> Self {
        Self {
            config,
            best_metric: f64::INFINITY,
            epochs_without_improvement: 0,
            scale: 1.0,
            reductions: 0,
        }
    }

    /// Record the epoch's metric given the rate that was in effect
    ///
    /// Returns the reduced rate when a reduction happened.
    pub fn step(&mut self, metric: f64, current_lr: f64) -> Option<f64> {
        if metric < self.best_metric - self.config.min_delta {
            self.best_metric = metric;
            self.epochs_without_improvement = 0;
            return None;
        }

        self.epochs_without_improvement += 1;
        if self.epochs_without_improvement < self.config.patience || current_lr <= self.config.min_lr
        {
            return None;
        }

        let new_lr = (current_lr * self.config.factor).max(self.config.min_lr);
        self.scale *= new_lr / current_lr;
        self.epochs_without_improvement = 0;
        self.reductions += 1;
        info!(
            "Validation loss plateaued, reducing learning rate {:.2e} -> {:.2e}",
            current_lr, new_lr
        );
        Some(new_lr)
    }

    /// Apply accumulated reductions to a scheduled rate
    pub fn apply(&self, scheduled_lr: f64) -> f64 {
        (scheduled_lr * self.scale).max(self.config.min_lr.min(scheduled_lr))
    }

    pub fn reductions(&self) -> usize {
        self.reductions
    }

    pub fn epochs_without_improvement(&self) -> usize {
        self.epochs_without_improvement
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_schedule() {
        let schedule = LrSchedule::Constant;
        assert_eq!(schedule.lr_at(0.001, 0), 0.001);
        assert_eq!(schedule.lr_at(0.001, 50), 0.001);
    }

    #[test]
    fn test_step_decay_schedule() {
        let schedule = LrSchedule::step_decay(0.1, vec![10, 20, 30]);

        assert_eq!(schedule.lr_at(0.1, 0), 0.1);
        assert_eq!(schedule.lr_at(0.1, 9), 0.1);
        assert!((schedule.lr_at(0.1, 10) - 0.01).abs() < 1e-10);
        assert!((schedule.lr_at(0.1, 20) - 0.001).abs() < 1e-10);
        assert!((schedule.lr_at(0.1, 30) - 0.0001).abs() < 1e-10);
    }

    #[test]
    fn test_cosine_annealing_schedule() {
        let schedule = LrSchedule::cosine_annealing(0.001, 100);

        assert!(schedule.lr_at(0.1, 0) > 0.09);

        let expected_mid = (0.1 + 0.001) / 2.0;
        assert!((schedule.lr_at(0.1, 50) - expected_mid).abs() < 0.01);

        assert!((schedule.lr_at(0.1, 100) - 0.001).abs() < 1e-10);
        assert!((schedule.lr_at(0.1, 150) - 0.001).abs() < 1e-10);
    }

    #[test]
    fn test_reduce_on_plateau() {
        let mut plateau = ReduceLrOnPlateau::new(ReduceLrOnPlateauConfig {
            factor: 0.5,
            patience: 3,
            min_lr: 1e-6,
            min_delta: 0.0,
        });
        let mut lr = 0.1;

        // Metric improves
        for metric in [1.0, 0.9, 0.8] {
            assert_eq!(plateau.step(metric, lr), None);
        }

        // Metric stagnates
        assert_eq!(plateau.step(0.85, lr), None);
        assert_eq!(plateau.step(0.86, lr), None);
        lr = plateau.step(0.87, lr).unwrap();
        assert!((lr - 0.05).abs() < 1e-12);
        assert_eq!(plateau.epochs_without_improvement(), 0);
        assert!((plateau.apply(0.1) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_plateau_floors_at_min_lr() {
        let mut plateau = ReduceLrOnPlateau::new(ReduceLrOnPlateauConfig {
            factor: 0.1,
            patience: 1,
            min_lr: 1e-3,
            min_delta: 0.0,
        });
        let mut lr = 2e-3;

        plateau.step(1.0, lr);
        lr = plateau.step(1.0, lr).unwrap();
        assert_eq!(lr, 1e-3);
        assert_eq!(plateau.step(1.0, lr), None);
        assert_eq!(plateau.reductions(), 1);
    }

    #[test]
    fn test_plateau_min_delta() {
        let mut plateau = ReduceLrOnPlateau::new(ReduceLrOnPlateauConfig {
            min_delta: 0.1,
            patience: 1,
            ..Default::default()
        });
        plateau.step(1.0, 0.1);
        // 0.95 is not an improvement of at least 0.1
        assert!(plateau.step(0.95, 0.1).is_some());
    }

    #[test]
    fn test_invalid_config() {
        let config = ReduceLrOnPlateauConfig {
            factor: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
