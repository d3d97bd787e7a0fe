//! Error Handling Module
//!
//! Defines the error taxonomy for the lesion classification pipeline.
//! Uses thiserror for ergonomic error definitions.
//!
//! - `Configuration`: fatal, raised before any computation starts
//! - `DataLoad`: recoverable, the offending sample is skipped and counted
//! - `NumericDivergence`: fatal, training aborts before applying the update
//! - `ResourceExhaustion`: surfaced to the caller, optionally retried

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for lesion classification operations
#[derive(Error, Debug)]
pub enum LesionError {
    /// Bad directory layout, dimension mismatch, invalid class count...
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An image could not be read or decoded
    #[error("Failed to load image at '{path}': {reason}")]
    DataLoad { path: PathBuf, reason: String },

    /// The training loss became NaN or infinite
    #[error(
        "Numeric divergence at epoch {epoch}, batch {batch} (loss = {loss}); last good checkpoint: {}",
        display_checkpoint(.last_checkpoint)
    )]
    NumericDivergence {
        epoch: usize,
        batch: usize,
        loss: f64,
        last_checkpoint: Option<PathBuf>,
    },

    /// The compute device ran out of memory or another capacity limit was hit
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Checkpoint could not be written or restored
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

fn display_checkpoint(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "none".to_string())
}

impl LesionError {
    /// Shorthand for a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether the error should abort the current run
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::DataLoad { .. })
    }
}

impl From<serde_json::Error> for LesionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for LesionError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<burn::record::RecorderError> for LesionError {
    fn from(err: burn::record::RecorderError) -> Self {
        Self::Checkpoint(format!("{:?}", err))
    }
}

/// Convenience Result type for lesion classification operations
pub type Result<T> = std::result::Result<T, LesionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LesionError::config("no class directories");
        assert_eq!(
            format!("{}", err),
            "Configuration error: no class directories"
        );
    }

    #[test]
    fn test_data_load_error_mentions_path() {
        let err = LesionError::DataLoad {
            path: PathBuf::from("/data/benign/broken.jpg"),
            reason: "unexpected EOF".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("broken.jpg"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_divergence_reports_checkpoint() {
        let err = LesionError::NumericDivergence {
            epoch: 3,
            batch: 7,
            loss: f64::NAN,
            last_checkpoint: Some(PathBuf::from("out/best.mpk")),
        };
        assert!(format!("{}", err).contains("out/best.mpk"));

        let err = LesionError::NumericDivergence {
            epoch: 0,
            batch: 0,
            loss: f64::INFINITY,
            last_checkpoint: None,
        };
        assert!(format!("{}", err).contains("none"));
        assert!(err.is_fatal());
    }
}
