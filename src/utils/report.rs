//! Metrics report artifacts
//!
//! Reports are written once per evaluation run. Every file goes through a
//! temporary file in the destination directory followed by a rename, so a
//! reader never observes a half-written report.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::info;

use crate::utils::error::{LesionError, Result};
use crate::utils::metrics::Metrics;

/// Write `contents` to `path` via temp file + atomic rename
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;

    let mut tmp = NamedTempFile::new_in(&parent)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| LesionError::Io(e.error))?;
    Ok(())
}

/// Structured evaluation report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub generated_at: DateTime<Local>,
    /// Checkpoint or model description the metrics belong to
    pub model: String,
    /// Dataset root that was evaluated
    pub dataset: String,
    pub class_names: Vec<String>,
    /// Samples skipped because they could not be decoded
    pub skipped_samples: usize,
    pub metrics: Metrics,
}

impl MetricsReport {
    pub fn new(
        model: impl Into<String>,
        dataset: impl Into<String>,
        class_names: Vec<String>,
        skipped_samples: usize,
        metrics: Metrics,
    ) -> Self {
        Self {
            generated_at: Local::now(),
            model: model.into(),
            dataset: dataset.into(),
            class_names,
            skipped_samples,
            metrics,
        }
    }

    /// Plain-text rendering: headline numbers, confusion matrix, report
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("model: {}\n", self.model));
        out.push_str(&format!("dataset: {}\n", self.dataset));
        out.push_str(&format!(
            "generated_at: {}\n",
            self.generated_at.format("%Y-%m-%d %H:%M:%S")
        ));
        out.push_str(&format!("accuracy: {:.4}\n", self.metrics.accuracy));
        out.push_str(&format!("f1_weighted: {:.4}\n", self.metrics.weighted_f1));
        if let Some(loss) = self.metrics.average_loss {
            out.push_str(&format!("loss: {:.4}\n", loss));
        }
        out.push_str(&format!("samples: {}\n", self.metrics.total_samples));
        out.push_str(&format!("skipped_samples: {}\n", self.skipped_samples));
        out.push_str("\nconfusion_matrix:\n");
        out.push_str(&self.metrics.confusion_matrix.to_table(&self.class_names));
        out.push_str("\nclassification_report:\n");
        out.push_str(&self.metrics.classification_report());
        out
    }

    /// Write `metrics.json` and `metrics.txt` into `dir`
    pub fn save(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        let json_path = dir.join("metrics.json");
        let text_path = dir.join("metrics.txt");

        write_atomic(&json_path, serde_json::to_string_pretty(self)?.as_bytes())?;
        write_atomic(&text_path, self.to_text().as_bytes())?;

        info!("Metrics report written to {:?}", dir);
        Ok((json_path, text_path))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_report() -> MetricsReport {
        let metrics = Metrics::from_predictions(
            &[0, 0, 1, 0, 0, 1, 0, 1, 1, 1],
            &[0, 0, 1, 1, 0, 1, 0, 1, 1, 0],
            2,
        )
        .unwrap()
        .with_loss(0.42);
        MetricsReport::new(
            "best.mpk",
            "data/val",
            vec!["benign".to_string(), "malignant".to_string()],
            1,
            metrics,
        )
    }

    #[test]
    fn test_write_atomic_replaces_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.txt");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        // Only the target remains, no stray temp files
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_report_save_and_load() {
        let dir = TempDir::new().unwrap();
        let report = sample_report();

        let (json_path, text_path) = report.save(dir.path()).unwrap();
        let loaded = MetricsReport::load(&json_path).unwrap();
        assert_eq!(loaded.metrics, report.metrics);

        let text = std::fs::read_to_string(text_path).unwrap();
        assert!(text.contains("accuracy: 0.8000"));
        assert!(text.contains("confusion_matrix"));
        assert!(text.contains("weighted avg"));
        assert!(text.contains("skipped_samples: 1"));
    }
}
