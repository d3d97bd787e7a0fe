//! Metrics Module for Model Evaluation
//!
//! Accumulated (true, predicted) label pairs are turned into:
//! - Accuracy
//! - Per-class precision, recall, F1-score and support
//! - Macro and support-weighted averages
//! - Confusion matrix (row = true class, column = predicted class)
//! - A plain-text classification report

use serde::{Deserialize, Serialize};

use crate::utils::error::{LesionError, Result};

/// Metrics record produced by one evaluation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Total number of samples evaluated
    pub total_samples: usize,

    /// Number of correct predictions
    pub correct_predictions: usize,

    /// Overall accuracy (correct / total)
    pub accuracy: f64,

    /// Mean (unweighted) loss over all samples, if the evaluator computed it
    pub average_loss: Option<f64>,

    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,

    /// F1 averaged over classes, weighted by support
    pub weighted_f1: f64,

    pub per_class: Vec<ClassMetrics>,

    pub confusion_matrix: ConfusionMatrix,
}

impl Metrics {
    /// Build metrics from predicted and ground-truth labels
    ///
    /// Fails if the two slices differ in length or a label is outside
    /// `0..num_classes`.
    pub fn from_predictions(
        predictions: &[usize],
        ground_truth: &[usize],
        num_classes: usize,
    ) -> Result<Self> {
        if predictions.len() != ground_truth.len() {
            return Err(LesionError::config(format!(
                "{} predictions for {} ground-truth labels",
                predictions.len(),
                ground_truth.len()
            )));
        }
        if num_classes == 0 {
            return Err(LesionError::config("num_classes must be at least 1"));
        }

        let confusion_matrix =
            ConfusionMatrix::from_predictions(predictions, ground_truth, num_classes)?;

        let total_samples = predictions.len();
        let correct_predictions = confusion_matrix.trace();
        let accuracy = if total_samples > 0 {
            correct_predictions as f64 / total_samples as f64
        } else {
            0.0
        };

        let per_class: Vec<ClassMetrics> = (0..num_classes)
            .map(|class_idx| ClassMetrics::from_confusion_matrix(&confusion_matrix, class_idx))
            .collect();

        // Classes that never occur in the ground truth do not count towards macro averages
        let valid_classes: Vec<&ClassMetrics> =
            per_class.iter().filter(|m| m.support > 0).collect();
        let num_valid = valid_classes.len() as f64;
        let macro_avg = |f: fn(&ClassMetrics) -> f64| {
            if num_valid > 0.0 {
                valid_classes.iter().map(|m| f(m)).sum::<f64>() / num_valid
            } else {
                0.0
            }
        };

        let macro_precision = macro_avg(|m| m.precision);
        let macro_recall = macro_avg(|m| m.recall);
        let macro_f1 = macro_avg(|m| m.f1);

        let weighted_f1 = weighted_average(&per_class, |m| m.f1);

        Ok(Self {
            total_samples,
            correct_predictions,
            accuracy,
            average_loss: None,
            macro_precision,
            macro_recall,
            macro_f1,
            weighted_f1,
            per_class,
            confusion_matrix,
        })
    }

    /// Attach class names to the per-class rows
    pub fn with_class_names(mut self, names: &[String]) -> Self {
        for class in &mut self.per_class {
            class.class_name = names.get(class.class_idx).cloned();
        }
        self
    }

    /// Attach the mean loss of the evaluation pass
    pub fn with_loss(mut self, loss: f64) -> Self {
        self.average_loss = Some(loss);
        self
    }

    pub fn weighted_precision(&self) -> f64 {
        weighted_average(&self.per_class, |m| m.precision)
    }

    pub fn weighted_recall(&self) -> f64 {
        weighted_average(&self.per_class, |m| m.recall)
    }

    /// Text report in the familiar precision/recall/f1/support layout
    pub fn classification_report(&self) -> String {
        let names: Vec<String> = self
            .per_class
            .iter()
            .map(|m| {
                m.class_name
                    .clone()
                    .unwrap_or_else(|| m.class_idx.to_string())
            })
            .collect();
        let width = names
            .iter()
            .map(|n| n.len())
            .chain(["weighted avg".len()])
            .max()
            .unwrap_or(12);

        let mut out = String::new();
        out.push_str(&format!(
            "{:>width$} {:>9} {:>9} {:>9} {:>9}\n\n",
            "",
            "precision",
            "recall",
            "f1-score",
            "support",
            width = width
        ));
        for (name, m) in names.iter().zip(&self.per_class) {
            out.push_str(&format!(
                "{:>width$} {:>9.4} {:>9.4} {:>9.4} {:>9}\n",
                name,
                m.precision,
                m.recall,
                m.f1,
                m.support,
                width = width
            ));
        }
        out.push('\n');
        out.push_str(&format!(
            "{:>width$} {:>9} {:>9} {:>9.4} {:>9}\n",
            "accuracy",
            "",
            "",
            self.accuracy,
            self.total_samples,
            width = width
        ));
        out.push_str(&format!(
            "{:>width$} {:>9.4} {:>9.4} {:>9.4} {:>9}\n",
            "macro avg",
            self.macro_precision,
            self.macro_recall,
            self.macro_f1,
            self.total_samples,
            width = width
        ));
        out.push_str(&format!(
            "{:>width$} {:>9.4} {:>9.4} {:>9.4} {:>9}\n",
            "weighted avg",
            self.weighted_precision(),
            self.weighted_recall(),
            self.weighted_f1,
            self.total_samples,
            width = width
        ));
        out
    }

    /// Short human readable summary
    pub fn summary(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!("Accuracy:        {:6.2}%\n", self.accuracy * 100.0));
        output.push_str(&format!("Weighted F1:     {:6.4}\n", self.weighted_f1));
        output.push_str(&format!("Macro F1:        {:6.4}\n", self.macro_f1));
        if let Some(loss) = self.average_loss {
            output.push_str(&format!("Loss:            {:6.4}\n", loss));
        }
        output.push_str(&format!("Total samples:   {:6}\n", self.total_samples));
        output
    }
}

impl std::fmt::Display for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.summary())
    }
}

fn weighted_average(per_class: &[ClassMetrics], f: fn(&ClassMetrics) -> f64) -> f64 {
    let total_support: usize = per_class.iter().map(|m| m.support).sum();
    if total_support == 0 {
        return 0.0;
    }
    per_class
        .iter()
        .map(|m| f(m) * m.support as f64)
        .sum::<f64>()
        / total_support as f64
}

/// Per-class metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub class_idx: usize,
    pub class_name: Option<String>,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    /// Precision = TP / (TP + FP)
    pub precision: f64,
    /// Recall = TP / (TP + FN)
    pub recall: f64,
    pub f1: f64,
    /// Number of samples whose true class is this one
    pub support: usize,
}

impl ClassMetrics {
    /// Calculate metrics for a class from confusion matrix
    pub fn from_confusion_matrix(cm: &ConfusionMatrix, class_idx: usize) -> Self {
        let true_positives = cm.get(class_idx, class_idx);

        let false_positives: usize = (0..cm.num_classes)
            .filter(|&i| i != class_idx)
            .map(|i| cm.get(i, class_idx))
            .sum();

        let false_negatives: usize = (0..cm.num_classes)
            .filter(|&i| i != class_idx)
            .map(|i| cm.get(class_idx, i))
            .sum();

        let support = true_positives + false_negatives;

        let precision = ratio(true_positives, true_positives + false_positives);
        let recall = ratio(true_positives, support);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            class_idx,
            class_name: None,
            true_positives,
            false_positives,
            false_negatives,
            precision,
            recall,
            f1,
            support,
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Confusion matrix for multi-class classification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub num_classes: usize,

    /// Row = true class, column = predicted class
    pub matrix: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    /// Create a new empty confusion matrix
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            matrix: vec![vec![0; num_classes]; num_classes],
        }
    }

    /// Create a confusion matrix from predictions
    pub fn from_predictions(
        predictions: &[usize],
        ground_truth: &[usize],
        num_classes: usize,
    ) -> Result<Self> {
        let mut cm = Self::new(num_classes);
        for (&pred, &actual) in predictions.iter().zip(ground_truth) {
            cm.add(actual, pred)?;
        }
        Ok(cm)
    }

    /// Record a single (true, predicted) pair
    pub fn add(&mut self, actual: usize, predicted: usize) -> Result<()> {
        if actual >= self.num_classes || predicted >= self.num_classes {
            return Err(LesionError::config(format!(
                "label pair ({}, {}) outside of {} classes",
                actual, predicted, self.num_classes
            )));
        }
        self.matrix[actual][predicted] += 1;
        Ok(())
    }

    /// Count at (actual, predicted)
    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        self.matrix
            .get(actual)
            .and_then(|row| row.get(predicted))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of the diagonal
    pub fn trace(&self) -> usize {
        (0..self.num_classes).map(|i| self.get(i, i)).sum()
    }

    pub fn total(&self) -> usize {
        self.matrix.iter().flatten().sum()
    }

    /// Render as an aligned text table
    pub fn to_table(&self, class_names: &[String]) -> String {
        let label = |i: usize| {
            class_names
                .get(i)
                .cloned()
                .unwrap_or_else(|| i.to_string())
        };
        let width = (0..self.num_classes)
            .map(|i| label(i).len())
            .chain(self.matrix.iter().flatten().map(|c| c.to_string().len()))
            .max()
            .unwrap_or(1)
            .max("true\\pred".len());

        let mut out = format!("{:>width$}", "true\\pred", width = width);
        for j in 0..self.num_classes {
            out.push_str(&format!(" {:>width$}", label(j), width = width));
        }
        out.push('\n');
        for i in 0..self.num_classes {
            out.push_str(&format!("{:>width$}", label(i), width = width));
            for j in 0..self.num_classes {
                out.push_str(&format!(" {:>width$}", self.get(i, j), width = width));
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_scenario() {
        let labels = [0, 0, 1, 1, 0, 1, 0, 1, 1, 0];
        let preds = [0, 0, 1, 0, 0, 1, 0, 1, 1, 1];

        let metrics = Metrics::from_predictions(&preds, &labels, 2).unwrap();

        assert!((metrics.accuracy - 0.8).abs() < 1e-12);
        assert_eq!(metrics.confusion_matrix.matrix, vec![vec![4, 1], vec![1, 4]]);
        assert_eq!(metrics.per_class[0].support, 5);
        assert_eq!(metrics.per_class[1].support, 5);
        assert!((metrics.per_class[1].precision - 0.8).abs() < 1e-12);
        assert!((metrics.per_class[1].recall - 0.8).abs() < 1e-12);
        assert!((metrics.weighted_f1 - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_f1_uses_support() {
        // class 0: 3 samples all right; class 1: 1 sample predicted as 0
        let labels = [0, 0, 0, 1];
        let preds = [0, 0, 0, 0];
        let metrics = Metrics::from_predictions(&preds, &labels, 2).unwrap();

        let f1_0 = 2.0 * 0.75 * 1.0 / 1.75;
        assert!((metrics.per_class[0].f1 - f1_0).abs() < 1e-12);
        assert_eq!(metrics.per_class[1].f1, 0.0);
        assert!((metrics.weighted_f1 - f1_0 * 0.75).abs() < 1e-12);
        assert!((metrics.macro_f1 - f1_0 / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_mismatched_lengths() {
        assert!(Metrics::from_predictions(&[0, 1], &[0], 2).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_label() {
        assert!(Metrics::from_predictions(&[2], &[0], 2).is_err());
    }

    #[test]
    fn test_empty_predictions() {
        let metrics = Metrics::from_predictions(&[], &[], 2).unwrap();
        assert_eq!(metrics.total_samples, 0);
        assert_eq!(metrics.accuracy, 0.0);
    }

    #[test]
    fn test_classification_report_rows() {
        let metrics = Metrics::from_predictions(&[0, 1, 1], &[0, 1, 0], 2)
            .unwrap()
            .with_class_names(&["benign".to_string(), "malignant".to_string()]);
        let report = metrics.classification_report();

        assert!(report.contains("benign"));
        assert!(report.contains("malignant"));
        assert!(report.contains("accuracy"));
        assert!(report.contains("macro avg"));
        assert!(report.contains("weighted avg"));
        assert!(report.contains("precision"));
    }

    #[test]
    fn test_confusion_table() {
        let cm = ConfusionMatrix::from_predictions(&[0, 1, 1], &[0, 1, 0], 2).unwrap();
        assert_eq!(cm.total(), 3);
        assert_eq!(cm.trace(), 2);
        let table = cm.to_table(&["benign".to_string(), "malignant".to_string()]);
        assert_eq!(table.lines().count(), 3);
    }
}
