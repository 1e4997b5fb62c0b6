// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Evaluation metrics for multi-class classification
//!
//! Implements standard ML metrics:
//! - Confusion Matrix
//! - Accuracy
//! - Per-class Precision, Recall, F1-Score and support
//! - Macro and support-weighted averages
//!
//! Undefined ratios (zero denominators) are reported as 0.0.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Confusion matrix over an ordered label set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    /// Sorted union of true and predicted labels
    pub labels: Vec<i64>,
    /// `matrix[actual][predicted]`, indexed like `labels`
    pub matrix: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    /// Create from predictions and ground truth labels
    pub fn from_predictions(predictions: &[i64], ground_truth: &[i64]) -> Result<Self, PipelineError> {
        if predictions.len() != ground_truth.len() {
            return Err(PipelineError::LengthMismatch {
                predictions: predictions.len(),
                labels: ground_truth.len(),
            });
        }

        let mut labels: Vec<i64> = ground_truth.iter().chain(predictions).copied().collect();
        labels.sort_unstable();
        labels.dedup();

        let k = labels.len();
        let mut matrix = vec![vec![0usize; k]; k];
        for (pred, truth) in predictions.iter().zip(ground_truth) {
            // both labels are in the set by construction
            let p = labels.binary_search(pred).unwrap_or_default();
            let t = labels.binary_search(truth).unwrap_or_default();
            matrix[t][p] += 1;
        }

        Ok(Self { labels, matrix })
    }

    /// Total number of samples
    pub fn total(&self) -> usize {
        self.matrix.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.labels.len()).map(|i| self.matrix[i][i]).sum()
    }

    /// Accuracy: correct / total
    pub fn accuracy(&self) -> f64 {
        ratio(self.correct(), self.total())
    }

    /// Samples whose true label is `labels[idx]`
    pub fn support(&self, idx: usize) -> usize {
        self.matrix[idx].iter().sum()
    }

    /// Samples predicted as `labels[idx]`
    pub fn predicted(&self, idx: usize) -> usize {
        self.matrix.iter().map(|row| row[idx]).sum()
    }

    /// Precision: TP / (TP + FP)
    pub fn precision(&self, idx: usize) -> f64 {
        ratio(self.matrix[idx][idx], self.predicted(idx))
    }

    /// Recall: TP / (TP + FN)
    pub fn recall(&self, idx: usize) -> f64 {
        ratio(self.matrix[idx][idx], self.support(idx))
    }

    /// F1 Score: 2 * (Precision * Recall) / (Precision + Recall)
    pub fn f1_score(&self, idx: usize) -> f64 {
        let precision = self.precision(idx);
        let recall = self.recall(idx);
        let denom = precision + recall;
        if denom == 0.0 {
            return 0.0;
        }
        2.0 * precision * recall / denom
    }
}

fn ratio(num: usize, denom: usize) -> f64 {
    if denom == 0 {
        return 0.0;
    }
    num as f64 / denom as f64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub support: usize,
}

/// The four headline numbers written to the metrics artifact
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub accuracy: f64,
    /// Support-weighted average over classes
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
}

impl EvaluationMetrics {
    /// (name, value) pairs in artifact order
    pub fn entries(&self) -> [(&'static str, f64); 4] {
        [
            ("accuracy", self.accuracy),
            ("precision", self.precision),
            ("recall", self.recall),
            ("f1_score", self.f1_score),
        ]
    }
}

/// Per-class report with averages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    /// (display name, metrics) in label order
    pub per_class: Vec<(String, ClassMetrics)>,
    pub accuracy: f64,
    pub macro_avg: ClassMetrics,
    pub weighted_avg: ClassMetrics,
    pub confusion_matrix: ConfusionMatrix,
}

impl ClassificationReport {
    /// Generate full report from confusion matrix.
    ///
    /// `target_names` label the classes in sorted label order; when the count
    /// does not match, numeric labels are used instead.
    pub fn from_confusion_matrix(cm: ConfusionMatrix, target_names: &[String]) -> Self {
        let names: Vec<String> = if target_names.len() == cm.labels.len() {
            target_names.to_vec()
        } else {
            if !target_names.is_empty() {
                tracing::warn!(
                    "{} target names given for {} labels; using numeric labels",
                    target_names.len(),
                    cm.labels.len()
                );
            }
            cm.labels.iter().map(|l| l.to_string()).collect()
        };

        let per_class: Vec<(String, ClassMetrics)> = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                (
                    name,
                    ClassMetrics {
                        precision: cm.precision(i),
                        recall: cm.recall(i),
                        f1_score: cm.f1_score(i),
                        support: cm.support(i),
                    },
                )
            })
            .collect();

        let total = cm.total();
        let k = per_class.len().max(1) as f64;
        let mut macro_avg = ClassMetrics {
            precision: 0.0,
            recall: 0.0,
            f1_score: 0.0,
            support: total,
        };
        let mut weighted_avg = macro_avg.clone();

        for (_, m) in &per_class {
            macro_avg.precision += m.precision / k;
            macro_avg.recall += m.recall / k;
            macro_avg.f1_score += m.f1_score / k;

            let w = ratio(m.support, total);
            weighted_avg.precision += m.precision * w;
            weighted_avg.recall += m.recall * w;
            weighted_avg.f1_score += m.f1_score * w;
        }

        Self {
            per_class,
            accuracy: cm.accuracy(),
            macro_avg,
            weighted_avg,
            confusion_matrix: cm,
        }
    }

    /// Generate report from predictions and ground truth
    pub fn from_predictions(predictions: &[i64], ground_truth: &[i64], target_names: &[String]) -> Result<Self, PipelineError> {
        let cm = ConfusionMatrix::from_predictions(predictions, ground_truth)?;
        Ok(Self::from_confusion_matrix(cm, target_names))
    }

    pub fn metrics(&self) -> EvaluationMetrics {
        EvaluationMetrics {
            accuracy: self.accuracy,
            precision: self.weighted_avg.precision,
            recall: self.weighted_avg.recall,
            f1_score: self.weighted_avg.f1_score,
        }
    }

    /// Support per class name
    pub fn supports(&self) -> BTreeMap<String, usize> {
        self.per_class.iter().map(|(n, m)| (n.clone(), m.support)).collect()
    }

    /// Format as the usual precision/recall/f1-score/support table
    pub fn format(&self) -> String {
        const AVG_WIDTH: usize = "weighted avg".len();
        let width = self
            .per_class
            .iter()
            .map(|(n, _)| n.len())
            .max()
            .unwrap_or(0)
            .max(AVG_WIDTH);

        let row = |name: &str, m: &ClassMetrics| {
            format!(
                "{:>width$}  {:>9.2} {:>9.2} {:>9.2} {:>9}\n",
                name,
                m.precision,
                m.recall,
                m.f1_score,
                m.support,
                width = width
            )
        };

        let mut out = format!(
            "{:>width$}  {:>9} {:>9} {:>9} {:>9}\n\n",
            "",
            "precision",
            "recall",
            "f1-score",
            "support",
            width = width
        );
        for (name, m) in &self.per_class {
            out.push_str(&row(name, m));
        }
        out.push('\n');
        out.push_str(&format!(
            "{:>width$}  {:>9} {:>9} {:>9.2} {:>9}\n",
            "accuracy",
            "",
            "",
            self.accuracy,
            self.confusion_matrix.total(),
            width = width
        ));
        out.push_str(&row("macro avg", &self.macro_avg));
        out.push_str(&row("weighted avg", &self.weighted_avg));
        out
    }
}
