// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Classifiers and the model artifact
//!
//! Implements:
//! - `Classifier` trait shared by every model the pipeline can train or evaluate
//! - Majority class baseline (always predict the most common training class)
//! - Versioned binary model artifact (bincode)

use crate::datasets::LabeledData;
use crate::error::PipelineError;
use crate::forest::RandomForest;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

const MODEL_MAGIC: &[u8; 8] = b"IRISMDL\0";
pub const MODEL_FORMAT_VERSION: u32 = 1;

/// Trait for all classifiers
pub trait Classifier: Send + Sync {
    /// Fit the model on labeled data
    fn fit(&mut self, data: &LabeledData) -> Result<(), PipelineError>;

    /// Predict the class label of a single row
    fn predict_row(&self, row: &[f64]) -> i64;

    /// Predict labels for multiple rows
    fn predict(&self, rows: &[Vec<f64>]) -> Vec<i64> {
        rows.iter().map(|r| self.predict_row(r)).collect()
    }

    /// Fraction of rows predicted correctly
    fn score(&self, data: &LabeledData) -> f64 {
        if data.n_samples() == 0 {
            return 0.0;
        }
        let correct = self
            .predict(&data.features)
            .iter()
            .zip(&data.labels)
            .filter(|(p, t)| p == t)
            .count();
        correct as f64 / data.n_samples() as f64
    }

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Feature count seen during fit
    fn n_features(&self) -> usize;

    fn is_fitted(&self) -> bool;
}

impl Classifier for RandomForest {
    fn fit(&mut self, data: &LabeledData) -> Result<(), PipelineError> {
        RandomForest::fit(self, &data.features, &data.labels)
    }

    fn predict_row(&self, row: &[f64]) -> i64 {
        RandomForest::predict_row(self, row)
    }

    fn name(&self) -> &str {
        "RandomForest"
    }

    fn description(&self) -> &str {
        "Bootstrap-aggregated Gini decision trees with averaged class probabilities"
    }

    fn n_features(&self) -> usize {
        self.n_features
    }

    fn is_fitted(&self) -> bool {
        RandomForest::is_fitted(self)
    }
}

/// Majority class baseline: always predicts the most common class
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MajorityBaseline {
    majority_label: Option<i64>,
    class_prob: f64,
    n_features: usize,
}

impl MajorityBaseline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Baseline that predicts `label` without fitting
    pub fn constant(label: i64, n_features: usize) -> Self {
        Self {
            majority_label: Some(label),
            class_prob: 1.0,
            n_features,
        }
    }

    /// Training frequency of the majority class
    pub fn class_prob(&self) -> f64 {
        self.class_prob
    }
}

impl Classifier for MajorityBaseline {
    fn fit(&mut self, data: &LabeledData) -> Result<(), PipelineError> {
        let dist = data.class_distribution();
        // BTreeMap iterates in label order, so ties keep the lowest label
        let (label, count) = dist
            .iter()
            .fold(None, |best: Option<(i64, usize)>, (&label, &count)| match best {
                Some((_, best_count)) if best_count >= count => best,
                _ => Some((label, count)),
            })
            .ok_or_else(|| PipelineError::EmptyData("cannot fit baseline on zero samples".to_string()))?;

        self.majority_label = Some(label);
        self.class_prob = count as f64 / data.n_samples() as f64;
        self.n_features = data.n_features();
        Ok(())
    }

    fn predict_row(&self, _row: &[f64]) -> i64 {
        self.majority_label.unwrap_or_default()
    }

    fn name(&self) -> &str {
        "Majority"
    }

    fn description(&self) -> &str {
        "Always predicts the majority class from training data"
    }

    fn n_features(&self) -> usize {
        self.n_features
    }

    fn is_fitted(&self) -> bool {
        self.majority_label.is_some()
    }
}

/// Any model the artifact can hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Model {
    RandomForest(RandomForest),
    Majority(MajorityBaseline),
}

impl Model {
    pub fn as_classifier(&self) -> &dyn Classifier {
        match self {
            Model::RandomForest(m) => m as &dyn Classifier,
            Model::Majority(m) => m as &dyn Classifier,
        }
    }
}

/// Model artifact: a fitted model plus the schema it was trained on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedModel {
    pub feature_names: Vec<String>,
    pub label_column: String,
    pub model: Model,
}

impl SavedModel {
    pub fn new(model: Model, data: &LabeledData) -> Self {
        Self {
            feature_names: data.feature_names.clone(),
            label_column: data.label_column.clone(),
            model,
        }
    }

    /// Magic, little-endian format version, then the bincode body
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(MODEL_MAGIC.len() + 4);
        bytes.extend_from_slice(MODEL_MAGIC);
        bytes.extend_from_slice(&MODEL_FORMAT_VERSION.to_le_bytes());
        bytes.extend(bincode::serialize(self).context("Failed to serialize model")?);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header_len = MODEL_MAGIC.len() + 4;
        if bytes.len() < header_len || &bytes[..MODEL_MAGIC.len()] != MODEL_MAGIC {
            anyhow::bail!("Not a model artifact (bad header)");
        }

        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[MODEL_MAGIC.len()..header_len]);
        let version = u32::from_le_bytes(version);
        if version != MODEL_FORMAT_VERSION {
            return Err(PipelineError::ArtifactVersion(version).into());
        }

        let model = bincode::deserialize(&bytes[header_len..]).context("Failed to deserialize model")?;
        Ok(model)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_bytes()?)
            .with_context(|| format!("Failed to write model: {}", path.display()))?;
        tracing::info!("Model saved to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read model: {}", path.display()))?;
        Self::from_bytes(&bytes).with_context(|| format!("Invalid model artifact: {}", path.display()))
    }

    pub fn classifier(&self) -> &dyn Classifier {
        self.model.as_classifier()
    }

    /// Fail unless `data` has exactly the training columns, in order
    pub fn check_schema(&self, data: &LabeledData) -> Result<(), PipelineError> {
        if data.feature_names != self.feature_names {
            return Err(PipelineError::SchemaMismatch {
                expected: self.feature_names.clone(),
                got: data.feature_names.clone(),
            });
        }
        Ok(())
    }
}
