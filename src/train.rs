// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Model training stage

use crate::datasets::LabeledData;
use crate::forest::{ForestConfig, RandomForest};
use crate::models::{Classifier, Model, SavedModel};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Summary of a training run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainReport {
    pub model_name: String,
    pub n_samples: usize,
    pub n_features: usize,
    pub n_classes: usize,
    pub n_estimators: usize,
    /// In-sample accuracy; informational only
    pub training_accuracy: f64,
    /// (feature, importance), most important first
    pub feature_importances: Vec<(String, f64)>,
}

/// Fit a forest on in-memory training data
pub fn fit_forest(data: &LabeledData, config: &ForestConfig) -> Result<(RandomForest, TrainReport)> {
    tracing::info!("Training data shape: ({}, {})", data.n_samples(), data.n_features());
    tracing::info!("Number of classes: {}", data.class_distribution().len());

    let mut forest = RandomForest::new(config.clone());
    Classifier::fit(&mut forest, data)?;

    let training_accuracy = forest.score(data);

    let mut feature_importances: Vec<(String, f64)> = data
        .feature_names
        .iter()
        .cloned()
        .zip(forest.feature_importances.iter().copied())
        .collect();
    feature_importances.sort_by(|a, b| b.1.total_cmp(&a.1));

    let report = TrainReport {
        model_name: forest.name().to_string(),
        n_samples: data.n_samples(),
        n_features: data.n_features(),
        n_classes: forest.classes.len(),
        n_estimators: config.n_estimators,
        training_accuracy,
        feature_importances,
    };

    Ok((forest, report))
}

/// Run the training stage from a train partition artifact to a model artifact
pub fn run_training(train_data: &Path, model_output: &Path, config: &ForestConfig, label_column: &str) -> Result<TrainReport> {
    tracing::info!("Starting model training");

    let data = LabeledData::read_csv(train_data, label_column)?;
    let (forest, report) = fit_forest(&data, config)?;

    SavedModel::new(Model::RandomForest(forest), &data).save(model_output)?;

    tracing::info!("Model trained successfully with {} estimators", report.n_estimators);
    tracing::info!("Training accuracy: {:.4}", report.training_accuracy);
    for (feature, importance) in &report.feature_importances {
        tracing::info!("  importance {:<24} {:.4}", feature, importance);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::LABEL_COLUMN;
    use crate::error::PipelineError;
    use crate::iris;

    #[test]
    fn test_training_is_bit_for_bit_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let train_path = dir.path().join("train.csv");
        iris::load().write_csv(&train_path).unwrap();

        let config = ForestConfig {
            n_estimators: 20,
            ..ForestConfig::default()
        };
        let first = dir.path().join("model_a.bin");
        let second = dir.path().join("model_b.bin");

        let report = run_training(&train_path, &first, &config, LABEL_COLUMN).unwrap();
        run_training(&train_path, &second, &config, LABEL_COLUMN).unwrap();

        assert_eq!(std::fs::read(&first).unwrap(), std::fs::read(&second).unwrap());
        assert_eq!(report.n_samples, 150);
        assert_eq!(report.n_features, 4);
        assert_eq!(report.n_classes, 3);
        assert!(report.training_accuracy > 0.95);
        assert_eq!(report.feature_importances.len(), 4);
    }

    #[test]
    fn test_training_rejects_non_numeric_features() {
        let dir = tempfile::tempdir().unwrap();
        let train_path = dir.path().join("train.csv");
        std::fs::write(&train_path, "x,target\nred,0\nblue,1\n").unwrap();

        let err = run_training(&train_path, &dir.path().join("m.bin"), &ForestConfig::default(), LABEL_COLUMN)
            .unwrap_err();
        assert!(err.chain().any(|e| matches!(
            e.downcast_ref::<PipelineError>(),
            Some(PipelineError::NonNumeric { .. })
        )));
    }
}
