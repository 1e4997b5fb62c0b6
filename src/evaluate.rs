// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Model evaluation stage
//!
//! Forward pass over the test partition, metric aggregation, and reporting
//! through the metrics-logging interface.

use crate::datasets::LabeledData;
use crate::error::PipelineError;
use crate::metrics::{ClassificationReport, EvaluationMetrics};
use crate::models::SavedModel;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Sink for scalar metrics reported to the orchestration platform
pub trait MetricsLogger {
    fn log_metric(&mut self, name: &str, value: f64);
}

/// Reports metrics as structured log events
#[derive(Debug, Default)]
pub struct TracingMetricsLogger;

impl MetricsLogger for TracingMetricsLogger {
    fn log_metric(&mut self, name: &str, value: f64) {
        tracing::info!(metric = name, value, "metric logged");
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiMetric {
    pub name: String,
    pub number_value: f64,
    pub format: String,
}

/// Collects metrics into the pipeline UI metadata file (`mlpipeline-metrics.json`)
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UiMetadataLogger {
    pub metrics: Vec<UiMetric>,
}

impl UiMetadataLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write UI metrics: {}", path.display()))?;
        Ok(())
    }
}

impl MetricsLogger for UiMetadataLogger {
    fn log_metric(&mut self, name: &str, value: f64) {
        self.metrics.push(UiMetric {
            name: name.to_string(),
            number_value: value,
            format: "RAW".to_string(),
        });
    }
}

/// Fans each metric out to several loggers
pub struct MultiLogger<'a> {
    loggers: Vec<&'a mut dyn MetricsLogger>,
}

impl<'a> MultiLogger<'a> {
    pub fn new(loggers: Vec<&'a mut dyn MetricsLogger>) -> Self {
        Self { loggers }
    }
}

impl MetricsLogger for MultiLogger<'_> {
    fn log_metric(&mut self, name: &str, value: f64) {
        for logger in &mut self.loggers {
            logger.log_metric(name, value);
        }
    }
}

/// Output locations of the evaluation stage
#[derive(Debug, Clone)]
pub struct EvaluateOutputs<'a> {
    pub metrics: &'a Path,
    pub report_text: Option<&'a Path>,
    pub report_json: Option<&'a Path>,
}

/// Predict on `test` and compute every metric
pub fn evaluate_model(model: &SavedModel, test: &LabeledData, target_names: &[String]) -> Result<ClassificationReport> {
    model.check_schema(test)?;
    if !model.classifier().is_fitted() {
        return Err(PipelineError::NotFitted.into());
    }

    let predictions = model.classifier().predict(&test.features);
    let report = ClassificationReport::from_predictions(&predictions, &test.labels, target_names)?;
    Ok(report)
}

/// Run the evaluation stage from model and test artifacts to the metrics artifact
pub fn run_evaluation(
    model_input: &Path,
    test_data: &Path,
    outputs: &EvaluateOutputs<'_>,
    target_names: &[String],
    logger: &mut dyn MetricsLogger,
) -> Result<(EvaluationMetrics, ClassificationReport)> {
    tracing::info!("Starting model evaluation");

    let model = SavedModel::load(model_input)?;
    let test = LabeledData::read_csv(test_data, &model.label_column)?;
    tracing::info!(
        "Evaluating {} on {} test samples",
        model.classifier().name(),
        test.n_samples()
    );

    let report = evaluate_model(&model, &test, target_names)
        .with_context(|| format!("Failed to evaluate model on {}", test_data.display()))?;
    let metrics = report.metrics();

    tracing::info!("Evaluation Metrics:");
    tracing::info!("  Accuracy:  {:.4}", metrics.accuracy);
    tracing::info!("  Precision: {:.4}", metrics.precision);
    tracing::info!("  Recall:    {:.4}", metrics.recall);
    tracing::info!("  F1-Score:  {:.4}", metrics.f1_score);
    tracing::info!("Classification Report:\n{}", report.format());

    for (name, value) in metrics.entries() {
        logger.log_metric(name, value);
    }

    if let Some(parent) = outputs.metrics.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(outputs.metrics, serde_json::to_string_pretty(&metrics)?)
        .with_context(|| format!("Failed to write metrics: {}", outputs.metrics.display()))?;

    if let Some(path) = outputs.report_text {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, report.format())
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
    }
    if let Some(path) = outputs.report_json {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
    }

    tracing::info!("Evaluation complete");
    Ok((metrics, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::LABEL_COLUMN;
    use crate::models::{MajorityBaseline, Model};
    use std::collections::BTreeMap;

    fn balanced_test_set() -> LabeledData {
        LabeledData {
            feature_names: vec!["a".to_string(), "b".to_string()],
            label_column: LABEL_COLUMN.to_string(),
            features: (0..30).map(|i| vec![i as f64, -(i as f64)]).collect(),
            labels: (0..30).map(|i| i / 10).collect(),
        }
    }

    fn names() -> Vec<String> {
        vec!["setosa".to_string(), "versicolor".to_string(), "virginica".to_string()]
    }

    #[test]
    fn test_majority_model_metrics_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let test = balanced_test_set();
        let test_path = dir.path().join("test.csv");
        test.write_csv(&test_path).unwrap();

        let model_path = dir.path().join("model.bin");
        SavedModel::new(Model::Majority(MajorityBaseline::constant(0, 2)), &test)
            .save(&model_path)
            .unwrap();

        let metrics_path = dir.path().join("metrics.json");
        let text_path = dir.path().join("reports").join("report.txt");
        let json_path = dir.path().join("reports").join("json").join("report.json");
        let outputs = EvaluateOutputs {
            metrics: &metrics_path,
            report_text: Some(&text_path),
            report_json: Some(&json_path),
        };
        let mut ui = UiMetadataLogger::new();

        let (metrics, report) = run_evaluation(&model_path, &test_path, &outputs, &names(), &mut ui).unwrap();

        assert!((metrics.accuracy - 1.0 / 3.0).abs() < 1e-9);
        assert!((metrics.f1_score - 1.0 / 6.0).abs() < 1e-9);
        assert_eq!(report.per_class.len(), 3);

        let written: BTreeMap<String, f64> =
            serde_json::from_str(&std::fs::read_to_string(&metrics_path).unwrap()).unwrap();
        assert_eq!(written.len(), 4);
        assert!((written["accuracy"] - 1.0 / 3.0).abs() < 1e-9);
        assert!(written.contains_key("f1_score"));

        let names_logged: Vec<&str> = ui.metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names_logged, vec!["accuracy", "precision", "recall", "f1_score"]);

        let text = std::fs::read_to_string(&text_path).unwrap();
        assert!(text.contains("versicolor"));
        let structured: ClassificationReport =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(structured.supports(), report.supports());
        assert_eq!(structured.confusion_matrix, report.confusion_matrix);
    }

    #[test]
    fn test_accuracy_matches_fraction_correct() {
        let mut test = balanced_test_set();
        test.labels[0] = 2;
        let model = SavedModel::new(Model::Majority(MajorityBaseline::constant(0, 2)), &test);

        let report = evaluate_model(&model, &test, &names()).unwrap();
        let predictions = model.classifier().predict(&test.features);
        let correct = predictions.iter().zip(&test.labels).filter(|(p, t)| p == t).count();
        assert!((report.accuracy - correct as f64 / test.n_samples() as f64).abs() < 1e-12);
    }

    #[test]
    fn test_schema_mismatch_is_fatal() {
        let test = balanced_test_set();
        let mut other = test.clone();
        other.feature_names = vec!["a".to_string(), "c".to_string()];
        let model = SavedModel::new(Model::Majority(MajorityBaseline::constant(0, 2)), &other);

        let err = evaluate_model(&model, &test, &names()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_ui_metadata_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ui").join("mlpipeline-metrics.json");
        let mut ui = UiMetadataLogger::new();
        let mut tracing_logger = TracingMetricsLogger;
        {
            let mut both = MultiLogger::new(vec![&mut ui as &mut dyn MetricsLogger, &mut tracing_logger]);
            both.log_metric("accuracy", 0.5);
        }
        ui.write(&path).unwrap();

        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["metrics"][0]["name"], "accuracy");
        assert_eq!(value["metrics"][0]["numberValue"], 0.5);
        assert_eq!(value["metrics"][0]["format"], "RAW");
    }

    #[test]
    fn test_unfitted_model_rejected() {
        let test = balanced_test_set();
        let model = SavedModel::new(Model::Majority(MajorityBaseline::new()), &test);
        let err = evaluate_model(&model, &test, &names()).unwrap_err();
        assert!(matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::NotFitted)));
    }
}
