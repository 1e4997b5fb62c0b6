// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Sequential four-stage pipeline runner
//!
//! Orchestrates:
//! - Dataset extraction (with reference fallback)
//! - Preprocessing (stratified split, standardization)
//! - Random forest training
//! - Evaluation and metrics logging
//! - Results serialization
//!
//! Stages exchange data only through the artifact files of an
//! [`ArtifactLayout`]. The first failing stage halts the run.

use crate::error::PipelineError;
use crate::evaluate::{self, EvaluateOutputs, MultiLogger, TracingMetricsLogger, UiMetadataLogger};
use crate::extract::{self, ExtractConfig, ExtractReport};
use crate::forest::{ForestConfig, MaxFeatures};
use crate::iris;
use crate::metrics::{ClassificationReport, EvaluationMetrics};
use crate::preprocess::{self, PreprocessConfig, PreprocessOutputs, PreprocessReport};
use crate::train::{self, TrainReport};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Configuration for a pipeline run; every field has a default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Repository holding the versioned dataset
    pub repo_url: String,
    /// Dataset path inside the repository
    pub data_path: String,
    pub revision: Option<String>,
    pub expected_sha256: Option<String>,
    /// Substitute the reference dataset when the fetch fails
    pub allow_fallback: bool,
    pub fetch_timeout_secs: u64,
    /// Held-out fraction, in (0, 1)
    pub test_size: f64,
    pub n_estimators: usize,
    /// `None` means unbounded
    pub max_depth: Option<usize>,
    /// Seed for both the split and the forest
    pub random_state: u64,
    pub n_jobs: Option<usize>,
    pub label_column: String,
    /// Class names for the report, in label order
    pub target_names: Vec<String>,
    /// Directory receiving all artifacts of the run
    pub output_dir: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let extract = ExtractConfig::default();
        Self {
            repo_url: extract.repo_url,
            data_path: extract.data_path,
            revision: None,
            expected_sha256: None,
            allow_fallback: true,
            fetch_timeout_secs: extract.timeout_secs,
            test_size: 0.2,
            n_estimators: 100,
            max_depth: Some(10),
            random_state: 42,
            n_jobs: None,
            label_column: crate::datasets::LABEL_COLUMN.to_string(),
            target_names: iris::TARGET_NAMES.iter().map(|n| n.to_string()).collect(),
            output_dir: "pipeline_runs/latest".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load parameters from a JSON file; absent keys keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read parameters: {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("Invalid parameters file: {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(self.test_size > 0.0 && self.test_size < 1.0) {
            return Err(PipelineError::InvalidParameter(format!(
                "test_size must be in (0, 1), got {}",
                self.test_size
            )));
        }
        self.forest_config().validate()
    }

    pub fn extract_config(&self) -> ExtractConfig {
        ExtractConfig {
            repo_url: self.repo_url.clone(),
            data_path: self.data_path.clone(),
            revision: self.revision.clone(),
            expected_sha256: self.expected_sha256.clone(),
            allow_fallback: self.allow_fallback,
            timeout_secs: self.fetch_timeout_secs,
        }
    }

    pub fn preprocess_config(&self) -> PreprocessConfig {
        PreprocessConfig {
            test_size: self.test_size,
            random_state: self.random_state,
            label_column: self.label_column.clone(),
        }
    }

    pub fn forest_config(&self) -> ForestConfig {
        ForestConfig {
            n_estimators: self.n_estimators,
            max_depth: self.max_depth,
            random_state: self.random_state,
            max_features: MaxFeatures::Sqrt,
            n_jobs: self.n_jobs,
            ..ForestConfig::default()
        }
    }
}

/// The four stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Preprocess,
    Train,
    Evaluate,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Extract, Stage::Preprocess, Stage::Train, Stage::Evaluate];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Extract => "data-extraction",
            Stage::Preprocess => "data-preprocessing",
            Stage::Train => "model-training",
            Stage::Evaluate => "model-evaluation",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Stage::Extract => "Extract Data",
            Stage::Preprocess => "Preprocess Data",
            Stage::Train => "Train Classifier",
            Stage::Evaluate => "Evaluate Model",
        }
    }

    /// The stage that must complete before this one runs
    pub fn upstream(&self) -> Option<Stage> {
        match self {
            Stage::Extract => None,
            Stage::Preprocess => Some(Stage::Extract),
            Stage::Train => Some(Stage::Preprocess),
            Stage::Evaluate => Some(Stage::Train),
        }
    }
}

/// Fixed artifact file names under a run directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset(&self) -> PathBuf {
        self.root.join("dataset.csv")
    }

    pub fn train_data(&self) -> PathBuf {
        self.root.join("train_data.csv")
    }

    pub fn test_data(&self) -> PathBuf {
        self.root.join("test_data.csv")
    }

    pub fn scaler(&self) -> PathBuf {
        self.root.join("scaler.json")
    }

    pub fn model(&self) -> PathBuf {
        self.root.join("model.bin")
    }

    pub fn metrics(&self) -> PathBuf {
        self.root.join("metrics.json")
    }

    pub fn report_text(&self) -> PathBuf {
        self.root.join("classification_report.txt")
    }

    pub fn report_json(&self) -> PathBuf {
        self.root.join("classification_report.json")
    }

    pub fn ui_metrics(&self) -> PathBuf {
        self.root.join("mlpipeline-metrics.json")
    }

    pub fn results(&self) -> PathBuf {
        self.root.join("run_results.json")
    }

    pub fn markdown_report(&self) -> PathBuf {
        self.root.join("run_report.md")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed { error: String },
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub display_name: String,
    #[serde(flatten)]
    pub status: StageStatus,
    pub duration_ms: u64,
}

/// Complete run results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResults {
    pub config: PipelineConfig,
    pub stages: Vec<StageRecord>,
    pub extraction: Option<ExtractReport>,
    pub preprocessing: Option<PreprocessReport>,
    pub training: Option<TrainReport>,
    pub metrics: Option<EvaluationMetrics>,
    pub classification_report: Option<ClassificationReport>,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl PipelineResults {
    fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            stages: Vec::new(),
            extraction: None,
            preprocessing: None,
            training: None,
            metrics: None,
            classification_report: None,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.stages.len() == Stage::ALL.len()
            && self.stages.iter().all(|s| s.status == StageStatus::Succeeded)
    }
}

/// Main pipeline
pub struct Pipeline {
    config: PipelineConfig,
    layout: ArtifactLayout,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let layout = ArtifactLayout::new(&config.output_dir);
        Self { config, layout }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    fn run_stage(&self, stage: Stage, results: &mut PipelineResults) -> Result<()> {
        let layout = &self.layout;
        match stage {
            Stage::Extract => {
                let report = extract::run_extraction(&self.config.extract_config(), &layout.dataset())?;
                results.extraction = Some(report);
            }
            Stage::Preprocess => {
                let (train, test, scaler) = (layout.train_data(), layout.test_data(), layout.scaler());
                let outputs = PreprocessOutputs {
                    train: &train,
                    test: &test,
                    scaler: Some(&scaler),
                };
                let report = preprocess::run_preprocessing(&layout.dataset(), &outputs, &self.config.preprocess_config())?;
                results.preprocessing = Some(report);
            }
            Stage::Train => {
                let report = train::run_training(
                    &layout.train_data(),
                    &layout.model(),
                    &self.config.forest_config(),
                    &self.config.label_column,
                )?;
                results.training = Some(report);
            }
            Stage::Evaluate => {
                let (metrics_path, text, json) = (layout.metrics(), layout.report_text(), layout.report_json());
                let outputs = EvaluateOutputs {
                    metrics: &metrics_path,
                    report_text: Some(&text),
                    report_json: Some(&json),
                };

                let mut ui = UiMetadataLogger::new();
                let mut log = TracingMetricsLogger;
                let (metrics, report) = {
                    let mut logger = MultiLogger::new(vec![&mut ui as &mut dyn evaluate::MetricsLogger, &mut log]);
                    evaluate::run_evaluation(
                        &layout.model(),
                        &layout.test_data(),
                        &outputs,
                        &self.config.target_names,
                        &mut logger,
                    )?
                };
                ui.write(&layout.ui_metrics())?;

                results.metrics = Some(metrics);
                results.classification_report = Some(report);
            }
        }
        Ok(())
    }

    /// Run every stage in order, stopping at the first failure.
    ///
    /// Results are written to the run directory whether or not the run succeeds.
    pub fn run(&self) -> Result<PipelineResults> {
        self.config.validate()?;
        std::fs::create_dir_all(self.layout.root())
            .with_context(|| format!("Failed to create run directory: {}", self.layout.root().display()))?;

        let mut results = PipelineResults::new(self.config.clone());
        let mut failure: Option<anyhow::Error> = None;

        for (i, stage) in Stage::ALL.iter().enumerate() {
            let status = if failure.is_some() {
                tracing::warn!("Skipping {}: upstream stage failed", stage.name());
                StageRecord {
                    stage: *stage,
                    display_name: stage.display_name().to_string(),
                    status: StageStatus::Skipped,
                    duration_ms: 0,
                }
            } else {
                tracing::info!("Stage {}/{}: {}", i + 1, Stage::ALL.len(), stage.display_name());
                let started = Instant::now();
                let outcome = self.run_stage(*stage, &mut results);
                let duration_ms = started.elapsed().as_millis() as u64;

                let status = match outcome {
                    Ok(()) => StageStatus::Succeeded,
                    Err(e) => {
                        tracing::error!("Stage {} failed: {:#}", stage.name(), e);
                        let status = StageStatus::Failed { error: format!("{:#}", e) };
                        failure = Some(e.context(format!("stage '{}' failed", stage.name())));
                        status
                    }
                };
                StageRecord {
                    stage: *stage,
                    display_name: stage.display_name().to_string(),
                    status,
                    duration_ms,
                }
            };
            results.stages.push(status);
        }

        Self::save_results(&results, &self.layout.results())?;
        std::fs::write(self.layout.markdown_report(), Self::generate_report(&results))?;

        match failure {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    /// Save results to JSON file
    pub fn save_results(results: &PipelineResults, output_path: &Path) -> Result<()> {
        std::fs::create_dir_all(output_path.parent().unwrap_or(Path::new(".")))?;
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(output_path, json)?;
        tracing::info!("Results saved to {}", output_path.display());
        Ok(())
    }

    /// Generate a markdown report
    pub fn generate_report(results: &PipelineResults) -> String {
        let mut report = String::new();

        report.push_str("# Classification Pipeline Run Report\n\n");
        report.push_str(&format!("**Generated:** {}\n\n", results.timestamp.format("%Y-%m-%d %H:%M:%S UTC")));
        report.push_str(&format!("**Version:** {}\n\n", results.version));

        report.push_str("## Stages\n\n");
        report.push_str("| Stage | Status | Duration (ms) |\n");
        report.push_str("|-------|--------|---------------|\n");
        for record in &results.stages {
            let status = match &record.status {
                StageStatus::Succeeded => "succeeded".to_string(),
                StageStatus::Failed { error } => format!("failed: {}", error.replace('|', "\\|")),
                StageStatus::Skipped => "skipped".to_string(),
            };
            report.push_str(&format!("| {} | {} | {} |\n", record.display_name, status, record.duration_ms));
        }

        if let Some(ref extraction) = results.extraction {
            report.push_str("\n## Dataset\n\n");
            match &extraction.outcome {
                extract::ExtractOutcome::Remote { source } => {
                    report.push_str(&format!("- **Source:** {}\n", source));
                }
                extract::ExtractOutcome::Fallback { reason } => {
                    report.push_str("- **Source:** bundled reference dataset (fallback)\n");
                    report.push_str(&format!("- **Fetch error:** {}\n", reason));
                }
            }
            report.push_str(&format!("- **Rows:** {}\n", extraction.rows));
            report.push_str(&format!("- **Columns:** {}\n", extraction.columns.join(", ")));
        }

        if let Some(ref prep) = results.preprocessing {
            report.push_str("\n## Preprocessing\n\n");
            report.push_str(&format!("- **Dropped rows:** {}\n", prep.dropped_rows));
            report.push_str(&format!("- **Split Sizes:** Train={}, Test={}\n", prep.train_rows, prep.test_rows));
            report.push_str(&format!("- **Class distribution:** {:?}\n", prep.class_distribution));
        }

        if let Some(ref training) = results.training {
            report.push_str("\n## Training\n\n");
            report.push_str(&format!(
                "- **Model:** {} ({} estimators)\n",
                training.model_name, training.n_estimators
            ));
            report.push_str(&format!("- **Training accuracy:** {:.4}\n", training.training_accuracy));
            report.push_str("- **Feature importances:**\n");
            for (feature, importance) in &training.feature_importances {
                report.push_str(&format!("  - {}: {:.4}\n", feature, importance));
            }
        }

        if let Some(ref metrics) = results.metrics {
            report.push_str("\n## Evaluation\n\n");
            report.push_str("| Metric | Value |\n");
            report.push_str("|--------|-------|\n");
            for (name, value) in metrics.entries() {
                report.push_str(&format!("| {} | {:.4} |\n", name, value));
            }
        }

        if let Some(ref cr) = results.classification_report {
            report.push_str(&format!("\n```\n{}```\n", cr.format()));
        }

        report.push_str("\n## Configuration\n\n");
        report.push_str(&format!(
            "```json\n{}\n```\n",
            serde_json::to_string_pretty(&results.config).unwrap_or_default()
        ));

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config(output_dir: &Path) -> PipelineConfig {
        PipelineConfig {
            repo_url: output_dir.join("no-such-repo").to_string_lossy().to_string(),
            output_dir: output_dir.join("run").to_string_lossy().to_string(),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::ALL[0].upstream(), None);
        for pair in Stage::ALL.windows(2) {
            assert_eq!(pair[1].upstream(), Some(pair[0]));
        }
    }

    #[test]
    fn test_params_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(&path, r#"{"n_estimators": 7, "max_depth": null}"#).unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.n_estimators, 7);
        assert_eq!(config.max_depth, None);
        assert_eq!(config.test_size, 0.2);
        assert_eq!(config.random_state, 42);
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        let config = PipelineConfig {
            test_size: 1.5,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(PipelineError::InvalidParameter(_))));

        let config = PipelineConfig {
            max_depth: Some(0),
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_end_to_end_with_fallback_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(offline_config(dir.path()));
        let results = pipeline.run().expect("Pipeline should succeed");

        assert!(results.succeeded());
        assert!(results.extraction.as_ref().unwrap().used_fallback());

        let prep = results.preprocessing.as_ref().unwrap();
        assert_eq!(prep.train_rows, 120);
        assert_eq!(prep.test_rows, 30);
        assert!(prep.test_class_distribution.values().all(|&n| n == 10));

        let metrics = results.metrics.unwrap();
        assert!(metrics.accuracy > 0.9, "accuracy {}", metrics.accuracy);
        assert!(metrics.f1_score > 0.9);

        let layout = pipeline.layout();
        for path in [
            layout.dataset(),
            layout.train_data(),
            layout.test_data(),
            layout.scaler(),
            layout.model(),
            layout.metrics(),
            layout.report_text(),
            layout.report_json(),
            layout.ui_metrics(),
            layout.results(),
            layout.markdown_report(),
        ] {
            assert!(path.exists(), "missing artifact {}", path.display());
        }

        let report = std::fs::read_to_string(layout.markdown_report()).unwrap();
        assert!(report.contains("Classification Pipeline Run Report"));
        assert!(report.contains("virginica"));
    }

    #[test]
    fn test_failed_stage_halts_downstream() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(repo.join("data")).unwrap();
        std::fs::write(repo.join("data/iris.csv"), "a,target\n1,0\n2,0\n3,0\n4,0\n5,1\n").unwrap();

        let config = PipelineConfig {
            repo_url: repo.to_string_lossy().to_string(),
            output_dir: dir.path().join("run").to_string_lossy().to_string(),
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::new(config);
        let err = pipeline.run().unwrap_err();
        assert!(format!("{:#}", err).contains("data-preprocessing"));

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(pipeline.layout().results()).unwrap()).unwrap();
        let statuses: Vec<&str> = saved["stages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["status"].as_str().unwrap())
            .collect();
        assert_eq!(statuses, vec!["succeeded", "failed", "skipped", "skipped"]);
        assert!(!pipeline.layout().model().exists());
    }
}
