// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Four-stage classification pipeline for the Iris dataset
//!
//! This crate provides:
//! - Versioned dataset extraction with a bundled reference fallback
//! - Preprocessing (missing-value removal, stratified split, standardization)
//! - Random forest training with parallel, seeded tree construction
//! - Evaluation metrics and classification reports
//! - A sequential runner and a compiled pipeline definition

pub mod datasets;
pub mod definition;
pub mod error;
pub mod evaluate;
pub mod extract;
pub mod forest;
pub mod iris;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod preprocess;
pub mod train;

pub use datasets::{LabeledData, Table, LABEL_COLUMN};
pub use definition::{ComponentSpec, DefinitionError, PipelineDefinition};
pub use error::PipelineError;
pub use evaluate::{MetricsLogger, TracingMetricsLogger, UiMetadataLogger};
pub use extract::{ExtractConfig, ExtractOutcome, ExtractReport};
pub use forest::{ForestConfig, MaxFeatures, RandomForest};
pub use metrics::{ClassificationReport, ConfusionMatrix, EvaluationMetrics};
pub use models::{Classifier, MajorityBaseline, Model, SavedModel};
pub use pipeline::{ArtifactLayout, Pipeline, PipelineConfig, PipelineResults, Stage};
pub use preprocess::{PreprocessConfig, StandardScaler};
pub use train::TrainReport;
