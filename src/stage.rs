// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Run a single pipeline stage, as a container component does
//!
//! Usage:
//!   pipeline-stage extract --repo-url <URL> --output dataset.csv
//!   pipeline-stage preprocess --input-data dataset.csv --train-data train.csv --test-data test.csv
//!   pipeline-stage train --train-data train.csv --model-output model.bin
//!   pipeline-stage evaluate --model-input model.bin --test-data test.csv --metrics-output metrics.json

use anyhow::Result;
use clap::{Parser, Subcommand};
use iris_pipeline::datasets::LABEL_COLUMN;
use iris_pipeline::evaluate::{self, EvaluateOutputs, MetricsLogger, MultiLogger, TracingMetricsLogger, UiMetadataLogger};
use iris_pipeline::extract::{self, ExtractConfig};
use iris_pipeline::forest::{DepthLimit, ForestConfig};
use iris_pipeline::iris;
use iris_pipeline::preprocess::{self, PreprocessConfig, PreprocessOutputs};
use iris_pipeline::train;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pipeline-stage")]
#[command(about = "Run one stage of the Iris classification pipeline")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    stage: StageCommand,
}

#[derive(Subcommand, Debug)]
enum StageCommand {
    /// Fetch the versioned dataset, falling back to the bundled copy
    Extract {
        #[arg(long, default_value_t = ExtractConfig::default().repo_url)]
        repo_url: String,

        #[arg(long, default_value = "data/iris.csv")]
        data_path: String,

        #[arg(long)]
        revision: Option<String>,

        #[arg(long)]
        expected_sha256: Option<String>,

        /// Fail instead of falling back when the fetch fails
        #[arg(long)]
        strict: bool,

        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,

        /// Dataset artifact to write
        #[arg(long)]
        output: PathBuf,
    },

    /// Split, standardize and write the train and test partitions
    Preprocess {
        #[arg(long)]
        input_data: PathBuf,

        #[arg(long)]
        train_data: PathBuf,

        #[arg(long)]
        test_data: PathBuf,

        /// Where to write the fitted scaler parameters
        #[arg(long)]
        scaler: Option<PathBuf>,

        #[arg(long, default_value_t = 0.2)]
        test_size: f64,

        #[arg(long, default_value_t = 42)]
        random_state: u64,

        #[arg(long, default_value = LABEL_COLUMN)]
        label_column: String,
    },

    /// Fit the random forest on the train partition
    Train {
        #[arg(long)]
        train_data: PathBuf,

        #[arg(long)]
        model_output: PathBuf,

        #[arg(long, default_value_t = 100)]
        n_estimators: usize,

        /// Positive integer or "none"
        #[arg(long, default_value = "10")]
        max_depth: DepthLimit,

        #[arg(long, default_value_t = 42)]
        random_state: u64,

        #[arg(long)]
        n_jobs: Option<usize>,

        #[arg(long, default_value = LABEL_COLUMN)]
        label_column: String,
    },

    /// Score the model on the test partition and log metrics
    Evaluate {
        #[arg(long)]
        model_input: PathBuf,

        #[arg(long)]
        test_data: PathBuf,

        #[arg(long)]
        metrics_output: PathBuf,

        /// Textual classification report
        #[arg(long)]
        report: Option<PathBuf>,

        /// Structured classification report
        #[arg(long)]
        report_json: Option<PathBuf>,

        /// Pipeline UI metrics file
        #[arg(long, default_value = "mlpipeline-metrics.json")]
        ui_metadata: PathBuf,

        /// Comma-separated class names, in label order
        #[arg(long, value_delimiter = ',')]
        target_names: Option<Vec<String>>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Args::parse().stage {
        StageCommand::Extract {
            repo_url,
            data_path,
            revision,
            expected_sha256,
            strict,
            timeout_secs,
            output,
        } => {
            let config = ExtractConfig {
                repo_url,
                data_path,
                revision,
                expected_sha256,
                allow_fallback: !strict,
                timeout_secs,
            };
            let report = extract::run_extraction(&config, &output)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        StageCommand::Preprocess {
            input_data,
            train_data,
            test_data,
            scaler,
            test_size,
            random_state,
            label_column,
        } => {
            let config = PreprocessConfig {
                test_size,
                random_state,
                label_column,
            };
            let outputs = PreprocessOutputs {
                train: &train_data,
                test: &test_data,
                scaler: scaler.as_deref(),
            };
            let report = preprocess::run_preprocessing(&input_data, &outputs, &config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        StageCommand::Train {
            train_data,
            model_output,
            n_estimators,
            max_depth,
            random_state,
            n_jobs,
            label_column,
        } => {
            let config = ForestConfig {
                n_estimators,
                max_depth: max_depth.0,
                random_state,
                n_jobs,
                ..ForestConfig::default()
            };
            let report = train::run_training(&train_data, &model_output, &config, &label_column)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        StageCommand::Evaluate {
            model_input,
            test_data,
            metrics_output,
            report,
            report_json,
            ui_metadata,
            target_names,
        } => {
            let target_names = target_names
                .unwrap_or_else(|| iris::TARGET_NAMES.iter().map(|n| n.to_string()).collect());
            let outputs = EvaluateOutputs {
                metrics: &metrics_output,
                report_text: report.as_deref(),
                report_json: report_json.as_deref(),
            };

            let mut ui = UiMetadataLogger::new();
            let mut log = TracingMetricsLogger;
            let (_, classification_report) = {
                let mut logger = MultiLogger::new(vec![&mut ui as &mut dyn MetricsLogger, &mut log]);
                evaluate::run_evaluation(&model_input, &test_data, &outputs, &target_names, &mut logger)?
            };
            ui.write(&ui_metadata)?;

            println!("\nClassification Report:\n{}", classification_report.format());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use iris_pipeline::definition::{ComponentSpec, PipelineDefinition};
    use iris_pipeline::pipeline::PipelineConfig;
    use serde_json::Value;
    use std::collections::BTreeMap;

    /// Bind parameters to their defaults and artifacts to paths under `/artifacts`
    fn bindings(def: &PipelineDefinition, component: &ComponentSpec) -> BTreeMap<String, String> {
        let defaults: BTreeMap<&str, String> = def
            .parameters
            .iter()
            .map(|p| {
                let value = match &p.default {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (p.name.as_str(), value)
            })
            .collect();

        let mut values = BTreeMap::new();
        for input in &component.inputs {
            let value = match input.from.as_deref().and_then(|f| f.strip_prefix("parameters.")) {
                Some(param) => defaults[param].clone(),
                None => format!("/artifacts/in/{}", input.name),
            };
            values.insert(format!("inputs.{}", input.name), value);
        }
        for output in &component.outputs {
            values.insert(format!("outputs.{}", output.name), format!("/artifacts/out/{}", output.name));
        }
        values
    }

    fn parse_component(def: &PipelineDefinition, name: &str) -> StageCommand {
        let component = def.component(name).unwrap();
        let argv = component.render(&bindings(def, component)).unwrap();
        Args::try_parse_from(argv).unwrap().stage
    }

    #[test]
    fn test_compiled_commands_parse() {
        let config = PipelineConfig {
            test_size: 0.25,
            n_estimators: 30,
            max_depth: None,
            random_state: 9,
            ..PipelineConfig::default()
        };
        let def = PipelineDefinition::build(&config);

        match parse_component(&def, "data-extraction") {
            StageCommand::Extract {
                repo_url,
                data_path,
                output,
                strict,
                ..
            } => {
                assert_eq!(repo_url, config.repo_url);
                assert_eq!(data_path, config.data_path);
                assert_eq!(output, PathBuf::from("/artifacts/out/dataset_path"));
                assert!(!strict);
            }
            other => panic!("unexpected {:?}", other),
        }

        match parse_component(&def, "data-preprocessing") {
            StageCommand::Preprocess {
                input_data,
                test_size,
                random_state,
                ..
            } => {
                assert_eq!(input_data, PathBuf::from("/artifacts/in/input_data"));
                assert!((test_size - 0.25).abs() < 1e-12);
                assert_eq!(random_state, 9);
            }
            other => panic!("unexpected {:?}", other),
        }

        match parse_component(&def, "model-training") {
            StageCommand::Train {
                n_estimators,
                max_depth,
                random_state,
                model_output,
                ..
            } => {
                assert_eq!(n_estimators, 30);
                assert_eq!(max_depth, DepthLimit(None));
                assert_eq!(random_state, 9);
                assert_eq!(model_output, PathBuf::from("/artifacts/out/model_output"));
            }
            other => panic!("unexpected {:?}", other),
        }

        match parse_component(&def, "model-evaluation") {
            StageCommand::Evaluate {
                metrics_output,
                report,
                report_json,
                ui_metadata,
                ..
            } => {
                assert_eq!(metrics_output, PathBuf::from("/artifacts/out/metrics_output"));
                assert_eq!(report, Some(PathBuf::from("/artifacts/out/report")));
                assert_eq!(report_json, Some(PathBuf::from("/artifacts/out/report_json")));
                assert_eq!(ui_metadata, PathBuf::from("/artifacts/out/ui_metadata"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bounded_depth_parses() {
        let def = PipelineDefinition::build(&PipelineConfig::default());
        match parse_component(&def, "model-training") {
            StageCommand::Train { max_depth, .. } => assert_eq!(max_depth, DepthLimit(Some(10))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_target_names_split_on_commas() {
        let args = Args::try_parse_from([
            "pipeline-stage",
            "evaluate",
            "--model-input",
            "m.bin",
            "--test-data",
            "t.csv",
            "--metrics-output",
            "metrics.json",
            "--target-names",
            "a,b,c",
        ])
        .unwrap();
        match args.stage {
            StageCommand::Evaluate { target_names, .. } => {
                assert_eq!(target_names, Some(vec!["a".to_string(), "b".to_string(), "c".to_string()]))
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
