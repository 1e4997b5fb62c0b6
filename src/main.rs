// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Local runner for the Iris classification pipeline
//!
//! Usage:
//!   iris-pipeline --output pipeline_runs/latest
//!   iris-pipeline --params params.json --n-estimators 200 --max-depth none

use anyhow::Result;
use clap::Parser;
use iris_pipeline::forest::DepthLimit;
use iris_pipeline::pipeline::{Pipeline, PipelineConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "iris-pipeline")]
#[command(about = "Run the extract, preprocess, train and evaluate stages in sequence")]
#[command(version)]
struct Args {
    /// JSON parameter file; flags below override its values
    #[arg(long)]
    params: Option<PathBuf>,

    /// Repository holding the versioned dataset (URL or local directory)
    #[arg(long)]
    repo_url: Option<String>,

    /// Dataset path inside the repository
    #[arg(long)]
    data_path: Option<String>,

    /// Git revision of the dataset
    #[arg(long)]
    revision: Option<String>,

    /// Expected SHA-256 of the fetched dataset
    #[arg(long)]
    expected_sha256: Option<String>,

    /// Fail instead of using the bundled dataset when the fetch fails
    #[arg(long)]
    strict: bool,

    /// Held-out fraction for evaluation
    #[arg(long)]
    test_size: Option<f64>,

    /// Number of trees
    #[arg(long)]
    n_estimators: Option<usize>,

    /// Maximum tree depth, or "none"
    #[arg(long)]
    max_depth: Option<DepthLimit>,

    /// Random seed for reproducibility
    #[arg(long)]
    random_state: Option<u64>,

    /// Worker threads for training (default: all cores)
    #[arg(long)]
    n_jobs: Option<usize>,

    /// Output directory for artifacts and results
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<PipelineConfig> {
        let mut config = match &self.params {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(v) = self.repo_url {
            config.repo_url = v;
        }
        if let Some(v) = self.data_path {
            config.data_path = v;
        }
        if self.revision.is_some() {
            config.revision = self.revision;
        }
        if self.expected_sha256.is_some() {
            config.expected_sha256 = self.expected_sha256;
        }
        if self.strict {
            config.allow_fallback = false;
        }
        if let Some(v) = self.test_size {
            config.test_size = v;
        }
        if let Some(v) = self.n_estimators {
            config.n_estimators = v;
        }
        if let Some(DepthLimit(depth)) = self.max_depth {
            config.max_depth = depth;
        }
        if let Some(v) = self.random_state {
            config.random_state = v;
        }
        if self.n_jobs.is_some() {
            config.n_jobs = self.n_jobs;
        }
        if let Some(v) = self.output {
            config.output_dir = v.to_string_lossy().to_string();
        }

        Ok(config)
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Args::parse().into_config()?;

    tracing::info!("Iris Classification Pipeline");
    tracing::info!("============================");
    tracing::info!("Repository: {}", config.repo_url);
    tracing::info!("Data path: {}", config.data_path);
    tracing::info!("Seed: {}", config.random_state);

    let pipeline = Pipeline::new(config);
    let results = pipeline.run()?;

    // Print summary to console
    println!("\n{}", "=".repeat(60));
    println!("PIPELINE SUMMARY");
    println!("{}", "=".repeat(60));

    if let Some(ref extraction) = results.extraction {
        let source = if extraction.used_fallback() { "bundled fallback" } else { "versioned repository" };
        println!("\nDataset: {} rows from {}", extraction.rows, source);
    }
    if let Some(ref prep) = results.preprocessing {
        println!("Split: train={}, test={}", prep.train_rows, prep.test_rows);
    }

    println!("\n{:<24} {:>10} {:>14}", "Stage", "Status", "Duration (ms)");
    println!("{:-<50}", "");
    for record in &results.stages {
        println!("{:<24} {:>10} {:>14}", record.display_name, "ok", record.duration_ms);
    }
    println!("{:-<50}", "");

    if let Some(ref report) = results.classification_report {
        println!("\nClassification Report:\n{}", report.format());
    }
    if let Some(metrics) = results.metrics {
        for (name, value) in metrics.entries() {
            println!("{:<10} {:.4}", name, value);
        }
    }

    println!("\nArtifacts saved to: {}", pipeline.layout().root().display());
    println!("Pipeline complete!");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<PipelineConfig> {
        let argv = std::iter::once("iris-pipeline").chain(args.iter().copied());
        Args::try_parse_from(argv)?.into_config()
    }

    #[test]
    fn test_defaults_without_flags() {
        assert_eq!(parse(&[]).unwrap(), PipelineConfig::default());
    }

    #[test]
    fn test_flags_override_params_file() {
        let dir = tempfile::tempdir().unwrap();
        let params = dir.path().join("params.json");
        std::fs::write(
            &params,
            r#"{"test_size": 0.3, "n_estimators": 50, "max_depth": 5, "random_state": 1, "data_path": "d.csv"}"#,
        )
        .unwrap();
        let params = params.to_string_lossy().to_string();

        let config = parse(&[
            "--params",
            params.as_str(),
            "--n-estimators",
            "7",
            "--max-depth",
            "none",
            "--strict",
            "--output",
            "runs/x",
        ])
        .unwrap();

        assert_eq!(config.n_estimators, 7);
        assert_eq!(config.max_depth, None);
        assert!(!config.allow_fallback);
        assert_eq!(config.output_dir, "runs/x");
        assert!((config.test_size - 0.3).abs() < 1e-12);
        assert_eq!(config.random_state, 1);
        assert_eq!(config.data_path, "d.csv");
    }

    #[test]
    fn test_params_file_value_kept_without_flag() {
        let dir = tempfile::tempdir().unwrap();
        let params = dir.path().join("params.json");
        std::fs::write(&params, r#"{"max_depth": null, "allow_fallback": false}"#).unwrap();
        let params = params.to_string_lossy().to_string();

        let config = parse(&["--params", params.as_str(), "--max-depth", "4"]).unwrap();
        assert_eq!(config.max_depth, Some(4));
        assert!(!config.allow_fallback);
    }

    #[test]
    fn test_invalid_depth_rejected() {
        assert!(parse(&["--max-depth", "0"]).is_err());
        assert!(parse(&["--max-depth", "deep"]).is_err());
    }
}
