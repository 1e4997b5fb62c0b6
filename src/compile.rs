// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Compile the pipeline definition to JSON
//!
//! Usage:
//!   compile-pipeline --output components/pipeline.json

use anyhow::Result;
use clap::Parser;
use iris_pipeline::definition::PipelineDefinition;
use iris_pipeline::pipeline::PipelineConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "compile-pipeline")]
#[command(about = "Write the compiled pipeline definition")]
#[command(version)]
struct Args {
    /// Destination of the compiled definition
    #[arg(short, long, default_value = "components/pipeline.json")]
    output: PathBuf,

    /// JSON parameter file supplying parameter defaults
    #[arg(long)]
    params: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.params {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    let definition = PipelineDefinition::build(&config);
    definition.save(&args.output)?;

    println!("Pipeline compiled successfully to {}", args.output.display());
    println!("Execution order:");
    for (i, component) in definition.execution_order()?.iter().enumerate() {
        println!("  {}. {} ({})", i + 1, component.display_name, component.name);
    }

    Ok(())
}
