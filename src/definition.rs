// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Compiled pipeline definition
//!
//! A declarative description of the four stages as container components:
//! image, pinned libraries, command line with `{{inputs.*}}` and
//! `{{outputs.*}}` placeholders, typed inputs and outputs, and the
//! dependency graph between components.

use crate::pipeline::{PipelineConfig, Stage};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use thiserror::Error;

pub const PIPELINE_NAME: &str = "Iris Classification Pipeline";
const STAGE_BINARY: &str = "pipeline-stage";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("component '{0}' is declared more than once")]
    DuplicateComponent(String),

    #[error("component '{component}' depends on unknown component '{dependency}'")]
    UnknownDependency { component: String, dependency: String },

    #[error("dependency cycle between components: {0:?}")]
    Cycle(Vec<String>),

    #[error("component '{component}' references undeclared placeholder '{placeholder}'")]
    UnknownPlaceholder { component: String, placeholder: String },

    #[error("no value bound for '{0}'")]
    Unbound(String),
}

/// Type of a component input, output or pipeline parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoType {
    Dataset,
    Model,
    Metrics,
    String,
    Float,
    Integer,
}

impl IoType {
    pub fn is_artifact(&self) -> bool {
        matches!(self, IoType::Dataset | IoType::Model | IoType::Metrics)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub io_type: IoType,
    /// Where an input's value comes from: `parameters.<name>` or `<component>.outputs.<name>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl IoSpec {
    fn output(name: &str, io_type: IoType) -> Self {
        Self {
            name: name.to_string(),
            io_type,
            from: None,
        }
    }

    fn parameter(name: &str, io_type: IoType) -> Self {
        Self {
            name: name.to_string(),
            io_type,
            from: Some(format!("parameters.{}", name)),
        }
    }

    fn upstream(name: &str, io_type: IoType, stage: Stage, output: &str) -> Self {
        Self {
            name: name.to_string(),
            io_type,
            from: Some(format!("{}.outputs.{}", stage.name(), output)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: IoType,
    pub default: Value,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    pub display_name: String,
    pub image: String,
    /// Pinned libraries the component relies on
    pub packages: Vec<String>,
    pub command: Vec<String>,
    pub inputs: Vec<IoSpec>,
    pub outputs: Vec<IoSpec>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ComponentSpec {
    /// Placeholder keys used by the command, e.g. `inputs.repo_url`
    pub fn placeholders(&self) -> Vec<String> {
        self.command.iter().filter_map(|arg| placeholder_key(arg)).map(str::to_string).collect()
    }

    /// Check every placeholder names a declared input or output
    pub fn check_placeholders(&self) -> Result<(), DefinitionError> {
        for key in self.placeholders() {
            let declared = match key.split_once('.') {
                Some(("inputs", name)) => self.inputs.iter().any(|i| i.name == name),
                Some(("outputs", name)) => self.outputs.iter().any(|o| o.name == name),
                _ => false,
            };
            if !declared {
                return Err(DefinitionError::UnknownPlaceholder {
                    component: self.name.clone(),
                    placeholder: key,
                });
            }
        }
        Ok(())
    }

    /// Substitute placeholders with bound values, keyed like `inputs.test_size`
    pub fn render(&self, values: &BTreeMap<String, String>) -> Result<Vec<String>, DefinitionError> {
        self.command
            .iter()
            .map(|arg| match placeholder_key(arg) {
                Some(key) => values.get(key).cloned().ok_or_else(|| DefinitionError::Unbound(key.to_string())),
                None => Ok(arg.clone()),
            })
            .collect()
    }
}

fn placeholder_key(arg: &str) -> Option<&str> {
    arg.strip_prefix("{{")?.strip_suffix("}}").map(str::trim)
}

fn input(name: &str) -> String {
    format!("{{{{inputs.{}}}}}", name)
}

fn output(name: &str) -> String {
    format!("{{{{outputs.{}}}}}", name)
}

/// Complete pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub description: String,
    pub version: String,
    pub parameters: Vec<ParameterSpec>,
    pub components: Vec<ComponentSpec>,
}

impl PipelineDefinition {
    /// Build the four-component definition with `config` supplying parameter defaults
    pub fn build(config: &PipelineConfig) -> Self {
        let version = env!("CARGO_PKG_VERSION").to_string();
        let image = format!("iris-pipeline:{}", version);
        let max_depth = match config.max_depth {
            Some(depth) => json!(depth),
            None => json!("none"),
        };

        let parameters = vec![
            param("repo_url", IoType::String, json!(config.repo_url), "Repository holding the versioned dataset"),
            param("data_path", IoType::String, json!(config.data_path), "Dataset path inside the repository"),
            param("test_size", IoType::Float, json!(config.test_size), "Held-out fraction for evaluation"),
            param("n_estimators", IoType::Integer, json!(config.n_estimators), "Number of trees in the forest"),
            param("max_depth", IoType::Integer, max_depth, "Maximum tree depth, or \"none\" for unbounded"),
            param("random_state", IoType::Integer, json!(config.random_state), "Seed for the split and the forest"),
        ];

        let component = |stage: Stage, packages: &[&str], args: Vec<String>, inputs, outputs| ComponentSpec {
            name: stage.name().to_string(),
            display_name: stage.display_name().to_string(),
            image: image.clone(),
            packages: packages.iter().map(|p| p.to_string()).collect(),
            command: [STAGE_BINARY.to_string(), subcommand(stage).to_string()]
                .into_iter()
                .chain(args)
                .collect(),
            inputs,
            outputs,
            depends_on: stage.upstream().map(|s| vec![s.name().to_string()]).unwrap_or_default(),
        };

        let components = vec![
            component(
                Stage::Extract,
                &["reqwest==0.12", "csv==1.3", "sha2==0.10"],
                vec![
                    "--repo-url".into(),
                    input("repo_url"),
                    "--data-path".into(),
                    input("data_path"),
                    "--output".into(),
                    output("dataset_path"),
                ],
                vec![
                    IoSpec::parameter("repo_url", IoType::String),
                    IoSpec::parameter("data_path", IoType::String),
                ],
                vec![IoSpec::output("dataset_path", IoType::Dataset)],
            ),
            component(
                Stage::Preprocess,
                &["csv==1.3", "rand==0.8", "rand_chacha==0.3"],
                vec![
                    "--input-data".into(),
                    input("input_data"),
                    "--train-data".into(),
                    output("train_data"),
                    "--test-data".into(),
                    output("test_data"),
                    "--test-size".into(),
                    input("test_size"),
                    "--random-state".into(),
                    input("random_state"),
                ],
                vec![
                    IoSpec::upstream("input_data", IoType::Dataset, Stage::Extract, "dataset_path"),
                    IoSpec::parameter("test_size", IoType::Float),
                    IoSpec::parameter("random_state", IoType::Integer),
                ],
                vec![
                    IoSpec::output("train_data", IoType::Dataset),
                    IoSpec::output("test_data", IoType::Dataset),
                ],
            ),
            component(
                Stage::Train,
                &["csv==1.3", "rayon==1.8", "bincode==1.3"],
                vec![
                    "--train-data".into(),
                    input("train_data"),
                    "--model-output".into(),
                    output("model_output"),
                    "--n-estimators".into(),
                    input("n_estimators"),
                    "--max-depth".into(),
                    input("max_depth"),
                    "--random-state".into(),
                    input("random_state"),
                ],
                vec![
                    IoSpec::upstream("train_data", IoType::Dataset, Stage::Preprocess, "train_data"),
                    IoSpec::parameter("n_estimators", IoType::Integer),
                    IoSpec::parameter("max_depth", IoType::Integer),
                    IoSpec::parameter("random_state", IoType::Integer),
                ],
                vec![IoSpec::output("model_output", IoType::Model)],
            ),
            component(
                Stage::Evaluate,
                &["csv==1.3", "bincode==1.3", "serde_json==1.0"],
                vec![
                    "--model-input".into(),
                    input("model_input"),
                    "--test-data".into(),
                    input("test_data"),
                    "--metrics-output".into(),
                    output("metrics_output"),
                    "--report".into(),
                    output("report"),
                    "--report-json".into(),
                    output("report_json"),
                    "--ui-metadata".into(),
                    output("ui_metadata"),
                ],
                vec![
                    IoSpec::upstream("model_input", IoType::Model, Stage::Train, "model_output"),
                    IoSpec::upstream("test_data", IoType::Dataset, Stage::Preprocess, "test_data"),
                ],
                vec![
                    IoSpec::output("metrics_output", IoType::Metrics),
                    IoSpec::output("report", IoType::Metrics),
                    IoSpec::output("report_json", IoType::Metrics),
                    IoSpec::output("ui_metadata", IoType::Metrics),
                ],
            ),
        ];

        Self {
            name: PIPELINE_NAME.to_string(),
            description: "End-to-end classification pipeline over a versioned dataset".to_string(),
            version,
            parameters,
            components,
        }
    }

    pub fn component(&self, name: &str) -> Option<&ComponentSpec> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Components in dependency order; declaration order breaks ties
    pub fn execution_order(&self) -> Result<Vec<&ComponentSpec>, DefinitionError> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, c) in self.components.iter().enumerate() {
            if index.insert(c.name.as_str(), i).is_some() {
                return Err(DefinitionError::DuplicateComponent(c.name.clone()));
            }
        }

        let mut in_degree = vec![0usize; self.components.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.components.len()];
        for (i, c) in self.components.iter().enumerate() {
            for dep in &c.depends_on {
                let &j = index.get(dep.as_str()).ok_or_else(|| DefinitionError::UnknownDependency {
                    component: c.name.clone(),
                    dependency: dep.clone(),
                })?;
                in_degree[i] += 1;
                dependents[j].push(i);
            }
        }

        let mut ready: VecDeque<usize> = (0..self.components.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.components.len());
        while let Some(i) = ready.pop_front() {
            order.push(&self.components[i]);
            for &d in &dependents[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    ready.push_back(d);
                }
            }
        }

        if order.len() < self.components.len() {
            let stuck = self
                .components
                .iter()
                .zip(&in_degree)
                .filter(|&(_, &deg)| deg > 0)
                .map(|(c, _)| c.name.clone())
                .collect();
            return Err(DefinitionError::Cycle(stuck));
        }

        Ok(order)
    }

    /// Check the graph and every component's placeholders
    pub fn validate(&self) -> Result<(), DefinitionError> {
        self.execution_order()?;
        self.components.iter().try_for_each(ComponentSpec::check_placeholders)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)
            .with_context(|| format!("Failed to write pipeline definition: {}", path.display()))?;
        tracing::info!("Pipeline compiled to {}", path.display());
        Ok(())
    }
}

fn param(name: &str, param_type: IoType, default: Value, description: &str) -> ParameterSpec {
    ParameterSpec {
        name: name.to_string(),
        param_type,
        default,
        description: description.to_string(),
    }
}

fn subcommand(stage: Stage) -> &'static str {
    match stage {
        Stage::Extract => "extract",
        Stage::Preprocess => "preprocess",
        Stage::Train => "train",
        Stage::Evaluate => "evaluate",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> PipelineDefinition {
        PipelineDefinition::build(&PipelineConfig::default())
    }

    #[test]
    fn test_default_definition_is_valid() {
        let def = definition();
        assert!(def.validate().is_ok());
        assert_eq!(def.components.len(), 4);

        let order: Vec<&str> = def.execution_order().unwrap().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            order,
            vec!["data-extraction", "data-preprocessing", "model-training", "model-evaluation"]
        );
    }

    #[test]
    fn test_parameter_defaults_follow_config() {
        let def = definition();
        let defaults: BTreeMap<&str, &Value> = def.parameters.iter().map(|p| (p.name.as_str(), &p.default)).collect();
        assert_eq!(defaults["test_size"], &json!(0.2));
        assert_eq!(defaults["n_estimators"], &json!(100));
        assert_eq!(defaults["max_depth"], &json!(10));
        assert_eq!(defaults["random_state"], &json!(42));

        let unbounded = PipelineDefinition::build(&PipelineConfig {
            max_depth: None,
            ..PipelineConfig::default()
        });
        let max_depth = unbounded.parameters.iter().find(|p| p.name == "max_depth").unwrap();
        assert_eq!(max_depth.default, json!("none"));
    }

    #[test]
    fn test_inputs_wire_to_declared_sources() {
        let def = definition();
        let params: Vec<&str> = def.parameters.iter().map(|p| p.name.as_str()).collect();

        for component in &def.components {
            for input in &component.inputs {
                let from = input.from.as_deref().unwrap();
                match from.split_once('.') {
                    Some(("parameters", name)) => assert!(params.contains(&name), "{}", from),
                    Some((upstream, rest)) => {
                        let output = rest.strip_prefix("outputs.").unwrap();
                        let source = def.component(upstream).unwrap();
                        let declared = source.outputs.iter().find(|o| o.name == output).unwrap();
                        assert_eq!(declared.io_type, input.io_type);
                        assert!(input.io_type.is_artifact());
                    }
                    None => panic!("malformed source {}", from),
                }
            }
        }
    }

    #[test]
    fn test_unknown_dependency_and_cycle_rejected() {
        let mut def = definition();
        def.components[1].depends_on = vec!["nowhere".to_string()];
        assert!(matches!(
            def.execution_order(),
            Err(DefinitionError::UnknownDependency { .. })
        ));

        let mut def = definition();
        def.components[0].depends_on = vec!["model-evaluation".to_string()];
        match def.execution_order() {
            Err(DefinitionError::Cycle(names)) => assert_eq!(names.len(), 4),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_undeclared_placeholder_rejected() {
        let mut def = definition();
        def.components[2].command.push(input("learning_rate"));
        assert_eq!(
            def.validate(),
            Err(DefinitionError::UnknownPlaceholder {
                component: "model-training".to_string(),
                placeholder: "inputs.learning_rate".to_string(),
            })
        );
    }

    #[test]
    fn test_render_command() {
        let def = definition();
        let extract = def.component("data-extraction").unwrap();
        let mut values = BTreeMap::new();
        values.insert("inputs.repo_url".to_string(), "/data/repo".to_string());
        values.insert("inputs.data_path".to_string(), "iris.csv".to_string());
        assert_eq!(extract.render(&values), Err(DefinitionError::Unbound("outputs.dataset_path".to_string())));

        values.insert("outputs.dataset_path".to_string(), "/tmp/dataset.csv".to_string());
        assert_eq!(
            extract.render(&values).unwrap(),
            vec![
                "pipeline-stage",
                "extract",
                "--repo-url",
                "/data/repo",
                "--data-path",
                "iris.csv",
                "--output",
                "/tmp/dataset.csv"
            ]
        );
    }

    #[test]
    fn test_save_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("components/pipeline.json");
        definition().save(&path).unwrap();

        let loaded: PipelineDefinition = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, definition());
    }

    #[test]
    fn test_evaluate_declares_every_report() {
        let def = definition();
        let evaluate = def.component("model-evaluation").unwrap();
        let outputs: Vec<&str> = evaluate.outputs.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(outputs, vec!["metrics_output", "report", "report_json", "ui_metadata"]);
        for name in outputs {
            assert!(evaluate.placeholders().contains(&format!("outputs.{}", name)));
        }
    }
}
