// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Typed errors raised by the pipeline stages

use thiserror::Error;

/// Errors that make a stage fail. None of these are recovered from.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The dataset has no column with the configured label name
    #[error("label column '{0}' not found in dataset")]
    MissingLabelColumn(String),

    /// A cell could not be read as a number
    #[error("column '{column}', row {row}: cannot parse '{value}' as a number")]
    NonNumeric {
        column: String,
        row: usize,
        value: String,
    },

    /// A label value is not an integer class id
    #[error("label column '{column}', row {row}: {value} is not an integer class label")]
    MalformedLabel {
        column: String,
        row: usize,
        value: f64,
    },

    /// Missing values where a complete table is required
    #[error("missing value in column '{column}', row {row}")]
    MissingValues { column: String, row: usize },

    /// Non-finite feature value (NaN or infinity)
    #[error("non-finite value in feature {feature}, row {row}")]
    NonFinite { feature: usize, row: usize },

    #[error("empty data: {0}")]
    EmptyData(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Stratified split cannot satisfy the class counts
    #[error("stratified split is infeasible: {0}")]
    Stratification(String),

    #[error("feature mismatch: expected {expected} features, got {got}")]
    FeatureMismatch { expected: usize, got: usize },

    /// Test data columns differ from the columns the model was trained on
    #[error("schema mismatch: model was trained on {expected:?}, test data has {got:?}")]
    SchemaMismatch {
        expected: Vec<String>,
        got: Vec<String>,
    },

    #[error("length mismatch: {predictions} predictions for {labels} labels")]
    LengthMismatch { predictions: usize, labels: usize },

    #[error("unsupported model artifact format version {0}")]
    ArtifactVersion(u32),

    #[error("model has not been fitted")]
    NotFitted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_schema_mismatch() {
        let err = PipelineError::SchemaMismatch {
            expected: vec!["a".to_string(), "b".to_string()],
            got: vec!["a".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("schema mismatch"));
        assert!(msg.contains("\"b\""));
    }

    #[test]
    fn test_error_converts_to_anyhow() {
        let err: anyhow::Error = PipelineError::Stratification("too few".to_string()).into();
        assert!(err.downcast_ref::<PipelineError>().is_some());
    }
}
