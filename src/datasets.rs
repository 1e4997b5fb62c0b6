// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Tabular dataset artifacts
//!
//! Two views of the same CSV files:
//! - [`Table`]: raw numeric table where any cell may be missing
//! - [`LabeledData`]: complete feature matrix plus an integer label column

use crate::error::PipelineError;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Name of the label column in every dataset artifact
pub const LABEL_COLUMN: &str = "target";

/// Compared case-insensitively; any cell that parses to NaN is missing as well
const MISSING_MARKERS: [&str; 15] = [
    "", "na", "nan", "-nan", "null", "none", "n/a", "#n/a", "#n/a n/a", "#na", "<na>", "-1.#ind", "1.#ind", "-1.#qnan",
    "1.#qnan",
];

/// Labels are exact in f64 only up to 2^53
const MAX_LABEL: f64 = 9_007_199_254_740_992.0;

/// Raw numeric table; `None` marks a missing cell
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<f64>>>,
}

impl Table {
    /// Parse CSV with a header row. Short rows are padded with missing cells.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let columns: Vec<String> = reader
            .headers()
            .context("Failed to read CSV header")?
            .iter()
            .map(|h| h.to_string())
            .collect();

        if columns.is_empty() {
            return Err(PipelineError::EmptyData("CSV has no columns".to_string()).into());
        }

        let mut rows = Vec::new();
        for (idx, result) in reader.records().enumerate() {
            let record = result.with_context(|| format!("Failed to read record {}", idx))?;
            let mut row = Vec::with_capacity(columns.len());
            for (col, name) in columns.iter().enumerate() {
                row.push(parse_cell(record.get(col).unwrap_or(""), name, idx)?);
            }
            rows.push(row);
        }

        Ok(Self { columns, rows })
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open dataset: {}", path.display()))?;
        Self::from_reader(file).with_context(|| format!("Failed to parse dataset: {}", path.display()))
    }

    /// Write as CSV; missing cells are written empty
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let rows = self
            .rows
            .iter()
            .map(|row| row.iter().map(|cell| cell.map(format_value).unwrap_or_default()).collect());
        write_records(path, &self.columns, rows)
    }

    /// (rows, columns)
    pub fn shape(&self) -> (usize, usize) {
        (self.rows.len(), self.columns.len())
    }

    /// Remove every row with at least one missing cell; returns the number dropped
    pub fn drop_incomplete(&mut self) -> usize {
        let before = self.rows.len();
        self.rows.retain(|row| row.iter().all(Option::is_some));
        before - self.rows.len()
    }

    /// Split off the label column. Fails on missing cells or non-integer labels.
    pub fn into_labeled(self, label_column: &str) -> Result<LabeledData, PipelineError> {
        let label_idx = self
            .columns
            .iter()
            .position(|c| c == label_column)
            .ok_or_else(|| PipelineError::MissingLabelColumn(label_column.to_string()))?;

        let feature_names: Vec<String> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != label_idx)
            .map(|(_, c)| c.clone())
            .collect();

        let mut features = Vec::with_capacity(self.rows.len());
        let mut labels = Vec::with_capacity(self.rows.len());

        for (row_idx, row) in self.rows.into_iter().enumerate() {
            let mut values = Vec::with_capacity(feature_names.len());
            for (col_idx, cell) in row.into_iter().enumerate() {
                let value = cell.ok_or_else(|| PipelineError::MissingValues {
                    column: self.columns[col_idx].clone(),
                    row: row_idx,
                })?;
                if col_idx == label_idx {
                    if !value.is_finite() || value.fract() != 0.0 || value.abs() > MAX_LABEL {
                        return Err(PipelineError::MalformedLabel {
                            column: label_column.to_string(),
                            row: row_idx,
                            value,
                        });
                    }
                    labels.push(value as i64);
                } else {
                    values.push(value);
                }
            }
            features.push(values);
        }

        Ok(LabeledData {
            feature_names,
            label_column: label_column.to_string(),
            features,
            labels,
        })
    }
}

/// Complete feature matrix with integer class labels
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledData {
    pub feature_names: Vec<String>,
    pub label_column: String,
    /// Row-major: one inner vector per sample
    pub features: Vec<Vec<f64>>,
    pub labels: Vec<i64>,
}

impl LabeledData {
    pub fn read_csv(path: &Path, label_column: &str) -> Result<Self> {
        let table = Table::read_csv(path)?;
        let data = table
            .into_labeled(label_column)
            .with_context(|| format!("Invalid dataset: {}", path.display()))?;
        Ok(data)
    }

    /// Write features followed by the label column
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut header = self.feature_names.clone();
        header.push(self.label_column.clone());

        let rows = self.features.iter().zip(&self.labels).map(|(row, label)| {
            row.iter()
                .map(|v| format_value(*v))
                .chain(std::iter::once(label.to_string()))
                .collect()
        });
        write_records(path, &header, rows)
    }

    pub fn n_samples(&self) -> usize {
        self.labels.len()
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    /// Rows at the given indices, in the given order
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            feature_names: self.feature_names.clone(),
            label_column: self.label_column.clone(),
            features: indices.iter().map(|&i| self.features[i].clone()).collect(),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }

    /// Sample count per class label, ordered by label
    pub fn class_distribution(&self) -> BTreeMap<i64, usize> {
        label_distribution(&self.labels)
    }
}

/// Sample count per label, ordered by label
pub fn label_distribution(labels: &[i64]) -> BTreeMap<i64, usize> {
    let mut dist = BTreeMap::new();
    for label in labels {
        *dist.entry(*label).or_insert(0) += 1;
    }
    dist
}

fn parse_cell(raw: &str, column: &str, row: usize) -> Result<Option<f64>, PipelineError> {
    if MISSING_MARKERS.iter().any(|m| raw.eq_ignore_ascii_case(m)) {
        return Ok(None);
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_nan() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(_) => Err(PipelineError::NonNumeric {
            column: column.to_string(),
            row,
            value: raw.to_string(),
        }),
    }
}

/// Shortest representation that reads back to the same f64
fn format_value(value: f64) -> String {
    format!("{}", value)
}

fn write_records<I>(path: &Path, header: &[String], rows: I) -> Result<()>
where
    I: Iterator<Item = Vec<String>>,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to create dataset: {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(&row)?;
    }
    writer.flush()?;
    let mut file = writer.into_inner().map_err(|e| anyhow::anyhow!("{}", e.error()))?;
    file.flush()?;
    Ok(())
}
