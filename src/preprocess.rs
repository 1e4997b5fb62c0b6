// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Preprocessing stage
//!
//! Drops incomplete rows, makes a seeded stratified train/test split and
//! standardizes features with parameters fit on the train partition only.

use crate::datasets::{LabeledData, Table};
use crate::error::PipelineError;
use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Configuration for the preprocessing stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Fraction of samples held out for testing, in (0, 1)
    pub test_size: f64,
    pub random_state: u64,
    pub label_column: String,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            test_size: 0.2,
            random_state: 42,
            label_column: crate::datasets::LABEL_COLUMN.to_string(),
        }
    }
}

/// Row indices of the two partitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StratifiedSplit {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Split `labels` so that every class keeps its proportion in both partitions.
///
/// `n_test = ceil(test_size * n)`. Per-class train counts are apportioned by
/// largest remainder and each class's remaining samples go to the test side,
/// so the partitions are disjoint and cover every row.
pub fn stratified_split(labels: &[i64], test_size: f64, seed: u64) -> Result<StratifiedSplit, PipelineError> {
    if !(test_size > 0.0 && test_size < 1.0) {
        return Err(PipelineError::InvalidParameter(format!(
            "test_size must be in (0, 1), got {}",
            test_size
        )));
    }

    let n_samples = labels.len();
    let n_test = (test_size * n_samples as f64).ceil() as usize;
    let n_train = n_samples.saturating_sub(n_test);
    if n_test == 0 || n_train == 0 {
        return Err(PipelineError::Stratification(format!(
            "test_size={} with {} samples leaves an empty partition",
            test_size, n_samples
        )));
    }

    let mut by_class: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (idx, label) in labels.iter().enumerate() {
        by_class.entry(*label).or_default().push(idx);
    }

    if let Some((label, members)) = by_class.iter().find(|(_, m)| m.len() < 2) {
        return Err(PipelineError::Stratification(format!(
            "class {} has only {} member(s); every class needs at least 2",
            label,
            members.len()
        )));
    }

    let n_classes = by_class.len();
    if n_train < n_classes || n_test < n_classes {
        return Err(PipelineError::Stratification(format!(
            "train size {} and test size {} must each be at least the number of classes ({})",
            n_train, n_test, n_classes
        )));
    }

    let class_counts: Vec<usize> = by_class.values().map(Vec::len).collect();
    let train_counts = apportion(&class_counts, n_train);

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut train = Vec::with_capacity(n_train);
    let mut test = Vec::with_capacity(n_test);

    for (members, &take) in by_class.into_values().zip(&train_counts) {
        let mut members = members;
        members.shuffle(&mut rng);
        let (class_train, class_test) = members.split_at(take);
        train.extend_from_slice(class_train);
        test.extend_from_slice(class_test);
    }

    train.shuffle(&mut rng);
    test.shuffle(&mut rng);

    Ok(StratifiedSplit { train, test })
}

/// Largest-remainder apportionment of `total` over `counts`; ties go to the earlier class
fn apportion(counts: &[usize], total: usize) -> Vec<usize> {
    let n: usize = counts.iter().sum();
    let exact: Vec<f64> = counts.iter().map(|&c| c as f64 * total as f64 / n as f64).collect();
    let mut alloc: Vec<usize> = exact.iter().map(|e| e.floor() as usize).collect();

    let mut order: Vec<usize> = (0..counts.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = exact[a] - alloc[a] as f64;
        let rb = exact[b] - alloc[b] as f64;
        rb.total_cmp(&ra).then(a.cmp(&b))
    });

    let mut remaining = total - alloc.iter().sum::<usize>();
    for idx in order.into_iter().cycle() {
        if remaining == 0 {
            break;
        }
        if alloc[idx] < counts[idx] {
            alloc[idx] += 1;
            remaining -= 1;
        }
    }

    alloc
}

/// Fitted per-feature standardization parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub feature_names: Vec<String>,
    pub mean: Vec<f64>,
    /// Population standard deviation (ddof = 0); constant features use 1.0
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(data: &LabeledData) -> Result<Self, PipelineError> {
        let n = data.n_samples();
        if n == 0 {
            return Err(PipelineError::EmptyData(
                "cannot fit scaler on empty data".to_string(),
            ));
        }

        let n_features = data.n_features();
        let mut mean = vec![0.0; n_features];
        for row in &data.features {
            for (m, v) in mean.iter_mut().zip(row) {
                *m += v;
            }
        }
        for m in &mut mean {
            *m /= n as f64;
        }

        let mut scale = vec![0.0; n_features];
        for row in &data.features {
            for ((s, v), m) in scale.iter_mut().zip(row).zip(&mean) {
                *s += (v - m).powi(2);
            }
        }
        for s in &mut scale {
            *s = (*s / n as f64).sqrt();
            if *s == 0.0 {
                *s = 1.0;
            }
        }

        Ok(Self {
            feature_names: data.feature_names.clone(),
            mean,
            scale,
        })
    }

    /// Apply the fitted parameters; labels pass through untouched
    pub fn transform(&self, data: &LabeledData) -> Result<LabeledData, PipelineError> {
        if data.n_features() != self.mean.len() {
            return Err(PipelineError::FeatureMismatch {
                expected: self.mean.len(),
                got: data.n_features(),
            });
        }

        let features = data
            .features
            .iter()
            .map(|row| {
                row.iter()
                    .zip(self.mean.iter().zip(&self.scale))
                    .map(|(v, (m, s))| (v - m) / s)
                    .collect()
            })
            .collect();

        Ok(LabeledData {
            features,
            ..data.clone()
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write scaler: {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scaler: {}", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Output locations of the preprocessing stage
#[derive(Debug, Clone)]
pub struct PreprocessOutputs<'a> {
    pub train: &'a Path,
    pub test: &'a Path,
    pub scaler: Option<&'a Path>,
}

/// Summary of the preprocessing stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessReport {
    pub input_rows: usize,
    pub dropped_rows: usize,
    pub train_rows: usize,
    pub test_rows: usize,
    pub features: Vec<String>,
    pub class_distribution: BTreeMap<i64, usize>,
    pub test_class_distribution: BTreeMap<i64, usize>,
}

/// Split and standardize the held partitions in memory
pub fn split_and_scale(
    data: &LabeledData,
    config: &PreprocessConfig,
) -> Result<(LabeledData, LabeledData, StandardScaler), PipelineError> {
    let split = stratified_split(&data.labels, config.test_size, config.random_state)?;
    let train = data.select(&split.train);
    let test = data.select(&split.test);

    let scaler = StandardScaler::fit(&train)?;
    let train = scaler.transform(&train)?;
    let test = scaler.transform(&test)?;

    Ok((train, test, scaler))
}

/// Run the preprocessing stage from a dataset artifact to two partition artifacts
pub fn run_preprocessing(input: &Path, outputs: &PreprocessOutputs<'_>, config: &PreprocessConfig) -> Result<PreprocessReport> {
    tracing::info!("Starting data preprocessing");

    let mut table = Table::read_csv(input)?;
    let input_rows = table.shape().0;
    tracing::info!("Loaded data shape: {:?}", table.shape());

    let dropped_rows = table.drop_incomplete();
    if dropped_rows > 0 {
        tracing::info!("Dropped {} rows with missing values", dropped_rows);
    }

    let data = table.into_labeled(&config.label_column)?;
    let class_distribution = data.class_distribution();
    tracing::info!("Features: {:?}", data.feature_names);
    tracing::info!("Class distribution: {:?}", class_distribution);

    let (train, test, scaler) = split_and_scale(&data, config)?;

    train.write_csv(outputs.train)?;
    test.write_csv(outputs.test)?;
    if let Some(path) = outputs.scaler {
        scaler.save(path)?;
    }

    tracing::info!(
        "Preprocessing complete. Train: ({}, {}), Test: ({}, {})",
        train.n_samples(),
        train.n_features() + 1,
        test.n_samples(),
        test.n_features() + 1
    );

    Ok(PreprocessReport {
        input_rows,
        dropped_rows,
        train_rows: train.n_samples(),
        test_rows: test.n_samples(),
        features: data.feature_names.clone(),
        class_distribution,
        test_class_distribution: test.class_distribution(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::LABEL_COLUMN;
    use crate::iris;

    fn iris_data() -> LabeledData {
        iris::load().into_labeled(LABEL_COLUMN).unwrap()
    }

    #[test]
    fn test_iris_split_sizes() {
        let data = iris_data();
        let split = stratified_split(&data.labels, 0.2, 42).unwrap();

        assert_eq!(split.train.len(), 120);
        assert_eq!(split.test.len(), 30);

        let test_labels: Vec<i64> = split.test.iter().map(|&i| data.labels[i]).collect();
        let dist = crate::datasets::label_distribution(&test_labels);
        assert_eq!(dist.values().copied().collect::<Vec<_>>(), vec![10, 10, 10]);
    }

    #[test]
    fn test_split_disjoint_and_exhaustive() {
        let labels: Vec<i64> = (0..97).map(|i| (i % 4) as i64).collect();
        for &test_size in &[0.1, 0.25, 0.33, 0.5, 0.8] {
            let split = stratified_split(&labels, test_size, 7).unwrap();
            let mut all: Vec<usize> = split.train.iter().chain(&split.test).copied().collect();
            all.sort_unstable();
            assert_eq!(all, (0..labels.len()).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_split_preserves_class_proportions() {
        let labels: Vec<i64> = std::iter::repeat(0)
            .take(60)
            .chain(std::iter::repeat(1).take(25))
            .chain(std::iter::repeat(2).take(15))
            .collect();

        for &test_size in &[0.2, 0.3, 0.45] {
            let split = stratified_split(&labels, test_size, 3).unwrap();
            let test_labels: Vec<i64> = split.test.iter().map(|&i| labels[i]).collect();
            let dist = crate::datasets::label_distribution(&test_labels);
            for (class, total) in [(0i64, 60usize), (1, 25), (2, 15)] {
                let got = *dist.get(&class).unwrap_or(&0) as f64;
                let expected = test_size * total as f64;
                assert!((got - expected).abs() <= 1.0, "class {} got {} expected {}", class, got, expected);
            }
        }
    }

    #[test]
    fn test_split_is_seeded() {
        let labels: Vec<i64> = (0..50).map(|i| (i % 2) as i64).collect();
        let a = stratified_split(&labels, 0.2, 11).unwrap();
        let b = stratified_split(&labels, 0.2, 11).unwrap();
        let c = stratified_split(&labels, 0.2, 12).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_split_rejects_infeasible() {
        let labels = vec![0, 0, 0, 1];
        assert!(matches!(
            stratified_split(&labels, 0.5, 0),
            Err(PipelineError::Stratification(_))
        ));

        let labels = vec![0, 0, 1, 1, 2, 2, 2, 2, 2, 2];
        assert!(matches!(
            stratified_split(&labels, 0.1, 0),
            Err(PipelineError::Stratification(_))
        ));

        assert!(matches!(
            stratified_split(&[0, 1], 1.0, 0),
            Err(PipelineError::InvalidParameter(_))
        ));
        assert!(matches!(
            stratified_split(&[0, 1], 0.0, 0),
            Err(PipelineError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_apportion() {
        assert_eq!(apportion(&[50, 50, 50], 120), vec![40, 40, 40]);
        assert_eq!(apportion(&[3, 3, 3], 7), vec![3, 2, 2]);
        assert_eq!(apportion(&[10, 5], 3), vec![2, 1]);
    }

    #[test]
    fn test_scaler_standardizes_train() {
        let data = iris_data();
        let (train, _, scaler) = split_and_scale(&data, &PreprocessConfig::default()).unwrap();

        let n = train.n_samples() as f64;
        for f in 0..train.n_features() {
            let mean = train.features.iter().map(|r| r[f]).sum::<f64>() / n;
            let var = train.features.iter().map(|r| (r[f] - mean).powi(2)).sum::<f64>() / n;
            assert!(mean.abs() < 1e-9, "feature {} mean {}", f, mean);
            assert!((var.sqrt() - 1.0).abs() < 1e-9, "feature {} std {}", f, var.sqrt());
        }
        assert_eq!(scaler.feature_names, data.feature_names);
    }

    #[test]
    fn test_scaler_not_refit_on_test() {
        let data = iris_data();
        let config = PreprocessConfig::default();
        let split = stratified_split(&data.labels, config.test_size, config.random_state).unwrap();
        let raw_test = data.select(&split.test);

        let (_, test, scaler) = split_and_scale(&data, &config).unwrap();
        let refit = StandardScaler::fit(&raw_test).unwrap();
        assert_ne!(refit.mean, scaler.mean);

        for (scaled, raw) in test.features.iter().zip(&raw_test.features) {
            for f in 0..scaled.len() {
                let expected = (raw[f] - scaler.mean[f]) / scaler.scale[f];
                assert!((scaled[f] - expected).abs() < 1e-12);
            }
        }
        assert_eq!(test.labels, raw_test.labels);
    }

    #[test]
    fn test_scaler_constant_feature_and_mismatch() {
        let table = Table::from_reader("c,x,target\n5,1,0\n5,3,1\n".as_bytes()).unwrap();
        let data = table.into_labeled(LABEL_COLUMN).unwrap();
        let scaler = StandardScaler::fit(&data).unwrap();
        assert_eq!(scaler.scale[0], 1.0);
        let scaled = scaler.transform(&data).unwrap();
        assert_eq!(scaled.features[0][0], 0.0);
        assert_eq!(scaled.features[0][1], -1.0);

        let narrow = Table::from_reader("x,target\n1,0\n".as_bytes())
            .unwrap()
            .into_labeled(LABEL_COLUMN)
            .unwrap();
        assert!(matches!(
            scaler.transform(&narrow),
            Err(PipelineError::FeatureMismatch { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_run_preprocessing_drops_missing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("dataset.csv");
        let mut csv = String::from("a,b,target\n");
        for i in 0..20 {
            csv.push_str(&format!("{},{},{}\n", i, i * 2, i % 2));
        }
        csv.push_str(",1,0\n3,,1\n");
        std::fs::write(&input, csv).unwrap();

        let train_path = dir.path().join("train.csv");
        let test_path = dir.path().join("test.csv");
        let scaler_path = dir.path().join("scaler.json");
        let outputs = PreprocessOutputs {
            train: &train_path,
            test: &test_path,
            scaler: Some(&scaler_path),
        };

        let report = run_preprocessing(&input, &outputs, &PreprocessConfig::default()).unwrap();
        assert_eq!(report.input_rows, 22);
        assert_eq!(report.dropped_rows, 2);
        assert_eq!(report.train_rows + report.test_rows, 20);
        assert_eq!(report.test_rows, 4);

        let train = LabeledData::read_csv(&train_path, LABEL_COLUMN).unwrap();
        assert_eq!(train.n_samples(), 16);
        assert!(StandardScaler::load(&scaler_path).is_ok());
    }

    #[test]
    fn test_run_preprocessing_surfaces_single_member_class() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("dataset.csv");
        std::fs::write(&input, "a,target\n1,0\n2,0\n3,0\n4,1\n").unwrap();

        let train_path = dir.path().join("train.csv");
        let test_path = dir.path().join("test.csv");
        let outputs = PreprocessOutputs {
            train: &train_path,
            test: &test_path,
            scaler: None,
        };

        let err = run_preprocessing(&input, &outputs, &PreprocessConfig::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Stratification(_))
        ));
        assert!(!train_path.exists());
    }

    #[test]
    fn test_run_preprocessing_treats_nan_spellings_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("dataset.csv");
        let mut csv = String::from("a,b,target\n");
        for i in 0..20 {
            csv.push_str(&format!("{},{},{}\n", i, i * 3, i % 2));
        }
        for cell in ["#N/A", "<NA>", "-nan", "-NaN", "#NA", "1.#QNAN"] {
            csv.push_str(&format!("{},1,0\n", cell));
        }
        std::fs::write(&input, csv).unwrap();

        let train_path = dir.path().join("train.csv");
        let test_path = dir.path().join("test.csv");
        let scaler_path = dir.path().join("params").join("scaler.json");
        let outputs = PreprocessOutputs {
            train: &train_path,
            test: &test_path,
            scaler: Some(&scaler_path),
        };

        let report = run_preprocessing(&input, &outputs, &PreprocessConfig::default()).unwrap();
        assert_eq!(report.input_rows, 26);
        assert_eq!(report.dropped_rows, 6);
        assert_eq!(report.train_rows + report.test_rows, 20);

        let scaler = StandardScaler::load(&scaler_path).unwrap();
        assert!(scaler.mean.iter().chain(&scaler.scale).all(|v| v.is_finite()));
        let train = LabeledData::read_csv(&train_path, LABEL_COLUMN).unwrap();
        assert!(train.features.iter().flatten().all(|v| v.is_finite()));
    }
}
