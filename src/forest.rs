// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Random forest classifier
//!
//! Bootstrap-aggregated CART trees split on Gini impurity. Trees are built in
//! parallel with rayon; each tree owns a ChaCha8 stream seeded from the master
//! seed, so the fitted forest does not depend on thread scheduling.

use crate::error::PipelineError;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Number of features considered at each split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaxFeatures {
    Sqrt,
    Log2,
    All,
}

impl MaxFeatures {
    pub fn resolve(&self, n_features: usize) -> usize {
        let k = match self {
            MaxFeatures::Sqrt => (n_features as f64).sqrt().floor() as usize,
            MaxFeatures::Log2 => (n_features as f64).log2().floor() as usize,
            MaxFeatures::All => n_features,
        };
        k.clamp(1, n_features.max(1))
    }
}

/// Depth limit as given on the command line: a positive integer or `none`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthLimit(pub Option<usize>);

impl std::str::FromStr for DepthLimit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("none") {
            return Ok(DepthLimit(None));
        }
        match s.parse::<usize>() {
            Ok(0) => Err("max_depth must be positive or 'none'".to_string()),
            Ok(depth) => Ok(DepthLimit(Some(depth))),
            Err(_) => Err(format!("invalid max_depth '{}': expected a positive integer or 'none'", s)),
        }
    }
}

/// Random forest hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestConfig {
    pub n_estimators: usize,
    /// `None` grows trees until leaves are pure
    pub max_depth: Option<usize>,
    pub random_state: u64,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub max_features: MaxFeatures,
    pub bootstrap: bool,
    /// Worker threads for tree construction; `None` uses every core
    #[serde(skip)]
    pub n_jobs: Option<usize>,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: Some(10),
            random_state: 42,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: MaxFeatures::Sqrt,
            bootstrap: true,
            n_jobs: None,
        }
    }
}

impl ForestConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.n_estimators == 0 {
            return Err(PipelineError::InvalidParameter("n_estimators must be positive".to_string()));
        }
        if self.max_depth == Some(0) {
            return Err(PipelineError::InvalidParameter("max_depth must be positive or unbounded".to_string()));
        }
        if self.min_samples_split < 2 {
            return Err(PipelineError::InvalidParameter("min_samples_split must be at least 2".to_string()));
        }
        if self.min_samples_leaf == 0 {
            return Err(PipelineError::InvalidParameter("min_samples_leaf must be positive".to_string()));
        }
        if self.n_jobs == Some(0) {
            return Err(PipelineError::InvalidParameter("n_jobs must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf {
        /// Class probabilities, indexed like `RandomForest::classes`
        distribution: Vec<f64>,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// A single fitted CART tree stored as a node arena; node 0 is the root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    nodes: Vec<Node>,
}

impl DecisionTree {
    pub fn predict_proba(&self, row: &[f64]) -> &[f64] {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { distribution } => return distribution,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match &nodes[idx] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }
}

struct Candidate {
    feature: usize,
    threshold: f64,
    impurity: f64,
    left_impurity: f64,
    right_impurity: f64,
}

struct Pending {
    node: usize,
    samples: Vec<usize>,
    depth: usize,
}

fn class_counts(y: &[usize], samples: &[usize], n_classes: usize) -> Vec<usize> {
    let mut counts = vec![0; n_classes];
    for &s in samples {
        counts[y[s]] += 1;
    }
    counts
}

fn gini(counts: &[usize], n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let n = n as f64;
    1.0 - counts.iter().map(|&c| (c as f64 / n).powi(2)).sum::<f64>()
}

fn best_split(
    x: &[Vec<f64>],
    y: &[usize],
    samples: &[usize],
    features: &[usize],
    n_classes: usize,
    min_samples_leaf: usize,
) -> Option<Candidate> {
    let n = samples.len();
    let total = class_counts(y, samples, n_classes);
    let mut best: Option<Candidate> = None;
    let mut order = samples.to_vec();

    for &feature in features {
        order.sort_by(|&a, &b| x[a][feature].total_cmp(&x[b][feature]));

        let mut left = vec![0usize; n_classes];
        for i in 0..n - 1 {
            left[y[order[i]]] += 1;

            let lo = x[order[i]][feature];
            let hi = x[order[i + 1]][feature];
            if lo == hi {
                continue;
            }

            let n_left = i + 1;
            let n_right = n - n_left;
            if n_left < min_samples_leaf || n_right < min_samples_leaf {
                continue;
            }

            let right: Vec<usize> = total.iter().zip(&left).map(|(t, l)| t - l).collect();
            let left_impurity = gini(&left, n_left);
            let right_impurity = gini(&right, n_right);
            let impurity = (n_left as f64 * left_impurity + n_right as f64 * right_impurity) / n as f64;

            if best.as_ref().map_or(true, |b| impurity < b.impurity) {
                let mut threshold = lo + (hi - lo) / 2.0;
                if threshold >= hi {
                    threshold = lo;
                }
                best = Some(Candidate {
                    feature,
                    threshold,
                    impurity,
                    left_impurity,
                    right_impurity,
                });
            }
        }
    }

    best
}

/// Grow one tree; returns the tree and its unnormalized impurity decrease per feature
fn build_tree(
    x: &[Vec<f64>],
    y: &[usize],
    n_classes: usize,
    config: &ForestConfig,
    seed: u64,
) -> (DecisionTree, Vec<f64>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let n_samples = x.len();
    let n_features = x[0].len();
    let k = config.max_features.resolve(n_features);

    let root_samples: Vec<usize> = if config.bootstrap {
        (0..n_samples).map(|_| rng.gen_range(0..n_samples)).collect()
    } else {
        (0..n_samples).collect()
    };

    let mut importances = vec![0.0; n_features];
    let mut nodes = vec![Node::Leaf { distribution: Vec::new() }];
    let mut stack = vec![Pending {
        node: 0,
        samples: root_samples,
        depth: 0,
    }];

    while let Some(Pending { node, samples, depth }) = stack.pop() {
        let n = samples.len();
        let counts = class_counts(y, &samples, n_classes);
        let impurity = gini(&counts, n);

        let depth_reached = config.max_depth.map_or(false, |max| depth >= max);
        let splittable = !depth_reached && n >= config.min_samples_split && n >= 2 * config.min_samples_leaf && impurity > 0.0;

        let candidate = if splittable {
            let features = index::sample(&mut rng, n_features, k).into_vec();
            best_split(x, y, &samples, &features, n_classes, config.min_samples_leaf)
        } else {
            None
        };

        match candidate {
            None => {
                let distribution = counts.iter().map(|&c| c as f64 / n as f64).collect();
                nodes[node] = Node::Leaf { distribution };
            }
            Some(split) => {
                let (left_samples, right_samples): (Vec<usize>, Vec<usize>) = samples
                    .iter()
                    .partition(|&&s| x[s][split.feature] <= split.threshold);

                importances[split.feature] += n as f64 * impurity
                    - left_samples.len() as f64 * split.left_impurity
                    - right_samples.len() as f64 * split.right_impurity;

                let left = nodes.len();
                let right = left + 1;
                nodes.push(Node::Leaf { distribution: Vec::new() });
                nodes.push(Node::Leaf { distribution: Vec::new() });
                nodes[node] = Node::Split {
                    feature: split.feature,
                    threshold: split.threshold,
                    left,
                    right,
                };

                stack.push(Pending {
                    node: right,
                    samples: right_samples,
                    depth: depth + 1,
                });
                stack.push(Pending {
                    node: left,
                    samples: left_samples,
                    depth: depth + 1,
                });
            }
        }
    }

    (DecisionTree { nodes }, importances)
}

/// Ensemble of bootstrap-aggregated decision trees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    pub config: ForestConfig,
    /// Sorted class labels seen during fit
    pub classes: Vec<i64>,
    pub n_features: usize,
    trees: Vec<DecisionTree>,
    /// Mean decrease in impurity, normalized to sum to 1
    pub feature_importances: Vec<f64>,
}

impl RandomForest {
    pub fn new(config: ForestConfig) -> Self {
        Self {
            config,
            classes: Vec::new(),
            n_features: 0,
            trees: Vec::new(),
            feature_importances: Vec::new(),
        }
    }

    pub fn is_fitted(&self) -> bool {
        !self.trees.is_empty()
    }

    pub fn trees(&self) -> &[DecisionTree] {
        &self.trees
    }

    pub fn fit(&mut self, x: &[Vec<f64>], y: &[i64]) -> Result<(), PipelineError> {
        self.config.validate()?;

        if x.is_empty() {
            return Err(PipelineError::EmptyData("cannot fit forest on zero samples".to_string()));
        }
        if x.len() != y.len() {
            return Err(PipelineError::LengthMismatch {
                predictions: x.len(),
                labels: y.len(),
            });
        }

        let n_features = x[0].len();
        if n_features == 0 {
            return Err(PipelineError::EmptyData("cannot fit forest without features".to_string()));
        }
        for (row_idx, row) in x.iter().enumerate() {
            if row.len() != n_features {
                return Err(PipelineError::FeatureMismatch {
                    expected: n_features,
                    got: row.len(),
                });
            }
            if let Some(feature) = row.iter().position(|v| !v.is_finite()) {
                return Err(PipelineError::NonFinite { feature, row: row_idx });
            }
        }

        let mut classes: Vec<i64> = y.to_vec();
        classes.sort_unstable();
        classes.dedup();
        let encoded: Vec<usize> = y
            .iter()
            .map(|label| classes.binary_search(label).unwrap_or_default())
            .collect();

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.random_state);
        let seeds: Vec<u64> = (0..self.config.n_estimators).map(|_| rng.gen()).collect();

        let n_classes = classes.len();
        let config = &self.config;
        let grow = || -> Vec<(DecisionTree, Vec<f64>)> {
            seeds
                .par_iter()
                .map(|&seed| build_tree(x, &encoded, n_classes, config, seed))
                .collect()
        };

        let grown = match config.n_jobs {
            Some(threads) => rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| PipelineError::InvalidParameter(format!("thread pool: {}", e)))?
                .install(grow),
            None => grow(),
        };

        let mut importances = vec![0.0; n_features];
        let mut trees = Vec::with_capacity(grown.len());
        for (tree, tree_importances) in grown {
            let total: f64 = tree_importances.iter().sum();
            if total > 0.0 {
                for (acc, v) in importances.iter_mut().zip(&tree_importances) {
                    *acc += v / total;
                }
            }
            trees.push(tree);
        }
        let sum: f64 = importances.iter().sum();
        if sum > 0.0 {
            for v in &mut importances {
                *v /= sum;
            }
        }

        self.classes = classes;
        self.n_features = n_features;
        self.trees = trees;
        self.feature_importances = importances;
        Ok(())
    }

    /// Class probabilities averaged over all trees
    pub fn predict_proba(&self, row: &[f64]) -> Vec<f64> {
        let mut proba = vec![0.0; self.classes.len()];
        for tree in &self.trees {
            for (p, t) in proba.iter_mut().zip(tree.predict_proba(row)) {
                *p += t;
            }
        }
        let n_trees = self.trees.len().max(1) as f64;
        for p in &mut proba {
            *p /= n_trees;
        }
        proba
    }

    /// Most probable class; ties go to the lowest label
    pub fn predict_row(&self, row: &[f64]) -> i64 {
        let proba = self.predict_proba(row);
        let mut best = 0;
        for (i, p) in proba.iter().enumerate() {
            if *p > proba[best] {
                best = i;
            }
        }
        self.classes.get(best).copied().unwrap_or_default()
    }
}
