//! Gradient-boosted regression trees used as the score surrogate.
//!
//! Least-squares boosting over CART trees, with a small grid search scored by
//! k-fold cross-validated MSE. Also yields impurity-based feature importances,
//! which the driver prints every round.

use std::cmp::Ordering;

use rand::rngs::StdRng;
use rand::seq::index;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaxFeatures {
    All,
    Sqrt,
    Log2,
}

impl MaxFeatures {
    fn count(self, n_features: usize) -> usize {
        let n = n_features.max(1);
        let k = match self {
            MaxFeatures::All => n,
            MaxFeatures::Sqrt => (n as f64).sqrt() as usize,
            MaxFeatures::Log2 => (n as f64).log2() as usize,
        };
        k.clamp(1, n)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoostParams {
    pub n_estimators: usize,
    /// `None` grows until leaves are pure or too small to split
    pub max_depth: Option<usize>,
    pub max_features: MaxFeatures,
    pub learning_rate: f64,
    pub min_samples_split: usize,
}

impl Default for BoostParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: Some(3),
            max_features: MaxFeatures::All,
            learning_rate: 0.1,
            min_samples_split: 2,
        }
    }
}

#[derive(Clone, Debug)]
enum Node {
    Leaf(f64),
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Clone, Debug)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn predict(&self, row: &[f64]) -> f64 {
        let mut i = 0;
        loop {
            match &self.nodes[i] {
                Node::Leaf(v) => return *v,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let x = row.get(*feature).copied().unwrap_or(0.0);
                    i = if x <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

struct TreeBuilder<'a> {
    x: &'a [Vec<f64>],
    target: &'a [f64],
    params: &'a BoostParams,
    n_features: usize,
    nodes: Vec<Node>,
    gains: Vec<f64>,
}

impl TreeBuilder<'_> {
    fn grow(&mut self, idx: &[usize], depth: usize, rng: &mut StdRng) -> usize {
        let slot = self.nodes.len();
        let mean = idx.iter().map(|&i| self.target[i]).sum::<f64>() / idx.len().max(1) as f64;
        self.nodes.push(Node::Leaf(mean));

        let depth_ok = self.params.max_depth.map(|d| depth < d).unwrap_or(true);
        if !depth_ok || idx.len() < self.params.min_samples_split.max(2) {
            return slot;
        }

        let Some((feature, threshold, gain)) = self.best_split(idx, rng) else {
            return slot;
        };

        let (l, r): (Vec<usize>, Vec<usize>) = idx
            .iter()
            .copied()
            .partition(|&i| self.x[i][feature] <= threshold);
        if l.is_empty() || r.is_empty() {
            return slot;
        }

        self.gains[feature] += gain;
        let left = self.grow(&l, depth + 1, rng);
        let right = self.grow(&r, depth + 1, rng);
        self.nodes[slot] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        slot
    }

    /// Best (feature, threshold, SSE reduction) over a random feature subset.
    fn best_split(&self, idx: &[usize], rng: &mut StdRng) -> Option<(usize, f64, f64)> {
        let k = self.params.max_features.count(self.n_features);
        let features = index::sample(rng, self.n_features, k);

        let n = idx.len() as f64;
        let total: f64 = idx.iter().map(|&i| self.target[i]).sum();
        let total_sq: f64 = idx.iter().map(|&i| self.target[i].powi(2)).sum();
        let parent_sse = total_sq - total * total / n;

        let mut best: Option<(usize, f64, f64)> = None;
        let mut order = idx.to_vec();
        for f in features.iter() {
            order.sort_by(|&a, &b| {
                self.x[a][f]
                    .partial_cmp(&self.x[b][f])
                    .unwrap_or(Ordering::Equal)
            });

            let mut left_sum = 0.0;
            let mut left_sq = 0.0;
            for split in 1..order.len() {
                let prev = order[split - 1];
                left_sum += self.target[prev];
                left_sq += self.target[prev].powi(2);

                let (lo, hi) = (self.x[prev][f], self.x[order[split]][f]);
                if hi <= lo {
                    continue;
                }
                let nl = split as f64;
                let nr = n - nl;
                let right_sum = total - left_sum;
                let right_sq = total_sq - left_sq;
                let sse = (left_sq - left_sum * left_sum / nl) + (right_sq - right_sum * right_sum / nr);
                let gain = parent_sse - sse;
                if gain > 1e-12 && best.map(|(_, _, g)| gain > g).unwrap_or(true) {
                    best = Some((f, (lo + hi) / 2.0, gain));
                }
            }
        }
        best
    }
}

#[derive(Clone, Debug)]
pub struct GradientBoostedTrees {
    init: f64,
    learning_rate: f64,
    trees: Vec<Tree>,
    importances: Vec<f64>,
}

impl GradientBoostedTrees {
    pub fn fit(x: &[Vec<f64>], y: &[f64], params: &BoostParams, rng: &mut StdRng) -> Self {
        let n_features = x.first().map(Vec::len).unwrap_or(0);
        let init = if y.is_empty() {
            0.0
        } else {
            y.iter().sum::<f64>() / y.len() as f64
        };

        let mut pred = vec![init; y.len()];
        let mut trees = Vec::with_capacity(params.n_estimators);
        let mut importances = vec![0.0; n_features];

        if n_features > 0 && !y.is_empty() {
            let all: Vec<usize> = (0..y.len()).collect();
            for _ in 0..params.n_estimators {
                let residual: Vec<f64> = y.iter().zip(&pred).map(|(t, p)| t - p).collect();
                let mut builder = TreeBuilder {
                    x,
                    target: &residual,
                    params,
                    n_features,
                    nodes: Vec::new(),
                    gains: vec![0.0; n_features],
                };
                builder.grow(&all, 0, rng);
                let tree = Tree {
                    nodes: builder.nodes,
                };

                let tree_total: f64 = builder.gains.iter().sum();
                if tree_total > 0.0 {
                    for (acc, g) in importances.iter_mut().zip(&builder.gains) {
                        *acc += g / tree_total;
                    }
                }
                for (p, row) in pred.iter_mut().zip(x) {
                    *p += params.learning_rate * tree.predict(row);
                }
                trees.push(tree);
            }
        }

        let sum: f64 = importances.iter().sum();
        if sum > 0.0 {
            importances.iter_mut().for_each(|v| *v /= sum);
        }

        Self {
            init,
            learning_rate: params.learning_rate,
            trees,
            importances,
        }
    }

    pub fn predict(&self, row: &[f64]) -> f64 {
        self.init
            + self.learning_rate * self.trees.iter().map(|t| t.predict(row)).sum::<f64>()
    }

    /// Normalized to sum to 1 (all zero if no split was ever made).
    pub fn feature_importances(&self) -> &[f64] {
        &self.importances
    }
}

#[derive(Clone, Debug)]
pub struct GridSearchConfig {
    pub max_features: Vec<MaxFeatures>,
    pub max_depth: Vec<Option<usize>>,
    pub n_estimators: Vec<usize>,
    pub folds: usize,
    /// Below this many samples no surrogate is fit
    pub min_samples: usize,
    pub learning_rate: f64,
}

impl Default for GridSearchConfig {
    fn default() -> Self {
        Self {
            max_features: vec![MaxFeatures::All, MaxFeatures::Sqrt, MaxFeatures::Log2],
            max_depth: vec![None, Some(10), Some(20)],
            n_estimators: vec![100, 200, 300],
            folds: 5,
            min_samples: 5,
            learning_rate: 0.1,
        }
    }
}

/// Best grid point refit on all samples.
#[derive(Clone, Debug)]
pub struct Surrogate {
    pub model: GradientBoostedTrees,
    pub params: BoostParams,
    pub cv_mse: f64,
}

impl Surrogate {
    pub fn predict(&self, row: &[f64]) -> f64 {
        self.model.predict(row)
    }

    /// `(name, importance)` sorted descending.
    pub fn ranked_importances(&self, names: &[String]) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = names
            .iter()
            .cloned()
            .zip(self.model.feature_importances().iter().copied())
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        ranked
    }
}

pub fn fit_surrogate(
    x: &[Vec<f64>],
    y: &[f64],
    grid: &GridSearchConfig,
    rng: &mut StdRng,
) -> Option<Surrogate> {
    if x.len() < grid.min_samples.max(2) || x.len() != y.len() {
        return None;
    }
    let folds = kfold(x.len(), grid.folds.clamp(2, x.len()));

    let mut best: Option<(BoostParams, f64)> = None;
    for &max_features in &grid.max_features {
        for &max_depth in &grid.max_depth {
            for &n_estimators in &grid.n_estimators {
                let params = BoostParams {
                    n_estimators,
                    max_depth,
                    max_features,
                    learning_rate: grid.learning_rate,
                    min_samples_split: 2,
                };
                let mse = cross_val_mse(x, y, &folds, &params, rng);
                if best.map(|(_, m)| mse < m).unwrap_or(true) {
                    best = Some((params, mse));
                }
            }
        }
    }

    let (params, cv_mse) = best?;
    Some(Surrogate {
        model: GradientBoostedTrees::fit(x, y, &params, rng),
        params,
        cv_mse,
    })
}

/// Contiguous, unshuffled folds; the first `n % k` folds take one extra.
fn kfold(n: usize, k: usize) -> Vec<std::ops::Range<usize>> {
    let base = n / k;
    let extra = n % k;
    let mut start = 0;
    (0..k)
        .map(|i| {
            let len = base + usize::from(i < extra);
            let r = start..start + len;
            start += len;
            r
        })
        .collect()
}

fn cross_val_mse(
    x: &[Vec<f64>],
    y: &[f64],
    folds: &[std::ops::Range<usize>],
    params: &BoostParams,
    rng: &mut StdRng,
) -> f64 {
    let mut total = 0.0;
    for fold in folds {
        let (mut tx, mut ty) = (Vec::new(), Vec::new());
        for i in (0..x.len()).filter(|i| !fold.contains(i)) {
            tx.push(x[i].clone());
            ty.push(y[i]);
        }
        let model = GradientBoostedTrees::fit(&tx, &ty, params, rng);
        let err: f64 = fold
            .clone()
            .map(|i| (model.predict(&x[i]) - y[i]).powi(2))
            .sum();
        total += err / fold.len().max(1) as f64;
    }
    total / folds.len().max(1) as f64
}
