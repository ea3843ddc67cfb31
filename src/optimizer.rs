//! Proposal strategies for the feedback loop.
//!
//! Both strategies take the same `(loss_fn, bounds, x_list, y_list)` and
//! spend exactly one real evaluation per round once enough history exists.
//! `loss_fn` returns `Ok(None)` for a failed evaluation; failed points are
//! never added to the history.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::gp::{self, GaussianProcess, GpConfig};
use crate::surrogate::Surrogate;

pub type LossFn<'a> = dyn FnMut(&[f64]) -> Result<Option<f64>> + 'a;

pub trait Optimizer {
    fn name(&self) -> &'static str;

    /// Whether history vectors must be jittered apart before `optimize`.
    fn needs_distinct_inputs(&self) -> bool {
        false
    }

    /// Hands over this round's fitted surrogate (if any).
    fn use_surrogate(&mut self, _surrogate: Option<Surrogate>) {}

    fn optimize(
        &mut self,
        loss_fn: &mut LossFn<'_>,
        bounds: &[(f64, f64)],
        x_list: &mut Vec<Vec<f64>>,
        y_list: &mut Vec<f64>,
    ) -> Result<()>;
}

pub fn sample_uniform(bounds: &[(f64, f64)], rng: &mut StdRng) -> Vec<f64> {
    bounds
        .iter()
        .map(|&(lo, hi)| if hi > lo { rng.random_range(lo..hi) } else { lo })
        .collect()
}

/// Scores random vectors until the history holds `n_pre_samples` points.
fn pre_sample(
    n_pre_samples: usize,
    loss_fn: &mut LossFn<'_>,
    bounds: &[(f64, f64)],
    x_list: &mut Vec<Vec<f64>>,
    y_list: &mut Vec<f64>,
    rng: &mut StdRng,
) -> Result<()> {
    for _ in x_list.len()..n_pre_samples {
        let params = sample_uniform(bounds, rng);
        if let Some(y) = loss_fn(&params)? {
            x_list.push(params);
            y_list.push(y);
        }
    }
    Ok(())
}

#[derive(Clone, Copy, Debug)]
pub struct BoostConfig {
    pub n_pre_samples: usize,
    /// Random vectors scored by the surrogate per round
    pub mc_samples: usize,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            n_pre_samples: 5,
            mc_samples: 1_000_000,
        }
    }
}

/// Monte-Carlo search over the boosted-tree surrogate: draw many uniform
/// vectors, keep the one with the best predicted score, evaluate it for real.
pub struct BoostedSearch {
    config: BoostConfig,
    surrogate: Option<Surrogate>,
    rng: StdRng,
}

impl BoostedSearch {
    pub fn new(config: BoostConfig, seed: u64) -> Self {
        Self {
            config,
            surrogate: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Optimizer for BoostedSearch {
    fn name(&self) -> &'static str {
        "boosted"
    }

    fn use_surrogate(&mut self, surrogate: Option<Surrogate>) {
        self.surrogate = surrogate;
    }

    fn optimize(
        &mut self,
        loss_fn: &mut LossFn<'_>,
        bounds: &[(f64, f64)],
        x_list: &mut Vec<Vec<f64>>,
        y_list: &mut Vec<f64>,
    ) -> Result<()> {
        pre_sample(
            self.config.n_pre_samples,
            loss_fn,
            bounds,
            x_list,
            y_list,
            &mut self.rng,
        )?;

        let Some(model) = &self.surrogate else {
            debug!("no surrogate this round, skipping Monte-Carlo step");
            return Ok(());
        };

        let mut best: Option<(Vec<f64>, f64)> = None;
        for _ in 0..self.config.mc_samples {
            let params = sample_uniform(bounds, &mut self.rng);
            let prediction = model.predict(&params);
            if best.as_ref().map(|(_, s)| prediction > *s).unwrap_or(true) {
                best = Some((params, prediction));
            }
        }

        let Some((params, predicted)) = best else {
            warn!("mc_samples is 0, no boosted proposal this round");
            return Ok(());
        };
        info!("boosted proposal, predicted score {predicted:.4}");
        if let Some(y) = loss_fn(&params)? {
            x_list.push(params);
            y_list.push(y);
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct BayesConfig {
    pub n_pre_samples: usize,
    /// Random candidates scored by expected improvement
    pub n_candidates: usize,
    /// Best candidates refined by local search
    pub n_restarts: usize,
    /// Exploration margin in expected improvement
    pub xi: f64,
    pub gp: GpConfig,
}

impl Default for BayesConfig {
    fn default() -> Self {
        Self {
            n_pre_samples: 5,
            n_candidates: 5_000,
            n_restarts: 10,
            xi: 0.01,
            gp: GpConfig::default(),
        }
    }
}

/// Gaussian-process search maximizing expected improvement.
pub struct BayesianSearch {
    config: BayesConfig,
    rng: StdRng,
}

impl BayesianSearch {
    pub fn new(config: BayesConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Next point to evaluate, in original coordinates.
    fn propose(&mut self, bounds: &[(f64, f64)], x_list: &[Vec<f64>], y_list: &[f64]) -> Vec<f64> {
        let to_unit = |x: &[f64]| -> Vec<f64> {
            x.iter()
                .zip(bounds)
                .map(|(v, &(lo, hi))| if hi > lo { (v - lo) / (hi - lo) } else { 0.0 })
                .collect()
        };
        let from_unit = |u: &[f64]| -> Vec<f64> {
            u.iter()
                .zip(bounds)
                .map(|(v, &(lo, hi))| lo + v.clamp(0.0, 1.0) * (hi - lo))
                .collect()
        };

        let unit_x: Vec<Vec<f64>> = x_list.iter().map(|x| to_unit(x)).collect();
        let Some(model) = GaussianProcess::fit(&unit_x, y_list, &self.config.gp) else {
            debug!("gaussian process fit failed, sampling uniformly");
            return sample_uniform(bounds, &mut self.rng);
        };
        debug!(length_scale = model.length_scale(), "gaussian process fit");

        let best_y = y_list.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let xi = self.config.xi;
        let ei = |u: &[f64]| {
            let (m, s) = model.predict(u);
            gp::expected_improvement(m, s, best_y, xi)
        };

        let dims = bounds.len();
        let mut scored: Vec<(Vec<f64>, f64)> = (0..self.config.n_candidates.max(1))
            .map(|_| {
                let u: Vec<f64> = (0..dims).map(|_| self.rng.random::<f64>()).collect();
                let score = ei(&u);
                (u, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.config.n_restarts.max(1));

        let mut best: Option<(Vec<f64>, f64)> = None;
        for (start, score) in scored {
            let (u, s) = refine(start, score, &ei);
            if best.as_ref().map(|(_, b)| s > *b).unwrap_or(true) {
                best = Some((u, s));
            }
        }

        let next = match best {
            Some((u, _)) => from_unit(&u),
            None => sample_uniform(bounds, &mut self.rng),
        };
        if gp::is_duplicate(&next, x_list) {
            debug!("proposal duplicates history, sampling uniformly");
            return sample_uniform(bounds, &mut self.rng);
        }
        next
    }
}

/// Coordinate pattern search on the unit cube, halving the step on failure.
fn refine(mut u: Vec<f64>, mut score: f64, f: &dyn Fn(&[f64]) -> f64) -> (Vec<f64>, f64) {
    let mut step = 0.1;
    while step > 1e-4 {
        let mut improved = false;
        for d in 0..u.len() {
            for dir in [-1.0, 1.0] {
                let mut trial = u.clone();
                trial[d] = (trial[d] + dir * step).clamp(0.0, 1.0);
                let s = f(&trial);
                if s > score {
                    u = trial;
                    score = s;
                    improved = true;
                }
            }
        }
        if !improved {
            step /= 2.0;
        }
    }
    (u, score)
}

impl Optimizer for BayesianSearch {
    fn name(&self) -> &'static str {
        "bayesian"
    }

    fn needs_distinct_inputs(&self) -> bool {
        true
    }

    fn optimize(
        &mut self,
        loss_fn: &mut LossFn<'_>,
        bounds: &[(f64, f64)],
        x_list: &mut Vec<Vec<f64>>,
        y_list: &mut Vec<f64>,
    ) -> Result<()> {
        if x_list.len() < self.config.n_pre_samples {
            let params = sample_uniform(bounds, &mut self.rng);
            if let Some(y) = loss_fn(&params)? {
                x_list.push(params);
                y_list.push(y);
            }
            return Ok(());
        }

        let params = self.propose(bounds, x_list, y_list);
        if let Some(y) = loss_fn(&params)? {
            x_list.push(params);
            y_list.push(y);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surrogate::{GridSearchConfig, MaxFeatures, fit_surrogate};

    fn peak(x: &[f64]) -> f64 {
        -(x[0] - 0.7).powi(2) - (x[1] - 0.2).powi(2)
    }

    #[test]
    fn uniform_samples_respect_bounds() {
        let mut rng = StdRng::seed_from_u64(0);
        let bounds = [(3.0, 9.0), (0.0, 1.0), (2.0, 2.0)];
        for _ in 0..100 {
            let v = sample_uniform(&bounds, &mut rng);
            assert!((3.0..9.0).contains(&v[0]));
            assert!((0.0..1.0).contains(&v[1]));
            assert_eq!(v[2], 2.0);
        }
    }

    #[test]
    fn boosted_pre_samples_then_stops_without_surrogate() {
        let mut opt = BoostedSearch::new(BoostConfig::default(), 1);
        let (mut xs, mut ys) = (Vec::new(), Vec::new());
        let mut calls = 0;
        let mut loss = |x: &[f64]| -> Result<Option<f64>> {
            calls += 1;
            Ok(Some(peak(x)))
        };
        opt.optimize(&mut loss, &[(0.0, 1.0), (0.0, 1.0)], &mut xs, &mut ys)
            .unwrap();
        assert_eq!(calls, 5);
        assert_eq!(xs.len(), 5);
    }

    #[test]
    fn boosted_evaluates_surrogate_argmax_once() {
        let mut rng = StdRng::seed_from_u64(2);
        let bounds = [(0.0, 1.0), (0.0, 1.0)];
        let xs: Vec<Vec<f64>> = (0..40).map(|_| sample_uniform(&bounds, &mut rng)).collect();
        let ys: Vec<f64> = xs.iter().map(|x| peak(x)).collect();
        let grid = GridSearchConfig {
            max_features: vec![MaxFeatures::All],
            max_depth: vec![Some(3)],
            n_estimators: vec![50],
            ..GridSearchConfig::default()
        };
        let surrogate = fit_surrogate(&xs, &ys, &grid, &mut rng);

        let mut opt = BoostedSearch::new(
            BoostConfig {
                n_pre_samples: 5,
                mc_samples: 2_000,
            },
            3,
        );
        opt.use_surrogate(surrogate);

        let (mut x_list, mut y_list) = (xs.clone(), ys.clone());
        let mut seen = Vec::new();
        let mut loss = |x: &[f64]| -> Result<Option<f64>> {
            seen.push(x.to_vec());
            Ok(Some(peak(x)))
        };
        opt.optimize(&mut loss, &bounds, &mut x_list, &mut y_list)
            .unwrap();

        assert_eq!(seen.len(), 1);
        assert_eq!(x_list.len(), 41);
        assert!(peak(&seen[0]) > -0.25);
    }

    #[test]
    fn boosted_without_mc_samples_proposes_nothing() {
        let mut rng = StdRng::seed_from_u64(2);
        let bounds = [(0.0, 1.0), (0.0, 1.0)];
        let xs: Vec<Vec<f64>> = (0..20).map(|_| sample_uniform(&bounds, &mut rng)).collect();
        let ys: Vec<f64> = xs.iter().map(|x| peak(x)).collect();
        let grid = GridSearchConfig {
            max_features: vec![MaxFeatures::All],
            max_depth: vec![Some(3)],
            n_estimators: vec![20],
            ..GridSearchConfig::default()
        };
        let surrogate = fit_surrogate(&xs, &ys, &grid, &mut rng);
        assert!(surrogate.is_some());

        let mut opt = BoostedSearch::new(
            BoostConfig {
                n_pre_samples: 5,
                mc_samples: 0,
            },
            3,
        );
        opt.use_surrogate(surrogate);
        let (mut x_list, mut y_list) = (xs.clone(), ys.clone());
        let mut calls = 0;
        let mut loss = |x: &[f64]| -> Result<Option<f64>> {
            calls += 1;
            Ok(Some(peak(x)))
        };
        opt.optimize(&mut loss, &bounds, &mut x_list, &mut y_list)
            .unwrap();
        assert_eq!(calls, 0);
        assert_eq!(x_list.len(), 20);
    }

    #[test]
    fn failed_evaluations_stay_out_of_history() {
        let mut opt = BayesianSearch::new(BayesConfig::default(), 4);
        let (mut xs, mut ys) = (Vec::new(), Vec::new());
        let mut loss = |_: &[f64]| -> Result<Option<f64>> { Ok(None) };
        opt.optimize(&mut loss, &[(0.0, 1.0)], &mut xs, &mut ys)
            .unwrap();
        assert!(xs.is_empty() && ys.is_empty());
    }

    #[test]
    fn bayesian_proposes_inside_bounds_and_moves_toward_peak() {
        let bounds = [(0.0, 1.0), (0.0, 1.0)];
        let mut opt = BayesianSearch::new(
            BayesConfig {
                n_candidates: 500,
                n_restarts: 3,
                ..BayesConfig::default()
            },
            5,
        );
        let (mut xs, mut ys) = (Vec::new(), Vec::new());
        let mut loss = |x: &[f64]| -> Result<Option<f64>> { Ok(Some(peak(x))) };
        for _ in 0..20 {
            opt.optimize(&mut loss, &bounds, &mut xs, &mut ys).unwrap();
        }
        assert_eq!(xs.len(), 20);
        assert!(xs.iter().flatten().all(|v| (0.0..=1.0).contains(v)));
        let best = ys.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        assert!(best > -0.1);
    }
}
