//! Gaussian-process regression and expected improvement.
//!
//! Inputs are expected on the unit cube (the Bayesian optimizer rescales by
//! the bounds table first). Targets are standardized before fitting.

use std::f64::consts::PI;

use rand::Rng;
use rand::rngs::StdRng;
use statrs::distribution::{Continuous, ContinuousCDF, Normal};

/// Two points closer than this in every coordinate count as the same point.
pub const DUPLICATE_TOLERANCE: f64 = 1e-5;

/// Upper bound of the per-coordinate jitter, kept below the duplicate
/// tolerance.
pub const JITTER_SCALE: f64 = 1e-6;

/// Nudges every coordinate by an independent positive amount below
/// [`JITTER_SCALE`], so points that collide exactly (integer-valued hypers)
/// stop being identical.
pub fn jitter(xs: &mut [Vec<f64>], rng: &mut StdRng) {
    for x in xs.iter_mut() {
        for v in x.iter_mut() {
            *v += rng.random_range(JITTER_SCALE * 1e-3..JITTER_SCALE);
        }
    }
}

pub fn is_duplicate(candidate: &[f64], existing: &[Vec<f64>]) -> bool {
    existing.iter().any(|x| {
        x.len() == candidate.len()
            && x.iter()
                .zip(candidate)
                .all(|(a, b)| (a - b).abs() <= DUPLICATE_TOLERANCE)
    })
}

#[derive(Clone, Debug)]
pub struct GpConfig {
    /// Observation noise added to the kernel diagonal
    pub alpha: f64,
    /// Candidate length scales; the one with the best marginal likelihood wins
    pub length_scales: Vec<f64>,
}

impl Default for GpConfig {
    fn default() -> Self {
        Self {
            alpha: 1e-5,
            length_scales: vec![0.05, 0.1, 0.2, 0.5, 1.0, 2.0],
        }
    }
}

#[derive(Clone, Debug)]
pub struct GaussianProcess {
    x: Vec<Vec<f64>>,
    chol: Vec<Vec<f64>>,
    weights: Vec<f64>,
    length_scale: f64,
    y_mean: f64,
    y_std: f64,
    log_likelihood: f64,
}

impl GaussianProcess {
    /// `None` when no candidate length scale yields a positive-definite
    /// kernel matrix.
    pub fn fit(x: &[Vec<f64>], y: &[f64], config: &GpConfig) -> Option<Self> {
        if x.is_empty() || x.len() != y.len() {
            return None;
        }
        let n = y.len() as f64;
        let y_mean = y.iter().sum::<f64>() / n;
        let var = y.iter().map(|v| (v - y_mean).powi(2)).sum::<f64>() / n;
        let y_std = if var > 0.0 { var.sqrt() } else { 1.0 };
        let target: Vec<f64> = y.iter().map(|v| (v - y_mean) / y_std).collect();

        let mut best: Option<GaussianProcess> = None;
        for &ls in &config.length_scales {
            let mut k = vec![vec![0.0; x.len()]; x.len()];
            for i in 0..x.len() {
                for j in 0..=i {
                    let v = rbf(&x[i], &x[j], ls);
                    k[i][j] = v;
                    k[j][i] = v;
                }
                k[i][i] += config.alpha;
            }
            let Some(chol) = cholesky(&k) else { continue };
            let weights = chol_solve(&chol, &target);

            let fit_term: f64 = target.iter().zip(&weights).map(|(a, b)| a * b).sum();
            let log_det: f64 = chol.iter().enumerate().map(|(i, row)| row[i].ln()).sum();
            let log_likelihood = -0.5 * fit_term - log_det - 0.5 * n * (2.0 * PI).ln();

            if best
                .as_ref()
                .map(|b| log_likelihood > b.log_likelihood)
                .unwrap_or(true)
            {
                best = Some(GaussianProcess {
                    x: x.to_vec(),
                    chol,
                    weights,
                    length_scale: ls,
                    y_mean,
                    y_std,
                    log_likelihood,
                });
            }
        }
        best
    }

    pub fn length_scale(&self) -> f64 {
        self.length_scale
    }

    /// Posterior `(mean, std)` in the original target units.
    pub fn predict(&self, point: &[f64]) -> (f64, f64) {
        let k_star: Vec<f64> = self
            .x
            .iter()
            .map(|xi| rbf(xi, point, self.length_scale))
            .collect();
        let mean: f64 = k_star.iter().zip(&self.weights).map(|(a, b)| a * b).sum();
        let v = forward_sub(&self.chol, &k_star);
        let var = (1.0 - v.iter().map(|x| x * x).sum::<f64>()).max(1e-12);
        (
            mean * self.y_std + self.y_mean,
            var.sqrt() * self.y_std,
        )
    }
}

/// Expected improvement over `best` for a maximization problem.
pub fn expected_improvement(mean: f64, std: f64, best: f64, xi: f64) -> f64 {
    if std <= 0.0 {
        return 0.0;
    }
    let Ok(normal) = Normal::new(0.0, 1.0) else {
        return 0.0;
    };
    let improvement = mean - best - xi;
    let z = improvement / std;
    (improvement * normal.cdf(z) + std * normal.pdf(z)).max(0.0)
}

fn rbf(a: &[f64], b: &[f64], length_scale: f64) -> f64 {
    let d2: f64 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum();
    (-0.5 * d2 / (length_scale * length_scale)).exp()
}

fn cholesky(a: &[Vec<f64>]) -> Option<Vec<Vec<f64>>> {
    let n = a.len();
    let mut l = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let s: f64 = (0..j).map(|k| l[i][k] * l[j][k]).sum();
            if i == j {
                let d = a[i][i] - s;
                if d <= 0.0 || !d.is_finite() {
                    return None;
                }
                l[i][j] = d.sqrt();
            } else {
                l[i][j] = (a[i][j] - s) / l[j][j];
            }
        }
    }
    Some(l)
}

fn forward_sub(l: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let n = b.len();
    let mut y = vec![0.0; n];
    for i in 0..n {
        let s: f64 = (0..i).map(|k| l[i][k] * y[k]).sum();
        y[i] = (b[i] - s) / l[i][i];
    }
    y
}

/// Solves `L Lᵀ x = b`.
fn chol_solve(l: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let y = forward_sub(l, b);
    let n = y.len();
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let s: f64 = (i + 1..n).map(|k| l[k][i] * x[k]).sum();
        x[i] = (y[i] - s) / l[i][i];
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn jitter_separates_duplicates_below_tolerance() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut xs = vec![vec![3.0, 1.0, 0.0], vec![3.0, 1.0, 0.0]];
        jitter(&mut xs, &mut rng);

        let diffs: Vec<f64> = xs[0].iter().zip(&xs[1]).map(|(a, b)| (a - b).abs()).collect();
        assert!(diffs.iter().any(|d| *d > 0.0));
        assert!(diffs.iter().all(|d| *d < DUPLICATE_TOLERANCE));
        assert!(xs[0].iter().all(|v| *v > 0.0));
    }

    #[test]
    fn duplicate_detection_uses_tolerance() {
        let existing = vec![vec![0.5, 0.5]];
        assert!(is_duplicate(&[0.5 + 1e-6, 0.5], &existing));
        assert!(!is_duplicate(&[0.5 + 1e-3, 0.5], &existing));
    }

    #[test]
    fn gp_interpolates_observations() {
        let x: Vec<Vec<f64>> = (0..6).map(|i| vec![i as f64 / 5.0]).collect();
        let y: Vec<f64> = x.iter().map(|p| (p[0] * 3.0).sin()).collect();
        let gp = GaussianProcess::fit(&x, &y, &GpConfig::default()).unwrap();

        for (p, t) in x.iter().zip(&y) {
            let (m, s) = gp.predict(p);
            assert!((m - t).abs() < 5e-2);
            assert!(s < 0.1);
        }
        let (_, far) = gp.predict(&[10.0]);
        assert!(far > 0.1);
    }

    #[test]
    fn gp_survives_near_duplicates() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut x = vec![vec![0.2, 0.4]; 4];
        x.push(vec![0.9, 0.1]);
        jitter(&mut x, &mut rng);
        let y = vec![1.0, 1.1, 0.9, 1.0, 3.0];
        assert!(GaussianProcess::fit(&x, &y, &GpConfig::default()).is_some());
    }

    #[test]
    fn expected_improvement_behaves() {
        assert_eq!(expected_improvement(1.0, 0.0, 0.0, 0.0), 0.0);
        let hi = expected_improvement(2.0, 1.0, 1.0, 0.0);
        let lo = expected_improvement(0.0, 1.0, 1.0, 0.0);
        assert!(hi > lo && lo > 0.0);
    }

    #[test]
    fn expected_improvement_stays_accurate_in_the_tails() {
        let cases = [
            (0.5, 0.6977965574013061),
            (-5.0, 5.3461655338324783e-08),
            (-6.0, 1.5635697959707935e-10),
            (-8.0, 7.550262411943723e-17),
        ];
        for (mean, exact) in cases {
            let ei = expected_improvement(mean, 1.0, 0.0, 0.0);
            let rel = (ei - exact).abs() / exact;
            assert!(rel < 1e-2, "mean {mean}: got {ei:e}, want {exact:e}");
        }
    }
}
