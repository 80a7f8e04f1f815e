//! # Beta approximation of permutation nulls
//!
//! A permutation run leaves one maximum r² per permutation. Converted to
//! p-values, these minima follow approximately `Beta(a, b)`, which lets a few
//! thousand permutations resolve empirical p-values far below `1 / nperm`.
//!
//! The conversion uses an *effective* degrees of freedom `ν` chosen so the
//! moment estimate of `a` equals one, i.e. the root of
//! `cost(ν) = m (m (1 - m) / v - 1) - 1`. The moment estimates are then
//! refined by maximum likelihood (Nelder-Mead), and the observed best r² is
//! evaluated as `BetaCDF(I_{1-r²}(ν/2, 1/2); a, b)`.
//!
//! Every failure is a `BetaFitError` value. `calibrate` turns it into a
//! flagged fallback to the raw permutation p-value.

use log::{debug, warn};
use statrs::distribution::{Beta, ContinuousCDF};
use statrs::function::gamma::ln_gamma;
use thiserror::Error;

use crate::association::pval_from_r2;

/// Smaller nulls are not fitted.
pub const MIN_NULL_SIZE: usize = 10;

const DOF_TOLERANCE: f64 = 1e-4;
const DOF_MAX_ITER: usize = 50;
const NM_TOLERANCE: f64 = 1e-8;
const NM_MAX_ITER: usize = 2000;
/// p-values are clamped into `[P_FLOOR, 1 - P_FLOOR]` for the log-likelihood.
const P_FLOOR: f64 = 1e-300;
/// Largest accepted shape. Genome-wide trans nulls reach shapes close to the
/// number of tested pairs, so the bound sits well above that.
const MAX_SHAPE: f64 = 1e12;
/// A null whose range is below this fraction of its magnitude is constant.
const RELATIVE_SPREAD: f64 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BetaFitError {
    #[error("permutation null has {got} values, at least {required} are needed")]
    TooFewPermutations { got: usize, required: usize },

    #[error("permutation null has zero variance")]
    DegenerateNull,

    #[error("effective degrees of freedom could not be determined")]
    DofNotFound,

    #[error("invalid Beta shape parameters ({shape1}, {shape2})")]
    InvalidShape { shape1: f64, shape2: f64 },
}

/// A fitted null: `Beta(shape1, shape2)` over p-values computed with `true_dof`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BetaParameters {
    pub shape1: f64,
    pub shape2: f64,
    pub true_dof: f64,
}

impl BetaParameters {
    fn new(shape1: f64, shape2: f64, true_dof: f64) -> Result<Self, BetaFitError> {
        let valid_shape = |x: f64| x.is_finite() && x > 0.0 && x <= MAX_SHAPE;
        if !(valid_shape(shape1) && valid_shape(shape2)) {
            return Err(BetaFitError::InvalidShape { shape1, shape2 });
        }
        if !(true_dof.is_finite() && true_dof > 0.0) {
            return Err(BetaFitError::DofNotFound);
        }
        Ok(Self {
            shape1,
            shape2,
            true_dof,
        })
    }

    /// Nominal p-value of `r2` under the effective degrees of freedom.
    pub fn pval_true_df(&self, r2: f64) -> f64 {
        pval_from_r2(r2, self.true_dof)
    }

    /// Calibrated p-value of an observed best r².
    pub fn pval_beta(&self, r2: f64) -> Result<f64, BetaFitError> {
        let dist = Beta::new(self.shape1, self.shape2).map_err(|_| BetaFitError::InvalidShape {
            shape1: self.shape1,
            shape2: self.shape2,
        })?;
        Ok(dist.cdf(self.pval_true_df(r2)).clamp(0.0, 1.0))
    }
}

/// Fits the Beta model to a null of maximum r² values (one per permutation).
pub fn fit_beta_null(max_r2: &[f64], dof: f64) -> Result<BetaParameters, BetaFitError> {
    if max_r2.len() < MIN_NULL_SIZE {
        return Err(BetaFitError::TooFewPermutations {
            got: max_r2.len(),
            required: MIN_NULL_SIZE,
        });
    }
    // rounding leaves a constant null with a tiny positive variance
    if is_constant(max_r2) {
        return Err(BetaFitError::DegenerateNull);
    }

    let true_dof = learn_effective_dof(max_r2, dof)?;
    let pvals: Vec<f64> = max_r2.iter().map(|&r2| pval_from_r2(r2, true_dof)).collect();
    if is_constant(&pvals) {
        return Err(BetaFitError::DegenerateNull);
    }
    let (m, v) = mean_var(pvals.iter().copied());
    let shape1 = m * (m * (1.0 - m) / v - 1.0);
    let shape2 = shape1 * (1.0 / m - 1.0);
    let moments = BetaParameters::new(shape1, shape2, true_dof)?;

    let (a, b) = maximum_likelihood(&pvals, moments.shape1, moments.shape2);
    let fitted = BetaParameters::new(a, b, true_dof)?;
    debug!(
        "Beta fit: dof {:.3} -> {:.3}, moments ({:.4}, {:.4}), ML ({:.4}, {:.4})",
        dof, true_dof, shape1, shape2, a, b
    );
    Ok(fitted)
}

/// Root of the moment cost in `ν`: secant iteration from the nominal dof,
/// then golden-section minimisation of `|cost|` if the secant diverges.
pub fn learn_effective_dof(max_r2: &[f64], dof_init: f64) -> Result<f64, BetaFitError> {
    let cost = |nu: f64| dof_cost(max_r2, nu);

    if let Some(nu) = secant(cost, dof_init, DOF_TOLERANCE, DOF_MAX_ITER) {
        return Ok(nu);
    }
    let hi = (3.0 * dof_init).max(100.0);
    let nu = golden_section(
        |nu| {
            let c = cost(nu);
            if c.is_finite() {
                c.abs()
            } else {
                f64::INFINITY
            }
        },
        1.0,
        hi,
        DOF_TOLERANCE,
        200,
    );
    if nu.is_finite() && nu > 0.0 && cost(nu).is_finite() {
        debug!("Secant search for effective dof failed; golden-section gave {:.4}", nu);
        Ok(nu)
    } else {
        Err(BetaFitError::DofNotFound)
    }
}

fn dof_cost(max_r2: &[f64], nu: f64) -> f64 {
    if !(nu > 0.0) {
        return f64::NAN;
    }
    let (m, v) = mean_var(max_r2.iter().map(|&r2| pval_from_r2(r2, nu)));
    if !(v > f64::EPSILON * m * m) {
        return f64::NAN;
    }
    m * (m * (1.0 - m) / v - 1.0) - 1.0
}

fn secant(f: impl Fn(f64) -> f64, x0: f64, tol: f64, max_iter: usize) -> Option<f64> {
    let mut x0 = x0;
    let mut x1 = x0 * (1.0 + 1e-4) + if x0 >= 0.0 { 1e-4 } else { -1e-4 };
    let mut f0 = f(x0);
    let mut f1 = f(x1);
    for _ in 0..max_iter {
        if !(f0.is_finite() && f1.is_finite()) || f1 == f0 {
            return None;
        }
        let x2 = x1 - f1 * (x1 - x0) / (f1 - f0);
        if !(x2.is_finite() && x2 > 0.0) {
            return None;
        }
        if (x2 - x1).abs() < tol {
            return Some(x2);
        }
        x0 = x1;
        f0 = f1;
        x1 = x2;
        f1 = f(x1);
    }
    None
}

fn golden_section(f: impl Fn(f64) -> f64, lo: f64, hi: f64, tol: f64, max_iter: usize) -> f64 {
    let phi = (5.0_f64.sqrt() - 1.0) / 2.0;
    let (mut lo, mut hi) = (lo, hi);
    let mut x1 = hi - phi * (hi - lo);
    let mut x2 = lo + phi * (hi - lo);
    let mut f1 = f(x1);
    let mut f2 = f(x2);
    for _ in 0..max_iter {
        if hi - lo < tol {
            break;
        }
        if f1 < f2 {
            hi = x2;
            x2 = x1;
            f2 = f1;
            x1 = hi - phi * (hi - lo);
            f1 = f(x1);
        } else {
            lo = x1;
            x1 = x2;
            f1 = f2;
            x2 = lo + phi * (hi - lo);
            f2 = f(x2);
        }
    }
    (lo + hi) / 2.0
}

/// Maximum-likelihood Beta shapes, started from the moment estimates.
fn maximum_likelihood(pvals: &[f64], shape1: f64, shape2: f64) -> (f64, f64) {
    let n = pvals.len() as f64;
    let (sum_ln_p, sum_ln_q) = pvals.iter().fold((0.0, 0.0), |(lp, lq), &p| {
        let p = p.clamp(P_FLOOR, 1.0 - 1e-16);
        (lp + p.ln(), lq + (1.0 - p).ln())
    });
    let neg_log_likelihood = |a: f64, b: f64| {
        if !(a > 0.0 && b > 0.0) {
            return f64::INFINITY;
        }
        let ln_beta = ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b);
        -((a - 1.0) * sum_ln_p + (b - 1.0) * sum_ln_q - n * ln_beta)
    };
    nelder_mead_2d(neg_log_likelihood, (shape1, shape2), (shape1 / 10.0, shape2 / 10.0))
}

fn nelder_mead_2d(f: impl Fn(f64, f64) -> f64, start: (f64, f64), step: (f64, f64)) -> (f64, f64) {
    let eval = |p: (f64, f64)| f(p.0, p.1);
    let mut pts = [start, (start.0 + step.0, start.1), (start.0, start.1 + step.1)];
    let mut fv = pts.map(eval);

    for _ in 0..NM_MAX_ITER {
        // order: best first
        let mut idx = [0usize, 1, 2];
        idx.sort_by(|&i, &j| fv[i].total_cmp(&fv[j]));
        pts = idx.map(|i| pts[i]);
        fv = idx.map(|i| fv[i]);

        let spread = (fv[2] - fv[0]).abs();
        if spread <= NM_TOLERANCE * (fv[0].abs() + NM_TOLERANCE) {
            break;
        }

        let centroid = ((pts[0].0 + pts[1].0) / 2.0, (pts[0].1 + pts[1].1) / 2.0);
        let toward = |t: f64| {
            (
                centroid.0 + t * (pts[2].0 - centroid.0),
                centroid.1 + t * (pts[2].1 - centroid.1),
            )
        };

        let reflected = toward(-1.0);
        let fr = eval(reflected);
        if fr < fv[0] {
            let expanded = toward(-2.0);
            let fe = eval(expanded);
            if fe < fr {
                pts[2] = expanded;
                fv[2] = fe;
            } else {
                pts[2] = reflected;
                fv[2] = fr;
            }
        } else if fr < fv[1] {
            pts[2] = reflected;
            fv[2] = fr;
        } else {
            let contracted = toward(0.5);
            let fc = eval(contracted);
            if fc < fv[2] {
                pts[2] = contracted;
                fv[2] = fc;
            } else {
                for k in 1..3 {
                    pts[k] = ((pts[k].0 + pts[0].0) / 2.0, (pts[k].1 + pts[0].1) / 2.0);
                    fv[k] = eval(pts[k]);
                }
            }
        }
    }

    let best = (0..3).min_by(|&i, &j| fv[i].total_cmp(&fv[j])).unwrap_or(0);
    pts[best]
}

/// True when the range of `values` vanishes relative to their magnitude, or
/// when nothing finite is left to compare.
fn is_constant(values: &[f64]) -> bool {
    let (lo, hi) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    !(hi - lo > RELATIVE_SPREAD * lo.abs().max(hi.abs()))
}

/// Mean and population variance.
fn mean_var(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let (n, sum) = values.clone().fold((0usize, 0.0), |(n, s), v| (n + 1, s + v));
    if n == 0 {
        return (f64::NAN, f64::NAN);
    }
    let mean = sum / n as f64;
    let var = values.map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    (mean, var)
}

/// How a calibrated p-value was obtained.
#[derive(Clone, Debug, PartialEq)]
pub enum CalibrationStatus {
    Beta,
    /// The Beta fit failed; `pval_perm` is the reported value.
    Fallback(String),
    Disabled,
}

impl CalibrationStatus {
    pub fn label(&self) -> &str {
        match self {
            CalibrationStatus::Beta => "beta",
            CalibrationStatus::Fallback(_) => "fallback",
            CalibrationStatus::Disabled => "disabled",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Calibration {
    /// `(#{null >= observed} + 1) / (nperm + 1)`.
    pub pval_perm: f64,
    pub beta: Option<BetaParameters>,
    pub pval_true_df: Option<f64>,
    pub pval_beta: Option<f64>,
    pub status: CalibrationStatus,
}

impl Calibration {
    /// The best available calibrated p-value.
    pub fn pval(&self) -> f64 {
        self.pval_beta.unwrap_or(self.pval_perm)
    }
}

/// Empirical p-value of an observed r² against a null of max r² values.
pub fn empirical_pval(max_r2: &[f64], observed_r2: f64) -> f64 {
    let n_better = max_r2.iter().filter(|&&r2| r2 >= observed_r2).count();
    (n_better as f64 + 1.0) / (max_r2.len() as f64 + 1.0)
}

/// Calibrates `observed_r2` against `max_r2`. A failed fit is logged and
/// reported as `CalibrationStatus::Fallback`.
pub fn calibrate(max_r2: &[f64], observed_r2: f64, dof: f64, use_beta: bool) -> Calibration {
    let pval_perm = empirical_pval(max_r2, observed_r2);
    if !use_beta {
        return Calibration {
            pval_perm,
            beta: None,
            pval_true_df: None,
            pval_beta: None,
            status: CalibrationStatus::Disabled,
        };
    }
    let fitted = fit_beta_null(max_r2, dof).and_then(|params| Ok((params, params.pval_beta(observed_r2)?)));
    match fitted {
        Ok((params, pval_beta)) => Calibration {
            pval_perm,
            beta: Some(params),
            pval_true_df: Some(params.pval_true_df(observed_r2)),
            pval_beta: Some(pval_beta),
            status: CalibrationStatus::Beta,
        },
        Err(e) => {
            warn!("Beta approximation failed ({}); reporting the permutation p-value.", e);
            Calibration {
                pval_perm,
                beta: None,
                pval_true_df: None,
                pval_beta: None,
                status: CalibrationStatus::Fallback(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    /// Max r² over `m` independent standard-normal predictors, `n` samples.
    fn simulated_null(m: usize, n: usize, nperm: usize, seed: u64) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let standardize = |mut v: Vec<f64>| {
            let mean = v.iter().sum::<f64>() / v.len() as f64;
            v.iter_mut().for_each(|x| *x -= mean);
            let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
            v.iter_mut().for_each(|x| *x /= norm);
            v
        };
        let predictors: Vec<Vec<f64>> = (0..m)
            .map(|_| standardize((0..n).map(|_| normal.sample(&mut rng)).collect()))
            .collect();
        (0..nperm)
            .map(|_| {
                let y = standardize((0..n).map(|_| normal.sample(&mut rng)).collect());
                predictors
                    .iter()
                    .map(|x| x.iter().zip(&y).map(|(a, b)| a * b).sum::<f64>().powi(2))
                    .fold(0.0, f64::max)
            })
            .collect()
    }

    #[test]
    fn fit_on_simulated_null_is_valid() {
        let null = simulated_null(10, 60, 500, 7);
        let params = fit_beta_null(&null, 58.0).unwrap();
        assert!(params.shape1 > 0.0 && params.shape2 > 0.0);
        assert!(params.true_dof > 1.0 && params.true_dof < 500.0);
    }

    #[test]
    fn calibrated_pvalue_is_bounded_and_monotone() {
        let null = simulated_null(10, 60, 500, 11);
        let params = fit_beta_null(&null, 58.0).unwrap();
        let mut previous = 0.0;
        // decreasing r² must not decrease the p-value
        for step in 0..50 {
            let r2 = 0.9 - step as f64 * 0.018;
            let p = params.pval_beta(r2).unwrap();
            assert!((0.0..=1.0).contains(&p));
            assert!(p >= previous - 1e-15, "r2={} p={} previous={}", r2, p, previous);
            previous = p;
        }
    }

    #[test]
    fn zero_variance_null_falls_back() {
        let null = vec![0.1; 50];
        let cal = calibrate(&null, 0.2, 48.0, true);
        assert!(matches!(cal.status, CalibrationStatus::Fallback(_)));
        assert_eq!(cal.pval_beta, None);
        assert!((cal.pval_perm - 1.0 / 51.0).abs() < 1e-15);
        assert_eq!(cal.pval(), cal.pval_perm);
    }

    #[test]
    fn rounding_level_spread_is_a_degenerate_null() {
        // 0.3 - 0.2 and 0.1 differ only in the last bits
        let null: Vec<f64> = (0..40).map(|i| if i % 2 == 0 { 0.1 } else { 0.3 - 0.2 }).collect();
        assert_eq!(fit_beta_null(&null, 48.0).unwrap_err(), BetaFitError::DegenerateNull);
        assert_eq!(fit_beta_null(&vec![0.1; 50], 48.0).unwrap_err(), BetaFitError::DegenerateNull);
    }

    #[test]
    fn absurd_shapes_are_rejected() {
        let err = BetaParameters::new(5.7e30, 2.2e32, 48.0).unwrap_err();
        assert!(matches!(err, BetaFitError::InvalidShape { .. }));
        assert!(BetaParameters::new(1.1, 2.5e6, 48.0).is_ok());
    }

    #[test]
    fn too_few_permutations_fall_back() {
        let err = fit_beta_null(&[0.1, 0.2, 0.3], 20.0).unwrap_err();
        assert!(matches!(err, BetaFitError::TooFewPermutations { got: 3, .. }));
    }

    #[test]
    fn empirical_pvalue_counts_ties() {
        assert!((empirical_pval(&[0.1, 0.2, 0.3], 0.25) - 0.5).abs() < 1e-15);
        assert!((empirical_pval(&[0.1, 0.2, 0.3], 0.2) - 0.75).abs() < 1e-15);
        assert_eq!(empirical_pval(&[], 0.5), 1.0);
    }

    #[test]
    fn disabled_calibration_skips_the_fit() {
        let cal = calibrate(&[0.1, 0.4], 0.3, 20.0, false);
        assert_eq!(cal.status, CalibrationStatus::Disabled);
        assert!((cal.pval() - 2.0 / 3.0).abs() < 1e-15);
    }
}
