//! # Association statistics
//!
//! Residualized genotype rows and phenotype vectors are standardized to zero
//! mean and unit norm, after which Pearson correlations for a whole batch are
//! one matrix product. Correlations convert to
//! `t = r * sqrt(dof / (1 - r^2))` with `dof = n - k - 2`, and two-sided
//! Student-t p-values are evaluated as `I_{1-r^2}(dof/2, 1/2)`.
//!
//! Rows whose residual norm vanishes (monomorphic after residualization) are
//! marked degenerate: they report `r = 0`, `t = 0`, `p = 1` instead of NaN.

use log::warn;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use statrs::function::beta::beta_reg;

use crate::residualizer::Residualizer;

/// Norms below this are treated as zero variance.
const NORM_EPSILON: f64 = 1e-10;
/// Perfect correlation is capped here so `t` stays finite.
pub const MAX_ABS_R: f64 = 1.0 - 1e-12;

/// Residualized rows scaled to unit norm, with their pre-scaling standard deviations.
#[derive(Clone, Debug)]
pub struct StandardizedRows {
    /// rows x samples; degenerate rows are all zero.
    pub values: Array2<f64>,
    /// Residual standard deviation of each row (sample variance, `n - 1`).
    pub std_dev: Vec<f64>,
    pub degenerate: Vec<bool>,
}

impl StandardizedRows {
    /// `residuals` must already be centred (the residualizer guarantees this).
    pub fn from_residuals(mut residuals: Array2<f64>) -> Self {
        let n = residuals.ncols();
        let mut std_dev = Vec::with_capacity(residuals.nrows());
        let mut degenerate = Vec::with_capacity(residuals.nrows());
        for mut row in residuals.axis_iter_mut(Axis(0)) {
            let norm = row.dot(&row).sqrt();
            if norm < NORM_EPSILON || !norm.is_finite() {
                row.fill(0.0);
                std_dev.push(0.0);
                degenerate.push(true);
            } else {
                row /= norm;
                std_dev.push(norm / ((n.max(2) - 1) as f64).sqrt());
                degenerate.push(false);
            }
        }
        Self {
            values: residuals,
            std_dev,
            degenerate,
        }
    }

    pub fn len(&self) -> usize {
        self.values.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.values.nrows() == 0
    }

    pub fn n_degenerate(&self) -> usize {
        self.degenerate.iter().filter(|&&d| d).count()
    }

    /// Row `row` as a standalone phenotype.
    pub fn phenotype(&self, row: usize) -> StandardizedPhenotype {
        StandardizedPhenotype {
            values: self.values.row(row).to_owned(),
            std_dev: self.std_dev[row],
            degenerate: self.degenerate[row],
        }
    }
}

/// A residualized, unit-norm phenotype.
#[derive(Clone, Debug)]
pub struct StandardizedPhenotype {
    pub values: Array1<f64>,
    pub std_dev: f64,
    pub degenerate: bool,
}

impl StandardizedPhenotype {
    pub fn from_residuals(residuals: Array1<f64>) -> Self {
        let n = residuals.len();
        let norm = residuals.dot(&residuals).sqrt();
        if norm < NORM_EPSILON || !norm.is_finite() {
            return Self {
                values: Array1::zeros(n),
                std_dev: 0.0,
                degenerate: true,
            };
        }
        Self {
            values: residuals / norm,
            std_dev: norm / ((n.max(2) - 1) as f64).sqrt(),
            degenerate: false,
        }
    }
}

/// Per-variant result of a single-phenotype test.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AssociationStats {
    pub r: f64,
    pub tstat: f64,
    pub pval: f64,
    pub slope: f64,
    /// NaN for degenerate rows.
    pub slope_se: f64,
    pub degenerate: bool,
}

impl AssociationStats {
    pub const SENTINEL: AssociationStats = AssociationStats {
        r: 0.0,
        tstat: 0.0,
        pval: 1.0,
        slope: 0.0,
        slope_se: f64::NAN,
        degenerate: true,
    };

    pub fn r2(&self) -> f64 {
        self.r * self.r
    }
}

/// Batched residualized-correlation engine bound to one covariate design.
#[derive(Clone, Copy, Debug)]
pub struct AssociationEngine<'a> {
    residualizer: &'a Residualizer,
    warn_degenerate: bool,
}

impl<'a> AssociationEngine<'a> {
    pub fn new(residualizer: &'a Residualizer, warn_degenerate: bool) -> Self {
        Self {
            residualizer,
            warn_degenerate,
        }
    }

    pub fn dof(&self) -> f64 {
        self.residualizer.dof()
    }

    /// Residualizes and standardizes genotype rows (variants x samples, no missing values).
    pub fn prepare_genotypes(&self, dosages: ArrayView2<f64>) -> StandardizedRows {
        let rows = StandardizedRows::from_residuals(self.residualizer.residualize_rows(dosages));
        let n_deg = rows.n_degenerate();
        if n_deg > 0 && self.warn_degenerate {
            warn!(
                "{} of {} variants have zero residual variance; reported with t=0, p=1.",
                n_deg,
                rows.len()
            );
        }
        rows
    }

    pub fn prepare_phenotype(&self, values: ArrayView1<f64>) -> StandardizedPhenotype {
        StandardizedPhenotype::from_residuals(self.residualizer.residualize(values))
    }

    /// Correlation of every row with `phenotype` (one matrix-vector product).
    pub fn correlate(&self, genotypes: &StandardizedRows, phenotype: ArrayView1<f64>) -> Array1<f64> {
        genotypes.values.dot(&phenotype)
    }

    /// Genotype rows x phenotype rows correlation block.
    pub fn correlate_batch(&self, genotypes: &StandardizedRows, phenotypes: ArrayView2<f64>) -> Array2<f64> {
        genotypes.values.dot(&phenotypes.t())
    }

    pub fn test(&self, genotypes: &StandardizedRows, phenotype: &StandardizedPhenotype) -> Vec<AssociationStats> {
        if phenotype.degenerate {
            if self.warn_degenerate {
                warn!("Phenotype has zero residual variance; all variants reported with t=0, p=1.");
            }
            return vec![AssociationStats::SENTINEL; genotypes.len()];
        }
        let r = self.correlate(genotypes, phenotype.values.view());
        let dof = self.dof();
        (0..genotypes.len())
            .into_par_iter()
            .map(|i| {
                if genotypes.degenerate[i] {
                    return AssociationStats::SENTINEL;
                }
                stats_from_r(r[i], dof, phenotype.std_dev, genotypes.std_dev[i])
            })
            .collect()
    }
}

/// Full statistics for one correlation; `y_sd`/`x_sd` are residual standard deviations.
pub fn stats_from_r(r: f64, dof: f64, y_sd: f64, x_sd: f64) -> AssociationStats {
    if !r.is_finite() || x_sd <= 0.0 || y_sd <= 0.0 {
        return AssociationStats::SENTINEL;
    }
    let r = r.clamp(-MAX_ABS_R, MAX_ABS_R);
    let tstat = t_from_r(r, dof);
    let slope = r * y_sd / x_sd;
    let slope_se = if tstat != 0.0 { (slope / tstat).abs() } else { f64::NAN };
    AssociationStats {
        r,
        tstat,
        pval: pval_from_r2(r * r, dof),
        slope,
        slope_se,
        degenerate: false,
    }
}

pub fn t_from_r(r: f64, dof: f64) -> f64 {
    let r = r.clamp(-MAX_ABS_R, MAX_ABS_R);
    r * (dof / (1.0 - r * r)).sqrt()
}

/// Two-sided p-value of a correlation with `dof` residual degrees of freedom.
pub fn pval_from_r2(r2: f64, dof: f64) -> f64 {
    if dof.is_nan() || dof <= 0.0 || !r2.is_finite() {
        return 1.0;
    }
    let r2 = r2.clamp(0.0, MAX_ABS_R * MAX_ABS_R);
    beta_reg(dof / 2.0, 0.5, 1.0 - r2).clamp(0.0, 1.0)
}

/// Two-sided Student-t p-value.
pub fn pval_from_t(t: f64, dof: f64) -> f64 {
    if dof.is_nan() || dof <= 0.0 || t.is_nan() {
        return 1.0;
    }
    if t.is_infinite() {
        return 0.0;
    }
    let x = dof / (dof + t * t);
    beta_reg(dof / 2.0, 0.5, x.clamp(0.0, 1.0)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use statrs::distribution::{ContinuousCDF, StudentsT};

    #[test]
    fn pvalue_matches_students_t_tail() {
        let dof = 20.0;
        let t_dist = StudentsT::new(0.0, 1.0, dof).unwrap();
        for &t in &[0.3, 1.0, 2.5, 4.0] {
            let expected = 2.0 * (1.0 - t_dist.cdf(t));
            assert!((pval_from_t(t, dof) - expected).abs() < 1e-10, "t={}", t);
            let r2 = t * t / (t * t + dof);
            assert!((pval_from_r2(r2, dof) - expected).abs() < 1e-10);
        }
    }

    #[test]
    fn correlation_matches_direct_pearson() {
        let residualizer = Residualizer::identity(6);
        let engine = AssociationEngine::new(&residualizer, false);
        let g = array![[0.0, 1.0, 2.0, 1.0, 0.0, 2.0]];
        let p = array![1.2, 0.3, 2.2, 1.9, 0.1, 2.8];
        let rows = engine.prepare_genotypes(g.view());
        let pheno = engine.prepare_phenotype(p.view());
        let stats = engine.test(&rows, &pheno);

        let gm = g.row(0).mean().unwrap();
        let pm = p.mean().unwrap();
        let cov: f64 = g.row(0).iter().zip(p.iter()).map(|(a, b)| (a - gm) * (b - pm)).sum();
        let vg: f64 = g.row(0).iter().map(|a| (a - gm).powi(2)).sum();
        let vp: f64 = p.iter().map(|b| (b - pm).powi(2)).sum();
        let r = cov / (vg * vp).sqrt();
        assert!((stats[0].r - r).abs() < 1e-12);
        // OLS slope of p on g
        assert!((stats[0].slope - cov / vg).abs() < 1e-10);
        assert!((stats[0].tstat - r * (4.0 / (1.0 - r * r)).sqrt()).abs() < 1e-10);
    }

    #[test]
    fn zero_variance_row_yields_sentinel() {
        let residualizer = Residualizer::identity(5);
        let engine = AssociationEngine::new(&residualizer, true);
        let g = array![[1.0, 1.0, 1.0, 1.0, 1.0], [0.0, 1.0, 2.0, 1.0, 0.0]];
        let rows = engine.prepare_genotypes(g.view());
        let pheno = engine.prepare_phenotype(array![0.1, 0.5, 0.9, 0.4, 0.2].view());
        let stats = engine.test(&rows, &pheno);
        assert!(stats[0].degenerate);
        assert_eq!(stats[0].tstat, 0.0);
        assert_eq!(stats[0].pval, 1.0);
        assert!(stats[1].tstat.is_finite() && stats[1].pval < 1.0);
    }

    #[test]
    fn perfect_correlation_is_capped() {
        let s = stats_from_r(1.0, 48.0, 1.0, 1.0);
        assert!(s.tstat.is_finite() && s.tstat > 1e5);
        assert!(s.pval < 1e-100);
    }
}
