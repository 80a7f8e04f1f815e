//! # Covariate residualization
//!
//! Removes the intercept and the linear span of the covariates from genotype
//! and phenotype rows: `x - mean(x) - Q Qᵀ (x - mean(x))`, where `Q` is an
//! orthonormal basis of the centred covariates. Centring covariates first
//! accounts for the implicit intercept, so a constant covariate is detected
//! as collinear with it.
//!
//! `Q` comes from a modified Gram-Schmidt pass with re-orthogonalization, or
//! from LAPACK QR when built with the `lapack` feature. Both paths apply the
//! same rank test, so a near-zero pivot is reported (or dropped, per
//! `CollinearityPolicy`) rather than divided by.

use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::config::CollinearityPolicy;
use crate::error::{QtlError, Result};

/// Relative size below which a covariate's component orthogonal to the
/// preceding ones is treated as zero.
const RANK_TOLERANCE: f64 = 1e-10;
/// Covariates whose centred norm is below this are constant.
const ZERO_NORM: f64 = 1e-12;

#[derive(Clone, Debug)]
pub struct Residualizer {
    /// samples x rank, orthonormal columns. `None` without covariates.
    basis: Option<Array2<f64>>,
    n_samples: usize,
    /// Indices of input covariates dropped as dependent.
    dropped: Vec<usize>,
}

impl Residualizer {
    /// Mean-centring only.
    pub fn identity(n_samples: usize) -> Self {
        Self {
            basis: None,
            n_samples,
            dropped: Vec::new(),
        }
    }

    /// `covariates` is covariates x samples.
    pub fn new(covariates: ArrayView2<f64>, policy: CollinearityPolicy) -> Result<Self> {
        let n_samples = covariates.ncols();
        if covariates.nrows() == 0 {
            return Ok(Self::identity(n_samples));
        }
        let mut centred = covariates.t().to_owned();
        for mut col in centred.axis_iter_mut(Axis(1)) {
            let mean = col.mean().unwrap_or(0.0);
            col.mapv_inplace(|v| v - mean);
        }

        let (basis, dropped) = orthonormal_basis(centred, policy)?;
        if !dropped.is_empty() {
            warn!(
                "Dropped {} collinear covariate(s) (input rows {:?}); {} remain.",
                dropped.len(),
                dropped,
                basis.ncols()
            );
        }
        let residualizer = Self {
            basis: if basis.ncols() == 0 { None } else { Some(basis) },
            n_samples,
            dropped,
        };
        if residualizer.dof() <= 0.0 {
            return Err(QtlError::degenerate_design(format!(
                "{} samples leave no residual degrees of freedom after {} covariates",
                n_samples,
                residualizer.n_covariates()
            )));
        }
        debug!(
            "Residualizer ready: {} samples, {} covariates, dof {}",
            n_samples,
            residualizer.n_covariates(),
            residualizer.dof()
        );
        Ok(residualizer)
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Covariates retained in the design (the intercept not counted).
    pub fn n_covariates(&self) -> usize {
        self.basis.as_ref().map_or(0, |q| q.ncols())
    }

    pub fn dropped_covariates(&self) -> &[usize] {
        &self.dropped
    }

    /// Residual degrees of freedom of a single-predictor test: `n - k - 2`.
    pub fn dof(&self) -> f64 {
        self.n_samples as f64 - self.n_covariates() as f64 - 2.0
    }

    /// Residualizes each row (variables x samples).
    pub fn residualize_rows(&self, x: ArrayView2<f64>) -> Array2<f64> {
        let mut out = x.to_owned();
        for mut row in out.axis_iter_mut(Axis(0)) {
            let mean = row.mean().unwrap_or(0.0);
            row.mapv_inplace(|v| v - mean);
        }
        if let Some(q) = &self.basis {
            let coef = out.dot(q);
            out -= &coef.dot(&q.t());
        }
        out
    }

    pub fn residualize(&self, x: ArrayView1<f64>) -> Array1<f64> {
        let mean = x.mean().unwrap_or(0.0);
        let mut out = x.mapv(|v| v - mean);
        if let Some(q) = &self.basis {
            let coef = q.t().dot(&out);
            out -= &q.dot(&coef);
        }
        out
    }
}

/// Orthonormal basis of the columns of `design` (samples x covariates), with
/// the input indices of dependent columns.
#[cfg(not(feature = "lapack"))]
fn orthonormal_basis(design: Array2<f64>, policy: CollinearityPolicy) -> Result<(Array2<f64>, Vec<usize>)> {
    let n = design.nrows();
    let mut columns: Vec<Array1<f64>> = Vec::with_capacity(design.ncols());
    let mut dropped = Vec::new();

    for (j, col) in design.axis_iter(Axis(1)).enumerate() {
        let original_norm = col.dot(&col).sqrt();
        let mut v = col.to_owned();
        // two passes restore orthogonality lost to cancellation
        for _ in 0..2 {
            for q in &columns {
                let proj = q.dot(&v);
                v.scaled_add(-proj, q);
            }
        }
        let norm = v.dot(&v).sqrt();
        if original_norm < ZERO_NORM || norm < RANK_TOLERANCE * original_norm {
            reject_column(j, policy)?;
            dropped.push(j);
            continue;
        }
        v /= norm;
        columns.push(v);
    }

    let mut basis = Array2::<f64>::zeros((n, columns.len()));
    for (j, q) in columns.iter().enumerate() {
        basis.column_mut(j).assign(q);
    }
    Ok((basis, dropped))
}

#[cfg(feature = "lapack")]
fn orthonormal_basis(design: Array2<f64>, policy: CollinearityPolicy) -> Result<(Array2<f64>, Vec<usize>)> {
    use ndarray_linalg::QR;

    let mut kept: Vec<usize> = (0..design.ncols()).collect();
    let mut dropped = Vec::new();
    loop {
        if kept.is_empty() {
            return Ok((Array2::zeros((design.nrows(), 0)), dropped));
        }
        let sub = design.select(Axis(1), &kept);
        let (q, r) = sub
            .qr()
            .map_err(|e| QtlError::degenerate_design(format!("covariate QR failed: {}", e)))?;
        let dependent = (0..kept.len()).find(|&j| {
            let col = sub.column(j);
            let original_norm = col.dot(&col).sqrt();
            original_norm < ZERO_NORM || r[[j, j]].abs() < RANK_TOLERANCE * original_norm
        });
        match dependent {
            None => {
                dropped.sort_unstable();
                return Ok((q, dropped));
            }
            Some(j) => {
                reject_column(kept[j], policy)?;
                dropped.push(kept.remove(j));
            }
        }
    }
}

fn reject_column(index: usize, policy: CollinearityPolicy) -> Result<()> {
    match policy {
        CollinearityPolicy::Fail => Err(QtlError::degenerate_design(format!(
            "covariate {} is constant or a linear combination of the preceding covariates",
            index
        ))),
        CollinearityPolicy::DropDependent => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn covariates() -> Array2<f64> {
        array![
            [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
            [0.5, -1.0, 2.0, 0.0, 1.5, -0.5, 3.0, 1.0],
        ]
    }

    #[test]
    fn residuals_are_orthogonal_to_covariates_and_centred() {
        let c = covariates();
        let r = Residualizer::new(c.view(), CollinearityPolicy::Fail).unwrap();
        assert_eq!(r.n_covariates(), 2);
        assert_eq!(r.dof(), 4.0);

        let y = array![3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0];
        let res = r.residualize(y.view());
        assert!(res.sum().abs() < 1e-10);
        for cov in c.rows() {
            assert!(res.dot(&cov).abs() < 1e-9);
        }
    }

    #[test]
    fn row_and_vector_paths_agree() {
        let c = covariates();
        let r = Residualizer::new(c.view(), CollinearityPolicy::Fail).unwrap();
        let x = array![[3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0], [0.0, 1.0, 0.0, 2.0, 1.0, 1.0, 0.0, 2.0]];
        let rows = r.residualize_rows(x.view());
        for (i, row) in x.rows().into_iter().enumerate() {
            let v = r.residualize(row);
            for (a, b) in v.iter().zip(rows.row(i)) {
                assert!((a - b).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn identity_only_centres() {
        let r = Residualizer::identity(4);
        let res = r.residualize(array![1.0, 2.0, 3.0, 6.0].view());
        assert_eq!(res, array![-2.0, -1.0, 0.0, 3.0]);
        assert_eq!(r.dof(), 2.0);
    }

    #[test]
    fn collinear_covariates_are_reported() {
        let mut c = covariates();
        let dup = &c.row(0) * 2.0 + &c.row(1);
        c.push_row(dup.view()).unwrap();
        let err = Residualizer::new(c.view(), CollinearityPolicy::Fail).unwrap_err();
        assert!(matches!(err, QtlError::DegenerateDesign { .. }));

        let r = Residualizer::new(c.view(), CollinearityPolicy::DropDependent).unwrap();
        assert_eq!(r.n_covariates(), 2);
        assert_eq!(r.dropped_covariates(), &[2]);
    }

    #[test]
    fn constant_covariate_is_collinear_with_intercept() {
        let c = array![[1.0, 1.0, 1.0, 1.0, 1.0]];
        assert!(Residualizer::new(c.view(), CollinearityPolicy::Fail).is_err());
    }

    #[test]
    fn too_many_covariates_leave_no_dof() {
        let c = array![[1.0, 2.0, 3.0, 5.0], [1.0, 0.0, 2.0, 0.5]];
        let err = Residualizer::new(c.view(), CollinearityPolicy::Fail).unwrap_err();
        assert!(matches!(err, QtlError::DegenerateDesign { .. }));
    }
}
