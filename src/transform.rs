//! Rank-based inverse normal transform and phenotype preparation.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::error::{QtlError, Result};
use crate::residualizer::Residualizer;

/// Residualizes phenotype rows. With `inverse_normal`, each residual row is
/// inverse-normal transformed and residualized again, so the transformed
/// values stay orthogonal to the covariates.
pub fn residualize_phenotypes(
    residualizer: &Residualizer,
    values: ArrayView2<f64>,
    inverse_normal: bool,
) -> Result<Array2<f64>> {
    let mut residuals = residualizer.residualize_rows(values);
    if inverse_normal {
        for mut row in residuals.axis_iter_mut(Axis(0)) {
            let transformed = inverse_normal_transform(row.view())?;
            row.assign(&transformed);
        }
        residuals = residualizer.residualize_rows(residuals.view());
    }
    Ok(residuals)
}

/// Maps values to standard-normal quantiles of `(rank - 0.5) / n`, averaging
/// ranks over ties.
pub fn inverse_normal_transform(values: ArrayView1<f64>) -> Result<Array1<f64>> {
    let n = values.len();
    let normal = Normal::new(0.0, 1.0).map_err(|e| QtlError::config(e.to_string()))?;

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut out = Array1::<f64>::zeros(n);
    let mut i = 0;
    while i < n {
        let mut j = i + 1;
        while j < n && values[order[j]] == values[order[i]] {
            j += 1;
        }
        // ranks i+1..=j share their mean
        let rank = (i + j + 1) as f64 / 2.0;
        let q = normal.inverse_cdf((rank - 0.5) / n as f64);
        for &idx in &order[i..j] {
            out[idx] = q;
        }
        i = j;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn preserves_order_and_symmetry() {
        let out = inverse_normal_transform(array![10.0, -3.0, 0.5, 7.0].view()).unwrap();
        assert!(out[1] < out[2] && out[2] < out[3] && out[3] < out[0]);
        assert!((out[0] + out[1]).abs() < 1e-12);
        assert!(out.sum().abs() < 1e-12);
    }

    #[test]
    fn transformed_phenotypes_stay_orthogonal_to_covariates() {
        use crate::config::CollinearityPolicy;

        let cov = array![[1.0, 0.0, 2.0, 1.0, 3.0, 0.5, 2.5, 1.5]];
        let residualizer = Residualizer::new(cov.view(), CollinearityPolicy::Fail).unwrap();
        let y = array![[5.0, 1.0, 9.0, 2.0, 40.0, 3.0, 8.0, 4.0]];
        let out = residualize_phenotypes(&residualizer, y.view(), true).unwrap();
        assert!(out.row(0).sum().abs() < 1e-10);
        assert!(out.row(0).dot(&cov.row(0)).abs() < 1e-9);
        // the outlier no longer dominates
        assert!(out.row(0).iter().all(|v| v.abs() < 3.0));
    }

    #[test]
    fn ties_share_a_quantile() {
        let out = inverse_normal_transform(array![1.0, 2.0, 2.0, 3.0].view()).unwrap();
        assert_eq!(out[1], out[2]);
        assert!(out[1].abs() < 1e-12);
    }
}
