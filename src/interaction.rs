//! # Genotype x interaction tests
//!
//! Fits `y ~ covariates + g + i + g*i` for each variant. All three predictors
//! and the phenotype are residualized against the covariates (and intercept)
//! first; by Frisch-Waugh-Lovell the three-column OLS on the residuals gives
//! the full-model coefficients, with `n - k - 4` residual degrees of freedom.
//! The product `g*i` is formed from raw values before residualization.

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};

use crate::association::pval_from_t;
use crate::error::{QtlError, Result};
use crate::residualizer::Residualizer;
use crate::variant_filter::allele_stats;

/// Relative pivot size below which the 3x3 normal matrix is singular.
const SINGULAR_TOLERANCE: f64 = 1e-10;

/// One fitted coefficient.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Coefficient {
    pub estimate: f64,
    pub se: f64,
    pub tstat: f64,
    pub pval: f64,
}

impl Coefficient {
    const SENTINEL: Coefficient = Coefficient {
        estimate: 0.0,
        se: f64::NAN,
        tstat: 0.0,
        pval: 1.0,
    };
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InteractionStats {
    /// Genotype main effect.
    pub g: Coefficient,
    /// Interaction-term main effect.
    pub i: Coefficient,
    /// Genotype x interaction effect.
    pub gi: Coefficient,
    pub dof: f64,
    /// The three predictors were linearly dependent after residualization.
    pub degenerate: bool,
}

impl InteractionStats {
    fn sentinel(dof: f64) -> Self {
        Self {
            g: Coefficient::SENTINEL,
            i: Coefficient::SENTINEL,
            gi: Coefficient::SENTINEL,
            dof,
            degenerate: true,
        }
    }
}

/// Interaction model bound to one covariate design and interaction vector.
#[derive(Clone, Debug)]
pub struct InteractionTester<'a> {
    residualizer: &'a Residualizer,
    interaction: Array1<f64>,
    interaction_residual: Array1<f64>,
    /// Sample indices below / at-or-above the interaction median split.
    lower_half: Vec<usize>,
    upper_half: Vec<usize>,
    maf_threshold: f64,
}

impl<'a> InteractionTester<'a> {
    pub fn new(residualizer: &'a Residualizer, interaction: ArrayView1<f64>, maf_threshold: f64) -> Result<Self> {
        let n = interaction.len();
        if n != residualizer.n_samples() {
            return Err(QtlError::input_validation(format!(
                "interaction term has {} samples, design has {}",
                n,
                residualizer.n_samples()
            )));
        }
        if interaction.iter().any(|v| !v.is_finite()) {
            return Err(QtlError::input_validation("interaction term contains non-finite values"));
        }
        if residualizer.dof() - 2.0 <= 0.0 {
            return Err(QtlError::degenerate_design(format!(
                "{} samples leave no degrees of freedom for the interaction model",
                n
            )));
        }
        let interaction_residual = residualizer.residualize(interaction);
        let norm = interaction_residual.dot(&interaction_residual).sqrt();
        let scale = interaction.dot(&interaction).sqrt().max(1.0);
        if norm < SINGULAR_TOLERANCE * scale {
            return Err(QtlError::degenerate_design(
                "interaction term is constant or collinear with the covariates",
            ));
        }

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| interaction[a].total_cmp(&interaction[b]));
        let upper_half = order.split_off(n / 2);

        Ok(Self {
            residualizer,
            interaction: interaction.to_owned(),
            interaction_residual,
            lower_half: order,
            upper_half,
            maf_threshold,
        })
    }

    pub fn dof(&self) -> f64 {
        self.residualizer.dof() - 2.0
    }

    /// Whether the minor allele frequency reaches the threshold within both
    /// halves of the samples split by interaction value. `dosages` may
    /// contain missing calls.
    pub fn passes_maf_halves(&self, dosages: ArrayView1<f64>) -> bool {
        let half_maf = |samples: &[usize]| {
            let sub = dosages.select(Axis(0), samples);
            allele_stats(sub.view()).map_or(0.0, |s| s.maf)
        };
        half_maf(&self.lower_half) >= self.maf_threshold && half_maf(&self.upper_half) >= self.maf_threshold
    }

    /// Residualized genotype and product columns of one variant, with the
    /// inverse normal matrix. `dosages` must be imputed.
    pub fn prepare(&self, dosages: ArrayView1<f64>) -> PreparedVariant {
        let g = self.residualizer.residualize(dosages);
        let product = &dosages * &self.interaction;
        let gi = self.residualizer.residualize(product.view());

        let columns = [g.view(), self.interaction_residual.view(), gi.view()];
        let mut xtx = [[0.0; 3]; 3];
        for a in 0..3 {
            for b in a..3 {
                let v = columns[a].dot(&columns[b]);
                xtx[a][b] = v;
                xtx[b][a] = v;
            }
        }
        PreparedVariant {
            g,
            gi,
            inverse: invert_3x3(&xtx),
        }
    }

    /// Tests a prepared variant against one phenotype residualized with the
    /// same residualizer.
    pub fn test_prepared(&self, variant: &PreparedVariant, phenotype_residual: ArrayView1<f64>) -> InteractionStats {
        let dof = self.dof();
        let Some(inv) = variant.inverse else {
            return InteractionStats::sentinel(dof);
        };
        let columns = [variant.g.view(), self.interaction_residual.view(), variant.gi.view()];
        let xty: [f64; 3] = std::array::from_fn(|a| columns[a].dot(&phenotype_residual));

        let beta: [f64; 3] = std::array::from_fn(|a| (0..3).map(|b| inv[a][b] * xty[b]).sum());
        let mut residual = phenotype_residual.to_owned();
        for (col, &b) in columns.iter().zip(&beta) {
            residual.scaled_add(-b, col);
        }
        let sigma2 = residual.dot(&residual) / dof;

        let coef = |j: usize| {
            let se = (sigma2 * inv[j][j]).sqrt();
            let tstat = if se > 0.0 { beta[j] / se } else { 0.0 };
            Coefficient {
                estimate: beta[j],
                se,
                tstat,
                pval: pval_from_t(tstat, dof),
            }
        };
        InteractionStats {
            g: coef(0),
            i: coef(1),
            gi: coef(2),
            dof,
            degenerate: false,
        }
    }

    /// Tests one variant. `dosages` must be imputed; `phenotype_residual` must
    /// already be residualized with the same residualizer.
    pub fn test(&self, dosages: ArrayView1<f64>, phenotype_residual: ArrayView1<f64>) -> InteractionStats {
        self.test_prepared(&self.prepare(dosages), phenotype_residual)
    }

    /// Tests one variant against every row of `phenotype_residuals`
    /// (phenotypes x samples), preparing the genotype columns once.
    pub fn test_phenotypes(&self, dosages: ArrayView1<f64>, phenotype_residuals: ArrayView2<f64>) -> Vec<InteractionStats> {
        let variant = self.prepare(dosages);
        phenotype_residuals
            .rows()
            .into_iter()
            .map(|y| self.test_prepared(&variant, y))
            .collect()
    }
}

/// Genotype-side part of the interaction model for one variant.
#[derive(Clone, Debug)]
pub struct PreparedVariant {
    g: Array1<f64>,
    gi: Array1<f64>,
    /// `None` when the three predictors are linearly dependent.
    inverse: Option<[[f64; 3]; 3]>,
}

/// Inverse through the adjugate; `None` when the determinant is negligible
/// relative to the diagonal.
fn invert_3x3(m: &[[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let cofactor = [
        [
            m[1][1] * m[2][2] - m[1][2] * m[2][1],
            m[1][2] * m[2][0] - m[1][0] * m[2][2],
            m[1][0] * m[2][1] - m[1][1] * m[2][0],
        ],
        [
            m[0][2] * m[2][1] - m[0][1] * m[2][2],
            m[0][0] * m[2][2] - m[0][2] * m[2][0],
            m[0][1] * m[2][0] - m[0][0] * m[2][1],
        ],
        [
            m[0][1] * m[1][2] - m[0][2] * m[1][1],
            m[0][2] * m[1][0] - m[0][0] * m[1][2],
            m[0][0] * m[1][1] - m[0][1] * m[1][0],
        ],
    ];
    let det = m[0][0] * cofactor[0][0] + m[0][1] * cofactor[0][1] + m[0][2] * cofactor[0][2];
    let scale = m[0][0] * m[1][1] * m[2][2];
    if !det.is_finite() || !(scale > 0.0) || det.abs() < SINGULAR_TOLERANCE * scale {
        return None;
    }
    Some(std::array::from_fn(|i| std::array::from_fn(|j| cofactor[j][i] / det)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1, Array2};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn inverse_of_known_matrix() {
        let m = [[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 2.0]];
        let inv = invert_3x3(&m).unwrap();
        for a in 0..3 {
            for b in 0..3 {
                let v: f64 = (0..3).map(|k| m[a][k] * inv[k][b]).sum();
                let expected = if a == b { 1.0 } else { 0.0 };
                assert!((v - expected).abs() < 1e-12, "({},{}) = {}", a, b, v);
            }
        }
        assert!(invert_3x3(&[[1.0, 1.0, 0.0], [1.0, 1.0, 0.0], [0.0, 0.0, 1.0]]).is_none());
    }

    #[test]
    fn recovers_injected_interaction_effect() {
        let n = 200;
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let noise = Normal::new(0.0, 0.5).unwrap();
        let inter_dist = Normal::new(0.0, 1.0).unwrap();
        let g: Array1<f64> = (0..n).map(|_| rng.random_range(0..3) as f64).collect();
        let i: Array1<f64> = (0..n).map(|_| inter_dist.sample(&mut rng)).collect();
        let covariate: Array2<f64> = Array2::from_shape_fn((1, n), |_| inter_dist.sample(&mut rng));
        let y: Array1<f64> = (0..n)
            .map(|s| 0.3 * g[s] + 0.5 * i[s] + 0.8 * g[s] * i[s] + 0.4 * covariate[[0, s]] + noise.sample(&mut rng))
            .collect();

        let residualizer = Residualizer::new(covariate.view(), Default::default()).unwrap();
        let tester = InteractionTester::new(&residualizer, i.view(), 0.05).unwrap();
        assert_eq!(tester.dof(), (n - 1 - 4) as f64);
        let y_res = residualizer.residualize(y.view());
        let stats = tester.test(g.view(), y_res.view());

        assert!(!stats.degenerate);
        assert!((stats.gi.estimate - 0.8).abs() < 0.1, "b_gi = {}", stats.gi.estimate);
        assert!((stats.g.estimate - 0.3).abs() < 0.15, "b_g = {}", stats.g.estimate);
        assert!(stats.gi.pval < 1e-10);
        assert!(stats.gi.se > 0.0);
    }

    #[test]
    fn maf_is_checked_in_both_halves() {
        let residualizer = Residualizer::identity(8);
        let inter = array![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8];
        let tester = InteractionTester::new(&residualizer, inter.view(), 0.1).unwrap();
        // minor alleles only among the low-interaction samples
        let one_sided = array![1.0, 2.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        assert!(!tester.passes_maf_halves(one_sided.view()));
        let balanced = array![1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0];
        assert!(tester.passes_maf_halves(balanced.view()));
    }

    #[test]
    fn product_equal_to_genotype_is_degenerate() {
        // binary interaction with carriers only where i = 1, so g*i == g
        let residualizer = Residualizer::identity(10);
        let inter = array![0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        let g = array![0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 0.0, 1.0, 1.0];
        let y = array![0.3, -0.1, 0.2, 0.5, -0.4, 1.1, 2.3, 0.1, 0.9, 1.2];
        let tester = InteractionTester::new(&residualizer, inter.view(), 0.0).unwrap();
        assert!(tester.prepare(g.view()).inverse.is_none());

        let stats = tester.test(g.view(), residualizer.residualize(y.view()).view());
        assert!(stats.degenerate);
        assert_eq!(stats.gi.pval, 1.0);
        assert!(stats.gi.se.is_nan());
    }

    #[test]
    fn multi_phenotype_call_matches_single_tests() {
        let n = 40;
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let g: Array1<f64> = (0..n).map(|_| rng.random_range(0..3) as f64).collect();
        let i: Array1<f64> = (0..n).map(|_| rng.random::<f64>()).collect();
        let ys = Array2::from_shape_fn((3, n), |_| rng.random::<f64>());
        let residualizer = Residualizer::identity(n);
        let tester = InteractionTester::new(&residualizer, i.view(), 0.0).unwrap();
        let residuals = residualizer.residualize_rows(ys.view());

        let all = tester.test_phenotypes(g.view(), residuals.view());
        assert_eq!(all.len(), 3);
        for (row, stats) in residuals.rows().into_iter().zip(&all) {
            assert_eq!(*stats, tester.test(g.view(), row));
        }
    }

    #[test]
    fn constant_interaction_is_rejected() {
        let residualizer = Residualizer::identity(6);
        let inter = array![2.0, 2.0, 2.0, 2.0, 2.0, 2.0];
        let err = InteractionTester::new(&residualizer, inter.view(), 0.0).unwrap_err();
        assert!(matches!(err, QtlError::DegenerateDesign { .. }));
    }
}
