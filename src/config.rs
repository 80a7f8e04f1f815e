//! # Mapping configuration
//!
//! Immutable settings handed by reference into every mapping call. Cis and
//! trans scans keep separate structs with different defaults: trans scans
//! filter rare variants (`maf_threshold = 0.05`) where cis scans keep
//! everything (`maf_threshold = 0.0`). Both run 10000 permutations by
//! default; trans calibration is disabled with `permutations = 0`.

use crate::error::{QtlError, Result};

/// What to do when covariates are linearly dependent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CollinearityPolicy {
    /// Return `QtlError::DegenerateDesign`.
    #[default]
    Fail,
    /// Drop each dependent covariate and log a warning.
    DropDependent,
}

#[derive(Clone, Debug)]
pub struct CisConfig {
    /// Half-width of the cis window in bp; a variant is in the window when
    /// `|variant_pos - phenotype_pos| <= window`.
    pub window: i64,
    pub maf_threshold: f64,
    /// Applied separately to the lower and upper half of samples sorted by the
    /// interaction term.
    pub maf_threshold_interaction: f64,
    /// Nominal p-value cutoff for per-pair output in nominal mode (1.0 keeps all).
    pub nominal_pval_threshold: f64,
    pub permutations: usize,
    pub seed: Option<u64>,
    pub beta_approx: bool,
    pub warn_monomorphic: bool,
    pub inverse_normal_transform: bool,
    pub collinearity: CollinearityPolicy,
    /// Number of permuted phenotype vectors multiplied against a window in one product.
    pub permutation_chunk: usize,
    pub show_progress: bool,
}

impl Default for CisConfig {
    fn default() -> Self {
        Self {
            window: 1_000_000,
            maf_threshold: 0.0,
            maf_threshold_interaction: 0.05,
            nominal_pval_threshold: 1.0,
            permutations: 10_000,
            seed: None,
            beta_approx: true,
            warn_monomorphic: false,
            inverse_normal_transform: false,
            collinearity: CollinearityPolicy::Fail,
            permutation_chunk: 256,
            show_progress: false,
        }
    }
}

impl CisConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window < 0 {
            return Err(QtlError::config(format!(
                "cis window must be non-negative, got {}",
                self.window
            )));
        }
        check_maf("maf_threshold", self.maf_threshold)?;
        check_maf("maf_threshold_interaction", self.maf_threshold_interaction)?;
        if !(self.nominal_pval_threshold > 0.0 && self.nominal_pval_threshold <= 1.0) {
            return Err(QtlError::config(format!(
                "nominal p-value threshold must satisfy 0 < x <= 1, got {}",
                self.nominal_pval_threshold
            )));
        }
        if self.permutation_chunk == 0 {
            return Err(QtlError::config("permutation_chunk must be > 0"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct TransConfig {
    pub maf_threshold: f64,
    /// Per-half threshold of the genotype x interaction scan.
    pub maf_threshold_interaction: f64,
    /// Variants per batch. Peak memory grows with `batch_size * (samples + phenotypes)`.
    pub batch_size: usize,
    /// Sparse mode keeps pairs with `pval < pval_threshold`.
    pub pval_threshold: f64,
    pub return_dense: bool,
    pub return_r2: bool,
    /// Pairs closer than this (same chromosome) are removed from sparse output.
    pub cis_exclusion_window: i64,
    pub permutations: usize,
    pub seed: Option<u64>,
    pub beta_approx: bool,
    pub warn_monomorphic: bool,
    pub inverse_normal_transform: bool,
    pub collinearity: CollinearityPolicy,
    pub max_batch_bytes: usize,
    pub show_progress: bool,
}

impl Default for TransConfig {
    fn default() -> Self {
        Self {
            maf_threshold: 0.05,
            maf_threshold_interaction: 0.05,
            batch_size: 20_000,
            pval_threshold: 1e-5,
            return_dense: false,
            return_r2: false,
            cis_exclusion_window: 5_000_000,
            permutations: 10_000,
            seed: None,
            beta_approx: true,
            warn_monomorphic: false,
            inverse_normal_transform: false,
            collinearity: CollinearityPolicy::Fail,
            max_batch_bytes: 8 << 30,
            show_progress: false,
        }
    }
}

impl TransConfig {
    pub fn validate(&self) -> Result<()> {
        check_maf("maf_threshold", self.maf_threshold)?;
        check_maf("maf_threshold_interaction", self.maf_threshold_interaction)?;
        if self.batch_size == 0 {
            return Err(QtlError::config("batch_size must be > 0"));
        }
        if !(self.pval_threshold > 0.0 && self.pval_threshold <= 1.0) {
            return Err(QtlError::config(format!(
                "p-value threshold must satisfy 0 < x <= 1, got {}",
                self.pval_threshold
            )));
        }
        if self.cis_exclusion_window < 0 {
            return Err(QtlError::config(format!(
                "cis exclusion window must be non-negative, got {}",
                self.cis_exclusion_window
            )));
        }
        Ok(())
    }
}

fn check_maf(name: &str, value: f64) -> Result<()> {
    if !(0.0..=0.5).contains(&value) {
        return Err(QtlError::config(format!(
            "{} must satisfy 0 <= x <= 0.5, got {}",
            name, value
        )));
    }
    Ok(())
}
