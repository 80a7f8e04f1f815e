//! # Input matrices
//!
//! Read-only containers for the data handed over by the I/O layer. All of them
//! store samples along columns; column order is sample identity and must be
//! identical across every matrix of a `QtlDataset`.

use std::collections::{HashMap, HashSet};

use log::debug;
use ndarray::{Array1, Array2, ArrayView1};

use crate::error::{QtlError, Result};

/// A (chromosome, coordinate) pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GenomicPosition {
    pub chrom: String,
    pub pos: i64,
}

impl GenomicPosition {
    pub fn new(chrom: impl Into<String>, pos: i64) -> Self {
        Self {
            chrom: chrom.into(),
            pos,
        }
    }
}

/// Variants x samples dosages. Missing calls are `NaN`.
#[derive(Clone, Debug)]
pub struct GenotypeMatrix {
    pub variant_ids: Vec<String>,
    pub sample_ids: Vec<String>,
    pub dosages: Array2<f64>,
    /// Absent positions only allow trans mapping.
    pub positions: Option<Vec<GenomicPosition>>,
}

impl GenotypeMatrix {
    pub fn new(
        variant_ids: Vec<String>,
        sample_ids: Vec<String>,
        dosages: Array2<f64>,
        positions: Option<Vec<GenomicPosition>>,
    ) -> Result<Self> {
        if dosages.nrows() != variant_ids.len() || dosages.ncols() != sample_ids.len() {
            return Err(QtlError::input_validation(format!(
                "genotype matrix is {}x{} but {} variant ids and {} sample ids were given",
                dosages.nrows(),
                dosages.ncols(),
                variant_ids.len(),
                sample_ids.len()
            )));
        }
        if let Some(pos) = &positions {
            if pos.len() != variant_ids.len() {
                return Err(QtlError::input_validation(format!(
                    "{} variant positions for {} variants",
                    pos.len(),
                    variant_ids.len()
                )));
            }
        }
        Ok(Self {
            variant_ids,
            sample_ids,
            dosages,
            positions,
        })
    }

    pub fn n_variants(&self) -> usize {
        self.dosages.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.dosages.ncols()
    }
}

/// Phenotypes x samples values with one reference coordinate per phenotype.
#[derive(Clone, Debug)]
pub struct PhenotypeMatrix {
    pub phenotype_ids: Vec<String>,
    pub sample_ids: Vec<String>,
    pub values: Array2<f64>,
    pub positions: Vec<GenomicPosition>,
}

impl PhenotypeMatrix {
    pub fn new(
        phenotype_ids: Vec<String>,
        sample_ids: Vec<String>,
        values: Array2<f64>,
        positions: Vec<GenomicPosition>,
    ) -> Result<Self> {
        if values.nrows() != phenotype_ids.len() || values.ncols() != sample_ids.len() {
            return Err(QtlError::input_validation(format!(
                "phenotype matrix is {}x{} but {} phenotype ids and {} sample ids were given",
                values.nrows(),
                values.ncols(),
                phenotype_ids.len(),
                sample_ids.len()
            )));
        }
        if positions.len() != phenotype_ids.len() {
            return Err(QtlError::input_validation(format!(
                "{} phenotype positions for {} phenotypes",
                positions.len(),
                phenotype_ids.len()
            )));
        }
        if let Some((row, _)) = values
            .rows()
            .into_iter()
            .enumerate()
            .find(|(_, r)| r.iter().any(|v| !v.is_finite()))
        {
            return Err(QtlError::input_validation(format!(
                "phenotype '{}' contains missing or non-finite values",
                phenotype_ids[row]
            )));
        }
        Ok(Self {
            phenotype_ids,
            sample_ids,
            values,
            positions,
        })
    }

    pub fn n_phenotypes(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.values.ncols()
    }
}

/// Covariates x samples.
#[derive(Clone, Debug)]
pub struct CovariateMatrix {
    pub covariate_ids: Vec<String>,
    pub sample_ids: Vec<String>,
    pub values: Array2<f64>,
}

impl CovariateMatrix {
    pub fn new(covariate_ids: Vec<String>, sample_ids: Vec<String>, values: Array2<f64>) -> Result<Self> {
        if values.nrows() != covariate_ids.len() || values.ncols() != sample_ids.len() {
            return Err(QtlError::input_validation(format!(
                "covariate matrix is {}x{} but {} covariate ids and {} sample ids were given",
                values.nrows(),
                values.ncols(),
                covariate_ids.len(),
                sample_ids.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(QtlError::input_validation(
                "covariate matrix contains missing or non-finite values",
            ));
        }
        Ok(Self {
            covariate_ids,
            sample_ids,
            values,
        })
    }
}

/// One extra covariate per phenotype (phenotypes x samples). A phenotype
/// without a row here is mapped with the shared covariates only.
#[derive(Clone, Debug)]
pub struct PairedCovariates {
    pub phenotype_ids: Vec<String>,
    pub sample_ids: Vec<String>,
    pub values: Array2<f64>,
    rows: HashMap<String, usize>,
}

impl PairedCovariates {
    pub fn new(phenotype_ids: Vec<String>, sample_ids: Vec<String>, values: Array2<f64>) -> Result<Self> {
        if values.nrows() != phenotype_ids.len() || values.ncols() != sample_ids.len() {
            return Err(QtlError::input_validation(format!(
                "paired covariate matrix is {}x{} but {} phenotype ids and {} sample ids were given",
                values.nrows(),
                values.ncols(),
                phenotype_ids.len(),
                sample_ids.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(QtlError::input_validation(
                "paired covariate matrix contains missing or non-finite values",
            ));
        }
        let mut rows = HashMap::with_capacity(phenotype_ids.len());
        for (row, id) in phenotype_ids.iter().enumerate() {
            if rows.insert(id.clone(), row).is_some() {
                return Err(QtlError::input_validation(format!(
                    "phenotype '{}' has more than one paired covariate",
                    id
                )));
            }
        }
        Ok(Self {
            phenotype_ids,
            sample_ids,
            values,
            rows,
        })
    }

    pub fn get(&self, phenotype_id: &str) -> Option<ArrayView1<'_, f64>> {
        self.rows.get(phenotype_id).map(|&row| self.values.row(row))
    }

    pub fn len(&self) -> usize {
        self.phenotype_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phenotype_ids.is_empty()
    }
}

/// One scalar per sample, tested as genotype x interaction.
#[derive(Clone, Debug)]
pub struct InteractionTerm {
    pub name: String,
    pub sample_ids: Vec<String>,
    pub values: Array1<f64>,
}

impl InteractionTerm {
    pub fn new(name: impl Into<String>, sample_ids: Vec<String>, values: Array1<f64>) -> Result<Self> {
        if values.len() != sample_ids.len() {
            return Err(QtlError::input_validation(format!(
                "interaction term has {} values for {} samples",
                values.len(),
                sample_ids.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(QtlError::input_validation(
                "interaction term contains missing or non-finite values",
            ));
        }
        Ok(Self {
            name: name.into(),
            sample_ids,
            values,
        })
    }
}

/// Everything one mapping run reads. Construction fails if any companion
/// matrix disagrees with the phenotype sample order.
#[derive(Clone, Debug)]
pub struct QtlDataset {
    pub genotypes: GenotypeMatrix,
    pub phenotypes: PhenotypeMatrix,
    pub covariates: Option<CovariateMatrix>,
    pub interaction: Option<InteractionTerm>,
    /// Used by permutation-calibrated cis mapping only.
    pub paired_covariates: Option<PairedCovariates>,
}

impl QtlDataset {
    pub fn new(
        genotypes: GenotypeMatrix,
        phenotypes: PhenotypeMatrix,
        covariates: Option<CovariateMatrix>,
        interaction: Option<InteractionTerm>,
    ) -> Result<Self> {
        let reference = &phenotypes.sample_ids;
        check_sample_order("genotype", &genotypes.sample_ids, reference)?;
        if let Some(cov) = &covariates {
            check_sample_order("covariate", &cov.sample_ids, reference)?;
        }
        if let Some(inter) = &interaction {
            check_sample_order("interaction", &inter.sample_ids, reference)?;
        }
        debug!(
            "Dataset: {} variants, {} phenotypes, {} samples, {} covariates{}",
            genotypes.n_variants(),
            phenotypes.n_phenotypes(),
            phenotypes.n_samples(),
            covariates.as_ref().map_or(0, |c| c.values.nrows()),
            if interaction.is_some() { ", with interaction term" } else { "" }
        );
        Ok(Self {
            genotypes,
            phenotypes,
            covariates,
            interaction,
            paired_covariates: None,
        })
    }

    /// Attaches phenotype-specific covariates. Every listed phenotype must be
    /// loaded and the samples must follow the phenotype order.
    pub fn with_paired_covariates(mut self, paired: PairedCovariates) -> Result<Self> {
        check_sample_order("paired covariate", &paired.sample_ids, &self.phenotypes.sample_ids)?;
        let loaded: HashSet<&str> = self.phenotypes.phenotype_ids.iter().map(String::as_str).collect();
        if let Some(missing) = paired.phenotype_ids.iter().find(|id| !loaded.contains(id.as_str())) {
            return Err(QtlError::input_validation(format!(
                "paired covariate given for unknown phenotype '{}'",
                missing
            )));
        }
        debug!("{} phenotypes carry a paired covariate", paired.len());
        self.paired_covariates = Some(paired);
        Ok(self)
    }

    pub fn n_samples(&self) -> usize {
        self.phenotypes.n_samples()
    }
}

fn check_sample_order(kind: &str, samples: &[String], reference: &[String]) -> Result<()> {
    if samples.len() != reference.len() {
        return Err(QtlError::input_validation(format!(
            "{} input has {} samples but the phenotype matrix has {}",
            kind,
            samples.len(),
            reference.len()
        )));
    }
    if let Some(i) = samples.iter().zip(reference).position(|(a, b)| a != b) {
        return Err(QtlError::input_validation(format!(
            "{} sample order differs from phenotypes at column {} ('{}' vs '{}')",
            kind, i, samples[i], reference[i]
        )));
    }
    Ok(())
}

/// Per-chromosome sorted variant coordinates for cis-window lookup.
#[derive(Debug, Default)]
pub struct VariantIndex {
    by_chrom: HashMap<String, Vec<(i64, usize)>>,
}

impl VariantIndex {
    pub fn build(positions: &[GenomicPosition]) -> Self {
        let mut by_chrom: HashMap<String, Vec<(i64, usize)>> = HashMap::new();
        for (idx, p) in positions.iter().enumerate() {
            by_chrom.entry(p.chrom.clone()).or_default().push((p.pos, idx));
        }
        for entries in by_chrom.values_mut() {
            entries.sort_unstable();
        }
        Self { by_chrom }
    }

    /// Variant indices with `center - radius <= pos <= center + radius`, ordered by position.
    pub fn window(&self, chrom: &str, center: i64, radius: i64) -> Vec<usize> {
        let Some(entries) = self.by_chrom.get(chrom) else {
            return Vec::new();
        };
        let lo = entries.partition_point(|&(pos, _)| pos < center.saturating_sub(radius));
        let hi = entries.partition_point(|&(pos, _)| pos <= center.saturating_add(radius));
        entries[lo..hi].iter().map(|&(_, idx)| idx).collect()
    }
}
