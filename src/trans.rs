//! # Trans mapping
//!
//! All variants against all phenotypes in fixed-size variant batches. Each
//! batch is filtered, residualized and standardized, then correlated with the
//! (once) standardized phenotypes in a single product. Sparse output keeps
//! pairs below the p-value threshold and removes cis-proximal pairs; dense
//! output keeps everything.
//!
//! With an interaction term, `map_trans_interaction` fits the genotype x
//! interaction model for every pair instead and keeps pairs by the p-value of
//! the interaction coefficient.
//!
//! The permutation companion tracks, per permutation, the maximum r² across
//! the whole variant x phenotype product, giving one genome-wide null.

use log::{debug, info, warn};
use ndarray::{Array2, Axis};
use rayon::prelude::*;

use crate::association::{stats_from_r, AssociationEngine, AssociationStats, StandardizedRows};
use crate::beta_approx::{empirical_pval, fit_beta_null};
use crate::config::TransConfig;
use crate::error::{QtlError, Result};
use crate::interaction::{InteractionStats, InteractionTester};
use crate::matrices::{GenomicPosition, QtlDataset};
use crate::permutation::{permute_into, resolve_seed, PermutationStream};
use crate::progress::progress_bar;
use crate::residualizer::Residualizer;
use crate::transform::residualize_phenotypes;
use crate::variant_filter::{filter_variants, FilterSummary, FilteredVariants};

#[derive(Clone, Debug, PartialEq)]
pub struct TransPair {
    /// Row in the genotype matrix.
    pub variant_index: usize,
    /// Row in the phenotype matrix.
    pub phenotype_index: usize,
    pub variant_id: String,
    pub phenotype_id: String,
    pub af: f64,
    pub stats: AssociationStats,
    /// Filled by `calibrate_pairs`.
    pub pval_perm: Option<f64>,
    pub pval_beta: Option<f64>,
}

/// A sparse pair of the genotype x interaction scan.
#[derive(Clone, Debug, PartialEq)]
pub struct TransInteractionPair {
    pub variant_index: usize,
    pub phenotype_index: usize,
    pub variant_id: String,
    pub phenotype_id: String,
    pub af: f64,
    pub stats: InteractionStats,
}

/// Genotype and phenotype rows of a trans result, for cis exclusion.
pub trait PairLocus {
    fn variant_index(&self) -> usize;
    fn phenotype_index(&self) -> usize;
}

impl PairLocus for TransPair {
    fn variant_index(&self) -> usize {
        self.variant_index
    }

    fn phenotype_index(&self) -> usize {
        self.phenotype_index
    }
}

impl PairLocus for TransInteractionPair {
    fn variant_index(&self) -> usize {
        self.variant_index
    }

    fn phenotype_index(&self) -> usize {
        self.phenotype_index
    }
}

/// Tested variants x phenotypes.
#[derive(Clone, Debug)]
pub struct DenseTransTable {
    pub variant_ids: Vec<String>,
    pub phenotype_ids: Vec<String>,
    pub af: Vec<f64>,
    pub tstat: Array2<f64>,
    pub pval: Array2<f64>,
    pub r2: Option<Array2<f64>>,
}

#[derive(Clone, Debug, Default)]
pub struct TransOutput {
    /// Sparse pairs; empty in dense mode.
    pub pairs: Vec<TransPair>,
    pub dense: Option<DenseTransTable>,
    pub summary: FilterSummary,
    /// Sparse pairs removed as cis-proximal.
    pub cis_excluded: usize,
}

#[derive(Clone, Debug, Default)]
pub struct TransInteractionOutput {
    /// Pairs with `pval_gi < pval_threshold`, cis-proximal pairs removed.
    pub pairs: Vec<TransInteractionPair>,
    pub summary: FilterSummary,
    pub cis_excluded: usize,
    /// Tests whose g, i and g*i columns were linearly dependent.
    pub n_degenerate: usize,
}

/// Genome-wide null: maximum r² over all pairs, one per permutation.
#[derive(Clone, Debug, PartialEq)]
pub struct TransPermutationNull {
    pub max_r2: Vec<f64>,
    pub dof: f64,
    pub seed: u64,
}

struct TransSetup {
    residualizer: Residualizer,
    /// Residualized phenotypes before standardization.
    residuals: Array2<f64>,
    phenotypes: StandardizedRows,
}

impl TransSetup {
    fn new(dataset: &QtlDataset, config: &TransConfig) -> Result<Self> {
        config.validate()?;
        check_batch_footprint(dataset, config)?;
        let residualizer = match &dataset.covariates {
            Some(c) => Residualizer::new(c.values.view(), config.collinearity)?,
            None => Residualizer::identity(dataset.n_samples()),
        };
        let residuals = residualize_phenotypes(
            &residualizer,
            dataset.phenotypes.values.view(),
            config.inverse_normal_transform,
        )?;
        let phenotypes = StandardizedRows::from_residuals(residuals.clone());
        for (row, _) in phenotypes.degenerate.iter().enumerate().filter(|(_, &d)| d) {
            warn!(
                "Phenotype '{}' has zero variance after residualization; its pairs report t=0, p=1.",
                dataset.phenotypes.phenotype_ids[row]
            );
        }
        Ok(Self {
            residualizer,
            residuals,
            phenotypes,
        })
    }
}

fn reject_interaction(dataset: &QtlDataset) -> Result<()> {
    if dataset.interaction.is_some() {
        return Err(QtlError::config(
            "the additive trans scan does not model interaction terms; use map_trans_interaction",
        ));
    }
    Ok(())
}

/// Fails before any batch runs if one batch would exceed `max_batch_bytes`.
fn check_batch_footprint(dataset: &QtlDataset, config: &TransConfig) -> Result<()> {
    let batch = config.batch_size.min(dataset.genotypes.n_variants().max(1));
    let bytes = 8usize
        .saturating_mul(batch)
        .saturating_mul(dataset.n_samples() + dataset.phenotypes.n_phenotypes());
    if bytes > config.max_batch_bytes {
        return Err(QtlError::resource(format!(
            "a batch of {} variants needs about {} MiB (limit {} MiB); reduce batch_size",
            batch,
            bytes >> 20,
            config.max_batch_bytes >> 20
        )));
    }
    debug!("Trans batch footprint: {} bytes for {} variants", bytes, batch);
    Ok(())
}

fn variant_batches(n_variants: usize, batch_size: usize) -> impl Iterator<Item = Vec<usize>> {
    (0..n_variants)
        .step_by(batch_size)
        .map(move |start| (start..(start + batch_size).min(n_variants)).collect())
}

/// Scans all variant x phenotype pairs.
pub fn map_trans(dataset: &QtlDataset, config: &TransConfig) -> Result<TransOutput> {
    reject_interaction(dataset)?;
    let setup = TransSetup::new(dataset, config)?;
    let engine = AssociationEngine::new(&setup.residualizer, config.warn_monomorphic);
    let phenos = &setup.phenotypes;
    let n_variants = dataset.genotypes.n_variants();
    let n_phenotypes = dataset.phenotypes.n_phenotypes();
    let n_batches = n_variants.div_ceil(config.batch_size);
    info!(
        "Trans scan: {} variants x {} phenotypes in {} batch(es) of {}, {} output",
        n_variants,
        n_phenotypes,
        n_batches,
        config.batch_size,
        if config.return_dense { "dense" } else { "sparse" }
    );
    let pb = progress_bar(n_batches, config.show_progress, "batches")?;

    let mut output = TransOutput::default();
    let mut dense_rows: Vec<(String, f64, Vec<AssociationStats>)> = Vec::new();
    for rows in variant_batches(n_variants, config.batch_size) {
        let filtered = filter_variants(
            dataset.genotypes.dosages.view(),
            &rows,
            config.maf_threshold,
            config.warn_monomorphic,
        );
        output.summary.merge(&filtered.summary);
        if filtered.is_empty() {
            pb.inc(1);
            continue;
        }
        let genotypes = engine.prepare_genotypes(filtered.dosages.view());
        let r = engine.correlate_batch(&genotypes, phenos.values.view());
        let dof = engine.dof();

        let batch_stats: Vec<Vec<AssociationStats>> = (0..r.nrows())
            .into_par_iter()
            .map(|i| {
                r.row(i)
                    .iter()
                    .enumerate()
                    .map(|(j, &corr)| {
                        if genotypes.degenerate[i] || phenos.degenerate[j] {
                            AssociationStats::SENTINEL
                        } else {
                            stats_from_r(corr, dof, phenos.std_dev[j], genotypes.std_dev[i])
                        }
                    })
                    .collect()
            })
            .collect();

        if config.return_dense {
            for (k, stats) in batch_stats.into_iter().enumerate() {
                let v = filtered.indices[k];
                dense_rows.push((dataset.genotypes.variant_ids[v].clone(), filtered.stats[k].af, stats));
            }
        } else {
            output.pairs.extend(sparse_pairs(dataset, &filtered, batch_stats, config.pval_threshold));
        }
        pb.inc(1);
    }
    pb.finish_with_message("trans scan complete");

    if config.return_dense {
        output.dense = Some(dense_table(dataset, dense_rows, config.return_r2)?);
    } else if let Some(variant_positions) = dataset.genotypes.positions.as_deref() {
        let before = output.pairs.len();
        output.pairs = filter_cis(
            std::mem::take(&mut output.pairs),
            variant_positions,
            &dataset.phenotypes.positions,
            config.cis_exclusion_window,
        );
        output.cis_excluded = before - output.pairs.len();
    } else {
        info!("No variant positions; cis-proximal pairs are not excluded.");
    }
    info!(
        "Trans scan: {} variants tested ({} excluded by filters), {} pairs reported, {} cis-proximal pairs removed",
        output.summary.tested,
        output.summary.excluded(),
        output.pairs.len(),
        output.cis_excluded
    );
    Ok(output)
}

fn sparse_pairs(
    dataset: &QtlDataset,
    filtered: &FilteredVariants,
    batch_stats: Vec<Vec<AssociationStats>>,
    pval_threshold: f64,
) -> Vec<TransPair> {
    let mut pairs = Vec::new();
    for (k, stats) in batch_stats.into_iter().enumerate() {
        let v = filtered.indices[k];
        for (j, s) in stats.into_iter().enumerate() {
            if s.pval < pval_threshold {
                pairs.push(TransPair {
                    variant_index: v,
                    phenotype_index: j,
                    variant_id: dataset.genotypes.variant_ids[v].clone(),
                    phenotype_id: dataset.phenotypes.phenotype_ids[j].clone(),
                    af: filtered.stats[k].af,
                    stats: s,
                    pval_perm: None,
                    pval_beta: None,
                });
            }
        }
    }
    pairs
}

fn dense_table(
    dataset: &QtlDataset,
    rows: Vec<(String, f64, Vec<AssociationStats>)>,
    return_r2: bool,
) -> Result<DenseTransTable> {
    let n_phenotypes = dataset.phenotypes.n_phenotypes();
    let n_rows = rows.len();
    let mut variant_ids = Vec::with_capacity(n_rows);
    let mut af = Vec::with_capacity(n_rows);
    let mut tstat = Vec::with_capacity(n_rows * n_phenotypes);
    let mut pval = Vec::with_capacity(n_rows * n_phenotypes);
    let mut r2 = Vec::with_capacity(if return_r2 { n_rows * n_phenotypes } else { 0 });
    for (id, freq, stats) in rows {
        variant_ids.push(id);
        af.push(freq);
        for s in stats {
            tstat.push(s.tstat);
            pval.push(s.pval);
            if return_r2 {
                r2.push(s.r2());
            }
        }
    }
    let shape = (n_rows, n_phenotypes);
    Ok(DenseTransTable {
        variant_ids,
        phenotype_ids: dataset.phenotypes.phenotype_ids.clone(),
        af,
        tstat: Array2::from_shape_vec(shape, tstat)?,
        pval: Array2::from_shape_vec(shape, pval)?,
        r2: if return_r2 {
            Some(Array2::from_shape_vec(shape, r2)?)
        } else {
            None
        },
    })
}

/// Drops pairs on the same chromosome with `|variant_pos - phenotype_pos| <= window`.
pub fn filter_cis<P: PairLocus>(
    pairs: Vec<P>,
    variant_positions: &[GenomicPosition],
    phenotype_positions: &[GenomicPosition],
    window: i64,
) -> Vec<P> {
    pairs
        .into_iter()
        .filter(|pair| {
            let v = &variant_positions[pair.variant_index()];
            let p = &phenotype_positions[pair.phenotype_index()];
            v.chrom != p.chrom || v.pos.abs_diff(p.pos) > window.unsigned_abs()
        })
        .collect()
}

/// Genotype x interaction scan of all variant x phenotype pairs. Variants must
/// pass `maf_threshold` overall and `maf_threshold_interaction` within both
/// halves of the samples split by interaction value. Output is sparse only.
pub fn map_trans_interaction(dataset: &QtlDataset, config: &TransConfig) -> Result<TransInteractionOutput> {
    let interaction = dataset
        .interaction
        .as_ref()
        .ok_or_else(|| QtlError::input_validation("interaction mapping requires an interaction term"))?;
    if config.return_dense {
        return Err(QtlError::config("dense trans output is not available with an interaction term"));
    }
    if config.inverse_normal_transform {
        return Err(QtlError::config(
            "inverse normal transform cannot be combined with an interaction term",
        ));
    }
    let setup = TransSetup::new(dataset, config)?;
    let tester = InteractionTester::new(
        &setup.residualizer,
        interaction.values.view(),
        config.maf_threshold_interaction,
    )?;
    let n_variants = dataset.genotypes.n_variants();
    let n_batches = n_variants.div_ceil(config.batch_size);
    info!(
        "Trans interaction scan with '{}': {} variants x {} phenotypes in {} batch(es), {} residual degrees of freedom",
        interaction.name,
        n_variants,
        dataset.phenotypes.n_phenotypes(),
        n_batches,
        tester.dof()
    );
    let pb = progress_bar(n_batches, config.show_progress, "batches")?;

    let dosages = dataset.genotypes.dosages.view();
    let mut output = TransInteractionOutput::default();
    for rows in variant_batches(n_variants, config.batch_size) {
        let filtered = filter_variants(dosages, &rows, config.maf_threshold, config.warn_monomorphic);
        let mut summary = filtered.summary;
        let keep: Vec<usize> = (0..filtered.len())
            .filter(|&k| tester.passes_maf_halves(dosages.row(filtered.indices[k])))
            .collect();
        summary.below_maf += filtered.len() - keep.len();
        summary.tested = keep.len();
        output.summary.merge(&summary);

        let batch: Vec<(Vec<TransInteractionPair>, usize)> = keep
            .par_iter()
            .map(|&k| {
                let v = filtered.indices[k];
                let stats = tester.test_phenotypes(filtered.dosages.row(k), setup.residuals.view());
                let n_degenerate = stats.iter().filter(|s| s.degenerate).count();
                let pairs = stats
                    .into_iter()
                    .enumerate()
                    .filter(|(_, s)| s.gi.pval < config.pval_threshold)
                    .map(|(j, s)| TransInteractionPair {
                        variant_index: v,
                        phenotype_index: j,
                        variant_id: dataset.genotypes.variant_ids[v].clone(),
                        phenotype_id: dataset.phenotypes.phenotype_ids[j].clone(),
                        af: filtered.stats[k].af,
                        stats: s,
                    })
                    .collect();
                (pairs, n_degenerate)
            })
            .collect();
        for (pairs, n_degenerate) in batch {
            output.pairs.extend(pairs);
            output.n_degenerate += n_degenerate;
        }
        pb.inc(1);
    }
    pb.finish_with_message("trans interaction scan complete");

    if output.n_degenerate > 0 {
        warn!(
            "{} variant x phenotype tests had linearly dependent g, i and g*i columns; reported with p=1.",
            output.n_degenerate
        );
    }
    if let Some(variant_positions) = dataset.genotypes.positions.as_deref() {
        let before = output.pairs.len();
        output.pairs = filter_cis(
            std::mem::take(&mut output.pairs),
            variant_positions,
            &dataset.phenotypes.positions,
            config.cis_exclusion_window,
        );
        output.cis_excluded = before - output.pairs.len();
    } else {
        info!("No variant positions; cis-proximal pairs are not excluded.");
    }
    info!(
        "Trans interaction scan: {} variants tested ({} excluded by filters), {} pairs reported, {} cis-proximal pairs removed",
        output.summary.tested,
        output.summary.excluded(),
        output.pairs.len(),
        output.cis_excluded
    );
    Ok(output)
}

/// Genome-wide permutation null for trans pairs.
pub fn map_permutations(dataset: &QtlDataset, config: &TransConfig) -> Result<TransPermutationNull> {
    if config.permutations == 0 {
        return Err(QtlError::config("trans permutations requested with permutations = 0"));
    }
    reject_interaction(dataset)?;
    let setup = TransSetup::new(dataset, config)?;
    let engine = AssociationEngine::new(&setup.residualizer, config.warn_monomorphic);
    let seed = resolve_seed(config.seed);
    let n = dataset.n_samples();
    let n_variants = dataset.genotypes.n_variants();
    let n_batches = n_variants.div_ceil(config.batch_size);
    info!(
        "Trans permutations: {} permutations over {} batch(es), seed {}",
        config.permutations, n_batches, seed
    );
    let pb = progress_bar(n_batches, config.show_progress, "batches")?;

    let phenos = &setup.phenotypes.values;
    let mut max_r2 = vec![0.0_f64; config.permutations];
    for rows in variant_batches(n_variants, config.batch_size) {
        let filtered = filter_variants(
            dataset.genotypes.dosages.view(),
            &rows,
            config.maf_threshold,
            config.warn_monomorphic,
        );
        if !filtered.is_empty() {
            let genotypes = engine.prepare_genotypes(filtered.dosages.view());
            max_r2.par_iter_mut().enumerate().for_each(|(perm, running)| {
                // the order of a permutation is the same in every batch
                let mut stream = PermutationStream::new(seed, perm as u64, n);
                let order = stream.next_order();
                let mut permuted = Array2::<f64>::zeros(phenos.raw_dim());
                for (src, dst) in phenos.axis_iter(Axis(0)).zip(permuted.axis_iter_mut(Axis(0))) {
                    permute_into(src, order, dst);
                }
                let r = genotypes.values.dot(&permuted.t());
                let batch_max = r.iter().fold(0.0_f64, |acc, &v| acc.max(v * v));
                *running = running.max(batch_max);
            });
        }
        pb.inc(1);
    }
    pb.finish_with_message("trans permutations complete");

    Ok(TransPermutationNull {
        max_r2,
        dof: engine.dof(),
        seed,
    })
}

/// Attaches `pval_perm` and, when the Beta fit succeeds, `pval_beta` to each pair.
pub fn calibrate_pairs(pairs: &mut [TransPair], null: &TransPermutationNull, beta_approx: bool) {
    let params = if beta_approx {
        match fit_beta_null(&null.max_r2, null.dof) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("Beta approximation of the trans null failed ({}); only pval_perm is reported.", e);
                None
            }
        }
    } else {
        None
    };
    for pair in pairs.iter_mut() {
        let r2 = pair.stats.r2();
        pair.pval_perm = Some(empirical_pval(&null.max_r2, r2));
        pair.pval_beta = params.and_then(|p| p.pval_beta(r2).ok());
    }
}
