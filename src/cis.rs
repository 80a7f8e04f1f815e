//! # Cis mapping
//!
//! Three scans over the variants within `window` bp of each phenotype:
//!
//! * `map_nominal`: every window pair with its nominal statistics, plus the
//!   top association per phenotype.
//! * `map_nominal_interaction`: the genotype x interaction model for every
//!   window pair passing the per-half MAF rule.
//! * `map_cis`: the best variant per phenotype (or phenotype group) calibrated
//!   against a permutation null of maximum r². A phenotype with a paired
//!   covariate gets its own design: the shared covariates plus that one.
//!
//! Permutations shuffle the residualized, standardized phenotype. A chunk of
//! permuted vectors is multiplied against the standardized window genotypes
//! at once and reduced to one maximum r² per permutation immediately, so no
//! per-variant permutation statistics are kept. Group members are permuted
//! with the same sample order and share one null.

use log::{debug, info, warn};
use ndarray::{s, Array2, ArrayView1, Axis};
use rayon::prelude::*;

use crate::association::{pval_from_r2, AssociationEngine, AssociationStats, StandardizedRows};
use crate::beta_approx::{calibrate, Calibration};
use crate::config::CisConfig;
use crate::error::{QtlError, Result};
use crate::groups::{PhenotypeGroup, PhenotypeGroups};
use crate::interaction::{InteractionStats, InteractionTester};
use crate::matrices::{GenomicPosition, QtlDataset, VariantIndex};
use crate::permutation::{permute_into, resolve_seed, PermutationStream};
use crate::progress::progress_bar;
use crate::residualizer::Residualizer;
use crate::transform::residualize_phenotypes;
use crate::variant_filter::{filter_variants, AlleleStats, FilterSummary, FilteredVariants};

/// Variant annotation shared by all cis records.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowVariant {
    pub variant_id: String,
    /// Variant position minus phenotype position.
    pub start_distance: i64,
    pub af: f64,
    pub ma_samples: usize,
    pub ma_count: f64,
}

impl WindowVariant {
    fn new(variant_id: &str, variant_pos: i64, phenotype_pos: i64, stats: &AlleleStats) -> Self {
        Self {
            variant_id: variant_id.to_string(),
            start_distance: variant_pos - phenotype_pos,
            af: stats.af,
            ma_samples: stats.ma_samples,
            ma_count: stats.ma_count,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CisNominalRecord {
    pub phenotype_id: String,
    pub variant: WindowVariant,
    pub n_samples: usize,
    pub stats: AssociationStats,
}

#[derive(Clone, Debug, Default)]
pub struct CisNominalOutput {
    /// Pairs with `pval <= nominal_pval_threshold`.
    pub records: Vec<CisNominalRecord>,
    /// Smallest nominal p-value per phenotype (before thresholding).
    pub top: Vec<CisNominalRecord>,
    pub summary: FilterSummary,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CisInteractionRecord {
    pub phenotype_id: String,
    pub variant: WindowVariant,
    pub n_samples: usize,
    pub stats: InteractionStats,
}

#[derive(Clone, Debug, Default)]
pub struct CisInteractionOutput {
    pub records: Vec<CisInteractionRecord>,
    /// Smallest genotype x interaction p-value per phenotype.
    pub top: Vec<CisInteractionRecord>,
    pub summary: FilterSummary,
}

/// The best variant of a calibration unit.
#[derive(Clone, Debug, PartialEq)]
pub struct BestVariant {
    pub variant: WindowVariant,
    pub stats: AssociationStats,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CisPermutationRecord {
    /// The phenotype carrying the best association (the first member when
    /// nothing was tested).
    pub phenotype_id: String,
    pub group_id: Option<String>,
    pub group_size: usize,
    /// Variants tested after filtering.
    pub num_var: usize,
    pub dof: f64,
    pub best: Option<BestVariant>,
    pub calibration: Option<Calibration>,
}

/// Maximum r² per permutation for one calibration unit.
#[derive(Clone, Debug, PartialEq)]
pub struct PermutationNull {
    pub id: String,
    pub max_r2: Vec<f64>,
    pub dof: f64,
}

impl PermutationNull {
    /// The null as minimum nominal p-values.
    pub fn min_pvalues(&self) -> Vec<f64> {
        self.max_r2.iter().map(|&r2| pval_from_r2(r2, self.dof)).collect()
    }
}

#[derive(Clone, Debug, Default)]
pub struct CisPermutationOutput {
    pub records: Vec<CisPermutationRecord>,
    pub nulls: Vec<PermutationNull>,
    pub summary: FilterSummary,
    pub seed: u64,
}

/// Residualized phenotypes and the variant index shared by all cis scans.
struct CisSetup<'d> {
    dataset: &'d QtlDataset,
    residualizer: Residualizer,
    residuals: Array2<f64>,
    phenotypes: StandardizedRows,
    variant_positions: &'d [GenomicPosition],
    index: VariantIndex,
}

impl<'d> CisSetup<'d> {
    fn new(dataset: &'d QtlDataset, config: &CisConfig) -> Result<Self> {
        config.validate()?;
        let variant_positions = dataset
            .genotypes
            .positions
            .as_deref()
            .ok_or_else(|| QtlError::input_validation("cis mapping requires variant positions"))?;
        if config.inverse_normal_transform && dataset.interaction.is_some() {
            return Err(QtlError::config(
                "inverse normal transform cannot be combined with an interaction term",
            ));
        }
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
                "Phenotype '{}' has zero variance after residualization; its tests report t=0, p=1.",
                dataset.phenotypes.phenotype_ids[row]
            );
        }
        info!(
            "Cis setup: {} phenotypes, {} variants, {} samples, {} covariates, window {} bp",
            dataset.phenotypes.n_phenotypes(),
            dataset.genotypes.n_variants(),
            dataset.n_samples(),
            residualizer.n_covariates(),
            config.window
        );
        Ok(Self {
            dataset,
            residualizer,
            residuals,
            phenotypes,
            variant_positions,
            index: VariantIndex::build(variant_positions),
        })
    }

    fn phenotype_position(&self, row: usize) -> &GenomicPosition {
        &self.dataset.phenotypes.positions[row]
    }

    fn window(&self, row: usize, radius: i64) -> Vec<usize> {
        let pos = self.phenotype_position(row);
        self.index.window(&pos.chrom, pos.pos, radius)
    }

    fn filtered_window(&self, indices: &[usize], config: &CisConfig) -> FilteredVariants {
        filter_variants(
            self.dataset.genotypes.dosages.view(),
            indices,
            config.maf_threshold,
            config.warn_monomorphic,
        )
    }

    /// Design extended by the phenotype's paired covariate, with the phenotype
    /// residualized against it. `None` when the phenotype has no paired covariate.
    fn paired_design(&self, row: usize, config: &CisConfig) -> Result<Option<(Residualizer, StandardizedRows)>> {
        let Some(extra) = self
            .dataset
            .paired_covariates
            .as_ref()
            .and_then(|paired| paired.get(&self.dataset.phenotypes.phenotype_ids[row]))
        else {
            return Ok(None);
        };
        let mut design = match &self.dataset.covariates {
            Some(c) => c.values.clone(),
            None => Array2::zeros((0, self.dataset.n_samples())),
        };
        design.push_row(extra)?;
        let residualizer = Residualizer::new(design.view(), config.collinearity)?;
        let residuals = residualize_phenotypes(
            &residualizer,
            self.dataset.phenotypes.values.slice(s![row..row + 1, ..]),
            config.inverse_normal_transform,
        )?;
        Ok(Some((residualizer, StandardizedRows::from_residuals(residuals))))
    }

    fn window_variant(&self, variant_row: usize, stats: &AlleleStats, phenotype_row: usize) -> WindowVariant {
        WindowVariant::new(
            &self.dataset.genotypes.variant_ids[variant_row],
            self.variant_positions[variant_row].pos,
            self.phenotype_position(phenotype_row).pos,
            stats,
        )
    }
}

fn merge_summaries<'a>(summaries: impl Iterator<Item = &'a FilterSummary>) -> FilterSummary {
    summaries.fold(FilterSummary::default(), |mut acc, s| {
        acc.merge(s);
        acc
    })
}

/// Nominal statistics for every cis pair.
pub fn map_nominal(dataset: &QtlDataset, config: &CisConfig) -> Result<CisNominalOutput> {
    let setup = CisSetup::new(dataset, config)?;
    let engine = AssociationEngine::new(&setup.residualizer, config.warn_monomorphic);
    let n_phenotypes = dataset.phenotypes.n_phenotypes();
    let pb = progress_bar(n_phenotypes, config.show_progress, "phenotypes")?;

    let per_phenotype: Vec<(Vec<CisNominalRecord>, FilterSummary)> = (0..n_phenotypes)
        .into_par_iter()
        .map(|row| {
            let filtered = setup.filtered_window(&setup.window(row, config.window), config);
            let genotypes = engine.prepare_genotypes(filtered.dosages.view());
            let stats = engine.test(&genotypes, &setup.phenotypes.phenotype(row));
            let records = filtered
                .indices
                .iter()
                .zip(&filtered.stats)
                .zip(stats)
                .map(|((&v, allele), stats)| CisNominalRecord {
                    phenotype_id: dataset.phenotypes.phenotype_ids[row].clone(),
                    variant: setup.window_variant(v, allele, row),
                    n_samples: dataset.n_samples(),
                    stats,
                })
                .collect();
            pb.inc(1);
            (records, filtered.summary)
        })
        .collect();
    pb.finish_with_message("cis nominal scan complete");

    let summary = merge_summaries(per_phenotype.iter().map(|(_, s)| s));
    let mut output = CisNominalOutput {
        summary,
        ..Default::default()
    };
    for (records, _) in per_phenotype {
        // first minimum wins ties
        let top = records
            .iter()
            .reduce(|best, r| if r.stats.pval < best.stats.pval { r } else { best });
        match top {
            Some(top) => output.top.push(top.clone()),
            None => continue,
        }
        output
            .records
            .extend(records.into_iter().filter(|r| r.stats.pval <= config.nominal_pval_threshold));
    }
    info!(
        "Cis nominal: {} pairs reported for {} phenotypes with tested variants ({} variants excluded by filters).",
        output.records.len(),
        output.top.len(),
        output.summary.excluded()
    );
    Ok(output)
}

/// Genotype x interaction statistics for every cis pair.
pub fn map_nominal_interaction(dataset: &QtlDataset, config: &CisConfig) -> Result<CisInteractionOutput> {
    let setup = CisSetup::new(dataset, config)?;
    let interaction = dataset
        .interaction
        .as_ref()
        .ok_or_else(|| QtlError::input_validation("interaction mapping requires an interaction term"))?;
    let tester = InteractionTester::new(
        &setup.residualizer,
        interaction.values.view(),
        config.maf_threshold_interaction,
    )?;
    info!(
        "Testing interaction with '{}' ({} residual degrees of freedom).",
        interaction.name,
        tester.dof()
    );
    let n_phenotypes = dataset.phenotypes.n_phenotypes();
    let pb = progress_bar(n_phenotypes, config.show_progress, "phenotypes")?;
    let dosages = dataset.genotypes.dosages.view();

    let per_phenotype: Vec<(Vec<CisInteractionRecord>, FilterSummary)> = (0..n_phenotypes)
        .into_par_iter()
        .map(|row| {
            let filtered = setup.filtered_window(&setup.window(row, config.window), config);
            let mut summary = filtered.summary;
            let keep: Vec<usize> = (0..filtered.len())
                .filter(|&k| tester.passes_maf_halves(dosages.row(filtered.indices[k])))
                .collect();
            summary.below_maf += filtered.len() - keep.len();
            summary.tested = keep.len();

            let phenotype_id = &dataset.phenotypes.phenotype_ids[row];
            let phenotype = setup.residuals.row(row);
            let records: Vec<CisInteractionRecord> = keep
                .iter()
                .map(|&k| CisInteractionRecord {
                    phenotype_id: phenotype_id.clone(),
                    variant: setup.window_variant(filtered.indices[k], &filtered.stats[k], row),
                    n_samples: dataset.n_samples(),
                    stats: tester.test(filtered.dosages.row(k), phenotype),
                })
                .collect();
            let n_degenerate = records.iter().filter(|r| r.stats.degenerate).count();
            if n_degenerate > 0 {
                warn!(
                    "'{}': {} of {} variants have linearly dependent g, i and g*i columns; reported as degenerate with p=1.",
                    phenotype_id,
                    n_degenerate,
                    records.len()
                );
            }
            pb.inc(1);
            (records, summary)
        })
        .collect();
    pb.finish_with_message("cis interaction scan complete");

    let summary = merge_summaries(per_phenotype.iter().map(|(_, s)| s));
    let mut output = CisInteractionOutput {
        summary,
        ..Default::default()
    };
    for (records, _) in per_phenotype {
        if let Some(top) = records
            .iter()
            .reduce(|best, r| if r.stats.gi.pval < best.stats.gi.pval { r } else { best })
        {
            output.top.push(top.clone());
        }
        output.records.extend(records);
    }
    info!(
        "Cis interaction: {} pairs tested across {} phenotypes.",
        output.records.len(),
        output.top.len()
    );
    Ok(output)
}

/// Permutation-calibrated best association per phenotype, or per group when
/// `groups` is given.
pub fn map_cis(dataset: &QtlDataset, groups: Option<&PhenotypeGroups>, config: &CisConfig) -> Result<CisPermutationOutput> {
    if config.permutations == 0 {
        return Err(QtlError::config("permutation mapping needs at least one permutation"));
    }
    let setup = CisSetup::new(dataset, config)?;
    let singletons;
    let (units, grouped) = match groups {
        Some(g) => {
            let covered: usize = g.iter().map(|grp| grp.rows.len()).sum();
            if covered != dataset.phenotypes.n_phenotypes() {
                return Err(QtlError::input_validation(format!(
                    "phenotype groups cover {} phenotypes but {} were loaded",
                    covered,
                    dataset.phenotypes.n_phenotypes()
                )));
            }
            (g, true)
        }
        None => {
            singletons = PhenotypeGroups::singletons(&dataset.phenotypes.phenotype_ids);
            (&singletons, false)
        }
    };
    if let Some(paired) = &dataset.paired_covariates {
        if grouped {
            return Err(QtlError::config(
                "paired covariates cannot be combined with phenotype groups",
            ));
        }
        info!("{} phenotypes are mapped with a paired covariate.", paired.len());
    }
    let seed = resolve_seed(config.seed);
    info!(
        "Cis permutations: {} units, {} permutations each, seed {}",
        units.len(),
        config.permutations,
        seed
    );
    let pb = progress_bar(units.len(), config.show_progress, if grouped { "groups" } else { "phenotypes" })?;

    let results: Vec<(CisPermutationRecord, Option<PermutationNull>, FilterSummary)> = units
        .as_slice()
        .par_iter()
        .enumerate()
        .map(|(unit, group)| {
            let mut stream = PermutationStream::new(seed, unit as u64, dataset.n_samples());
            let result = calibrate_unit(&setup, group, grouped, &mut stream, config);
            pb.inc(1);
            result
        })
        .collect::<Result<_>>()?;
    pb.finish_with_message("cis permutations complete");

    let summary = merge_summaries(results.iter().map(|(_, _, s)| s));
    let mut output = CisPermutationOutput {
        summary,
        seed,
        ..Default::default()
    };
    for (record, null, _) in results {
        output.records.push(record);
        output.nulls.extend(null);
    }
    Ok(output)
}

fn calibrate_unit(
    setup: &CisSetup,
    group: &PhenotypeGroup,
    grouped: bool,
    stream: &mut PermutationStream,
    config: &CisConfig,
) -> Result<(CisPermutationRecord, Option<PermutationNull>, FilterSummary)> {
    let paired = if grouped {
        None
    } else {
        setup.paired_design(group.rows.start, config)?
    };
    // a paired design holds only this unit's phenotype
    let (residualizer, phenotypes, first_row) = match &paired {
        Some((residualizer, phenotypes)) => (residualizer, phenotypes, group.rows.start),
        None => (&setup.residualizer, &setup.phenotypes, 0),
    };
    let local = |row: usize| row - first_row;
    let engine = AssociationEngine::new(residualizer, config.warn_monomorphic);
    let ids = &setup.dataset.phenotypes.phenotype_ids;
    let mut record = CisPermutationRecord {
        phenotype_id: ids[group.rows.start].clone(),
        group_id: grouped.then(|| group.id.clone()),
        group_size: group.rows.len(),
        num_var: 0,
        dof: engine.dof(),
        best: None,
        calibration: None,
    };

    let mut window: Vec<usize> = group.rows.clone().flat_map(|row| setup.window(row, config.window)).collect();
    window.sort_unstable();
    window.dedup();
    let filtered = setup.filtered_window(&window, config);
    record.num_var = filtered.len();
    if filtered.is_empty() {
        debug!("No variants tested in the cis window of '{}'.", group.id);
        return Ok((record, None, filtered.summary));
    }

    let members: Vec<usize> = group.rows.clone().filter(|&row| !phenotypes.degenerate[local(row)]).collect();
    if members.is_empty() {
        warn!("'{}' has no phenotype with residual variance; not calibrated.", group.id);
        return Ok((record, None, filtered.summary));
    }

    let genotypes = engine.prepare_genotypes(filtered.dosages.view());
    let mut best: Option<(usize, usize, AssociationStats)> = None;
    for &row in &members {
        let stats = engine.test(&genotypes, &phenotypes.phenotype(local(row)));
        for (k, s) in stats.into_iter().enumerate() {
            if best.map_or(true, |(_, _, b)| s.r2() > b.r2()) {
                best = Some((row, k, s));
            }
        }
    }
    let Some((best_row, best_k, best_stats)) = best else {
        return Ok((record, None, filtered.summary));
    };

    let permuted: Vec<ArrayView1<f64>> = members.iter().map(|&row| phenotypes.values.row(local(row))).collect();
    let max_r2 = permutation_null(&genotypes, &permuted, config.permutations, config.permutation_chunk, stream);
    let calibration = calibrate(&max_r2, best_stats.r2(), engine.dof(), config.beta_approx);

    record.phenotype_id = ids[best_row].clone();
    record.best = Some(BestVariant {
        variant: setup.window_variant(filtered.indices[best_k], &filtered.stats[best_k], best_row),
        stats: best_stats,
    });
    record.calibration = Some(calibration);
    let null = PermutationNull {
        id: if grouped { group.id.clone() } else { ids[best_row].clone() },
        max_r2,
        dof: engine.dof(),
    };
    Ok((record, Some(null), filtered.summary))
}

/// Maximum r² over `genotypes` and all `phenotypes` for each of
/// `permutations` sample orders, evaluated `chunk` orders per product.
pub fn permutation_null(
    genotypes: &StandardizedRows,
    phenotypes: &[ArrayView1<f64>],
    permutations: usize,
    chunk: usize,
    stream: &mut PermutationStream,
) -> Vec<f64> {
    let n = genotypes.values.ncols();
    let chunk = chunk.clamp(1, permutations.max(1));
    let mut blocks: Vec<Array2<f64>> = phenotypes.iter().map(|_| Array2::zeros((chunk, n))).collect();
    let mut max_r2 = Vec::with_capacity(permutations);

    while max_r2.len() < permutations {
        let size = chunk.min(permutations - max_r2.len());
        for k in 0..size {
            let order = stream.next_order();
            for (block, values) in blocks.iter_mut().zip(phenotypes) {
                permute_into(*values, order, block.row_mut(k));
            }
        }
        let mut chunk_max = vec![0.0_f64; size];
        for block in &blocks {
            let r = genotypes.values.dot(&block.slice(s![..size, ..]).t());
            for (k, column) in r.axis_iter(Axis(1)).enumerate() {
                let m = column.iter().fold(0.0_f64, |acc, &v| acc.max(v * v));
                chunk_max[k] = chunk_max[k].max(m);
            }
        }
        max_r2.extend(chunk_max);
    }
    max_r2
}
