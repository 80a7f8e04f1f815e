// main.rs

// --- External Crate Imports ---
use anyhow::{anyhow, Error, Result};
use clap::Parser;
use log::{info, warn};
use std::time::Instant;

use qtlscan::{
    cis, input, output, trans, groups::PhenotypeGroups, CisConfig, CollinearityPolicy, QtlDataset,
    TransConfig,
};

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting qtlscan with args: {:?}", cli_args);

    // Configure Rayon thread pool
    let num_threads = cli_args.threads.unwrap_or_else(num_cpus::get);
    info!("Using {} threads for parallel operations.", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()?;

    // --- 1. Load inputs ---
    let dataset = load_dataset(&cli_args)?;

    let output_prefix = cli_args.output_prefix();
    if !cli_args.output_dir.as_os_str().is_empty() && !cli_args.output_dir.exists() {
        std::fs::create_dir_all(&cli_args.output_dir).map_err(|e| {
            anyhow!(
                "Failed to create output directory {}: {}",
                cli_args.output_dir.display(),
                e
            )
        })?;
        info!("Created output directory: {}", cli_args.output_dir.display());
    }

    // --- 2. Map and write ---
    match cli_args.mode {
        cli::Mode::CisNominal => {
            let config = cis_config(&cli_args);
            if dataset.interaction.is_some() {
                let result = cis::map_nominal_interaction(&dataset, &config)?;
                output::write_cis_interaction(&output_prefix, &result)?;
            } else {
                let result = cis::map_nominal(&dataset, &config)?;
                output::write_cis_nominal(&output_prefix, &result)?;
            }
        }
        cli::Mode::Cis => {
            let config = cis_config(&cli_args);
            let groups = match &cli_args.phenotype_groups {
                Some(path) => {
                    let mapping = input::read_phenotype_groups(path)?;
                    Some(PhenotypeGroups::from_mapping(
                        &dataset.phenotypes.phenotype_ids,
                        &mapping,
                    )?)
                }
                None => None,
            };
            let result = cis::map_cis(&dataset, groups.as_ref(), &config)?;
            output::write_cis_permutations(&output_prefix, &result)?;
            if cli_args.write_nulls {
                output::write_cis_nulls(&output_prefix, &result)?;
            }
        }
        cli::Mode::Trans if dataset.interaction.is_some() => {
            let config = trans_config(&cli_args);
            if config.permutations > 0 {
                warn!("Trans permutations are not run with an interaction term; reporting nominal interaction p-values.");
            }
            let result = trans::map_trans_interaction(&dataset, &config)?;
            output::write_trans_interaction(&output_prefix, &result)?;
        }
        cli::Mode::Trans => {
            let config = trans_config(&cli_args);
            let mut result = trans::map_trans(&dataset, &config)?;
            info!(
                "Trans scan kept {} pairs ({} removed as cis-proximal).",
                result.pairs.len(),
                result.cis_excluded
            );
            if config.permutations > 0 {
                if config.return_dense {
                    warn!("Permutation calibration applies to sparse pairs only; skipping it for dense output.");
                } else {
                    let null = trans::map_permutations(&dataset, &config)?;
                    trans::calibrate_pairs(&mut result.pairs, &null, config.beta_approx);
                    if cli_args.write_nulls {
                        output::write_trans_null(&output_prefix, &null)?;
                    }
                }
            }
            output::write_trans(&output_prefix, &result, config.return_r2)?;
        }
    }

    info!(
        "qtlscan finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

fn load_dataset(cli_args: &cli::CliArgs) -> Result<QtlDataset> {
    let phenotypes = input::read_phenotype_bed(&cli_args.phenotype_bed)?;
    info!(
        "Loaded {} phenotypes across {} samples.",
        phenotypes.n_phenotypes(),
        phenotypes.n_samples()
    );
    let samples = phenotypes.sample_ids.clone();

    let genotypes = input::read_plink(&cli_args.genotype_prefix, &samples)?;
    info!("Loaded {} variants.", genotypes.n_variants());

    let covariates = cli_args
        .covariates
        .as_deref()
        .map(|path| input::read_covariates(path, &samples))
        .transpose()?;
    let interaction = cli_args
        .interaction
        .as_deref()
        .map(|path| input::read_interaction(path, &samples))
        .transpose()?;

    let dataset = QtlDataset::new(genotypes, phenotypes, covariates, interaction)?;
    match &cli_args.paired_covariate {
        Some(path) => {
            if cli_args.mode != cli::Mode::Cis {
                warn!("--paired-covariate is only used with --mode cis; ignoring it.");
                return Ok(dataset);
            }
            let paired = input::read_paired_covariates(path, &dataset.phenotypes.sample_ids)?;
            Ok(dataset.with_paired_covariates(paired)?)
        }
        None => Ok(dataset),
    }
}

fn collinearity(cli_args: &cli::CliArgs) -> CollinearityPolicy {
    if cli_args.drop_collinear_covariates {
        CollinearityPolicy::DropDependent
    } else {
        CollinearityPolicy::Fail
    }
}

fn cis_config(cli_args: &cli::CliArgs) -> CisConfig {
    let defaults = CisConfig::default();
    CisConfig {
        window: cli_args.window,
        maf_threshold: cli_args.maf_threshold.unwrap_or(defaults.maf_threshold),
        maf_threshold_interaction: cli_args.maf_threshold_interaction,
        nominal_pval_threshold: cli_args.pval_threshold.unwrap_or(defaults.nominal_pval_threshold),
        permutations: cli_args.permutations.unwrap_or(defaults.permutations),
        seed: cli_args.seed,
        beta_approx: !cli_args.disable_beta_approx,
        warn_monomorphic: cli_args.warn_monomorphic,
        inverse_normal_transform: cli_args.invnorm,
        collinearity: collinearity(cli_args),
        show_progress: cli_args.progress,
        ..defaults
    }
}

fn trans_config(cli_args: &cli::CliArgs) -> TransConfig {
    let defaults = TransConfig::default();
    TransConfig {
        maf_threshold: cli_args.maf_threshold.unwrap_or(defaults.maf_threshold),
        maf_threshold_interaction: cli_args.maf_threshold_interaction,
        batch_size: cli_args.batch_size,
        pval_threshold: cli_args.pval_threshold.unwrap_or(defaults.pval_threshold),
        return_dense: cli_args.return_dense,
        return_r2: cli_args.return_r2,
        cis_exclusion_window: cli_args.cis_exclusion_window,
        permutations: cli_args.permutations.unwrap_or(defaults.permutations),
        seed: cli_args.seed,
        beta_approx: !cli_args.disable_beta_approx,
        warn_monomorphic: cli_args.warn_monomorphic,
        inverse_normal_transform: cli_args.invnorm,
        collinearity: collinearity(cli_args),
        show_progress: cli_args.progress,
        ..defaults
    }
}

// --- Module Implementations ---

mod cli {
    use clap::{Parser, ValueEnum};
    use std::path::PathBuf;

    #[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) enum Mode {
        /// Per-phenotype permutation calibration of the best cis variant.
        Cis,
        /// Every cis pair (interaction model when --interaction is given).
        CisNominal,
        /// All variants against all phenotypes.
        Trans,
    }

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Cis- and trans-QTL mapping.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        /// PLINK 1 prefix (.bed/.bim/.fam).
        #[arg(short = 'g', long = "genotypes", required = true)]
        pub(crate) genotype_prefix: PathBuf,

        /// Phenotype BED (optionally gzipped).
        #[arg(short = 'p', long = "phenotypes", required = true)]
        pub(crate) phenotype_bed: PathBuf,

        #[arg(long, required = true)]
        pub(crate) prefix: String,

        #[arg(short, long = "out-dir", default_value = ".")]
        pub(crate) output_dir: PathBuf,

        #[arg(short, long, value_enum, default_value_t = Mode::Cis)]
        pub(crate) mode: Mode,

        #[arg(long)]
        pub(crate) covariates: Option<PathBuf>,

        #[arg(long)]
        pub(crate) interaction: Option<PathBuf>,

        /// Covariate TSV with one row per phenotype, each projected out of its
        /// own phenotype only (cis mode).
        #[arg(long)]
        pub(crate) paired_covariate: Option<PathBuf>,

        /// Header-less phenotype_id / group_id TSV.
        #[arg(long)]
        pub(crate) phenotype_groups: Option<PathBuf>,

        /// Defaults to 10000; 0 disables permutation calibration in trans mode.
        #[arg(long)]
        pub(crate) permutations: Option<usize>,

        #[arg(long, default_value_t = 1_000_000)]
        pub(crate) window: i64,

        /// Nominal threshold for cis-nominal output; sparse threshold for trans (default 1e-5).
        #[arg(long)]
        pub(crate) pval_threshold: Option<f64>,

        /// Defaults to 0 in cis modes and 0.05 in trans mode.
        #[arg(long)]
        pub(crate) maf_threshold: Option<f64>,

        #[arg(long, default_value_t = 0.05)]
        pub(crate) maf_threshold_interaction: f64,

        #[arg(long)]
        pub(crate) return_dense: bool,

        #[arg(long)]
        pub(crate) return_r2: bool,

        #[arg(long, default_value_t = 20_000)]
        pub(crate) batch_size: usize,

        #[arg(long, default_value_t = 5_000_000)]
        pub(crate) cis_exclusion_window: i64,

        /// Inverse normal transform of residualized phenotypes.
        #[arg(long)]
        pub(crate) invnorm: bool,

        #[arg(long)]
        pub(crate) disable_beta_approx: bool,

        #[arg(long)]
        pub(crate) warn_monomorphic: bool,

        #[arg(long)]
        pub(crate) drop_collinear_covariates: bool,

        /// Also write the permutation nulls.
        #[arg(long)]
        pub(crate) write_nulls: bool,

        #[arg(long)]
        pub(crate) seed: Option<u64>,

        #[arg(short = 't', long)]
        pub(crate) threads: Option<usize>,

        #[arg(long)]
        pub(crate) progress: bool,

        #[arg(long, default_value = "Info")]
        pub(crate) log_level: String,
    }

    impl CliArgs {
        pub(crate) fn output_prefix(&self) -> PathBuf {
            self.output_dir.join(&self.prefix)
        }
    }
}
