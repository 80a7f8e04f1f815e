//! # qtlscan
//!
//! Cis- and trans-QTL mapping over residualized genotype/phenotype
//! correlations.
//!
//! * [`cis`] scans each phenotype against the variants within a window of its
//!   position, either nominally, with a genotype x interaction model, or with
//!   a per-phenotype (or per-group) permutation null calibrated through a
//!   Beta approximation ([`beta_approx`]).
//! * [`trans`] scans all variants against all phenotypes in variant batches,
//!   keeping pairs below a p-value threshold and removing cis-proximal
//!   pairs, with an optional genome-wide permutation null.
//!
//! Covariates are projected out of genotypes and phenotypes by the
//! [`residualizer::Residualizer`]; statistics come from the
//! [`association::AssociationEngine`]. [`input`] and [`output`] read and
//! write the usual PLINK / BED / TSV files.

pub mod association;
pub mod beta_approx;
pub mod cis;
pub mod config;
pub mod error;
pub mod groups;
pub mod input;
pub mod interaction;
pub mod matrices;
pub mod output;
pub mod permutation;
pub mod progress;
pub mod residualizer;
pub mod trans;
pub mod transform;
pub mod variant_filter;

pub use config::{CisConfig, CollinearityPolicy, TransConfig};
pub use error::{QtlError, Result};
pub use matrices::{
    CovariateMatrix, GenomicPosition, GenotypeMatrix, InteractionTerm, PairedCovariates, PhenotypeMatrix,
    QtlDataset,
};
