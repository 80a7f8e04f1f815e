//! # Input readers
//!
//! Thin loaders that turn files into the containers of `matrices`. Every
//! reader aligns samples to the phenotype sample order by id; samples that
//! cannot be found are a fatal `InputValidation` error.
//!
//! * PLINK 1 `.bed/.bim/.fam` through `bed-reader`, counting allele 1 as f64
//!   dosages (missing calls are NaN).
//! * Phenotype BED: `#chr start end phenotype_id sample...`, optionally
//!   gzip-compressed. A phenotype's coordinate is its `end` column.
//! * Covariates: header `id sample...`, one covariate per row.
//! * Paired covariates: same layout as covariates, one phenotype per row.
//! * Interaction term: two columns `sample value`, optional header.
//! * Phenotype groups: header-less `phenotype_id group_id`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use bed_reader::{Bed, ReadOptions};
use flate2::read::MultiGzDecoder;
use log::{debug, info};
use ndarray::{Array1, Array2};

use crate::error::{QtlError, Result};
use crate::matrices::{
    CovariateMatrix, GenomicPosition, GenotypeMatrix, InteractionTerm, PairedCovariates, PhenotypeMatrix,
};

/// Opens a text file, decompressing when the name ends in `.gz`.
fn open_text(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    let gz = path.extension().is_some_and(|ext| ext == "gz");
    Ok(if gz {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    })
}

/// Non-empty lines with their 1-based line numbers.
fn numbered_lines(path: &Path) -> Result<Vec<(usize, String)>> {
    let mut lines = Vec::new();
    for (i, line) in open_text(path)?.lines().enumerate() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push((i + 1, line));
        }
    }
    Ok(lines)
}

fn parse_value(path: &Path, line: usize, field: &str) -> Result<f64> {
    match field {
        "NA" | "nan" | "NaN" => Ok(f64::NAN),
        _ => field
            .parse::<f64>()
            .map_err(|e| QtlError::parse(path, line, format!("invalid number '{}': {}", field, e))),
    }
}

/// Column index of each wanted sample within `available`.
fn sample_columns(kind: &str, available: &[String], wanted: &[String]) -> Result<Vec<usize>> {
    let lookup: HashMap<&str, usize> = available.iter().enumerate().map(|(i, s)| (s.as_str(), i)).collect();
    wanted
        .iter()
        .map(|s| {
            lookup
                .get(s.as_str())
                .copied()
                .ok_or_else(|| QtlError::input_validation(format!("sample '{}' is missing from the {} input", s, kind)))
        })
        .collect()
}

/// `prefix.bed/.bim/.fam`, restricted and ordered to `sample_ids`.
pub fn read_plink(prefix: &Path, sample_ids: &[String]) -> Result<GenotypeMatrix> {
    let bed_path = with_suffix(prefix, "bed");
    info!("Reading PLINK genotypes from {}", bed_path.display());
    let mut bed = Bed::new(&bed_path)?;
    let fam_ids: Vec<String> = bed.iid()?.to_vec();
    let columns = sample_columns("PLINK .fam", &fam_ids, sample_ids)?;
    let iid_index: Vec<isize> = columns.iter().map(|&c| c as isize).collect();

    let variant_ids = bed.sid()?.to_vec();
    let chromosomes = bed.chromosome()?.to_vec();
    let bp = bed.bp_position()?.to_vec();
    let positions = chromosomes
        .into_iter()
        .zip(bp)
        .map(|(chrom, pos)| GenomicPosition::new(chrom, pos as i64))
        .collect();

    // samples x variants
    let dosages = ReadOptions::builder().iid_index(&iid_index).f64().read(&mut bed)?;
    let dosages: Array2<f64> = dosages.t().as_standard_layout().into_owned();
    debug!(
        "PLINK: {} variants x {} samples ({} samples in .fam)",
        dosages.nrows(),
        dosages.ncols(),
        fam_ids.len()
    );
    GenotypeMatrix::new(variant_ids, sample_ids.to_vec(), dosages, Some(positions))
}

fn with_suffix(prefix: &Path, ext: &str) -> PathBuf {
    let mut s = prefix.as_os_str().to_owned();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

/// Phenotype BED (plain or `.gz`).
pub fn read_phenotype_bed(path: &Path) -> Result<PhenotypeMatrix> {
    info!("Reading phenotypes from {}", path.display());
    let lines = numbered_lines(path)?;
    let Some(((_, header), rows)) = lines.split_first() else {
        return Err(QtlError::parse(path, 1, "empty phenotype file"));
    };
    let header: Vec<&str> = header.split('\t').collect();
    if header.len() < 5 || !header[0].starts_with('#') {
        return Err(QtlError::parse(
            path,
            1,
            "expected header '#chr start end phenotype_id sample...'",
        ));
    }
    let sample_ids: Vec<String> = header[4..].iter().map(|s| s.to_string()).collect();

    let mut phenotype_ids = Vec::with_capacity(rows.len());
    let mut positions = Vec::with_capacity(rows.len());
    let mut values = Array2::<f64>::zeros((rows.len(), sample_ids.len()));
    for (r, (line_no, line)) in rows.iter().enumerate() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != header.len() {
            return Err(QtlError::parse(
                path,
                *line_no,
                format!("{} fields, header has {}", fields.len(), header.len()),
            ));
        }
        let end = fields[2]
            .parse::<i64>()
            .map_err(|e| QtlError::parse(path, *line_no, format!("invalid end '{}': {}", fields[2], e)))?;
        positions.push(GenomicPosition::new(fields[0], end));
        phenotype_ids.push(fields[3].to_string());
        for (dst, field) in values.row_mut(r).iter_mut().zip(&fields[4..]) {
            *dst = parse_value(path, *line_no, field)?;
        }
    }
    debug!("{} phenotypes x {} samples", phenotype_ids.len(), sample_ids.len());
    PhenotypeMatrix::new(phenotype_ids, sample_ids, values, positions)
}

/// Covariates TSV, columns reordered to `sample_ids`.
pub fn read_covariates(path: &Path, sample_ids: &[String]) -> Result<CovariateMatrix> {
    info!("Reading covariates from {}", path.display());
    let lines = numbered_lines(path)?;
    let Some(((_, header), rows)) = lines.split_first() else {
        return Err(QtlError::parse(path, 1, "empty covariate file"));
    };
    let header: Vec<String> = header.split('\t').skip(1).map(|s| s.to_string()).collect();
    let columns = sample_columns("covariate", &header, sample_ids)?;

    let mut covariate_ids = Vec::with_capacity(rows.len());
    let mut values = Array2::<f64>::zeros((rows.len(), sample_ids.len()));
    for (r, (line_no, line)) in rows.iter().enumerate() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != header.len() + 1 {
            return Err(QtlError::parse(
                path,
                *line_no,
                format!("{} fields, header has {}", fields.len(), header.len() + 1),
            ));
        }
        covariate_ids.push(fields[0].to_string());
        for (c, &col) in columns.iter().enumerate() {
            values[[r, c]] = parse_value(path, *line_no, fields[col + 1])?;
        }
    }
    CovariateMatrix::new(covariate_ids, sample_ids.to_vec(), values)
}

/// Phenotype-specific covariates: header `phenotype_id sample...`, one
/// phenotype per row.
pub fn read_paired_covariates(path: &Path, sample_ids: &[String]) -> Result<PairedCovariates> {
    let table = read_covariates(path, sample_ids)?;
    debug!("{} paired covariates read", table.covariate_ids.len());
    PairedCovariates::new(table.covariate_ids, table.sample_ids, table.values)
}

/// Interaction TSV, values ordered to `sample_ids`.
pub fn read_interaction(path: &Path, sample_ids: &[String]) -> Result<InteractionTerm> {
    info!("Reading interaction term from {}", path.display());
    let mut name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "interaction".to_string());
    let mut by_sample: HashMap<String, f64> = HashMap::new();
    for (idx, (line_no, line)) in numbered_lines(path)?.into_iter().enumerate() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 2 {
            return Err(QtlError::parse(path, line_no, "expected 'sample<TAB>value'"));
        }
        match fields[1].parse::<f64>() {
            Ok(v) => {
                by_sample.insert(fields[0].to_string(), v);
            }
            // a non-numeric first line is a header
            Err(_) if idx == 0 => name = fields[1].to_string(),
            Err(e) => {
                return Err(QtlError::parse(
                    path,
                    line_no,
                    format!("invalid number '{}': {}", fields[1], e),
                ))
            }
        }
    }
    let values = sample_ids
        .iter()
        .map(|s| {
            by_sample
                .get(s)
                .copied()
                .ok_or_else(|| QtlError::input_validation(format!("sample '{}' is missing from the interaction input", s)))
        })
        .collect::<Result<Array1<f64>>>()?;
    InteractionTerm::new(name, sample_ids.to_vec(), values)
}

/// Header-less `phenotype_id<TAB>group_id` mapping.
pub fn read_phenotype_groups(path: &Path) -> Result<HashMap<String, String>> {
    info!("Reading phenotype groups from {}", path.display());
    let mut mapping = HashMap::new();
    for (line_no, line) in numbered_lines(path)? {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 2 {
            return Err(QtlError::parse(path, line_no, "expected 'phenotype_id<TAB>group_id'"));
        }
        mapping.insert(fields[0].to_string(), fields[1].to_string());
    }
    Ok(mapping)
}
