//! Tab-separated writers for every result table. Missing values are written
//! as `NA`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;

use crate::association::pval_from_r2;
use crate::cis::{CisInteractionOutput, CisNominalRecord, CisNominalOutput, CisPermutationOutput};
use crate::error::{QtlError, Result};
use crate::interaction::Coefficient;
use crate::trans::{DenseTransTable, TransInteractionOutput, TransOutput, TransPermutationNull};

fn create_output_file(prefix: &Path, suffix: &str) -> Result<(PathBuf, BufWriter<File>)> {
    let mut name = prefix.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    let path = PathBuf::from(name);
    let file = File::create(&path).map_err(|e| {
        QtlError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to create output file {}: {}", path.display(), e),
        ))
    })?;
    Ok((path, BufWriter::new(file)))
}

/// Six significant digits; scientific notation outside `[1e-3, 1e6)`.
fn num(v: f64) -> String {
    if v.is_nan() {
        "NA".to_string()
    } else if v == 0.0 || (1e-3..1e6).contains(&v.abs()) {
        format!("{:.6}", v)
    } else {
        format!("{:.6e}", v)
    }
}

fn opt(v: Option<f64>) -> String {
    v.map_or_else(|| "NA".to_string(), num)
}

const NOMINAL_HEADER: &str =
    "phenotype_id\tvariant_id\tstart_distance\taf\tma_samples\tma_count\tpval_nominal\tslope\tslope_se\ttstat\tn_samples";

fn write_nominal_rows(writer: &mut impl Write, records: &[CisNominalRecord]) -> Result<()> {
    writeln!(writer, "{}", NOMINAL_HEADER)?;
    for r in records {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            r.phenotype_id,
            r.variant.variant_id,
            r.variant.start_distance,
            num(r.variant.af),
            r.variant.ma_samples,
            num(r.variant.ma_count),
            num(r.stats.pval),
            num(r.stats.slope),
            num(r.stats.slope_se),
            num(r.stats.tstat),
            r.n_samples
        )?;
    }
    Ok(())
}

/// `{prefix}.cis_nominal.tsv` and `{prefix}.cis_nominal_top.tsv`.
pub fn write_cis_nominal(prefix: &Path, output: &CisNominalOutput) -> Result<()> {
    let (path, mut writer) = create_output_file(prefix, "cis_nominal.tsv")?;
    info!("Writing {} cis pairs to {}", output.records.len(), path.display());
    write_nominal_rows(&mut writer, &output.records)?;
    writer.flush()?;

    let (path, mut writer) = create_output_file(prefix, "cis_nominal_top.tsv")?;
    info!("Writing top associations to {}", path.display());
    write_nominal_rows(&mut writer, &output.top)?;
    writer.flush()?;
    Ok(())
}

fn coefficient_columns(c: &Coefficient) -> String {
    format!("{}\t{}\t{}\t{}", num(c.estimate), num(c.se), num(c.tstat), num(c.pval))
}

const INTERACTION_COLUMNS: &str = "b_g\tb_g_se\ttstat_g\tpval_g\tb_i\tb_i_se\ttstat_i\tpval_i\t\
                                   b_gi\tb_gi_se\ttstat_gi\tpval_gi\tdof\tdegenerate";

/// `{prefix}.cis_interaction.tsv` and `{prefix}.cis_interaction_top.tsv`.
pub fn write_cis_interaction(prefix: &Path, output: &CisInteractionOutput) -> Result<()> {
    for (suffix, records) in [
        ("cis_interaction.tsv", &output.records),
        ("cis_interaction_top.tsv", &output.top),
    ] {
        let (path, mut writer) = create_output_file(prefix, suffix)?;
        info!("Writing {} interaction records to {}", records.len(), path.display());
        writeln!(
            writer,
            "phenotype_id\tvariant_id\tstart_distance\taf\tma_samples\tma_count\t{}\tn_samples",
            INTERACTION_COLUMNS
        )?;
        for r in records {
            writeln!(
                writer,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                r.phenotype_id,
                r.variant.variant_id,
                r.variant.start_distance,
                num(r.variant.af),
                r.variant.ma_samples,
                num(r.variant.ma_count),
                coefficient_columns(&r.stats.g),
                coefficient_columns(&r.stats.i),
                coefficient_columns(&r.stats.gi),
                r.stats.dof,
                r.stats.degenerate,
                r.n_samples
            )?;
        }
        writer.flush()?;
    }
    Ok(())
}

/// `{prefix}.cis_qtl.tsv`, one row per phenotype or group.
pub fn write_cis_permutations(prefix: &Path, output: &CisPermutationOutput) -> Result<()> {
    let (path, mut writer) = create_output_file(prefix, "cis_qtl.tsv")?;
    info!("Writing {} calibrated records to {}", output.records.len(), path.display());
    writeln!(
        writer,
        "phenotype_id\tgroup_id\tgroup_size\tnum_var\tbeta_shape1\tbeta_shape2\ttrue_df\tpval_true_df\t\
         variant_id\tstart_distance\taf\tma_samples\tma_count\tpval_nominal\tslope\tslope_se\t\
         pval_perm\tpval_beta\tcalibration"
    )?;
    for r in &output.records {
        let cal = r.calibration.as_ref();
        let beta = cal.and_then(|c| c.beta);
        let best = r.best.as_ref();
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            r.phenotype_id,
            r.group_id.as_deref().unwrap_or("NA"),
            r.group_size,
            r.num_var,
            opt(beta.map(|b| b.shape1)),
            opt(beta.map(|b| b.shape2)),
            opt(beta.map(|b| b.true_dof)),
            opt(cal.and_then(|c| c.pval_true_df)),
            best.map_or("NA", |b| b.variant.variant_id.as_str()),
            best.map_or_else(|| "NA".to_string(), |b| b.variant.start_distance.to_string()),
            opt(best.map(|b| b.variant.af)),
            best.map_or_else(|| "NA".to_string(), |b| b.variant.ma_samples.to_string()),
            opt(best.map(|b| b.variant.ma_count)),
            opt(best.map(|b| b.stats.pval)),
            opt(best.map(|b| b.stats.slope)),
            opt(best.map(|b| b.stats.slope_se)),
            opt(cal.map(|c| c.pval_perm)),
            opt(cal.and_then(|c| c.pval_beta)),
            cal.map_or("NA", |c| c.status.label())
        )?;
    }
    writer.flush()?;
    Ok(())
}

/// `{prefix}.cis_nulls.tsv`: one row per unit with its comma-separated max r²
/// values and the matching minimum p-values.
pub fn write_cis_nulls(prefix: &Path, output: &CisPermutationOutput) -> Result<()> {
    let (path, mut writer) = create_output_file(prefix, "cis_nulls.tsv")?;
    info!("Writing {} permutation nulls to {}", output.nulls.len(), path.display());
    writeln!(writer, "id\tdof\tseed\tmax_r2\tmin_pval")?;
    let joined = |values: &[f64]| values.iter().map(|&v| num(v)).collect::<Vec<_>>().join(",");
    for null in &output.nulls {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}",
            null.id,
            null.dof,
            output.seed,
            joined(&null.max_r2),
            joined(&null.min_pvalues())
        )?;
    }
    writer.flush()?;
    Ok(())
}

/// `{prefix}.trans_qtl_pairs.tsv`, or the dense matrices in dense mode.
pub fn write_trans(prefix: &Path, output: &TransOutput, return_r2: bool) -> Result<()> {
    if let Some(dense) = &output.dense {
        return write_trans_dense(prefix, dense);
    }
    let (path, mut writer) = create_output_file(prefix, "trans_qtl_pairs.tsv")?;
    info!("Writing {} trans pairs to {}", output.pairs.len(), path.display());
    let calibrated = output.pairs.iter().any(|p| p.pval_perm.is_some());
    write!(writer, "variant_id\tphenotype_id\tpval\tslope\tslope_se\ttstat\taf")?;
    if return_r2 {
        write!(writer, "\tr2")?;
    }
    if calibrated {
        write!(writer, "\tpval_perm\tpval_beta")?;
    }
    writeln!(writer)?;
    for p in &output.pairs {
        write!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            p.variant_id,
            p.phenotype_id,
            num(p.stats.pval),
            num(p.stats.slope),
            num(p.stats.slope_se),
            num(p.stats.tstat),
            num(p.af)
        )?;
        if return_r2 {
            write!(writer, "\t{}", num(p.stats.r2()))?;
        }
        if calibrated {
            write!(writer, "\t{}\t{}", opt(p.pval_perm), opt(p.pval_beta))?;
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

/// `{prefix}.trans_interaction_pairs.tsv`, the sparse genotype x interaction pairs.
pub fn write_trans_interaction(prefix: &Path, output: &TransInteractionOutput) -> Result<()> {
    let (path, mut writer) = create_output_file(prefix, "trans_interaction_pairs.tsv")?;
    info!("Writing {} trans interaction pairs to {}", output.pairs.len(), path.display());
    writeln!(writer, "variant_id\tphenotype_id\taf\t{}", INTERACTION_COLUMNS)?;
    for p in &output.pairs {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            p.variant_id,
            p.phenotype_id,
            num(p.af),
            coefficient_columns(&p.stats.g),
            coefficient_columns(&p.stats.i),
            coefficient_columns(&p.stats.gi),
            p.stats.dof,
            p.stats.degenerate
        )?;
    }
    writer.flush()?;
    Ok(())
}

fn write_trans_dense(prefix: &Path, dense: &DenseTransTable) -> Result<()> {
    let mut tables = vec![("trans_tstat.tsv", &dense.tstat), ("trans_pval.tsv", &dense.pval)];
    if let Some(r2) = &dense.r2 {
        tables.push(("trans_r2.tsv", r2));
    }
    for (suffix, table) in tables {
        let (path, mut writer) = create_output_file(prefix, suffix)?;
        info!(
            "Writing {} x {} dense table to {}",
            table.nrows(),
            table.ncols(),
            path.display()
        );
        writeln!(writer, "variant_id\taf\t{}", dense.phenotype_ids.join("\t"))?;
        for ((id, &af), row) in dense.variant_ids.iter().zip(&dense.af).zip(table.rows()) {
            let values: Vec<String> = row.iter().map(|&v| num(v)).collect();
            writeln!(writer, "{}\t{}\t{}", id, num(af), values.join("\t"))?;
        }
        writer.flush()?;
    }
    Ok(())
}

/// `{prefix}.trans_null.tsv`: max r² and the matching minimum p-value per permutation.
pub fn write_trans_null(prefix: &Path, null: &TransPermutationNull) -> Result<()> {
    let (path, mut writer) = create_output_file(prefix, "trans_null.tsv")?;
    info!("Writing {} trans permutations to {}", null.max_r2.len(), path.display());
    writeln!(writer, "permutation\tmax_r2\tmin_pval")?;
    for (i, &r2) in null.max_r2.iter().enumerate() {
        writeln!(writer, "{}\t{}\t{}", i, num(r2), num(pval_from_r2(r2, null.dof)))?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::AssociationStats;
    use crate::beta_approx::{Calibration, CalibrationStatus};
    use crate::cis::{BestVariant, CisInteractionRecord, CisPermutationRecord, PermutationNull, WindowVariant};
    use crate::interaction::InteractionStats;
    use crate::trans::TransInteractionPair;
    use tempfile::tempdir;

    fn variant(id: &str) -> WindowVariant {
        WindowVariant {
            variant_id: id.into(),
            start_distance: 40,
            af: 0.25,
            ma_samples: 10,
            ma_count: 12.0,
        }
    }

    fn interaction_stats(degenerate: bool) -> InteractionStats {
        let c = if degenerate {
            Coefficient {
                estimate: 0.0,
                se: f64::NAN,
                tstat: 0.0,
                pval: 1.0,
            }
        } else {
            Coefficient {
                estimate: 0.5,
                se: 0.1,
                tstat: 5.0,
                pval: 2e-6,
            }
        };
        InteractionStats {
            g: c,
            i: c,
            gi: c,
            dof: 45.0,
            degenerate,
        }
    }

    #[test]
    fn numbers_switch_to_scientific_notation() {
        assert_eq!(num(0.25), "0.250000");
        assert_eq!(num(1.5e-12), "1.500000e-12");
        assert_eq!(num(f64::NAN), "NA");
        assert_eq!(num(0.0), "0.000000");
    }

    #[test]
    fn permutation_table_has_na_for_untested_units() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("run");
        let tested = CisPermutationRecord {
            phenotype_id: "geneA".into(),
            group_id: None,
            group_size: 1,
            num_var: 12,
            dof: 48.0,
            best: Some(BestVariant {
                variant: WindowVariant {
                    variant_id: "rs1".into(),
                    start_distance: -250,
                    af: 0.3,
                    ma_samples: 20,
                    ma_count: 30.0,
                },
                stats: AssociationStats {
                    r: 0.6,
                    tstat: 5.2,
                    pval: 3e-6,
                    slope: 0.4,
                    slope_se: 0.08,
                    degenerate: false,
                },
            }),
            calibration: Some(Calibration {
                pval_perm: 0.001,
                beta: None,
                pval_true_df: None,
                pval_beta: None,
                status: CalibrationStatus::Fallback("zero variance".into()),
            }),
        };
        let empty = CisPermutationRecord {
            phenotype_id: "geneB".into(),
            num_var: 0,
            best: None,
            calibration: None,
            ..tested.clone()
        };
        let output = CisPermutationOutput {
            records: vec![tested, empty],
            ..Default::default()
        };
        write_cis_permutations(&prefix, &output).unwrap();

        let text = std::fs::read_to_string(dir.path().join("run.cis_qtl.tsv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        let n_cols = lines[0].split('\t').count();
        assert!(lines.iter().all(|l| l.split('\t').count() == n_cols));
        assert!(lines[1].contains("rs1\t-250"));
        assert!(lines[1].ends_with("fallback"));
        assert!(lines[2].starts_with("geneB\tNA\t1\t0\tNA"));
    }

    #[test]
    fn interaction_tables_flag_degenerate_tests() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("run");
        let record = |id: &str, degenerate: bool| CisInteractionRecord {
            phenotype_id: "geneA".into(),
            variant: variant(id),
            n_samples: 50,
            stats: interaction_stats(degenerate),
        };
        let output = CisInteractionOutput {
            records: vec![record("rs1", false), record("rs2", true)],
            top: vec![record("rs1", false)],
            ..Default::default()
        };
        write_cis_interaction(&prefix, &output).unwrap();

        let text = std::fs::read_to_string(dir.path().join("run.cis_interaction.tsv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        let header: Vec<&str> = lines[0].split('\t').collect();
        let col = header.iter().position(|&h| h == "degenerate").unwrap();
        assert_eq!(header.len(), 21);
        assert!(lines.iter().all(|l| l.split('\t').count() == header.len()));
        assert_eq!(lines[1].split('\t').nth(col), Some("false"));
        assert_eq!(lines[2].split('\t').nth(col), Some("true"));
        assert!(lines[2].contains("\tNA\t"));

        let trans = TransInteractionOutput {
            pairs: vec![TransInteractionPair {
                variant_index: 0,
                phenotype_index: 0,
                variant_id: "rs2".into(),
                phenotype_id: "geneB".into(),
                af: 0.25,
                stats: interaction_stats(true),
            }],
            ..Default::default()
        };
        write_trans_interaction(&prefix, &trans).unwrap();
        let text = std::fs::read_to_string(dir.path().join("run.trans_interaction_pairs.tsv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("dof\tdegenerate"));
        assert!(lines[1].starts_with("rs2\tgeneB\t"));
        assert!(lines[1].ends_with("\ttrue"));
    }

    #[test]
    fn cis_nulls_carry_min_pvalues() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("run");
        let null = PermutationNull {
            id: "geneA".into(),
            max_r2: vec![0.1, 0.4],
            dof: 48.0,
        };
        let output = CisPermutationOutput {
            nulls: vec![null.clone()],
            seed: 5,
            ..Default::default()
        };
        write_cis_nulls(&prefix, &output).unwrap();

        let text = std::fs::read_to_string(dir.path().join("run.cis_nulls.tsv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "id\tdof\tseed\tmax_r2\tmin_pval");
        let fields: Vec<&str> = lines[1].split('\t').collect();
        assert_eq!(fields[..3], ["geneA", "48", "5"]);
        let min_pval: Vec<f64> = fields[4].split(',').map(|v| v.parse().unwrap()).collect();
        assert_eq!(min_pval.len(), 2);
        // larger r² gives the smaller p-value
        assert!(min_pval[1] < min_pval[0]);
        let expected = null.min_pvalues();
        for (got, want) in min_pval.iter().zip(&expected) {
            assert!((got - want).abs() <= 1e-6 + 1e-5 * want);
        }
    }
}
