//! # Variant filtering
//!
//! Allele statistics from called genotypes only, mean imputation of missing
//! calls and minor-allele-frequency filtering. Filtering happens before any
//! residualization or standardization so that excluded variants cost nothing
//! and never appear in tested-variant counts.

use log::{debug, warn};
use ndarray::{Array2, ArrayView1, ArrayView2};

/// Frequency summary for one variant, computed over called samples.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AlleleStats {
    /// Alternate (counted) allele frequency.
    pub af: f64,
    pub maf: f64,
    /// Samples carrying at least one minor allele.
    pub ma_samples: usize,
    pub ma_count: f64,
    pub n_called: usize,
}

impl AlleleStats {
    pub fn is_monomorphic(&self) -> bool {
        self.maf <= 0.0
    }
}

/// `None` when every call is missing.
pub fn allele_stats(dosages: ArrayView1<f64>) -> Option<AlleleStats> {
    let mut n_called = 0usize;
    let mut alt_sum = 0.0;
    let mut carriers_alt = 0usize;
    let mut carriers_ref = 0usize;
    for &g in dosages.iter().filter(|g| !g.is_nan()) {
        n_called += 1;
        alt_sum += g;
        if g > 0.5 {
            carriers_alt += 1;
        }
        if g < 1.5 {
            carriers_ref += 1;
        }
    }
    if n_called == 0 {
        return None;
    }
    let n_alleles = 2.0 * n_called as f64;
    let af = alt_sum / n_alleles;
    let (maf, ma_samples, ma_count) = if af <= 0.5 {
        (af, carriers_alt, alt_sum)
    } else {
        (1.0 - af, carriers_ref, n_alleles - alt_sum)
    };
    Some(AlleleStats {
        af,
        maf,
        ma_samples,
        ma_count,
        n_called,
    })
}

/// Why variants were left out of a batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilterSummary {
    pub tested: usize,
    pub all_missing: usize,
    pub monomorphic: usize,
    pub below_maf: usize,
}

impl FilterSummary {
    pub fn merge(&mut self, other: &FilterSummary) {
        self.tested += other.tested;
        self.all_missing += other.all_missing;
        self.monomorphic += other.monomorphic;
        self.below_maf += other.below_maf;
    }

    pub fn excluded(&self) -> usize {
        self.all_missing + self.monomorphic + self.below_maf
    }
}

/// The surviving rows of a batch, with missing calls imputed.
#[derive(Clone, Debug)]
pub struct FilteredVariants {
    /// Row indices into the source genotype matrix.
    pub indices: Vec<usize>,
    pub stats: Vec<AlleleStats>,
    /// `indices.len()` x samples.
    pub dosages: Array2<f64>,
    pub summary: FilterSummary,
}

impl FilteredVariants {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Selects `rows` of `genotypes` that pass `maf >= maf_threshold`. All-missing
/// and monomorphic variants are always excluded.
pub fn filter_variants(
    genotypes: ArrayView2<f64>,
    rows: &[usize],
    maf_threshold: f64,
    warn_monomorphic: bool,
) -> FilteredVariants {
    let mut summary = FilterSummary::default();
    let mut indices = Vec::with_capacity(rows.len());
    let mut stats = Vec::with_capacity(rows.len());

    for &row in rows {
        let g = genotypes.row(row);
        let Some(s) = allele_stats(g) else {
            warn!("Variant row {} has no called genotypes; excluded.", row);
            summary.all_missing += 1;
            continue;
        };
        if s.is_monomorphic() {
            if warn_monomorphic {
                warn!("Variant row {} is monomorphic; excluded.", row);
            }
            summary.monomorphic += 1;
            continue;
        }
        if s.maf < maf_threshold {
            summary.below_maf += 1;
            continue;
        }
        indices.push(row);
        stats.push(s);
    }
    summary.tested = indices.len();

    let n_samples = genotypes.ncols();
    let mut dosages = Array2::<f64>::zeros((indices.len(), n_samples));
    for (out_row, (&row, s)) in indices.iter().zip(&stats).enumerate() {
        let mean = 2.0 * s.af;
        for (dst, &g) in dosages.row_mut(out_row).iter_mut().zip(genotypes.row(row)) {
            *dst = if g.is_nan() { mean } else { g };
        }
    }

    if summary.excluded() > 0 {
        debug!(
            "Variant filter: {} tested, {} all-missing, {} monomorphic, {} below MAF {}",
            summary.tested, summary.all_missing, summary.monomorphic, summary.below_maf, maf_threshold
        );
    }
    FilteredVariants {
        indices,
        stats,
        dosages,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn allele_stats_ignore_missing_calls() {
        let g = array![0.0, 1.0, f64::NAN, 2.0, 1.0];
        let s = allele_stats(g.view()).unwrap();
        assert_eq!(s.n_called, 4);
        assert!((s.af - 0.5).abs() < 1e-12);
        assert!((s.maf - 0.5).abs() < 1e-12);
    }

    #[test]
    fn minor_allele_flips_above_half() {
        let g = array![2.0, 2.0, 1.0, 2.0];
        let s = allele_stats(g.view()).unwrap();
        assert!((s.af - 7.0 / 8.0).abs() < 1e-12);
        assert!((s.maf - 1.0 / 8.0).abs() < 1e-12);
        assert_eq!(s.ma_samples, 1);
        assert!((s.ma_count - 1.0).abs() < 1e-12);
    }

    #[test]
    fn all_missing_has_no_stats() {
        let g = array![f64::NAN, f64::NAN];
        assert!(allele_stats(g.view()).is_none());
    }

    #[test]
    fn filter_drops_monomorphic_missing_and_rare() {
        let g = array![
            [0.0, 1.0, 2.0, 1.0],
            [1.0, 1.0, 1.0, 1.0], // heterozygous everywhere: af 0.5, not monomorphic
            [0.0, 0.0, 0.0, 0.0],
            [f64::NAN, f64::NAN, f64::NAN, f64::NAN],
            [0.0, 0.0, 0.0, 1.0],
            [0.0, f64::NAN, 2.0, 2.0],
        ];
        let f = filter_variants(g.view(), &[0, 1, 2, 3, 4, 5], 0.2, false);
        assert_eq!(f.indices, vec![0, 1, 5]);
        assert_eq!(
            f.summary,
            FilterSummary {
                tested: 3,
                all_missing: 1,
                monomorphic: 1,
                below_maf: 1,
            }
        );
        // missing call imputed with the called mean (4/3)
        assert!((f.dosages[[2, 1]] - 4.0 / 3.0).abs() < 1e-12);
    }
}
