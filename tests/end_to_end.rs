use std::collections::HashSet;

use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use qtlscan::beta_approx::CalibrationStatus;
use qtlscan::cis::{map_cis, map_nominal_interaction};
use qtlscan::trans::{filter_cis, map_trans, TransPair};
use qtlscan::{
    CisConfig, CovariateMatrix, GenomicPosition, GenotypeMatrix, InteractionTerm, PhenotypeMatrix,
    QtlDataset, TransConfig,
};

fn ids(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}{}", prefix, i)).collect()
}

fn random_dosages(rng: &mut ChaCha8Rng, n_variants: usize, n_samples: usize) -> Array2<f64> {
    Array2::from_shape_fn((n_variants, n_samples), |_| rng.random_range(0..3) as f64)
}

/// Variants at 1 kb spacing on chr1; phenotypes all placed at 2 kb.
fn cis_dataset(dosages: Array2<f64>, values: Array2<f64>) -> QtlDataset {
    let (n_variants, n) = dosages.dim();
    let n_pheno = values.nrows();
    let positions = (0..n_variants)
        .map(|i| GenomicPosition::new("chr1", 1_000 * i as i64))
        .collect();
    let genotypes = GenotypeMatrix::new(ids("rs", n_variants), ids("S", n), dosages, Some(positions)).unwrap();
    let phenotypes = PhenotypeMatrix::new(
        ids("gene", n_pheno),
        ids("S", n),
        values,
        vec![GenomicPosition::new("chr1", 2_000); n_pheno],
    )
    .unwrap();
    QtlDataset::new(genotypes, phenotypes, None, None).unwrap()
}

#[test]
fn perfectly_correlated_variant_is_calibrated_near_zero() {
    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let dosages = random_dosages(&mut rng, 5, 50);
    let values = dosages.row(0).to_owned().insert_axis(ndarray::Axis(0));
    let data = cis_dataset(dosages, values);
    let config = CisConfig {
        window: 10_000,
        permutations: 100,
        seed: Some(1),
        ..CisConfig::default()
    };

    let out = map_cis(&data, None, &config).unwrap();
    let record = &out.records[0];
    let best = record.best.as_ref().unwrap();
    assert_eq!(best.variant.variant_id, "rs0");
    assert_eq!(record.num_var, 5);
    assert!(best.stats.pval < 1e-30);
    assert!(best.stats.tstat.is_finite());

    let cal = record.calibration.as_ref().unwrap();
    assert!((cal.pval_perm - 1.0 / 101.0).abs() < 1e-12);
    assert_eq!(cal.status, CalibrationStatus::Beta);
    let beta = cal.beta.unwrap();
    assert!(beta.shape1 > 0.0 && beta.shape2 > 0.0);
    assert!(cal.pval() < 1e-3);
}

#[test]
fn seeded_permutations_are_reproducible() {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let dosages = random_dosages(&mut rng, 8, 60);
    let values = Array2::from_shape_fn((3, 60), |_| rng.random::<f64>());
    let data = cis_dataset(dosages, values);
    let config = CisConfig {
        window: 20_000,
        permutations: 150,
        seed: Some(77),
        ..CisConfig::default()
    };

    let a = map_cis(&data, None, &config).unwrap();
    let b = map_cis(&data, None, &config).unwrap();
    assert_eq!(a.records, b.records);
    assert_eq!(a.nulls, b.nulls);
    assert_eq!(a.seed, 77);

    let other = map_cis(
        &data,
        None,
        &CisConfig {
            seed: Some(78),
            ..config
        },
    )
    .unwrap();
    assert_ne!(a.nulls[0].max_r2, other.nulls[0].max_r2);
}

#[test]
fn interaction_effect_is_recovered_with_covariates() {
    let n = 300;
    let mut rng = ChaCha8Rng::seed_from_u64(8);
    let standard = Normal::new(0.0, 1.0).unwrap();
    let noise = Normal::new(0.0, 0.5).unwrap();
    let dosages = random_dosages(&mut rng, 4, n);
    let inter: Array1<f64> = (0..n).map(|_| standard.sample(&mut rng)).collect();
    let covariate = Array2::from_shape_fn((1, n), |_| standard.sample(&mut rng));
    let values = Array2::from_shape_fn((1, n), |(_, s)| {
        let g = dosages[[1, s]];
        0.2 * g + 0.3 * inter[s] + 0.8 * g * inter[s] + 0.5 * covariate[[0, s]] + noise.sample(&mut rng)
    });

    let base = cis_dataset(dosages, values);
    let data = QtlDataset::new(
        base.genotypes,
        base.phenotypes,
        Some(CovariateMatrix::new(vec!["PC1".into()], ids("S", n), covariate).unwrap()),
        Some(InteractionTerm::new("age", ids("S", n), inter).unwrap()),
    )
    .unwrap();

    let out = map_nominal_interaction(&data, &CisConfig::default()).unwrap();
    assert_eq!(out.top.len(), 1);
    let top = &out.top[0];
    assert_eq!(top.variant.variant_id, "rs1");
    assert!((top.stats.gi.estimate - 0.8).abs() < 0.15, "b_gi = {}", top.stats.gi.estimate);
    assert!(top.stats.gi.pval < 1e-10);
    assert_eq!(top.stats.dof, (n - 1 - 4) as f64);
}

#[test]
fn sparse_trans_matches_thresholded_dense() {
    let n = 80;
    let mut rng = ChaCha8Rng::seed_from_u64(21);
    let noise = Normal::new(0.0, 1.0).unwrap();
    let dosages = random_dosages(&mut rng, 30, n);
    let mut values = Array2::from_shape_fn((6, n), |_| noise.sample(&mut rng));
    // two planted associations of different strength
    for s in 0..n {
        values[[2, s]] += 1.5 * dosages[[4, s]];
        values[[5, s]] += 0.6 * dosages[[17, s]];
    }
    let genotypes = GenotypeMatrix::new(ids("rs", 30), ids("S", n), dosages, None).unwrap();
    let phenotypes = PhenotypeMatrix::new(
        ids("gene", 6),
        ids("S", n),
        values,
        vec![GenomicPosition::new("chr2", 0); 6],
    )
    .unwrap();
    let data = QtlDataset::new(genotypes, phenotypes, None, None).unwrap();
    let config = TransConfig {
        batch_size: 7,
        pval_threshold: 1e-5,
        ..TransConfig::default()
    };

    let sparse = map_trans(&data, &config).unwrap();
    let dense = map_trans(
        &data,
        &TransConfig {
            return_dense: true,
            ..config.clone()
        },
    )
    .unwrap()
    .dense
    .unwrap();

    let expected: HashSet<(String, String)> = dense
        .pval
        .indexed_iter()
        .filter(|(_, &p)| p < 1e-5)
        .map(|((i, j), _)| (dense.variant_ids[i].clone(), dense.phenotype_ids[j].clone()))
        .collect();
    let got: HashSet<(String, String)> = sparse
        .pairs
        .iter()
        .map(|p| (p.variant_id.clone(), p.phenotype_id.clone()))
        .collect();
    assert!(got.contains(&("rs4".to_string(), "gene2".to_string())));
    assert_eq!(got, expected);
}

#[test]
fn cis_exclusion_boundary_is_inclusive() {
    let window = 5_000_000;
    let pair = |variant_index: usize| TransPair {
        variant_index,
        phenotype_index: 0,
        variant_id: format!("rs{}", variant_index),
        phenotype_id: "gene0".into(),
        af: 0.3,
        stats: qtlscan::association::AssociationStats::SENTINEL,
        pval_perm: None,
        pval_beta: None,
    };
    let phenotype_positions = vec![GenomicPosition::new("chr1", 10_000_000)];
    let variant_positions = vec![
        GenomicPosition::new("chr1", 10_000_000 + window),
        GenomicPosition::new("chr1", 10_000_000 + window + 1),
        GenomicPosition::new("chr1", 10_000_000 - window),
        GenomicPosition::new("chr1", 10_000_000 - window - 1),
        GenomicPosition::new("chr2", 10_000_000),
    ];
    let kept = filter_cis(
        (0..5).map(pair).collect(),
        &variant_positions,
        &phenotype_positions,
        window,
    );
    let kept: Vec<usize> = kept.iter().map(|p| p.variant_index).collect();
    assert_eq!(kept, vec![1, 3, 4]);
}
