use audiogen_eval::engine::Evaluator;
use audiogen_eval::features::FeatureStore;
use audiogen_eval::metrics::{
    align, frechet_distance, inception_score, kernel_distance, kl_divergence, IscParams,
    KidParams, MetricError, MetricsConfig,
};
use audiogen_eval::ndb::{NdbModel, NdbParams};
use audiogen_eval::{EMBEDDING_LAYER, LOGITS_LAYER};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

const SAMPLES: usize = 50;
const CLASSES: usize = 10;
const WIDTH: usize = 2048;

fn random_rows(rng: &mut StdRng, n: usize, width: usize, range: f64) -> Vec<Vec<f64>> {
    (0..n)
        .map(|_| (0..width).map(|_| rng.random_range(-range..range)).collect())
        .collect()
}

fn store(ids: Vec<String>, logits: Vec<Vec<f64>>, embedding: Vec<Vec<f64>>) -> FeatureStore {
    let mut layers = BTreeMap::new();
    layers.insert(LOGITS_LAYER.to_string(), logits);
    layers.insert(EMBEDDING_LAYER.to_string(), embedding);
    FeatureStore::new(ids, layers).unwrap()
}

/// 50 clips with 10-class logits and a 2048-wide embedding.
fn scenario_store(seed: u64, width: usize) -> FeatureStore {
    let mut rng = StdRng::seed_from_u64(seed);
    let logits = random_rows(&mut rng, SAMPLES, CLASSES, 4.0);
    let embedding = random_rows(&mut rng, SAMPLES, width, 1.0);
    let ids = (0..SAMPLES).map(|i| format!("gen/clip_{:02}.wav", i)).collect();
    store(ids, logits, embedding)
}

fn scenario_kid() -> KidParams {
    KidParams {
        subsets: 10,
        subset_size: 50,
        ..KidParams::default()
    }
}

#[test]
fn test_store_against_itself() {
    let a = scenario_store(2020, WIDTH);

    let kl = kl_divergence(&a, &a, LOGITS_LAYER, true).unwrap();
    assert!(kl.abs() < 1e-9, "kl = {}", kl);
    let kl_unpaired = kl_divergence(&a, &a, LOGITS_LAYER, false).unwrap();
    assert!(kl_unpaired.abs() < 1e-9, "kl = {}", kl_unpaired);

    let fid = frechet_distance(&a, &a, EMBEDDING_LAYER).unwrap();
    assert!(fid.abs() < 1e-3, "fid = {}", fid);

    let (kid_mean, kid_std) = kernel_distance(&a, &a, EMBEDDING_LAYER, &scenario_kid()).unwrap();
    assert!(
        kid_mean.abs() < 4.0 * kid_std / (10f64).sqrt() + 1e-3,
        "kid = {} ± {}",
        kid_mean,
        kid_std
    );

    let (is_mean, is_std) = inception_score(&a, LOGITS_LAYER, &IscParams::default()).unwrap();
    assert!(is_mean >= 1.0 && is_mean <= CLASSES as f64);
    assert!(is_std >= 0.0);
}

#[test]
fn test_shifted_population_fid_is_squared_offset() {
    let a = scenario_store(1, WIDTH);
    let shift: Vec<f64> = (0..WIDTH).map(|d| if d % 2 == 0 { 0.05 } else { -0.05 }).collect();
    let shifted_rows: Vec<Vec<f64>> = a
        .layer(EMBEDDING_LAYER)
        .unwrap()
        .iter_rows()
        .map(|r| r.iter().zip(&shift).map(|(v, c)| v + c).collect())
        .collect();
    let logits = a
        .layer(LOGITS_LAYER)
        .unwrap()
        .iter_rows()
        .map(|r| r.to_vec())
        .collect();
    let b = store(a.file_ids().to_vec(), logits, shifted_rows);

    let expected: f64 = shift.iter().map(|c| c * c).sum();
    let fid = frechet_distance(&a, &b, EMBEDDING_LAYER).unwrap();
    assert!((fid - expected).abs() < 1e-3, "fid = {}, expected {}", fid, expected);

    let ba = frechet_distance(&b, &a, EMBEDDING_LAYER).unwrap();
    assert!((fid - ba).abs() < 1e-3);
}

#[test]
fn test_independent_populations_are_apart() {
    let a = scenario_store(1, 64);
    let b = scenario_store(2, 64);
    let fid = frechet_distance(&a, &b, EMBEDDING_LAYER).unwrap();
    let kl = kl_divergence(&a, &b, LOGITS_LAYER, false).unwrap();
    assert!(fid > 0.0);
    assert!(kl >= 0.0);
}

#[test]
fn test_width_mismatch() {
    let a = scenario_store(1, WIDTH);
    let b = scenario_store(2, 1024);
    assert_eq!(
        frechet_distance(&a, &b, EMBEDDING_LAYER).unwrap_err(),
        MetricError::DimensionMismatch {
            layer: EMBEDDING_LAYER.to_string(),
            left: WIDTH,
            right: 1024
        }
    );
    assert!(matches!(
        kernel_distance(&a, &b, EMBEDDING_LAYER, &scenario_kid()),
        Err(MetricError::DimensionMismatch { .. })
    ));
}

#[test]
fn test_file_only_in_one_store_fails_alignment() {
    let mut rng = StdRng::seed_from_u64(3);
    let a = store(
        vec!["a/x.wav".into(), "a/y.wav".into(), "a/only_here.wav".into()],
        random_rows(&mut rng, 3, CLASSES, 1.0),
        random_rows(&mut rng, 3, 4, 1.0),
    );
    let b = store(
        vec!["b/y.flac".into(), "b/x.flac".into()],
        random_rows(&mut rng, 2, CLASSES, 1.0),
        random_rows(&mut rng, 2, 4, 1.0),
    );

    let expected = MetricError::Alignment {
        unmatched: vec!["a/only_here.wav".to_string()],
    };
    assert_eq!(align(&a, &b, true).unwrap_err(), expected);
    assert_eq!(kl_divergence(&a, &b, LOGITS_LAYER, true).unwrap_err(), expected);
    assert!(expected.to_string().contains("a/only_here.wav"));
}

#[test]
fn test_same_name_alignment_matches_base_names() {
    let mut rng = StdRng::seed_from_u64(4);
    let a = store(
        vec!["gen/b.wav".into(), "gen/a.wav".into(), "gen/c.wav".into()],
        random_rows(&mut rng, 3, CLASSES, 1.0),
        random_rows(&mut rng, 3, 4, 1.0),
    );
    let b = store(
        vec!["ref/c.flac".into(), "ref/b.flac".into(), "ref/a.flac".into()],
        random_rows(&mut rng, 3, CLASSES, 1.0),
        random_rows(&mut rng, 3, 4, 1.0),
    );

    let pair = align(&a, &b, true).unwrap();
    assert_eq!(pair.len(), 3);
    for (i, j) in pair.pairs() {
        let stem = |id: &str| id.rsplit('/').next().unwrap().split('.').next().unwrap().to_string();
        assert_eq!(stem(&a.file_ids()[i]), stem(&b.file_ids()[j]));
    }

    let positional = align(&a, &b, false).unwrap();
    assert_eq!(positional.idx_a, vec![0, 1, 2]);
    assert_eq!(positional.idx_b, vec![0, 1, 2]);
}

#[test]
fn test_deterministic_across_runs_and_workers() {
    let a = scenario_store(7, 32);
    let b = scenario_store(8, 32);
    let config = MetricsConfig {
        kid: KidParams {
            subsets: 12,
            subset_size: 20,
            ..KidParams::default()
        },
        ..MetricsConfig::default()
    };

    let single = Evaluator::new(config.clone()).with_workers(1).evaluate(&a, &b);
    let again = Evaluator::new(config.clone()).with_workers(1).evaluate(&a, &b);
    let many = Evaluator::new(config).with_workers(4).evaluate(&a, &b);

    for ((key, x), ((_, y), (_, z))) in single
        .entries()
        .into_iter()
        .zip(again.entries().into_iter().zip(many.entries()))
    {
        assert!(x.is_finite(), "{} = {}", key, x);
        assert_eq!(x.to_bits(), y.to_bits(), "{} differs between runs", key);
        assert_eq!(x.to_bits(), z.to_bits(), "{} differs across worker counts", key);
    }
}

#[test]
fn test_engine_reports_nan_for_missing_layer() {
    let mut rng = StdRng::seed_from_u64(9);
    let logits_only = |rng: &mut StdRng| {
        let mut layers = BTreeMap::new();
        layers.insert(LOGITS_LAYER.to_string(), random_rows(rng, 20, CLASSES, 2.0));
        let ids = (0..20).map(|i| format!("{}.wav", i)).collect();
        FeatureStore::new(ids, layers).unwrap()
    };
    let a = logits_only(&mut rng);
    let b = logits_only(&mut rng);

    let report = Evaluator::new(MetricsConfig::default()).evaluate(&a, &b);
    assert!(report.kullback_leibler_divergence.is_finite());
    assert!(report.inception_score_mean.is_finite());
    assert!(report.inception_score_std.is_finite());
    assert!(report.frechet_inception_distance.is_nan());
    assert!(report.kernel_inception_distance_mean.is_nan());
    assert!(report.kernel_inception_distance_std.is_nan());

    let json = serde_json::to_value(report).unwrap();
    assert!(json["frechet_inception_distance"].is_null());
}

#[test]
fn test_saved_store_evaluates_identically() {
    let a = scenario_store(11, 16);
    let b = scenario_store(12, 16);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("generated.json");
    a.save(&path).unwrap();
    let loaded = FeatureStore::load(&path).unwrap();
    assert_eq!(loaded, a);

    let config = MetricsConfig {
        kid: KidParams {
            subsets: 5,
            subset_size: 20,
            ..KidParams::default()
        },
        ..MetricsConfig::default()
    };
    let before = Evaluator::new(config.clone()).evaluate(&a, &b);
    let after = Evaluator::new(config).evaluate(&loaded, &b);
    assert_eq!(before, after);
}

#[test]
fn test_ndb_on_matching_and_collapsed_sets() {
    let reference = scenario_store(21, 8);
    let matching = reference.clone();
    let params = NdbParams {
        bins: 5,
        ..NdbParams::default()
    };
    let model = NdbModel::fit(&reference, EMBEDDING_LAYER, &params).unwrap();
    let report = model.evaluate(&matching).unwrap();
    assert_eq!(report.different_bins, 0);

    // Every generated sample is a copy of the first reference sample
    let first = reference.layer(EMBEDDING_LAYER).unwrap().row(0).to_vec();
    let mut rng = StdRng::seed_from_u64(22);
    let collapsed = store(
        (0..SAMPLES).map(|i| format!("{}.wav", i)).collect(),
        random_rows(&mut rng, SAMPLES, CLASSES, 1.0),
        vec![first; SAMPLES],
    );
    let report = model.evaluate(&collapsed).unwrap();
    assert!(report.different_bins > 0);
    assert!(report.js_divergence > 0.0);
}
