//! Runs every estimator over a generated/reference pair of feature stores.
//!
//! A metric that fails is reported as NaN and logged; the remaining metrics
//! are still computed.

use crate::features::FeatureStore;
use crate::metrics::{
    frechet_distance, inception_score, kernel_distance, kl_divergence, MetricError, MetricsConfig,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// The six result fields, in report order.
pub const METRIC_KEYS: [&str; 6] = [
    "kullback_leibler_divergence",
    "inception_score_mean",
    "inception_score_std",
    "frechet_inception_distance",
    "kernel_inception_distance_mean",
    "kernel_inception_distance_std",
];

/// Merged evaluation result. NaN marks a metric that could not be computed
/// (serialised as `null`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricReport {
    pub kullback_leibler_divergence: f64,
    pub inception_score_mean: f64,
    pub inception_score_std: f64,
    pub frechet_inception_distance: f64,
    pub kernel_inception_distance_mean: f64,
    pub kernel_inception_distance_std: f64,
}

impl MetricReport {
    /// A report with every metric unavailable.
    pub fn unavailable() -> Self {
        Self {
            kullback_leibler_divergence: f64::NAN,
            inception_score_mean: f64::NAN,
            inception_score_std: f64::NAN,
            frechet_inception_distance: f64::NAN,
            kernel_inception_distance_mean: f64::NAN,
            kernel_inception_distance_std: f64::NAN,
        }
    }

    pub fn entries(&self) -> [(&'static str, f64); 6] {
        [
            (METRIC_KEYS[0], self.kullback_leibler_divergence),
            (METRIC_KEYS[1], self.inception_score_mean),
            (METRIC_KEYS[2], self.inception_score_std),
            (METRIC_KEYS[3], self.frechet_inception_distance),
            (METRIC_KEYS[4], self.kernel_inception_distance_mean),
            (METRIC_KEYS[5], self.kernel_inception_distance_std),
        ]
    }

    pub fn to_map(&self) -> BTreeMap<&'static str, f64> {
        self.entries().into_iter().collect()
    }
}

impl fmt::Display for MetricReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KL: {:8.5}; ISc: {:8.5} ({:5}); FID: {:8.5}; KID: {:.5} ({:.5})",
            self.kullback_leibler_divergence,
            self.inception_score_mean,
            self.inception_score_std,
            self.frechet_inception_distance,
            self.kernel_inception_distance_mean,
            self.kernel_inception_distance_std
        )
    }
}

pub struct Evaluator {
    config: MetricsConfig,
    workers: usize,
}

impl Evaluator {
    pub fn new(config: MetricsConfig) -> Self {
        Self { config, workers: 0 }
    }

    /// Threads for the parallel estimators; 0 lets rayon decide.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Compare `generated` against `reference`. The Inception Score only looks
    /// at `generated`.
    pub fn evaluate(&self, generated: &FeatureStore, reference: &FeatureStore) -> MetricReport {
        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
        {
            Ok(pool) => pool.install(|| self.run(generated, reference)),
            Err(e) => {
                log::warn!("Failed to build a {}-thread pool ({}), using the global pool", self.workers, e);
                self.run(generated, reference)
            }
        }
    }

    fn run(&self, generated: &FeatureStore, reference: &FeatureStore) -> MetricReport {
        let cfg = &self.config;
        log::info!(
            "Evaluating {} generated against {} reference samples",
            generated.len(),
            reference.len()
        );

        let kl = settle(
            "kullback_leibler_divergence",
            kl_divergence(generated, reference, &cfg.logits_layer, cfg.same_name),
        );
        let (is_mean, is_std) = settle_pair(
            "inception_score",
            inception_score(generated, &cfg.logits_layer, &cfg.isc),
        );
        let fid = settle(
            "frechet_inception_distance",
            frechet_distance(generated, reference, &cfg.embedding_layer),
        );
        let (kid_mean, kid_std) = settle_pair(
            "kernel_inception_distance",
            kernel_distance(generated, reference, &cfg.embedding_layer, &cfg.kid),
        );

        let report = MetricReport {
            kullback_leibler_divergence: kl,
            inception_score_mean: is_mean,
            inception_score_std: is_std,
            frechet_inception_distance: fid,
            kernel_inception_distance_mean: kid_mean,
            kernel_inception_distance_std: kid_std,
        };
        log::info!("{}", report);
        report
    }
}

fn settle(name: &str, result: Result<f64, MetricError>) -> f64 {
    match result {
        Ok(value) => {
            log::info!("{}: {:.7}", name, value);
            value
        }
        Err(e) => {
            log::warn!("{} unavailable: {}", name, e);
            f64::NAN
        }
    }
}

fn settle_pair(name: &str, result: Result<(f64, f64), MetricError>) -> (f64, f64) {
    match result {
        Ok((mean, std)) => {
            log::info!("{}: {:.7} ± {:.7}", name, mean, std);
            (mean, std)
        }
        Err(e) => {
            log::warn!("{} unavailable: {}", name, e);
            (f64::NAN, f64::NAN)
        }
    }
}
