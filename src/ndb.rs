//! Number of statistically Different Bins (NDB).
//!
//! Reference embeddings are clustered with k-means; generated embeddings are
//! dropped into the same bins and each bin's proportion is compared with a
//! two-proportion z-test. A model that covers the reference modes evenly has
//! few different bins.

use crate::features::{FeatureLayer, FeatureStore};
use crate::metrics::{require_layer, MetricError};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NdbError {
    #[error("Invalid bin count {bins} for {samples} reference samples")]
    InvalidBinCount { bins: usize, samples: usize },
    #[error("Cannot draw {requested} query samples from {available}")]
    InvalidSampleCount { requested: usize, available: usize },
    #[error(transparent)]
    Metric(#[from] MetricError),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NdbParams {
    pub bins: usize,
    /// Z-score both populations with the reference statistics before binning.
    pub whiten: bool,
    /// Fixed |z| cutoff; `None` uses `significance` instead.
    pub z_threshold: Option<f64>,
    pub significance: f64,
    pub max_iterations: usize,
    pub seed: u64,
    /// Evaluate a seeded subsample of the generated set.
    pub query_samples: Option<usize>,
}

impl Default for NdbParams {
    fn default() -> Self {
        Self {
            bins: 10,
            whiten: false,
            z_threshold: None,
            significance: 0.05,
            max_iterations: 100,
            seed: 2020,
            query_samples: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BinResult {
    pub reference_proportion: f64,
    pub generated_proportion: f64,
    pub z_score: f64,
    pub different: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NdbReport {
    pub bins: Vec<BinResult>,
    pub different_bins: usize,
    pub ndb_ratio: f64,
    pub js_divergence: f64,
    pub query_samples: usize,
}

impl fmt::Display for NdbReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>4}  {:>9}  {:>9}  {:>8}", "bin", "reference", "generated", "z")?;
        for (i, bin) in self.bins.iter().enumerate() {
            writeln!(
                f,
                "{:>4}  {:>9.4}  {:>9.4}  {:>8.3}{}",
                i,
                bin.reference_proportion,
                bin.generated_proportion,
                bin.z_score,
                if bin.different { "  *" } else { "" }
            )?;
        }
        write!(
            f,
            "NDB: {}/{} = {:.3}; JS: {:.5} ({} samples)",
            self.different_bins,
            self.bins.len(),
            self.ndb_ratio,
            self.js_divergence,
            self.query_samples
        )
    }
}

/// Per-dimension z-score statistics of the reference population.
#[derive(Debug, Clone)]
struct Whitening {
    means: Vec<f64>,
    stds: Vec<f64>,
}

impl Whitening {
    fn fit(layer: &FeatureLayer) -> Self {
        let n = layer.rows() as f64;
        let dim = layer.dim();
        let mut means = vec![0.0_f64; dim];
        let mut vars = vec![0.0_f64; dim];

        for row in layer.iter_rows() {
            for (m, &val) in means.iter_mut().zip(row) {
                *m += val;
            }
        }
        for m in &mut means {
            *m /= n;
        }
        for row in layer.iter_rows() {
            for (d, &val) in row.iter().enumerate() {
                let diff = val - means[d];
                vars[d] += diff * diff;
            }
        }
        let stds = vars.iter().map(|v| (v / n).sqrt().max(1e-10)).collect();

        Self { means, stds }
    }

    fn apply(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .enumerate()
            .map(|(d, &val)| (val - self.means[d]) / self.stds[d])
            .collect()
    }
}

/// Bins fitted on a reference population.
pub struct NdbModel {
    layer: String,
    params: NdbParams,
    whitening: Option<Whitening>,
    centroids: Vec<Vec<f64>>,
    reference_proportions: Vec<f64>,
    reference_count: usize,
}

impl NdbModel {
    pub fn fit(reference: &FeatureStore, layer: &str, params: &NdbParams) -> Result<Self, NdbError> {
        let features = require_layer(reference, layer)?;
        let n = features.rows();
        if params.bins == 0 || params.bins > n {
            return Err(NdbError::InvalidBinCount {
                bins: params.bins,
                samples: n,
            });
        }

        let whitening = params.whiten.then(|| Whitening::fit(features));
        let points = prepare(features, whitening.as_ref());

        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut centroids = kmeans_plus_plus(&points, params.bins, &mut rng);
        let mut assignment = assign(&points, &centroids);
        let mut iterations = 0;
        while iterations < params.max_iterations {
            iterations += 1;
            update_centroids(&points, &assignment, &mut centroids);
            let next = assign(&points, &centroids);
            if next == assignment {
                break;
            }
            assignment = next;
        }
        log::debug!(
            "NDB: {} bins over {} reference samples after {} iterations",
            params.bins,
            n,
            iterations
        );

        let reference_proportions = proportions(&assignment, params.bins);
        Ok(Self {
            layer: layer.to_string(),
            params: params.clone(),
            whitening,
            centroids,
            reference_proportions,
            reference_count: n,
        })
    }

    pub fn bins(&self) -> usize {
        self.centroids.len()
    }

    pub fn reference_proportions(&self) -> &[f64] {
        &self.reference_proportions
    }

    pub fn evaluate(&self, generated: &FeatureStore) -> Result<NdbReport, NdbError> {
        let features = require_layer(generated, &self.layer)?;
        if features.dim() != self.centroids[0].len() {
            return Err(MetricError::DimensionMismatch {
                layer: self.layer.clone(),
                left: self.centroids[0].len(),
                right: features.dim(),
            }
            .into());
        }

        let available = features.rows();
        let points = match self.params.query_samples {
            Some(requested) => {
                if requested == 0 || requested > available {
                    return Err(NdbError::InvalidSampleCount {
                        requested,
                        available,
                    });
                }
                let mut rng = StdRng::seed_from_u64(self.params.seed);
                let mut indices = sample(&mut rng, available, requested).into_vec();
                indices.sort_unstable();
                indices
                    .iter()
                    .map(|&i| self.transform(features.row(i)))
                    .collect()
            }
            None => prepare(features, self.whitening.as_ref()),
        };
        let query_count = points.len();

        let generated_proportions = proportions(&assign(&points, &self.centroids), self.bins());

        let bins: Vec<BinResult> = self
            .reference_proportions
            .iter()
            .zip(&generated_proportions)
            .map(|(&p_ref, &p_gen)| {
                let z = two_proportion_z(p_ref, self.reference_count, p_gen, query_count);
                BinResult {
                    reference_proportion: p_ref,
                    generated_proportion: p_gen,
                    z_score: z,
                    different: self.is_different(z),
                }
            })
            .collect();

        let different_bins = bins.iter().filter(|b| b.different).count();
        let report = NdbReport {
            ndb_ratio: different_bins as f64 / bins.len() as f64,
            js_divergence: js_divergence(&self.reference_proportions, &generated_proportions),
            different_bins,
            bins,
            query_samples: query_count,
        };
        log::info!(
            "NDB: {} of {} bins differ (JS {:.5})",
            report.different_bins,
            self.bins(),
            report.js_divergence
        );
        Ok(report)
    }

    fn transform(&self, row: &[f64]) -> Vec<f64> {
        match &self.whitening {
            Some(w) => w.apply(row),
            None => row.to_vec(),
        }
    }

    fn is_different(&self, z: f64) -> bool {
        match self.params.z_threshold {
            Some(threshold) => z.abs() > threshold,
            None => two_sided_p(z) < self.params.significance,
        }
    }
}

fn prepare(layer: &FeatureLayer, whitening: Option<&Whitening>) -> Vec<Vec<f64>> {
    layer
        .iter_rows()
        .map(|row| match whitening {
            Some(w) => w.apply(row),
            None => row.to_vec(),
        })
        .collect()
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest(point: &[f64], centroids: &[Vec<f64>]) -> (usize, f64) {
    centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, squared_distance(point, c)))
        .fold((0, f64::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best })
}

/// k-means++ seeding: each new centre is drawn with probability proportional
/// to its squared distance from the nearest existing centre.
fn kmeans_plus_plus(points: &[Vec<f64>], k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(points[rng.random_range(0..points.len())].clone());

    let mut dist: Vec<f64> = points
        .iter()
        .map(|p| squared_distance(p, &centroids[0]))
        .collect();
    while centroids.len() < k {
        let total: f64 = dist.iter().sum();
        let chosen = if total > 0.0 {
            let target = rng.random::<f64>() * total;
            let mut acc = 0.0;
            dist.iter()
                .position(|d| {
                    acc += d;
                    acc > target
                })
                .unwrap_or(points.len() - 1)
        } else {
            // Every point coincides with a centre already
            rng.random_range(0..points.len())
        };
        let centre = points[chosen].clone();
        for (d, p) in dist.iter_mut().zip(points) {
            *d = d.min(squared_distance(p, &centre));
        }
        centroids.push(centre);
    }
    centroids
}

fn assign(points: &[Vec<f64>], centroids: &[Vec<f64>]) -> Vec<usize> {
    points
        .par_iter()
        .map(|p| nearest(p, centroids).0)
        .collect()
}

/// Move each centroid to the mean of its members. Empty bins keep their centre.
fn update_centroids(points: &[Vec<f64>], assignment: &[usize], centroids: &mut [Vec<f64>]) {
    let dim = centroids[0].len();
    let mut sums = vec![vec![0.0_f64; dim]; centroids.len()];
    let mut counts = vec![0usize; centroids.len()];
    for (p, &bin) in points.iter().zip(assignment) {
        counts[bin] += 1;
        for (s, v) in sums[bin].iter_mut().zip(p) {
            *s += v;
        }
    }
    for ((c, s), &count) in centroids.iter_mut().zip(sums).zip(&counts) {
        if count > 0 {
            *c = s.into_iter().map(|v| v / count as f64).collect();
        }
    }
}

fn proportions(assignment: &[usize], bins: usize) -> Vec<f64> {
    let mut counts = vec![0usize; bins];
    for &bin in assignment {
        counts[bin] += 1;
    }
    counts
        .into_iter()
        .map(|c| c as f64 / assignment.len() as f64)
        .collect()
}

/// Pooled two-proportion z statistic. Zero when both proportions are 0 or 1.
fn two_proportion_z(p1: f64, n1: usize, p2: f64, n2: usize) -> f64 {
    let (n1, n2) = (n1 as f64, n2 as f64);
    let pooled = (p1 * n1 + p2 * n2) / (n1 + n2);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if se > 0.0 { (p1 - p2) / se } else { 0.0 }
}

/// `2 (1 − Φ(|z|))`
fn two_sided_p(z: f64) -> f64 {
    libm::erfc(z.abs() / std::f64::consts::SQRT_2)
}

/// Jensen-Shannon divergence (natural log) between two histograms.
fn js_divergence(p: &[f64], q: &[f64]) -> f64 {
    let kl_to_mid = |a: &[f64], b: &[f64]| -> f64 {
        a.iter()
            .zip(b)
            .filter(|(x, _)| **x > 0.0)
            .map(|(x, y)| x * (2.0 * x / (x + y)).ln())
            .sum()
    };
    0.5 * kl_to_mid(p, q) + 0.5 * kl_to_mid(q, p)
}
