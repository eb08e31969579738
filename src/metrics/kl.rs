//! Kullback-Leibler divergence between the class distributions of two stores.

use super::{align, require_pair, softmax, MetricError, Result};
use crate::features::{FeatureLayer, FeatureStore};
use rayon::prelude::*;

/// Floor added to every probability before taking its log.
pub const KL_EPS: f64 = 1e-6;

/// A softmaxed logit row with its floored log, ready for repeated KL terms.
struct Distribution {
    p: Vec<f64>,
    log_floored: Vec<f64>,
}

/// Mean `KL(p_a ‖ p_b)` over the two stores' logits.
///
/// With `same_name`, rows are paired by file name and the per-pair divergences
/// are averaged. Otherwise every row of `a` is matched to the row of `b` with
/// the smallest divergence; this search is O(N_a · N_b · C).
pub fn kl_divergence(
    a: &FeatureStore,
    b: &FeatureStore,
    layer: &str,
    same_name: bool,
) -> Result<f64> {
    let (la, lb) = require_pair(a, b, layer)?;
    let dist_a = distributions(la)?;
    let dist_b = distributions(lb)?;

    let divergences: Vec<f64> = if same_name {
        let pair = align(a, b, true)?;
        pair.pairs()
            .map(|(i, j)| categorical_kl(&dist_a[i], &dist_b[j]))
            .collect()
    } else {
        log::debug!(
            "Unpaired KL: best-match search over {} x {} rows",
            dist_a.len(),
            dist_b.len()
        );
        dist_a
            .par_iter()
            .map(|p| {
                dist_b
                    .iter()
                    .map(|q| categorical_kl(p, q))
                    .fold(f64::INFINITY, f64::min)
            })
            .collect()
    };

    Ok(divergences.iter().sum::<f64>() / divergences.len() as f64)
}

fn distributions(layer: &FeatureLayer) -> Result<Vec<Distribution>> {
    layer
        .iter_rows()
        .enumerate()
        .map(|(row, logits)| {
            let p = softmax(logits).ok_or(MetricError::DegenerateDistribution { row })?;
            let mass: f64 = p.iter().map(|v| v + KL_EPS).sum();
            if !(mass.is_finite() && mass > 0.0) {
                return Err(MetricError::DegenerateDistribution { row });
            }
            let log_floored = p.iter().map(|v| (v + KL_EPS).ln()).collect();
            Ok(Distribution { p, log_floored })
        })
        .collect()
}

fn categorical_kl(p: &Distribution, q: &Distribution) -> f64 {
    p.p.iter()
        .zip(p.log_floored.iter().zip(q.log_floored.iter()))
        .map(|(pi, (lp, lq))| pi * (lp - lq))
        .sum()
}
