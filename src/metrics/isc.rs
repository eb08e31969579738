//! Inception Score of a single population's logits.

use super::{log_softmax, mean_std, require_layer, MetricError, Result};
use crate::features::{FeatureLayer, FeatureStore};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IscParams {
    pub splits: usize,
    /// Shuffle rows (seeded) before splitting.
    pub shuffle: bool,
    pub seed: u64,
}

impl Default for IscParams {
    fn default() -> Self {
        Self {
            splits: 4,
            shuffle: true,
            seed: 2020,
        }
    }
}

/// Inception Score mean and population std over `splits` contiguous chunks.
///
/// Each chunk scores `exp(mean_i KL(p_i ‖ q))` with `q` the chunk's marginal
/// class distribution. With `splits = 1` the std is 0.
pub fn inception_score(store: &FeatureStore, layer: &str, params: &IscParams) -> Result<(f64, f64)> {
    let logits = require_layer(store, layer)?;
    let n = logits.rows();
    if params.splits == 0 || params.splits > n {
        return Err(MetricError::InvalidSplitCount {
            splits: params.splits,
            samples: n,
        });
    }

    let mut order: Vec<usize> = (0..n).collect();
    if params.shuffle {
        let mut rng = StdRng::seed_from_u64(params.seed);
        order.shuffle(&mut rng);
    }

    let scores: Vec<f64> = split_bounds(n, params.splits)
        .into_par_iter()
        .map(|range| chunk_score(logits, &order[range]))
        .collect::<Result<_>>()?;
    log::debug!("Inception score per split: {:?}", scores);

    Ok(mean_std(&scores))
}

/// Contiguous chunk ranges covering `0..n`. Every chunk has `n / splits` rows
/// and the first `n % splits` chunks take one extra row each.
pub(crate) fn split_bounds(n: usize, splits: usize) -> Vec<Range<usize>> {
    let base = n / splits;
    let extra = n % splits;
    let mut start = 0;
    (0..splits)
        .map(|i| {
            let len = base + usize::from(i < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

fn chunk_score(logits: &FeatureLayer, rows: &[usize]) -> Result<f64> {
    let log_probs: Vec<Vec<f64>> = rows
        .iter()
        .map(|&row| log_softmax(logits.row(row)).ok_or(MetricError::DegenerateDistribution { row }))
        .collect::<Result<_>>()?;

    let classes = logits.dim();
    let mut marginal = vec![0.0_f64; classes];
    for lp in &log_probs {
        for (m, l) in marginal.iter_mut().zip(lp) {
            *m += l.exp();
        }
    }
    let log_marginal: Vec<f64> = marginal
        .iter()
        .map(|m| (m / log_probs.len() as f64).ln())
        .collect();

    let mean_kl = log_probs
        .iter()
        .map(|lp| {
            lp.iter()
                .zip(&log_marginal)
                .map(|(l, lq)| {
                    let p = l.exp();
                    // 0 · log 0 contributes nothing
                    if p > 0.0 { p * (l - lq) } else { 0.0 }
                })
                .sum::<f64>()
        })
        .sum::<f64>()
        / log_probs.len() as f64;

    Ok(mean_kl.exp())
}
