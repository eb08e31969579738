//! Feature-population comparison: sample alignment and the four estimators.

pub mod align;
pub mod fid;
pub mod isc;
pub mod kid;
pub mod kl;

use crate::features::{FeatureLayer, FeatureStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use align::{align, AlignedPair};
pub use fid::frechet_distance;
pub use isc::{inception_score, IscParams};
pub use kid::{kernel_distance, KidParams};
pub use kl::kl_divergence;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("Alignment failed, unmatched file ids: {}", .unmatched.join(", "))]
    Alignment { unmatched: Vec<String> },
    #[error("Alignment failed, base name '{name}' appears twice in the {side} store")]
    DuplicateName { name: String, side: &'static str },
    #[error("Alignment produced no pairs")]
    EmptyAlignment,
    #[error("Feature layer '{0}' is missing")]
    MissingFeatureLayer(String),
    #[error("Degenerate probability distribution in row {row}")]
    DegenerateDistribution { row: usize },
    #[error("Dimension mismatch on layer '{layer}': {left} vs {right}")]
    DimensionMismatch {
        layer: String,
        left: usize,
        right: usize,
    },
    #[error("Invalid split count {splits} for {samples} samples")]
    InvalidSplitCount { splits: usize, samples: usize },
    #[error("Invalid subset size {subset_size} x {subsets} (populations have {left} and {right} samples)")]
    InvalidSubsetSize {
        subset_size: usize,
        subsets: usize,
        left: usize,
        right: usize,
    },
    #[error("Kernel degree {0} is too large")]
    InvalidKernelDegree(u32),
    #[error("Need at least {needed} samples, got {got}")]
    InsufficientSamples { needed: usize, got: usize },
    #[error("Numerical failure: {0}")]
    NumericalFailure(String),
}

pub type Result<T> = std::result::Result<T, MetricError>;

/// Which layers and parameters the evaluation engine uses.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Pair KL samples by file name instead of searching for the best match.
    pub same_name: bool,
    pub logits_layer: String,
    pub embedding_layer: String,
    pub isc: IscParams,
    pub kid: KidParams,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            same_name: false,
            logits_layer: crate::LOGITS_LAYER.to_string(),
            embedding_layer: crate::EMBEDDING_LAYER.to_string(),
            isc: IscParams::default(),
            kid: KidParams::default(),
        }
    }
}

pub(crate) fn require_layer<'a>(store: &'a FeatureStore, name: &str) -> Result<&'a FeatureLayer> {
    store
        .layer(name)
        .ok_or_else(|| MetricError::MissingFeatureLayer(name.to_string()))
}

/// Fetch `name` from both stores and check the widths agree.
pub(crate) fn require_pair<'a>(
    a: &'a FeatureStore,
    b: &'a FeatureStore,
    name: &str,
) -> Result<(&'a FeatureLayer, &'a FeatureLayer)> {
    let la = require_layer(a, name)?;
    let lb = require_layer(b, name)?;
    if la.dim() != lb.dim() {
        return Err(MetricError::DimensionMismatch {
            layer: name.to_string(),
            left: la.dim(),
            right: lb.dim(),
        });
    }
    Ok((la, lb))
}

/// Log-probabilities of a logit row (max-shifted). `None` if any logit is non-finite.
pub(crate) fn log_softmax(logits: &[f64]) -> Option<Vec<f64>> {
    if logits.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let log_sum = logits.iter().map(|v| (v - max).exp()).sum::<f64>().ln();
    Some(logits.iter().map(|v| v - max - log_sum).collect())
}

/// Probabilities of a logit row (max-shifted). `None` if any logit is non-finite.
pub(crate) fn softmax(logits: &[f64]) -> Option<Vec<f64>> {
    if logits.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    Some(exps.into_iter().map(|e| e / sum).collect())
}

/// Mean and population standard deviation (divide by n).
pub(crate) fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}
