//! Kernel distance: unbiased polynomial-kernel MMD² averaged over seeded
//! random subsets. Each subset costs O(m²·D); `subsets` and `subset_size`
//! trade accuracy for time.

use super::{mean_std, require_pair, MetricError, Result};
use crate::features::{FeatureLayer, FeatureStore};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KidParams {
    pub subsets: usize,
    pub subset_size: usize,
    pub degree: u32,
    /// Kernel scale; `None` means `1 / D`.
    pub gamma: Option<f64>,
    pub coef0: f64,
    pub seed: u64,
}

impl Default for KidParams {
    fn default() -> Self {
        Self {
            subsets: 100,
            subset_size: 1000,
            degree: 3,
            gamma: None,
            coef0: 1.0,
            seed: 2020,
        }
    }
}

/// `k(x, y) = (γ·xᵀy + c₀)^d`
#[derive(Debug, Clone, Copy)]
struct PolynomialKernel {
    gamma: f64,
    coef0: f64,
    degree: i32,
}

impl PolynomialKernel {
    fn gram(&self, x: &DMatrix<f64>, y: &DMatrix<f64>) -> DMatrix<f64> {
        (x * y.transpose()).map(|dot| (self.gamma * dot + self.coef0).powi(self.degree))
    }
}

/// Mean and population std of the MMD² estimate over `subsets` subsets.
///
/// Subset `i` draws `subset_size` rows with replacement from each population
/// using a generator seeded with `seed + i`, so results do not depend on how
/// the subsets are scheduled across threads.
pub fn kernel_distance(
    a: &FeatureStore,
    b: &FeatureStore,
    layer: &str,
    params: &KidParams,
) -> Result<(f64, f64)> {
    let (la, lb) = require_pair(a, b, layer)?;
    let m = params.subset_size;
    if params.subsets == 0 || m < 2 || m > la.rows() || m > lb.rows() {
        return Err(MetricError::InvalidSubsetSize {
            subset_size: m,
            subsets: params.subsets,
            left: la.rows(),
            right: lb.rows(),
        });
    }

    let degree = i32::try_from(params.degree)
        .map_err(|_| MetricError::InvalidKernelDegree(params.degree))?;
    let kernel = PolynomialKernel {
        gamma: params.gamma.unwrap_or(1.0 / la.dim() as f64),
        coef0: params.coef0,
        degree,
    };
    log::debug!(
        "KID: {} subsets of {} samples, kernel {:?}",
        params.subsets,
        m,
        kernel
    );

    let mmds: Vec<f64> = (0..params.subsets)
        .into_par_iter()
        .map(|i| {
            let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(i as u64));
            let x = subsample(la, m, &mut rng);
            let y = subsample(lb, m, &mut rng);
            polynomial_mmd(&x, &y, &kernel)
        })
        .collect();

    Ok(mean_std(&mmds))
}

fn subsample(layer: &FeatureLayer, m: usize, rng: &mut StdRng) -> DMatrix<f64> {
    let indices: Vec<usize> = (0..m).map(|_| rng.random_range(0..layer.rows())).collect();
    layer.select_rows(&indices)
}

/// Unbiased MMD² between two equally sized samples (diagonals of the
/// within-sample kernels excluded).
fn polynomial_mmd(x: &DMatrix<f64>, y: &DMatrix<f64>, kernel: &PolynomialKernel) -> f64 {
    let m = x.nrows() as f64;
    let k_xx = kernel.gram(x, x);
    let k_yy = kernel.gram(y, y);
    let k_xy = kernel.gram(x, y);

    let off_diagonal = |k: &DMatrix<f64>| k.sum() - k.trace();
    (off_diagonal(&k_xx) + off_diagonal(&k_yy)) / (m * (m - 1.0)) - 2.0 * k_xy.sum() / (m * m)
}
