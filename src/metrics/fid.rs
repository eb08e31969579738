//! Fréchet distance between Gaussian fits of two feature populations.
//!
//! `FID = ‖μ_a − μ_b‖² + tr(Σ_a) + tr(Σ_b) − 2·tr(sqrtm(Σ_a Σ_b))`
//!
//! The trace of the matrix square root is the sum of the square roots of the
//! eigenvalues of the symmetric matrix `Σ_a^½ Σ_b Σ_a^½`, which shares its
//! spectrum with `Σ_a Σ_b`. That costs O(D³) and dominates for wide layers.
//! A near-singular covariance gets `ε·I` added to both covariances, and the
//! trace terms are taken from the same regularised matrices, so the distance
//! of a population to itself stays 0. When a population has no more samples
//! than dimensions its covariance is singular by construction; the
//! regularised traces are then computed exactly in the subspace spanned by
//! the pooled samples.

use super::{require_pair, MetricError, Result};
use crate::features::{FeatureLayer, FeatureStore};
use nalgebra::{DMatrix, DVector, Dyn, SymmetricEigen};

/// Multiple of the identity added to both covariances when either is (near-)singular.
pub const FID_EPS: f64 = 1e-6;

/// Largest imaginary root magnitude, relative to `max(1, largest real root)`,
/// accepted silently. Roots above it are still dropped, with a warning.
/// Changing this changes which runs warn, never the returned value.
pub const IMAGINARY_TOLERANCE: f64 = 1e-3;

/// A covariance is near-singular when `min_eig ≤ SINGULAR_RTOL · max_eig`.
pub const SINGULAR_RTOL: f64 = 1e-10;

/// Mean and centred samples of one population.
struct Population {
    mu: DVector<f64>,
    centred: DMatrix<f64>,
}

impl Population {
    fn new(layer: &FeatureLayer) -> Result<Self> {
        if layer.rows() < 2 {
            return Err(MetricError::InsufficientSamples {
                needed: 2,
                got: layer.rows(),
            });
        }
        let n = layer.rows();
        let mut mu = DVector::<f64>::zeros(layer.dim());
        for row in layer.iter_rows() {
            for (m, v) in mu.iter_mut().zip(row) {
                *m += v;
            }
        }
        mu /= n as f64;
        let centred = DMatrix::from_fn(n, layer.dim(), |r, c| layer.row(r)[c] - mu[c]);
        Ok(Self { mu, centred })
    }

    fn n(&self) -> usize {
        self.centred.nrows()
    }

    /// Unbiased covariance (divide by N − 1).
    fn covariance(&self) -> DMatrix<f64> {
        self.centred.tr_mul(&self.centred) / (self.n() - 1) as f64
    }

    fn covariance_trace(&self) -> f64 {
        self.centred.norm_squared() / (self.n() - 1) as f64
    }
}

/// `tr(Σ_a)`, `tr(Σ_b)` and `tr(sqrtm(Σ_a Σ_b))`, all taken from the same
/// (possibly regularised) covariances.
#[derive(Debug, Clone, Copy)]
struct TraceTerms {
    tr_a: f64,
    tr_b: f64,
    tr_covmean: f64,
}

/// Fréchet distance between the `layer` populations of two stores.
pub fn frechet_distance(a: &FeatureStore, b: &FeatureStore, layer: &str) -> Result<f64> {
    let (la, lb) = require_pair(a, b, layer)?;
    let pop_a = Population::new(la)?;
    let pop_b = Population::new(lb)?;
    let dim = la.dim();

    let mean_term = (&pop_a.mu - &pop_b.mu).norm_squared();

    let low_rank = pop_a.n() <= dim || pop_b.n() <= dim;
    let terms = if low_rank {
        log::debug!(
            "FID: {} and {} samples in {} dims, regularising in the sample subspace",
            pop_a.n(),
            pop_b.n(),
            dim
        );
        match subspace_terms(&pop_a, &pop_b) {
            Some(t) => t,
            None => {
                log::warn!("FID: subspace square root is not finite, falling back to full covariances");
                regularised_terms(&pop_a.covariance(), &pop_b.covariance())?
            }
        }
    } else {
        covariance_terms(&pop_a.covariance(), &pop_b.covariance())?
    };

    let fid = mean_term + terms.tr_a + terms.tr_b - 2.0 * terms.tr_covmean;
    if !fid.is_finite() {
        return Err(MetricError::NumericalFailure(format!(
            "Fréchet distance evaluated to {}",
            fid
        )));
    }
    Ok(fid)
}

/// Trace terms from full covariances, regularising near-singular input.
fn covariance_terms(sigma_a: &DMatrix<f64>, sigma_b: &DMatrix<f64>) -> Result<TraceTerms> {
    let (Some(eig_a), Some(eig_b)) = (symmetric_eigen(sigma_a), symmetric_eigenvalues(sigma_b))
    else {
        return Err(MetricError::NumericalFailure(
            "covariance has non-finite entries".to_string(),
        ));
    };

    if near_singular(&eig_a.eigenvalues) || near_singular(&eig_b) {
        log::debug!("FID: near-singular covariance, adding {:e}·I to both", FID_EPS);
        return regularised_terms(sigma_a, sigma_b);
    }

    let root_a = psd_sqrt(&eig_a);
    match root_trace(&root_a * sigma_b * &root_a) {
        Some(t) => Ok(TraceTerms {
            tr_a: sigma_a.trace(),
            tr_b: sigma_b.trace(),
            tr_covmean: t,
        }),
        None => {
            log::warn!("FID: matrix square root is not finite, retrying with {:e}·I", FID_EPS);
            regularised_terms(sigma_a, sigma_b)
        }
    }
}

/// Trace terms of `Σ_a + εI` and `Σ_b + εI`.
fn regularised_terms(sigma_a: &DMatrix<f64>, sigma_b: &DMatrix<f64>) -> Result<TraceTerms> {
    let offset = DMatrix::<f64>::identity(sigma_a.nrows(), sigma_a.ncols()) * FID_EPS;
    let reg_a = sigma_a + &offset;
    let reg_b = sigma_b + &offset;
    let eig_a = symmetric_eigen(&reg_a).ok_or_else(|| {
        MetricError::NumericalFailure("regularised covariance has non-finite entries".to_string())
    })?;
    let root_a = psd_sqrt(&eig_a);
    let tr_covmean = root_trace(&root_a * &reg_b * &root_a).ok_or_else(|| {
        MetricError::NumericalFailure("matrix square root is not finite after regularisation".to_string())
    })?;
    Ok(TraceTerms {
        tr_a: reg_a.trace(),
        tr_b: reg_b.trace(),
        tr_covmean,
    })
}

/// Regularised trace terms for populations with no more samples than
/// dimensions, without forming a `D × D` matrix.
///
/// Both covariances live in the span `Q` (`D × r`) of the pooled centred
/// samples. With `S = QᵀΣQ`, `(Σ_a + εI)(Σ_b + εI)` has the eigenvalues of
/// `(S_a + εI)(S_b + εI)` plus `ε²` with multiplicity `D − r`.
fn subspace_terms(a: &Population, b: &Population) -> Option<TraceTerms> {
    let dim = a.centred.ncols();
    let (na, nb) = (a.n(), b.n());
    let offset = dim as f64 * FID_EPS;

    let pooled = DMatrix::from_fn(na + nb, dim, |r, c| {
        if r < na { a.centred[(r, c)] } else { b.centred[(r - na, c)] }
    });
    let gram = symmetric_eigen(&(&pooled * pooled.transpose()))?;
    let max = gram.eigenvalues.max();
    let kept: Vec<usize> = (0..gram.eigenvalues.len())
        .filter(|&i| max > 0.0 && gram.eigenvalues[i] > SINGULAR_RTOL * max)
        .collect();
    let rank = kept.len();
    if rank == 0 {
        // Both populations are a single point each
        return Some(TraceTerms {
            tr_a: offset,
            tr_b: offset,
            tr_covmean: offset,
        });
    }

    let scaled = DMatrix::from_fn(na + nb, rank, |i, k| {
        gram.eigenvectors[(i, kept[k])] / gram.eigenvalues[kept[k]].sqrt()
    });
    let basis = pooled.tr_mul(&scaled);

    let projected = |p: &Population| {
        let coords = &p.centred * &basis;
        coords.tr_mul(&coords) / (p.n() - 1) as f64
            + DMatrix::<f64>::identity(rank, rank) * FID_EPS
    };
    let s_a = projected(a);
    let s_b = projected(b);
    let root_a = psd_sqrt(&symmetric_eigen(&s_a)?);
    let inner = root_trace(&root_a * s_b * &root_a)?;

    Some(TraceTerms {
        tr_a: a.covariance_trace() + offset,
        tr_b: b.covariance_trace() + offset,
        tr_covmean: inner + dim.saturating_sub(rank) as f64 * FID_EPS,
    })
}

/// Sum of the real square roots of a (numerically) symmetric PSD matrix's
/// eigenvalues. Negative eigenvalues would give imaginary roots; they are
/// numerical error and only their real part (zero) is kept.
fn root_trace(m: DMatrix<f64>) -> Option<f64> {
    let eigenvalues = symmetric_eigenvalues(&m)?;

    let mut trace = 0.0_f64;
    let mut max_real = 0.0_f64;
    let mut max_imag = 0.0_f64;
    for &value in eigenvalues.iter() {
        if value >= 0.0 {
            let root = value.sqrt();
            trace += root;
            max_real = max_real.max(root);
        } else {
            max_imag = max_imag.max((-value).sqrt());
        }
    }

    if max_imag > IMAGINARY_TOLERANCE * max_real.max(1.0) {
        log::warn!(
            "FID: imaginary component {:.3e} in matrix square root, keeping the real part",
            max_imag
        );
    }
    trace.is_finite().then_some(trace)
}

fn near_singular(eigenvalues: &DVector<f64>) -> bool {
    let max = eigenvalues.max();
    let min = eigenvalues.min();
    max <= 0.0 || min <= SINGULAR_RTOL * max
}

/// Principal square root of a PSD matrix from its eigendecomposition;
/// eigenvalues below zero are treated as zero.
fn psd_sqrt(eigen: &SymmetricEigen<f64, Dyn>) -> DMatrix<f64> {
    let roots = eigen.eigenvalues.map(|v| v.max(0.0).sqrt());
    &eigen.eigenvectors * DMatrix::from_diagonal(&roots) * eigen.eigenvectors.transpose()
}

fn symmetrised(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if m.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some((m + m.transpose()) * 0.5)
}

fn symmetric_eigen(m: &DMatrix<f64>) -> Option<SymmetricEigen<f64, Dyn>> {
    symmetrised(m).map(SymmetricEigen::new)
}

fn symmetric_eigenvalues(m: &DMatrix<f64>) -> Option<DVector<f64>> {
    symmetrised(m).map(|s| s.symmetric_eigenvalues())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::synthetic_store;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    fn embedding_store(rows: Vec<Vec<f64>>) -> FeatureStore {
        let ids = (0..rows.len()).map(|i| format!("{}.wav", i)).collect();
        let mut layers = BTreeMap::new();
        layers.insert("emb".to_string(), rows);
        FeatureStore::new(ids, layers).unwrap()
    }

    fn gaussian_rows(n: usize, dim: usize, scale: f64, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dim).map(|d| scale * (d as f64 + 1.0) * rng.random_range(-1.0..1.0)).collect())
            .collect()
    }

    #[test]
    fn test_fid_self_full_rank() {
        let store = embedding_store(gaussian_rows(200, 4, 1.0, 1));
        let fid = frechet_distance(&store, &store, "emb").unwrap();
        assert!(fid.abs() < 1e-9, "fid = {}", fid);
    }

    #[test]
    fn test_fid_self_low_rank() {
        let store = synthetic_store(20, 3, 64, 4);
        let fid = frechet_distance(&store, &store, "2048").unwrap();
        assert!(fid.abs() < 1e-4, "fid = {}", fid);
    }

    #[test]
    fn test_fid_mean_shift() {
        let rows = gaussian_rows(100, 3, 1.0, 2);
        let shifted: Vec<Vec<f64>> = rows
            .iter()
            .map(|r| vec![r[0] + 1.0, r[1] - 2.0, r[2]])
            .collect();
        let a = embedding_store(rows);
        let b = embedding_store(shifted);
        let fid = frechet_distance(&a, &b, "emb").unwrap();
        assert!((fid - 5.0).abs() < 1e-8, "fid = {}", fid);

        // Low-rank path gives the same shift term
        let rows = gaussian_rows(5, 8, 1.0, 3);
        let shifted: Vec<Vec<f64>> = rows.iter().map(|r| r.iter().map(|v| v + 0.5).collect()).collect();
        let fid = frechet_distance(&embedding_store(rows), &embedding_store(shifted), "emb").unwrap();
        assert!((fid - 8.0 * 0.25).abs() < 1e-4, "fid = {}", fid);
    }

    #[test]
    fn test_fid_symmetric() {
        let a = embedding_store(gaussian_rows(80, 5, 1.0, 10));
        let b = embedding_store(gaussian_rows(60, 5, 2.0, 11));
        let ab = frechet_distance(&a, &b, "emb").unwrap();
        let ba = frechet_distance(&b, &a, "emb").unwrap();
        assert!(ab > 0.0);
        assert!((ab - ba).abs() < 1e-8 * ab.max(1.0));

        let a = synthetic_store(10, 3, 32, 12);
        let b = synthetic_store(15, 3, 32, 13);
        let ab = frechet_distance(&a, &b, "2048").unwrap();
        let ba = frechet_distance(&b, &a, "2048").unwrap();
        assert!((ab - ba).abs() < 1e-5 * ab.max(1.0));
    }

    fn population(rows: Vec<Vec<f64>>) -> Population {
        Population::new(&FeatureLayer::from_rows("emb", rows).unwrap()).unwrap()
    }

    fn fid_from(a: &Population, b: &Population, terms: TraceTerms) -> f64 {
        (&a.mu - &b.mu).norm_squared() + terms.tr_a + terms.tr_b - 2.0 * terms.tr_covmean
    }

    /// Rows with a constant last column, so the covariance is singular.
    fn flat_rows(n: usize, dim: usize, seed: u64) -> Vec<Vec<f64>> {
        gaussian_rows(n, dim - 1, 1.0, seed)
            .into_iter()
            .map(|mut r| {
                r.push(0.5);
                r
            })
            .collect()
    }

    #[test]
    fn test_low_rank_matches_regularised_covariances() {
        // N = D: low-rank path, compared with the explicit regularised form
        let rows_a = gaussian_rows(6, 6, 1.0, 20);
        let rows_b = gaussian_rows(6, 6, 1.5, 21);
        let a = population(rows_a.clone());
        let b = population(rows_b.clone());
        let direct = fid_from(&a, &b, regularised_terms(&a.covariance(), &b.covariance()).unwrap());

        let fid = frechet_distance(&embedding_store(rows_a), &embedding_store(rows_b), "emb").unwrap();
        assert!((fid - direct).abs() < 1e-8 * direct.max(1.0), "{} vs {}", fid, direct);

        let a = population(gaussian_rows(10, 32, 0.1, 22));
        let b = population(gaussian_rows(12, 32, 0.1, 23));
        let subspace = fid_from(&a, &b, subspace_terms(&a, &b).unwrap());
        let direct = fid_from(&a, &b, regularised_terms(&a.covariance(), &b.covariance()).unwrap());
        assert!((subspace - direct).abs() < 1e-8 * direct.max(1.0), "{} vs {}", subspace, direct);
    }

    #[test]
    fn test_paths_agree_just_above_dimension() {
        // N = D + 1 with a constant column: full-rank path, regularised
        let rows_a = flat_rows(7, 6, 24);
        let rows_b = flat_rows(7, 6, 25);
        let a = population(rows_a.clone());
        let b = population(rows_b.clone());
        let fid = frechet_distance(&embedding_store(rows_a), &embedding_store(rows_b), "emb").unwrap();
        let subspace = fid_from(&a, &b, subspace_terms(&a, &b).unwrap());
        assert!((fid - subspace).abs() < 1e-8 * fid.max(1.0), "{} vs {}", fid, subspace);

        // Well-conditioned N = D + 1: unregularised, within O(ε) of the subspace form
        let rows_a = gaussian_rows(7, 6, 1.0, 26);
        let rows_b = gaussian_rows(7, 6, 1.0, 27);
        let a = population(rows_a.clone());
        let b = population(rows_b.clone());
        let fid = frechet_distance(&embedding_store(rows_a), &embedding_store(rows_b), "emb").unwrap();
        let subspace = fid_from(&a, &b, subspace_terms(&a, &b).unwrap());
        assert!((fid - subspace).abs() < 1e-4 * fid.max(1.0), "{} vs {}", fid, subspace);
    }

    #[test]
    fn test_singular_covariance_self_distance_is_zero() {
        let rows = flat_rows(40, 6, 30);
        let sigma = population(rows.clone()).covariance();
        assert!(near_singular(&symmetric_eigenvalues(&sigma).unwrap()));

        let store = embedding_store(rows);
        let fid = frechet_distance(&store, &store, "emb").unwrap();
        assert!(fid >= -1e-9, "fid = {}", fid);
        assert!(fid.abs() < 1e-9, "fid = {}", fid);

        // Same on the low-rank path
        let store = embedding_store(flat_rows(5, 6, 31));
        let fid = frechet_distance(&store, &store, "emb").unwrap();
        assert!(fid.abs() < 1e-9, "fid = {}", fid);
    }

    #[test]
    fn test_non_finite_root_retries_regularised() {
        // Well-conditioned but huge: the product Σ_a^½ Σ_b Σ_a^½ overflows,
        // and the retry with ε·I overflows as well.
        let sigma = DMatrix::from_diagonal(&DVector::from_vec(vec![1e160, 2e160]));
        assert!(!near_singular(&symmetric_eigenvalues(&sigma).unwrap()));
        assert_eq!(
            covariance_terms(&sigma, &sigma).unwrap_err(),
            MetricError::NumericalFailure(
                "matrix square root is not finite after regularisation".to_string()
            )
        );

        let small = DMatrix::from_diagonal(&DVector::from_vec(vec![4.0, 9.0]));
        let terms = covariance_terms(&small, &small).unwrap();
        assert!((terms.tr_covmean - 13.0).abs() < 1e-12);
        assert_eq!(terms.tr_a, 13.0);
    }

    #[test]
    fn test_root_trace_drops_negative_eigenvalues() {
        let m = DMatrix::from_diagonal(&DVector::from_vec(vec![4.0, 9.0, -1e-12]));
        assert!((root_trace(m).unwrap() - 5.0).abs() < 1e-12);

        // Large negative eigenvalue: warned about, still only the real part
        let m = DMatrix::from_diagonal(&DVector::from_vec(vec![4.0, -4.0]));
        assert!((root_trace(m).unwrap() - 2.0).abs() < 1e-12);

        let m = DMatrix::from_element(2, 2, f64::NAN);
        assert!(root_trace(m).is_none());
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = synthetic_store(10, 3, 16, 1);
        let b = synthetic_store(10, 3, 8, 2);
        assert_eq!(
            frechet_distance(&a, &b, "2048").unwrap_err(),
            MetricError::DimensionMismatch {
                layer: "2048".to_string(),
                left: 16,
                right: 8
            }
        );
    }

    #[test]
    fn test_single_sample_rejected() {
        let a = embedding_store(vec![vec![1.0, 2.0]]);
        let b = embedding_store(vec![vec![1.0, 2.0], vec![0.0, 1.0]]);
        assert_eq!(
            frechet_distance(&a, &b, "emb").unwrap_err(),
            MetricError::InsufficientSamples { needed: 2, got: 1 }
        );
    }
}
