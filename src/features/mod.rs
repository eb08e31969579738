//! Per-dataset feature stores: named layers of per-clip vectors plus the
//! file identifier of every clip.

pub mod builder;
pub mod io;

use nalgebra::DMatrix;
use std::collections::BTreeMap;
use thiserror::Error;

pub use builder::{
    build_feature_store, AudioClip, Backbone, ExtractError, ExtractorConfig, FeatureExtractor,
    FrontendPreset, LayerBatch,
};

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("Feature store has no samples")]
    Empty,
    #[error("Feature store has no layers")]
    NoLayers,
    #[error("Layer '{layer}' has {rows} rows but the store has {expected} file ids")]
    RowCountMismatch {
        layer: String,
        rows: usize,
        expected: usize,
    },
    #[error("Layer '{layer}' row {row} has width {width}, expected {expected}")]
    RaggedLayer {
        layer: String,
        row: usize,
        width: usize,
        expected: usize,
    },
    #[error("Layer '{0}' has zero width")]
    ZeroWidth(String),
    #[error("Extractor did not return requested layer '{0}'")]
    MissingLayer(String),
    #[error("Clip {clip} is missing layer '{layer}'")]
    ClipMissingLayer { clip: String, layer: String },
    #[error("Extractor returned {rows} rows of layer '{layer}' for a batch of {batch}")]
    BatchSizeMismatch {
        layer: String,
        rows: usize,
        batch: usize,
    },
    #[error("Extractor error: {0}")]
    Extractor(#[from] ExtractError),
    #[error("Unsupported sampling rate {0} Hz (only 16000 and 32000 are supported)")]
    UnsupportedSampleRate(u32),
    #[error("Invalid extractor config: {0}")]
    InvalidConfig(String),
    #[error("No feature files found under {0}")]
    NoFeatureFiles(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One named layer: `rows × dim` values stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureLayer {
    rows: usize,
    dim: usize,
    data: Vec<f64>,
}

impl FeatureLayer {
    /// Build a layer from per-sample rows, rejecting ragged or zero-width input.
    pub fn from_rows(name: &str, rows: Vec<Vec<f64>>) -> Result<Self, FeatureError> {
        let dim = rows.first().map(|r| r.len()).unwrap_or(0);
        if dim == 0 {
            return Err(FeatureError::ZeroWidth(name.to_string()));
        }
        let mut data = Vec::with_capacity(rows.len() * dim);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != dim {
                return Err(FeatureError::RaggedLayer {
                    layer: name.to_string(),
                    row: i,
                    width: row.len(),
                    expected: dim,
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            dim,
            data,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Vector width D.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f64]> {
        self.data.chunks_exact(self.dim)
    }

    /// The whole layer as an `N × D` matrix.
    pub fn to_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_row_slice(self.rows, self.dim, &self.data)
    }

    /// Gather the given rows (repeats allowed) into a `len × D` matrix.
    pub fn select_rows(&self, indices: &[usize]) -> DMatrix<f64> {
        DMatrix::from_fn(indices.len(), self.dim, |r, c| {
            self.data[indices[r] * self.dim + c]
        })
    }

    fn to_rows(&self) -> Vec<Vec<f64>> {
        self.iter_rows().map(|r| r.to_vec()).collect()
    }

    fn head(&self, limit: usize) -> Self {
        let rows = limit.min(self.rows);
        Self {
            rows,
            dim: self.dim,
            data: self.data[..rows * self.dim].to_vec(),
        }
    }
}

/// Features of one dataset. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureStore {
    file_ids: Vec<String>,
    layers: BTreeMap<String, FeatureLayer>,
}

impl FeatureStore {
    /// Validate shapes and build the store: at least one sample, at least one
    /// layer, and exactly one row per file id in every layer.
    pub fn new(
        file_ids: Vec<String>,
        layers: BTreeMap<String, Vec<Vec<f64>>>,
    ) -> Result<Self, FeatureError> {
        if file_ids.is_empty() {
            return Err(FeatureError::Empty);
        }
        if layers.is_empty() {
            return Err(FeatureError::NoLayers);
        }

        let mut built = BTreeMap::new();
        for (name, rows) in layers {
            if rows.len() != file_ids.len() {
                return Err(FeatureError::RowCountMismatch {
                    layer: name,
                    rows: rows.len(),
                    expected: file_ids.len(),
                });
            }
            let layer = FeatureLayer::from_rows(&name, rows)?;
            built.insert(name, layer);
        }

        Ok(Self {
            file_ids,
            layers: built,
        })
    }

    /// Number of samples N.
    pub fn len(&self) -> usize {
        self.file_ids.len()
    }

    /// Always false for a constructed store; present for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.file_ids.is_empty()
    }

    pub fn file_ids(&self) -> &[String] {
        &self.file_ids
    }

    pub fn layer(&self, name: &str) -> Option<&FeatureLayer> {
        self.layers.get(name)
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(|k| k.as_str())
    }

    pub fn layers(&self) -> impl Iterator<Item = (&str, &FeatureLayer)> {
        self.layers.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Keep only the first `limit` samples.
    pub fn truncated(&self, limit: usize) -> Result<Self, FeatureError> {
        if limit == 0 {
            return Err(FeatureError::Empty);
        }
        if limit >= self.len() {
            return Ok(self.clone());
        }
        Ok(Self {
            file_ids: self.file_ids[..limit].to_vec(),
            layers: self
                .layers
                .iter()
                .map(|(name, layer)| (name.clone(), layer.head(limit)))
                .collect(),
        })
    }

    pub(crate) fn to_row_map(&self) -> BTreeMap<String, Vec<Vec<f64>>> {
        self.layers
            .iter()
            .map(|(name, layer)| (name.clone(), layer.to_rows()))
            .collect()
    }
}

/// Seeded synthetic store used across the unit tests: `logits` with
/// `classes` columns and an embedding layer of width `dim`.
#[cfg(test)]
pub(crate) fn synthetic_store(n: usize, classes: usize, dim: usize, seed: u64) -> FeatureStore {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(seed);
    let logits: Vec<Vec<f64>> = (0..n)
        .map(|_| (0..classes).map(|_| rng.random_range(-3.0..3.0)).collect())
        .collect();
    let embedding: Vec<Vec<f64>> = (0..n)
        .map(|_| (0..dim).map(|_| rng.random_range(-1.0..1.0)).collect())
        .collect();
    let file_ids = (0..n).map(|i| format!("clip_{:03}.wav", i)).collect();

    let mut layers = BTreeMap::new();
    layers.insert(crate::LOGITS_LAYER.to_string(), logits);
    layers.insert(crate::EMBEDDING_LAYER.to_string(), embedding);
    FeatureStore::new(file_ids, layers).unwrap()
}
