//! On-disk feature stores.
//!
//! Two layouts are read: a single JSON file holding the whole store
//! (`{"file_ids": [...], "layers": {"logits": [[...], ...]}}`), or a directory
//! of per-clip JSON files (`{"layers": {"logits": [...]}}`) where each clip's
//! file id is its path relative to the directory minus the `.json` suffix.

use super::{FeatureError, FeatureStore};
use crate::FEATURE_FILE_EXTENSION;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Serialize, Deserialize)]
struct StoreFile {
    file_ids: Vec<String>,
    layers: BTreeMap<String, Vec<Vec<f64>>>,
}

#[derive(Deserialize)]
struct ClipFile {
    layers: BTreeMap<String, Vec<f64>>,
}

impl FeatureStore {
    /// Load a store from a single JSON file or a directory of per-clip files.
    pub fn load(path: &Path) -> Result<Self, FeatureError> {
        let store = if path.is_dir() {
            load_clip_dir(path)?
        } else {
            let file: StoreFile = read_json(path)?;
            FeatureStore::new(file.file_ids, file.layers)?
        };
        log::info!(
            "Loaded {} samples ({} layers) from {}",
            store.len(),
            store.layers.len(),
            path.display()
        );
        Ok(store)
    }

    /// Write the store in the single-file layout.
    pub fn save(&self, path: &Path) -> Result<(), FeatureError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = StoreFile {
            file_ids: self.file_ids.clone(),
            layers: self.to_row_map(),
        };
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, &file).map_err(|source| FeatureError::Json {
            path: path.display().to_string(),
            source,
        })
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, FeatureError> {
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader).map_err(|source| FeatureError::Json {
        path: path.display().to_string(),
        source,
    })
}

/// Every feature file below `dir`, sorted, plus the number of entries that
/// could not be read.
fn feature_files(dir: &Path) -> (Vec<PathBuf>, usize) {
    let suffix = format!(".{}", FEATURE_FILE_EXTENSION);
    let mut skipped = 0;

    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                log::warn!("Skipping unreadable entry under {}: {}", dir.display(), e);
                skipped += 1;
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy().ends_with(&suffix))
        .map(|e| e.into_path())
        .collect();
    paths.sort();

    (paths, skipped)
}

fn load_clip_dir(dir: &Path) -> Result<FeatureStore, FeatureError> {
    let suffix = format!(".{}", FEATURE_FILE_EXTENSION);
    let (paths, skipped) = feature_files(dir);
    if skipped > 0 {
        log::warn!(
            "{} entries under {} could not be read; the store may be missing clips",
            skipped,
            dir.display()
        );
    }

    if paths.is_empty() {
        return Err(FeatureError::NoFeatureFiles(dir.display().to_string()));
    }

    let mut file_ids = Vec::with_capacity(paths.len());
    let mut layers: BTreeMap<String, Vec<Vec<f64>>> = BTreeMap::new();

    for path in &paths {
        let rel = path
            .strip_prefix(dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        let file_id = rel.strip_suffix(&suffix).unwrap_or(&rel).to_string();

        let mut clip: ClipFile = read_json(path)?;

        // The first clip decides which layers the store has
        if layers.is_empty() {
            for name in clip.layers.keys() {
                layers.insert(name.clone(), Vec::with_capacity(paths.len()));
            }
        }
        for (name, rows) in layers.iter_mut() {
            let row = clip
                .layers
                .remove(name)
                .ok_or_else(|| FeatureError::ClipMissingLayer {
                    clip: file_id.clone(),
                    layer: name.clone(),
                })?;
            rows.push(row);
        }
        if !clip.layers.is_empty() {
            log::debug!(
                "Ignoring extra layers {:?} in {}",
                clip.layers.keys().collect::<Vec<_>>(),
                path.display()
            );
        }

        file_ids.push(file_id);
    }

    FeatureStore::new(file_ids, layers)
}
