use super::{MetricError, Result};
use crate::features::FeatureStore;
use std::collections::BTreeMap;
use std::path::Path;

/// Row pairing between two stores: `idx_a[i]` goes with `idx_b[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignedPair {
    pub idx_a: Vec<usize>,
    pub idx_b: Vec<usize>,
}

impl AlignedPair {
    pub fn len(&self) -> usize {
        self.idx_a.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idx_a.is_empty()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.idx_a.iter().copied().zip(self.idx_b.iter().copied())
    }
}

/// Pair rows of two stores.
///
/// With `same_name`, rows are matched by base name (directory and extension
/// stripped) and ordered by that name; both stores must hold exactly the same
/// set of names. Otherwise rows are paired by position up to the shorter store.
pub fn align(a: &FeatureStore, b: &FeatureStore, same_name: bool) -> Result<AlignedPair> {
    let pair = if same_name {
        align_by_name(a.file_ids(), b.file_ids())?
    } else {
        positional(a.len(), b.len())
    };
    if pair.is_empty() {
        return Err(MetricError::EmptyAlignment);
    }
    log::debug!("Aligned {} sample pairs (same_name = {})", pair.len(), same_name);
    Ok(pair)
}

/// `dir/clip.wav` → `clip`
pub fn base_name(file_id: &str) -> &str {
    Path::new(file_id)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_id)
}

fn positional(n_a: usize, n_b: usize) -> AlignedPair {
    let m = n_a.min(n_b);
    AlignedPair {
        idx_a: (0..m).collect(),
        idx_b: (0..m).collect(),
    }
}

fn index_by_name<'a>(ids: &'a [String], side: &'static str) -> Result<BTreeMap<&'a str, usize>> {
    let mut index = BTreeMap::new();
    for (i, id) in ids.iter().enumerate() {
        let name = base_name(id);
        if index.insert(name, i).is_some() {
            return Err(MetricError::DuplicateName {
                name: name.to_string(),
                side,
            });
        }
    }
    Ok(index)
}

fn align_by_name(ids_a: &[String], ids_b: &[String]) -> Result<AlignedPair> {
    let by_name_a = index_by_name(ids_a, "first")?;
    let by_name_b = index_by_name(ids_b, "second")?;

    let mut unmatched: Vec<String> = ids_a
        .iter()
        .filter(|id| !by_name_b.contains_key(base_name(id)))
        .cloned()
        .collect();
    unmatched.extend(
        ids_b
            .iter()
            .filter(|id| !by_name_a.contains_key(base_name(id)))
            .cloned(),
    );
    if !unmatched.is_empty() {
        return Err(MetricError::Alignment { unmatched });
    }

    let mut pair = AlignedPair {
        idx_a: Vec::with_capacity(by_name_a.len()),
        idx_b: Vec::with_capacity(by_name_a.len()),
    };
    for (name, &ia) in &by_name_a {
        pair.idx_a.push(ia);
        pair.idx_b.push(by_name_b[name]);
    }
    Ok(pair)
}
