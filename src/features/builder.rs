use super::{FeatureError, FeatureStore};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Layer name → one row per clip of the batch.
pub type LayerBatch = BTreeMap<String, Vec<Vec<f64>>>;

/// Failure reported by an extractor implementation.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct ExtractError(pub String);

/// One dataset item: a mono waveform and the file it came from.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub waveform: Vec<f32>,
    pub file_id: String,
}

/// The perceptual feature network, consumed as a black box.
///
/// Must return every layer of the requested feature list with one row per
/// clip of the batch, with a width that stays the same across calls.
pub trait FeatureExtractor {
    fn extract(&self, batch: &[AudioClip]) -> Result<LayerBatch, ExtractError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backbone {
    #[default]
    Cnn14,
}

/// Mel front-end parameters of the backbone at a given sampling rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrontendPreset {
    pub sample_rate: u32,
    pub window_size: usize,
    pub hop_size: usize,
    pub mel_bins: usize,
    pub fmin: u32,
    pub fmax: u32,
    pub classes_num: usize,
}

/// Everything the extraction pass needs to know, passed explicitly so the
/// builder can run against any extractor (including test doubles).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub backbone: Backbone,
    /// Sampling rate of the input waveforms (16000 or 32000).
    pub sampling_rate: u32,
    /// Device the extractor runs on ("cpu", "cuda:0", ...). Opaque to the builder.
    pub device: String,
    /// Layers to keep from every extractor call.
    pub features_list: Vec<String>,
    /// Clips per extractor call.
    pub batch_size: usize,
    /// Stop after this many clips.
    pub limit_num: Option<usize>,
    /// Draw a progress bar while extracting.
    pub progress: bool,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            backbone: Backbone::Cnn14,
            sampling_rate: 16000,
            device: "cpu".to_string(),
            features_list: vec![
                crate::EMBEDDING_LAYER.to_string(),
                crate::LOGITS_LAYER.to_string(),
            ],
            batch_size: 1,
            limit_num: None,
            progress: true,
        }
    }
}

impl ExtractorConfig {
    /// Front-end preset for the configured sampling rate.
    pub fn frontend(&self) -> Result<FrontendPreset, FeatureError> {
        match (self.backbone, self.sampling_rate) {
            (Backbone::Cnn14, 16000) => Ok(FrontendPreset {
                sample_rate: 16000,
                window_size: 512,
                hop_size: 160,
                mel_bins: 64,
                fmin: 50,
                fmax: 8000,
                classes_num: 527,
            }),
            (Backbone::Cnn14, 32000) => Ok(FrontendPreset {
                sample_rate: 32000,
                window_size: 1024,
                hop_size: 320,
                mel_bins: 64,
                fmin: 50,
                fmax: 14000,
                classes_num: 527,
            }),
            (_, rate) => Err(FeatureError::UnsupportedSampleRate(rate)),
        }
    }

    fn validate(&self) -> Result<FrontendPreset, FeatureError> {
        if self.features_list.is_empty() {
            return Err(FeatureError::InvalidConfig(
                "features_list is empty".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(FeatureError::InvalidConfig(
                "batch_size must be at least 1".to_string(),
            ));
        }
        self.frontend()
    }
}

/// Push every clip through the extractor and collect the requested layers.
///
/// Reads at most `limit_num` clips, in batches of `batch_size`.
pub fn build_feature_store<E, I>(
    extractor: &E,
    clips: I,
    config: &ExtractorConfig,
) -> Result<FeatureStore, FeatureError>
where
    E: FeatureExtractor + ?Sized,
    I: IntoIterator<Item = AudioClip>,
{
    let preset = config.validate()?;
    log::debug!(
        "Extracting {:?} on {} at {} Hz (window {}, hop {}, {} mel bins)",
        config.features_list,
        config.device,
        preset.sample_rate,
        preset.window_size,
        preset.hop_size,
        preset.mel_bins
    );

    let clips = clips.into_iter();
    let limit = config.limit_num.unwrap_or(usize::MAX);
    let (lower, upper) = clips.size_hint();
    let expected = upper.unwrap_or(lower).min(limit);

    let pb = if config.progress {
        ProgressBar::new(expected as u64)
    } else {
        ProgressBar::hidden()
    };
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} clips ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }

    let mut collector = Collector::new(&config.features_list);
    let mut batch: Vec<AudioClip> = Vec::with_capacity(config.batch_size);

    for clip in clips.take(limit) {
        batch.push(clip);
        if batch.len() == config.batch_size {
            collector.push(extractor, &batch)?;
            pb.inc(batch.len() as u64);
            batch.clear();
        }
    }
    if !batch.is_empty() {
        collector.push(extractor, &batch)?;
        pb.inc(batch.len() as u64);
    }

    pb.finish_with_message(format!("{} clips", collector.file_ids.len()));
    log::info!("Extracted features for {} clips", collector.file_ids.len());

    FeatureStore::new(collector.file_ids, collector.layers)
}

struct Collector {
    file_ids: Vec<String>,
    layers: LayerBatch,
}

impl Collector {
    fn new(features_list: &[String]) -> Self {
        Self {
            file_ids: Vec::new(),
            layers: features_list
                .iter()
                .map(|name| (name.clone(), Vec::new()))
                .collect(),
        }
    }

    fn push<E: FeatureExtractor + ?Sized>(
        &mut self,
        extractor: &E,
        batch: &[AudioClip],
    ) -> Result<(), FeatureError> {
        let mut out = extractor.extract(batch)?;
        for (name, rows) in self.layers.iter_mut() {
            let batch_rows = out
                .remove(name)
                .ok_or_else(|| FeatureError::MissingLayer(name.clone()))?;
            if batch_rows.len() != batch.len() {
                return Err(FeatureError::BatchSizeMismatch {
                    layer: name.clone(),
                    rows: batch_rows.len(),
                    batch: batch.len(),
                });
            }
            rows.extend(batch_rows);
        }
        self.file_ids
            .extend(batch.iter().map(|clip| clip.file_id.clone()));
        Ok(())
    }
}
