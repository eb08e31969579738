use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::features::ExtractorConfig;
use crate::metrics::MetricsConfig;
use crate::ndb::NdbParams;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Application configuration loaded from a TOML file.
/// Every field has a default, so the file is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Threads for the parallel estimators. 0 = let rayon decide.
    pub workers: usize,
    pub metrics: MetricsConfig,
    pub ndb: NdbParams,
    /// Settings handed to a feature extractor when building stores from audio.
    pub extractor: ExtractorConfig,
}

impl AppConfig {
    /// Load config from `~/.config/audiogen-eval/config.toml`.
    /// Returns defaults if the file doesn't exist or can't be used.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => Self::from_file_or_default(&path),
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Like [`AppConfig::from_file`], but logs a warning and falls back to
    /// defaults on failure.
    pub fn from_file_or_default(path: &Path) -> Self {
        match Self::from_file(path) {
            Ok(config) => {
                log::info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                log::warn!("{}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Worker count: a non-zero CLI value wins over the config file.
    pub fn resolve_workers(&self, cli_jobs: usize) -> usize {
        if cli_jobs > 0 { cli_jobs } else { self.workers }
    }

    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
