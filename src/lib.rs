pub mod config;
pub mod engine;
pub mod features;
pub mod metrics;
pub mod ndb;

/// Layer holding pre-softmax class scores (source for KL and Inception Score).
pub const LOGITS_LAYER: &str = "logits";

/// Penultimate-layer embedding of the CNN14 backbone (source for FID and KID).
pub const EMBEDDING_LAYER: &str = "2048";

/// Extension of feature files written by the extraction step.
pub const FEATURE_FILE_EXTENSION: &str = "json";

/// Application name for XDG paths
pub const APP_NAME: &str = "audiogen-eval";
