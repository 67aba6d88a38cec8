//! Error type shared by the keyward crates.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout `keyward-core`.
pub type KeywardResult<T> = Result<T, KeywardError>;

/// Failures surfaced by configuration handling, marker I/O, and process launch.
///
/// Per-device problems inside the engine never reach callers as errors; they are
/// folded into classification results or dispatch outcomes instead.
#[derive(Debug, Error)]
pub enum KeywardError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse TOML configuration: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("failed to render TOML configuration: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("failed to process YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to process JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("marker file {}: {reason}", .path.display())]
    Marker { path: PathBuf, reason: String },

    #[error("failed to launch command: {0}")]
    Launch(String),
}
