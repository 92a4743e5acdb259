//! Error types for the timing core

use std::path::PathBuf;
use thiserror::Error;

/// Timing subsystem errors
#[derive(Debug, Error)]
pub enum TimingError {
    #[error("Failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Timing subsystem already running")]
    AlreadyRunning,

    #[error("Failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config {path}: {field} must be non-zero")]
    ConfigInvalid { path: PathBuf, field: &'static str },

    #[error("Persistence error: {0}")]
    Persist(#[from] std::io::Error),
}

pub type TimingResult<T> = Result<T, TimingError>;
