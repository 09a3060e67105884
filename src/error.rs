//! Error types shared by every module of the crate.

use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for the enrichment engine.
#[derive(Debug, Error)]
pub enum GseaError {
    /// I/O error (file not found, permission denied, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error raised by the delimited text reader/writer
    #[error("table error: {0}")]
    Csv(#[from] csv::Error),

    /// A numeric field in a table could not be parsed
    #[error("malformed input in {source_name} (line {line}, column {column}): '{value}'")]
    MalformedInput {
        source_name: String,
        line: usize,
        column: usize,
        value: String,
    },

    /// An operation was called with arguments it cannot honour
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    /// The chunk directory is missing or holds no chunk files
    #[error("no data to filter in {}", path.display())]
    NoChunkData { path: PathBuf },

    /// The per-invocation worker pool could not be created
    #[error("could not build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// Configuration file could not be parsed or written
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid parameters for a sampling distribution
    #[error("distribution error: {0}")]
    Distribution(String),
}

impl From<toml::de::Error> for GseaError {
    fn from(err: toml::de::Error) -> Self {
        GseaError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for GseaError {
    fn from(err: toml::ser::Error) -> Self {
        GseaError::Config(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GseaError>;
