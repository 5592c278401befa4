//! Error types for `Corral` core library.

use thiserror::Error;

/// Result type alias using `Corral` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `Corral` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// NDJSON parsing error
    #[error("Failed to parse NDJSON: {0}")]
    NdjsonParse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
