//! Error types for the feed engine.

use thiserror::Error;

/// Common error type for storage, parsing and feed-store operations.
#[derive(Error, Debug)]
pub enum FeedscopeError {
    /// Missing required credential or configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network failure, timeout or non-2xx status while fetching a feed.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Corrupt persisted record or unparseable feed document.
    #[error("format error: {0}")]
    Format(String),

    /// Empty, invalid or non-JSON completion from the LLM.
    #[error("LLM response error: {0}")]
    LlmResponse(String),

    /// Entity exceeds the chunk ceiling of the table record.
    #[error("entity {key} needs {chunks} chunks, limit is {max}")]
    StorageCapacity { key: String, chunks: usize, max: usize },

    /// Invalid feed or item id in a direct lookup.
    #[error("{0} not found")]
    NotFound(String),

    /// Backend transport or persistence failure.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for FeedscopeError {
    fn from(e: reqwest::Error) -> Self {
        FeedscopeError::Storage(e.to_string())
    }
}

/// Result type alias for feed engine operations.
pub type Result<T> = std::result::Result<T, FeedscopeError>;
