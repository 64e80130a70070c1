use svcs_types::SvcsError;
use thiserror::Error;

/// Errors raised by the semantic index and its embedders.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Metadata encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Embedding failed: {0}")]
    Embedding(String),
    #[error("Semantic index unavailable: {0}")]
    Unavailable(String),
}

impl From<MemoryError> for SvcsError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::Embedding(details) => SvcsError::Dependency {
                component: "embedder".to_string(),
                details,
            },
            MemoryError::Unavailable(details) => SvcsError::Dependency {
                component: "semantic_index".to_string(),
                details,
            },
            other => SvcsError::Persistence(other.to_string()),
        }
    }
}
