//! Storage engine error types

use std::io;

use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by the paged table store
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("page {page} failed structural validation")]
    Corrupt { page: u32 },

    #[error("cipher key does not match the file's key verifier")]
    KeyMismatch,

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("schema mismatch for table {table}: {detail}")]
    SchemaMismatch { table: String, detail: String },

    #[error("invalid file format: {0}")]
    InvalidFormat(String),
}

impl EngineError {
    pub fn io(path: &std::path::Path, source: io::Error) -> Self {
        EngineError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
