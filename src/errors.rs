//! Error types for the backup / deposit / retrieve surface
//!
//! Taxonomy:
//! - `Io` — disk or file failure during backup, deposit or archive work.
//!   Surfaced to the caller; no partial state is left reachable as valid.
//! - `KeyMismatch` — wrong content or backup key. During retrieve the
//!   affected artifact is treated as absent rather than failing the call.
//! - `SchemaMismatch` — an artifact describes tables no longer present or
//!   structurally incompatible; the table is skipped during merge.
//! - `Corrupt` — a page or artifact failed structural validation.
//!
//! `backup` and `deposit` are total-failure operations: they return an error
//! and leave prior state intact. `retrieve` and `recover` convert data-level
//! problems into score reduction and only surface setup errors.

use std::io;

use thiserror::Error;

use crate::engine::EngineError;

/// Result type for repair-surface operations
pub type RepairResult<T> = Result<T, RepairError>;

/// Errors raised by backup, deposit, retrieve and recover
#[derive(Debug, Error)]
pub enum RepairError {
    #[error("I/O failure: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("key mismatch: {0}")]
    KeyMismatch(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("corrupt artifact: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl RepairError {
    /// I/O failure with context describing the operation that failed
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        RepairError::Io {
            context: context.into(),
            source,
        }
    }

    /// I/O failure at a specific path
    pub fn io_at(path: &std::path::Path, source: io::Error) -> Self {
        RepairError::io(format!("at {}", path.display()), source)
    }

    /// True when the error means a wrong cipher key, not damaged data
    pub fn is_key_mismatch(&self) -> bool {
        matches!(
            self,
            RepairError::KeyMismatch(_) | RepairError::Engine(EngineError::KeyMismatch)
        )
    }
}
