//! Error type shared by the local and remote legs of the store.

use mnemo_types::MnemoError;
use thiserror::Error;

/// Errors that can arise from memory store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Remote store HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Remote store rejected request: {0}")]
    Remote(String),
    #[error("Invalid record: {0}")]
    InvalidMemory(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl From<MnemoError> for StoreError {
    fn from(err: MnemoError) -> Self {
        StoreError::InvalidMemory(err.to_string())
    }
}

impl From<StoreError> for MnemoError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidMemory(msg) => MnemoError::InvalidMemory(msg),
            other => MnemoError::StoreUnavailable(other.to_string()),
        }
    }
}
