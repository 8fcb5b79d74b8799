use std::{io, path::PathBuf};

use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("cannot create metadata store directory '{}': {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("{0} already exists")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("metadata store is closed")]
    Closed,
    #[error("metadata store lock is poisoned")]
    Poisoned,
}

impl StoreError {
    /// Turns a unique-constraint violation into [`StoreError::Conflict`] naming `what`.
    pub(crate) fn from_insert(error: rusqlite::Error, what: impl FnOnce() -> String) -> Self {
        match error {
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                Self::Conflict(what())
            }
            other => Self::Sqlite(other),
        }
    }
}
