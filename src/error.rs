//! Core error taxonomy.
//!
//! Each variant corresponds to one of the error kinds in the design doc's
//! propagation policy: retryable errors are absorbed inside the ingest
//! client, everything else bubbles up here and the orchestrator reduces it
//! to a one-line reason and a process exit code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(String),

    #[error("auth error: {0}")]
    Auth(String),

    /// Recovered locally by the ingest client's retry policy; surfaced only
    /// when the caller wants to report why a retry loop is still spinning.
    #[error("transient fetch error: {0}")]
    TransientFetch(String),

    #[error("permanent fetch error: {0}")]
    PermanentFetch(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("upsert error: {0}")]
    Upsert(#[from] UpsertError),

    #[error("data error: {0}")]
    Data(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// One-line reason for the orchestrator's failure log and exit path.
    pub fn one_line(&self) -> String {
        self.to_string().replace('\n', " ")
    }
}

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("row count mismatch in {table}: expected {expected}, got {actual}")]
    RowCountMismatch {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("row count too low in {table}: expected at least {expected} distinct keys, got {actual}")]
    RowCountTooLow {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("table {0} has a multi-column primary key; upsert requires a single-column key")]
    CompositePrimaryKey(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
