//! Error types for keyset-export
//!
//! This module provides the error taxonomy used across the pipeline:
//! - Backend errors, split into transient (throttling) and permanent kinds
//! - Input, configuration and destination errors
//! - Stage attribution, so a fatal run error names the stage that failed

use crate::types::{FetchResult, Stage};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for keyset-export operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for keyset-export
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "fetch.batch_size")
        key: Option<String>,
    },

    /// Backend request failed
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// A batched fetch was aborted by a non-transient backend error
    #[error("{0}")]
    Fetch(Box<FetchError>),

    /// Input could not be opened or has an unusable shape
    #[error("input error: {0}")]
    Input(String),

    /// The output destination could not be written
    #[error("failed to write {path}: {reason}")]
    DestinationWrite {
        /// Destination being written
        path: PathBuf,
        /// The reason the write failed
        reason: String,
    },

    /// Reference store database error
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// CSV encoding or decoding error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A pipeline stage failed; wraps the underlying error
    #[error("{stage} stage failed: {source}")]
    Stage {
        /// The stage that failed
        stage: Stage,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Attribute this error to a pipeline stage
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            already @ Error::Stage { .. } => already,
            other => Error::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage this error was attributed to, if any
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Machine-readable error code
    pub fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Backend(e) => e.error_code(),
            Error::Fetch(e) => e.source.error_code(),
            Error::Input(_) => "input_error",
            Error::DestinationWrite { .. } => "destination_write_error",
            Error::Database(_) | Error::Sqlx(_) => "database_error",
            Error::Csv(_) => "csv_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::Stage { source, .. } => source.error_code(),
            Error::Other(_) => "internal_error",
        }
    }
}

impl From<FetchError> for Error {
    fn from(e: FetchError) -> Self {
        Error::Fetch(Box::new(e))
    }
}

/// Errors reported by a record store
///
/// Only [`BackendError::Throttled`] is transient; every other kind signals a
/// condition that retrying cannot fix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Request rate exceeded the provisioned throughput
    #[error("request throttled: {0}")]
    Throttled(String),

    /// Credentials rejected or missing
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Request was malformed (oversized batch, bad key shape, ...)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Addressed table or collection does not exist
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// Backend could not serve the request at all
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// Whether this is the throttling signal
    pub fn is_throttled(&self) -> bool {
        matches!(self, BackendError::Throttled(_))
    }

    /// Machine-readable error code
    pub fn error_code(&self) -> &str {
        match self {
            BackendError::Throttled(_) => "throttled",
            BackendError::Unauthorized(_) => "unauthorized",
            BackendError::InvalidRequest(_) => "invalid_request",
            BackendError::TableNotFound(_) => "table_not_found",
            BackendError::Unavailable(_) => "backend_unavailable",
        }
    }
}

/// A batched fetch aborted by a non-transient backend error
///
/// Carries what earlier batches resolved so callers can inspect it; the
/// pipeline itself discards these records.
#[derive(Debug, Error)]
#[error("fetch aborted at batch {batch_index}: {source}")]
pub struct FetchError {
    /// Zero-based index of the batch that failed
    pub batch_index: usize,
    /// The backend error that aborted the fetch
    #[source]
    pub source: BackendError,
    /// Records resolved by batches completed before the abort
    pub completed: FetchResult,
}

/// Reference store database errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),
}
