//! Custom error types for mediagraph
//!
//! Every variant maps onto one of four classes: recoverable (retry is safe),
//! permanent (terminal, never retried), validation (malformed caller request)
//! and auth (surfaced by collaborators).

use std::time::Duration;
use thiserror::Error;

/// Retry classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Recoverable,
    Permanent,
    Validation,
    Auth,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Recoverable => write!(f, "recoverable"),
            ErrorClass::Permanent => write!(f, "permanent"),
            ErrorClass::Validation => write!(f, "validation"),
            ErrorClass::Auth => write!(f, "auth"),
        }
    }
}

/// Main error type for mediagraph operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Schema violation: {0}")]
    Schema(String),

    #[error("Incompatible file {uri}: {reason}")]
    IncompatibleFile { uri: String, reason: String },

    #[error("Corrupt manifest {manifest}: {reason}")]
    CorruptManifest { manifest: String, reason: String },

    #[error("Manifest {run_id} for {entity} is missing required {kind} sub-table")]
    MissingSubTable {
        entity: String,
        kind: String,
        run_id: String,
    },

    #[error("Incomplete entity {entity}: {reason}")]
    IncompleteEntity { entity: String, reason: String },

    #[error("Row count mismatch for {entity}/{kind}: expected {expected}, read {actual}")]
    RowCountMismatch {
        entity: String,
        kind: String,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid vector: {0}")]
    InvalidVector(String),

    #[error("Invalid state transition for {key}: {reason}")]
    InvalidTransition { key: String, reason: String },

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Embedding backend timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backpressure: backlog is full ({0} items queued)")]
    Backpressure(usize),

    #[error("Unsupported input: {0}")]
    Unsupported(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not authorized: {0}")]
    Auth(String),

    #[error("No snapshot has been published yet")]
    SnapshotNotFound,

    #[error("Not initialized: run 'mediagraph init' first")]
    NotInitialized,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classify this error for retry decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Database(e) => match e {
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                    ErrorClass::Recoverable
                }
                _ => ErrorClass::Permanent,
            },
            Error::ObjectStore(e) => match e {
                object_store::Error::NotFound { .. }
                | object_store::Error::InvalidPath { .. }
                | object_store::Error::NotSupported { .. }
                | object_store::Error::NotImplemented => ErrorClass::Permanent,
                _ => ErrorClass::Recoverable,
            },
            Error::Io(_) | Error::Http(_) | Error::Timeout(_) | Error::Backpressure(_) => {
                ErrorClass::Recoverable
            }
            Error::Embedding(_) => ErrorClass::Recoverable,
            Error::Validation(_) => ErrorClass::Validation,
            Error::Auth(_) => ErrorClass::Auth,
            Error::Config(_)
            | Error::Arrow(_)
            | Error::Parquet(_)
            | Error::Schema(_)
            | Error::IncompatibleFile { .. }
            | Error::CorruptManifest { .. }
            | Error::MissingSubTable { .. }
            | Error::IncompleteEntity { .. }
            | Error::RowCountMismatch { .. }
            | Error::InvalidVector(_)
            | Error::InvalidTransition { .. }
            | Error::Unsupported(_)
            | Error::SnapshotNotFound
            | Error::NotInitialized
            | Error::UrlParse(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::Other(_) => ErrorClass::Permanent,
        }
    }

    /// Whether a caller may safely retry the failed operation
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Recoverable
    }

    /// Whether this error means a stored object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ObjectStore(object_store::Error::NotFound { .. }))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

/// Result type alias for mediagraph
pub type Result<T> = std::result::Result<T, Error>;
