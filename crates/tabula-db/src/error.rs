//! Error type for the data-access layer.
//!
//! Messages name the operation, table, or identifier involved. They never
//! include bound parameter values, so errors are safe to log verbatim.

use crate::migrations::MigrationError;
use tabula_types::TypeError;
use thiserror::Error;

/// Errors returned by every data-access operation.
#[derive(Debug, Error)]
pub enum DbError {
    /// The pool could not be reached, was exhausted, was closed, or failed
    /// to reconnect.
    #[error("connection error: {0}")]
    Connection(String),

    /// SQL execution failed, ownership was denied, or a lookup failed.
    #[error("query error: {0}")]
    Query(String),

    /// The body of a transaction failed; the transaction was rolled back.
    #[error("transaction rolled back: {0}")]
    Transaction(#[source] Box<DbError>),

    /// Startup or lazy initialisation failed.
    #[error("initialization error: {0}")]
    Initialization(String),

    /// An identifier, tenant identity, or statement shape was rejected
    /// before any I/O.
    #[error("validation error: {0}")]
    Validation(String),

    /// A schema migration failed.
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

impl DbError {
    /// Wraps a backend error with the operation and target it occurred on.
    pub(crate) fn query(operation: &str, target: &str, source: &rusqlite::Error) -> Self {
        Self::Query(format!("{operation} on '{target}' failed: {source}"))
    }

    /// Builds the error returned when a tenant writes a table it does not own.
    pub(crate) fn ownership_denied(table: &str, owner: &str) -> Self {
        Self::Query(format!(
            "write to table '{table}' denied: table is owned by '{owner}'"
        ))
    }

    /// Stable, machine-readable code for the error kind.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Query(_) => "query",
            Self::Transaction(_) => "transaction",
            Self::Initialization(_) => "initialization",
            Self::Validation(_) => "validation",
            Self::Migration(_) => "migration",
        }
    }
}

impl From<TypeError> for DbError {
    fn from(err: TypeError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<r2d2::Error> for DbError {
    fn from(err: r2d2::Error) -> Self {
        Self::Connection(format!("failed to acquire pooled connection: {err}"))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DbError>;
