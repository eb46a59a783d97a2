//! Error types for the database scaler

use thiserror::Error;

/// Main error type for scaler operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error, fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Rejected WHERE clause fragment
    #[error("invalid WHERE clause: {0}")]
    InvalidWhereClause(String),

    /// Credential file error
    #[error("credential error: {0}")]
    Credentials(String),

    /// Row-level semantic error; skips the row, never halts the loop
    #[error("row error: {0}")]
    Row(String),

    /// Per-duplicate error; skips the duplicate, never halts the fan-out
    #[error("duplicate error: {0}")]
    Duplicate(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a WHERE-clause validation error with the given message
    pub fn invalid_where_clause(msg: impl Into<String>) -> Self {
        Self::InvalidWhereClause(msg.into())
    }

    /// Create a credential error with the given message
    pub fn credentials(msg: impl Into<String>) -> Self {
        Self::Credentials(msg.into())
    }

    /// Create a row-level error with the given message
    pub fn row(msg: impl Into<String>) -> Self {
        Self::Row(msg.into())
    }

    /// Create a per-duplicate error with the given message
    pub fn duplicate(msg: impl Into<String>) -> Self {
        Self::Duplicate(msg.into())
    }

    /// True when this wraps a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }

    /// True when this wraps a Kubernetes 409 (racing create)
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }
}

/// Convenience alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;
