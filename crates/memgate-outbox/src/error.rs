//! Error types for the delivery core.

use thiserror::Error;

/// Errors that can occur in the router, worker, or reconciler.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] memgate_database::DatabaseError),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type for delivery-core operations.
pub type OutboxResult<T> = Result<T, OutboxError>;
