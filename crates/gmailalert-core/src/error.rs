//! Error types for the core library.

use thiserror::Error;

use crate::notify::DeliveryError;
use crate::search::QueryError;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid alert, alert file, or backend settings.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mail search failed.
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// Notification delivery failed.
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// An alert task panicked or was cancelled.
    #[error("Alert task failed: {0}")]
    Task(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
