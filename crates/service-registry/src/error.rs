//! Error types for the service registry

use crate::models::ServiceStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Service registry error type
#[derive(Error, Debug)]
pub enum Error {
    /// Service not found
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Invalid service status transition
    #[error("Invalid status transition for {service}: {from} -> {to}")]
    InvalidStateTransition {
        /// Service being updated
        service: String,
        /// Current status
        from: ServiceStatus,
        /// Attempted status
        to: ServiceStatus,
    },

    /// Writing state to disk failed; the previous file is left intact
    #[error("Failed to persist {path}: {source}")]
    Persist {
        /// File that could not be written
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
