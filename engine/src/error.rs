//! Error types for the reconciliation engine.

use crate::transport::ApiError;
use thiserror::Error;

/// All possible errors from the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Transport errors
    #[error(transparent)]
    Api(#[from] ApiError),

    // Validation errors, raised before any remote call
    #[error("rule {index} references undeclared category '{category}'")]
    UnknownCategory { index: usize, category: String },

    #[error("category '{0}' is declared more than once")]
    DuplicateCategory(String),

    #[error("rule {index} in group '{category}/{section}' is out of order: {reason}")]
    GroupOrder {
        index: usize,
        category: String,
        section: String,
        reason: String,
    },

    // Server response anomalies that would otherwise lose track of state
    #[error("unexpected response from {path}: {reason}")]
    UnexpectedResponse { path: String, reason: String },

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl Error {
    /// The HTTP status behind a transport error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api(err) => err.status,
            _ => None,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
