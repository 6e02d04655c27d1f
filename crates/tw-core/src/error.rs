//! Error types for tw-core.

use thiserror::Error;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid listing id: {0}")]
    InvalidListingId(String),

    #[error("Invalid listing state: {0}")]
    InvalidState(String),

    #[error("Invalid sort direction: {0}")]
    InvalidSortDirection(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
