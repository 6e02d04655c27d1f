//! View configuration errors.
//!
//! All of these are returned synchronously at the call site.

use thiserror::Error;
use tw_core::SortDirection;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ViewError {
    #[error("Sort key already registered: {name} {direction}")]
    DuplicateSortKey {
        name: String,
        direction: SortDirection,
    },

    #[error("Unknown sort key: {name} {direction}")]
    UnknownSortKey {
        name: String,
        direction: SortDirection,
    },

    #[error("Invalid page size: {0}")]
    InvalidPageSize(usize),
}

pub type ViewResult<T> = Result<T, ViewError>;
