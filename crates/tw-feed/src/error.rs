//! Feed error types.

use thiserror::Error;
use tw_core::{ListingId, SourceToken};
use tw_registry::RegistryError;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Unknown source: {0}")]
    UnknownSource(SourceToken),

    #[error("Source already attached: {0}")]
    DuplicateSource(SourceToken),

    #[error("Source {0} is not a query")]
    NotAQuery(SourceToken),

    #[error("Source {0} is not a group")]
    NotAGroup(SourceToken),

    #[error("Aggregator desync: {token} retracted {id} it never contributed")]
    Desync { token: SourceToken, id: ListingId },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl FeedError {
    /// Whether this error signals an internal invariant break.
    pub fn is_desync(&self) -> bool {
        match self {
            Self::Desync { .. } => true,
            Self::Registry(e) => e.is_desync(),
            _ => false,
        }
    }
}

pub type FeedResult<T> = Result<T, FeedError>;
