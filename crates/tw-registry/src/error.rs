//! Registry error types.

use crate::classify::ProtocolViolation;
use std::fmt;
use thiserror::Error;
use tw_core::ListingId;

/// A rejected batch and every violation found in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRejection {
    /// Number of entries in the rejected batch.
    pub batch_len: usize,
    /// All violations, in batch order. Never empty.
    pub violations: Vec<ProtocolViolation>,
}

impl fmt::Display for BatchRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} violation(s) in batch of {}",
            self.violations.len(),
            self.batch_len
        )?;
        if let Some(first) = self.violations.first() {
            write!(f, ", first: {first}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Protocol violation, batch rejected: {0}")]
    ProtocolViolation(BatchRejection),

    #[error("Registry desync on {id}: {reason}")]
    Desync { id: ListingId, reason: String },
}

impl RegistryError {
    /// Whether this error signals an internal invariant break.
    pub fn is_desync(&self) -> bool {
        matches!(self, Self::Desync { .. })
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;
