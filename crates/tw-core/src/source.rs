//! Source identification.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle for a registered source (one query/tab or a group of them).
///
/// Tokens are allocated monotonically and never reused, so a stale token
/// held by a producer can never address a replacement source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceToken(u64);

impl SourceToken {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_display_and_order() {
        let a = SourceToken::new(1);
        let b = SourceToken::new(2);
        assert!(a < b);
        assert_eq!(a.to_string(), "src#1");
    }
}
