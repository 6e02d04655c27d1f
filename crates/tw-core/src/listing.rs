//! Listing identity, lifecycle state and batch types.
//!
//! A listing is a single marketplace offer. Sources deliver one
//! `ListingBatch` per refresh cycle; the registry turns those into
//! `ListingItem`s whose `ListingState` follows the lifecycle automaton:
//!
//! ```text
//!  (absent) --New--> New --Removed--> Removed
//!                    ^  \                |
//!                    |   `--mark read--> Normal
//!                    `------New----------'
//! ```

use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Content-addressed identity of a listing.
///
/// Stable across re-polls of the same listing. Cloning is cheap.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ListingId(Arc<str>);

impl ListingId {
    /// Create an identity from its content address.
    ///
    /// Returns `Err(InvalidListingId)` for an empty or blank key. Any other
    /// key is kept byte for byte.
    pub fn new(key: impl AsRef<str>) -> Result<Self> {
        let key = key.as_ref();
        if key.trim().is_empty() {
            return Err(CoreError::InvalidListingId(
                "identity must not be empty".to_string(),
            ));
        }
        Ok(Self(Arc::from(key)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ListingId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ListingId> for String {
    fn from(id: ListingId) -> Self {
        id.0.to_string()
    }
}

impl fmt::Debug for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListingId({})", self.0)
    }
}

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a registry entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingState {
    /// Never classified. Registry entries never hold this state.
    #[default]
    Unknown,
    /// Newly observed or reappeared, not yet acknowledged.
    New,
    /// Acknowledged by the user ("mark all read").
    Normal,
    /// No longer offered by the marketplace. Retained for reappearance detection.
    Removed,
}

impl ListingState {
    /// Whether a batch may declare this state.
    ///
    /// Only `New` and `Removed` are legal batch states.
    pub fn is_declarable(&self) -> bool {
        matches!(self, Self::New | Self::Removed)
    }
}

impl fmt::Display for ListingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::New => write!(f, "NEW"),
            Self::Normal => write!(f, "NORMAL"),
            Self::Removed => write!(f, "REMOVED"),
        }
    }
}

impl FromStr for ListingState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(Self::Unknown),
            "new" => Ok(Self::New),
            "normal" => Ok(Self::Normal),
            "removed" => Ok(Self::Removed),
            other => Err(CoreError::InvalidState(other.to_string())),
        }
    }
}

/// A registry entry as seen by downstream stages.
///
/// The payload is opaque to the pipeline and shared, so cloning an item
/// never clones the payload.
#[derive(Debug)]
pub struct ListingItem<P> {
    /// Listing identity.
    pub id: ListingId,
    /// Current lifecycle state.
    pub state: ListingState,
    /// When the identity was first observed. Never changes.
    pub first_seen_at: DateTime<Utc>,
    /// When the state last changed.
    pub last_transition_at: DateTime<Utc>,
    /// Domain payload (price, item, seller...).
    pub payload: Arc<P>,
}

impl<P> ListingItem<P> {
    /// Create a freshly observed item in state `New`.
    pub fn new(id: ListingId, payload: P, now: DateTime<Utc>) -> Self {
        Self {
            id,
            state: ListingState::New,
            first_seen_at: now,
            last_transition_at: now,
            payload: Arc::new(payload),
        }
    }

    pub fn is_new(&self) -> bool {
        self.state == ListingState::New
    }

    pub fn is_removed(&self) -> bool {
        self.state == ListingState::Removed
    }
}

impl<P> Clone for ListingItem<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            state: self.state,
            first_seen_at: self.first_seen_at,
            last_transition_at: self.last_transition_at,
            payload: Arc::clone(&self.payload),
        }
    }
}

/// One `(identity, declared state, payload)` tuple of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry<P> {
    pub id: ListingId,
    pub declared: ListingState,
    pub payload: P,
}

/// An ordered, per-refresh diff delivered by one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingBatch<P> {
    entries: Vec<BatchEntry<P>>,
}

impl<P> ListingBatch<P> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn from_entries(entries: Vec<BatchEntry<P>>) -> Self {
        Self { entries }
    }

    /// Append an entry declaring the listing as (re)appeared.
    pub fn push_new(&mut self, id: ListingId, payload: P) -> &mut Self {
        self.entries.push(BatchEntry {
            id,
            declared: ListingState::New,
            payload,
        });
        self
    }

    /// Append an entry declaring the listing as gone.
    pub fn push_removed(&mut self, id: ListingId, payload: P) -> &mut Self {
        self.entries.push(BatchEntry {
            id,
            declared: ListingState::Removed,
            payload,
        });
        self
    }

    /// Append an entry with an arbitrary declared state.
    pub fn push(&mut self, entry: BatchEntry<P>) -> &mut Self {
        self.entries.push(entry);
        self
    }

    pub fn entries(&self) -> &[BatchEntry<P>] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<BatchEntry<P>> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ListingId> {
        self.entries.iter().map(|e| &e.id)
    }
}

impl<P> Default for ListingBatch<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-state listing counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleCounters {
    pub new_count: usize,
    pub removed_count: usize,
    pub normal_count: usize,
}

impl LifecycleCounters {
    /// Count one more item in `state`.
    pub fn increment(&mut self, state: ListingState) {
        if let Some(slot) = self.slot_mut(state) {
            *slot += 1;
        }
    }

    /// Count one item less in `state`.
    pub fn decrement(&mut self, state: ListingState) {
        if let Some(slot) = self.slot_mut(state) {
            *slot = slot.saturating_sub(1);
        }
    }

    /// Move one item from `from` to `to`.
    pub fn transition(&mut self, from: ListingState, to: ListingState) {
        if from != to {
            self.decrement(from);
            self.increment(to);
        }
    }

    pub fn total(&self) -> usize {
        self.new_count + self.removed_count + self.normal_count
    }

    fn slot_mut(&mut self, state: ListingState) -> Option<&mut usize> {
        match state {
            ListingState::New => Some(&mut self.new_count),
            ListingState::Removed => Some(&mut self.removed_count),
            ListingState::Normal => Some(&mut self.normal_count),
            ListingState::Unknown => None,
        }
    }
}
