//! Core domain types for the TradeWatch listing pipeline.
//!
//! This crate provides the vocabulary shared by every pipeline stage:
//! - `ListingId`: Content-addressed identity of a marketplace listing
//! - `ListingState`: Lifecycle state of a listing (New / Normal / Removed)
//! - `ListingItem`, `ListingBatch`: Registry entries and per-refresh diffs
//! - `SourceToken`: Opaque handle for a registered query/tab
//! - `PageRequest`, `PageResponse`, `SortDirection`: View negotiation types

pub mod error;
pub mod listing;
pub mod source;
pub mod view;

pub use error::{CoreError, Result};
pub use listing::{BatchEntry, LifecycleCounters, ListingBatch, ListingId, ListingItem, ListingState};
pub use source::SourceToken;
pub use view::{PageRequest, PageResponse, SortDirection, SortKeySpec};
