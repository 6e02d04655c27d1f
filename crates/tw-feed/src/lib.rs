//! Source aggregation for TradeWatch.
//!
//! Merges the listing collections of an arbitrary, changing number of
//! sources (one per query/tab) into one logical collection:
//! - [`SourceAggregator`]: identity-based set union of attached sources,
//!   reporting every change of its output as a [`MergeDelta`]
//! - [`SourceTree`]: query leaves (each owning an `ItemRegistry`) and groups
//!   (each owning an aggregator), propagating deltas up to the root
//!
//! A `MergeDelta` has the same shape as a source mutation, so a group's
//! output can feed its parent exactly like a query does.

pub mod aggregator;
pub mod error;
pub mod tree;

pub use aggregator::{MergeDelta, SourceAggregator};
pub use error::{FeedError, FeedResult};
pub use tree::{SourceKind, SourceTree};
