//! Listing registry and lifecycle classification for TradeWatch.
//!
//! Owns one entry per listing identity and applies the lifecycle
//! transitions declared by source batches.
//!
//! Batch processing is split in two steps so the expensive part can run
//! off the serialized context:
//! - [`classify`]: pure validation of a batch against known states, producing
//!   a [`TransitionPlan`] or the list of protocol violations
//! - [`ItemRegistry::apply_plan`]: atomic application of a plan

pub mod classify;
pub mod error;
pub mod registry;

pub use classify::{
    classify, LifecycleSummary, PlannedTransition, ProtocolViolation, StateLookup, TransitionKind,
    TransitionPlan, ViolationKind,
};
pub use error::{BatchRejection, RegistryError, RegistryResult};
pub use registry::{AppliedBatch, ItemRegistry};
