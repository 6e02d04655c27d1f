//! Pipeline orchestrator for TradeWatch.
//!
//! Runs the whole Merge -> Filter -> Sort -> Page pipeline on one actor
//! task and republishes the current page with its counters.
//!
//! # Key Components
//!
//! - [`PipelineBuilder`]: Registers sort keys and the quick-filter matcher, then spawns
//! - [`PipelineHandle`]: Cloneable handle for commands, projection and status reads
//! - [`SourceFeed`]: Producer-side handle bound to one query
//! - [`Projection`]: Published page, page info, counters and busy flag
//! - [`ErrorLog`]: Bounded rolling log of source errors and faults
//! - [`PipelineConfig`]: Channel, debounce and paging parameters

pub mod config;
pub mod error;
pub mod error_log;
pub mod feed;
pub mod orchestrator;
pub mod projection;

pub use config::PipelineConfig;
pub use error::{PipelineError, PipelineResult};
pub use error_log::{ErrorLog, ErrorRecord};
pub use feed::SourceFeed;
pub use orchestrator::{PipelineBuilder, PipelineHandle, PipelineMsg, PipelineTask, SourceStatus};
pub use projection::{Projection, VerificationRequired};
pub use tw_feed::SourceKind;
