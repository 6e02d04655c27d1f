//! Prometheus metrics and structured logging for TradeWatch.
//!
//! - Structured logging with tracing (pretty in development, JSON in production)
//! - Per-pipeline Prometheus metrics, each instance with its own registry

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::PipelineMetrics;
