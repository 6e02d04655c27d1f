//! TradeWatch application.
//!
//! Wires the pipeline to a concrete payload and drives it from a replay file:
//! - `AppConfig`: TOML configuration (pipeline, telemetry, start-up sort keys)
//! - `TradeListing`: demo payload with its sort keys and quick-filter matcher
//! - `Application`: replay driver over JSON-lines `ReplayEvent`s

pub mod app;
pub mod config;
pub mod error;
pub mod listing;

pub use app::{Application, ReplayEvent, ReplayReport, Snapshot};
pub use config::{AppConfig, TelemetryConfig};
pub use error::{AppError, AppResult};
pub use listing::{ListingRow, ListingTextMatcher, TradeListing};
