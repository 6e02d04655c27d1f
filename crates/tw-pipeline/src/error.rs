//! Pipeline error types.

use thiserror::Error;
use tw_core::SourceToken;
use tw_feed::FeedError;
use tw_registry::RegistryError;
use tw_telemetry::TelemetryError;
use tw_view::ViewError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unknown source: {0}")]
    UnknownSource(SourceToken),

    #[error("Source {token} is faulted: {reason}")]
    SourceFaulted { token: SourceToken, reason: String },

    #[error("Source {0} was removed or re-homed")]
    SourceClosed(SourceToken),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Feed error: {0}")]
    Feed(FeedError),

    #[error("View configuration error: {0}")]
    View(#[from] ViewError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Pipeline channel closed")]
    ChannelClosed,
}

impl From<FeedError> for PipelineError {
    fn from(e: FeedError) -> Self {
        match e {
            FeedError::UnknownSource(token) => Self::UnknownSource(token),
            FeedError::Registry(e) => Self::Registry(e),
            other => Self::Feed(other),
        }
    }
}

impl PipelineError {
    /// Whether the batch was rejected for breaking the source contract.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Registry(RegistryError::ProtocolViolation(_)))
    }

    /// Whether this error signals an internal invariant break.
    pub fn is_desync(&self) -> bool {
        match self {
            Self::Registry(e) => e.is_desync(),
            Self::Feed(e) => e.is_desync(),
            _ => false,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
