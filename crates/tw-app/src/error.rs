//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] tw_pipeline::PipelineError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] tw_telemetry::TelemetryError),

    #[error("Replay line {line}: {reason}")]
    Replay { line: usize, reason: String },

    #[error("Unknown tab or group: {0}")]
    UnknownName(String),

    #[error("Name already in use: {0}")]
    DuplicateName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
