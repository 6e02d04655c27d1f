//! Application configuration.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tw_core::SortKeySpec;
use tw_pipeline::PipelineConfig;

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV: &str = "TRADEWATCH_CONFIG";

/// Config file used when neither `--config` nor the environment names one.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive. `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Sort keys active at start-up. Newest listings first by default.
    #[serde(default = "default_sort_keys")]
    pub sort_keys: Vec<SortKeySpec>,
}

fn default_sort_keys() -> Vec<SortKeySpec> {
    vec![SortKeySpec::descending("indexed_at")]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            telemetry: TelemetryConfig::default(),
            sort_keys: default_sort_keys(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.pipeline.validate()?;
        Ok(config)
    }

    /// Resolve and load configuration.
    ///
    /// Order: `explicit` path > `TRADEWATCH_CONFIG` > `config/default.toml`.
    /// Only a missing default file falls back to built-in defaults; an
    /// explicitly named file must exist.
    pub fn load(explicit: Option<&str>) -> AppResult<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::from_file(path);
        }
        if Path::new(DEFAULT_CONFIG_PATH).exists() {
            return Self::from_file(DEFAULT_CONFIG_PATH);
        }
        Ok(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_core::SortDirection;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.sort_keys, vec![SortKeySpec::descending("indexed_at")]);
        assert_eq!(config.pipeline.default_page_size, 25);
    }

    #[test]
    fn test_parse_sections() {
        let config: AppConfig = toml::from_str(
            r#"
            [pipeline]
            debounce_ms = 100
            default_page_size = 10

            [telemetry]
            log_level = "debug"

            [[sort_keys]]
            name = "price"

            [[sort_keys]]
            name = "indexed_at"
            direction = "descending"
            "#,
        )
        .unwrap();

        assert_eq!(config.pipeline.debounce_ms, 100);
        assert_eq!(config.pipeline.max_debounce_ms, 1000);
        assert_eq!(config.pipeline.default_page_size, 10);
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(config.sort_keys.len(), 2);
        assert_eq!(config.sort_keys[0].direction, SortDirection::Ascending);
        assert_eq!(config.sort_keys[1].direction, SortDirection::Descending);
    }

    #[test]
    fn test_invalid_pipeline_section_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[pipeline]\ndefault_page_size = 0\n").unwrap();

        let err = AppConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, AppError::Pipeline(_)));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = AppConfig::load(Some("/nonexistent/tradewatch.toml")).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
