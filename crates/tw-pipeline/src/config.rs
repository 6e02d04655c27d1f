//! Pipeline configuration.

use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tw_core::SortKeySpec;
use tw_view::ViewSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of the command channel. A full channel makes producers wait.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Quiet window before a filter/sort/page recomputation.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Longest a pending recomputation may be postponed by further requests.
    #[serde(default = "default_max_debounce_ms")]
    pub max_debounce_ms: u64,
    /// Entries kept by the rolling error log.
    #[serde(default = "default_error_log_capacity")]
    pub error_log_capacity: usize,
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    /// Batches at least this long are classified on the blocking pool.
    #[serde(default = "default_parallel_classify_threshold")]
    pub parallel_classify_threshold: usize,
    #[serde(default = "default_show_new")]
    pub show_new: bool,
    #[serde(default)]
    pub show_removed: bool,
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_debounce_ms() -> u64 {
    250
}

fn default_max_debounce_ms() -> u64 {
    1000
}

fn default_error_log_capacity() -> usize {
    100
}

fn default_page_size() -> usize {
    25
}

fn default_parallel_classify_threshold() -> usize {
    512
}

fn default_show_new() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            debounce_ms: default_debounce_ms(),
            max_debounce_ms: default_max_debounce_ms(),
            error_log_capacity: default_error_log_capacity(),
            default_page_size: default_page_size(),
            parallel_classify_threshold: default_parallel_classify_threshold(),
            show_new: default_show_new(),
            show_removed: false,
        }
    }
}

impl PipelineConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn max_debounce(&self) -> Duration {
        Duration::from_millis(self.max_debounce_ms)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.channel_capacity == 0 {
            return Err(PipelineError::Config(
                "channel_capacity must be positive".to_string(),
            ));
        }
        if self.error_log_capacity == 0 {
            return Err(PipelineError::Config(
                "error_log_capacity must be positive".to_string(),
            ));
        }
        if self.default_page_size == 0 {
            return Err(PipelineError::Config(
                "default_page_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings for the view stages.
    pub fn view_settings(&self, sort_keys: Vec<SortKeySpec>) -> ViewSettings {
        ViewSettings {
            debounce: self.debounce(),
            max_debounce: self.max_debounce(),
            page_size: self.default_page_size,
            show_new: self.show_new,
            show_removed: self.show_removed,
            sort_keys,
        }
    }
}
