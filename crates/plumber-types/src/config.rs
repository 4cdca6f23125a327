//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls the
//! retry backoff and the database location. All fields have defaults.

use serde::{Deserialize, Serialize};

/// Delay before the first retry, in milliseconds.
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 3000;

/// Maximum number of attempts (first run included) per step.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Top-level configuration for the flow engine.
///
/// Loaded from `~/.plumber/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database URL. `None` means `{data_dir}/plumber.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Retry backoff settings handed to the external scheduler.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

/// Exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_delay_ms() -> u64 {
    DEFAULT_INITIAL_DELAY_MS
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}
