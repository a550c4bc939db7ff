//! Agent Settings
//!
//! Tunables shared by every agent, read from the environment.

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Agent-wide settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Sampling temperature passed to the provider
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Completion token cap (provider default when unset)
    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Verbose logging
    #[serde(default)]
    pub debug: bool,

    /// Log level used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Maximum number of messages an agent keeps in its history
    #[serde(default = "default_max_history_length")]
    pub max_history_length: usize,
}

fn default_temperature() -> f32 { 0.7 }
fn default_log_level() -> String { "INFO".into() }
fn default_max_history_length() -> usize { 1000 }

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: None,
            debug: false,
            log_level: default_log_level(),
            max_history_length: default_max_history_length(),
        }
    }
}

impl AgentSettings {
    /// Read settings from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let temperature = match lookup("TEMPERATURE") {
            Some(raw) => raw.trim().parse::<f32>().map_err(|e| {
                AgentError::Config(format!("TEMPERATURE must be a number, got '{}': {}", raw, e))
            })?,
            None => defaults.temperature,
        };

        let max_tokens = match lookup("MAX_TOKENS").filter(|v| !v.trim().is_empty()) {
            Some(raw) => Some(raw.trim().parse::<u32>().map_err(|e| {
                AgentError::Config(format!("MAX_TOKENS must be an integer, got '{}': {}", raw, e))
            })?),
            None => None,
        };

        let max_history_length = match lookup("MAX_HISTORY_LENGTH") {
            Some(raw) => raw.trim().parse::<usize>().map_err(|e| {
                AgentError::Config(format!("MAX_HISTORY_LENGTH must be an integer, got '{}': {}", raw, e))
            })?,
            None => defaults.max_history_length,
        };

        Ok(Self {
            temperature,
            max_tokens,
            debug: lookup("DEBUG").is_some_and(|v| v.trim().eq_ignore_ascii_case("true")),
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
            max_history_length,
        })
    }

    /// `tracing` filter directive derived from these settings
    pub fn log_filter(&self) -> String {
        if self.debug {
            "debug".into()
        } else {
            self.log_level.to_lowercase()
        }
    }
}
