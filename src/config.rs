//! Engine configuration loaded from a JSON document.
//!
//! ```json
//! {
//!   "settings": { "dead_letter_channel": "DLQ", "lock_timeout_ms": 5000 },
//!   "accounts": [{ "name": "foo", "balance": 1000 }],
//!   "channels": [{ "name": "out", "capacity": 10 }],
//!   "routes": [{ "name": "transfer", "from": "in", "policy": "local", "steps": [] }]
//! }
//! ```
//!
//! Every section is optional except `routes`.

use crate::application::coordinator::RetryPolicy;
use crate::domain::account::Account;
use crate::domain::route::Route;
use crate::error::{Result, RouteError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_dead_letter_channel() -> String {
    "DLQ".to_string()
}

fn default_operator_channel() -> String {
    "operator.alerts".to_string()
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_resource_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    10
}

/// Engine-wide knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_dead_letter_channel")]
    pub dead_letter_channel: String,
    /// Receives heuristic hazard reports.
    #[serde(default = "default_operator_channel")]
    pub operator_channel: String,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Retries of a `ResourceUnavailable` failure before it becomes a step failure.
    #[serde(default = "default_resource_retries")]
    pub resource_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Capacity of channels not declared explicitly; absent means unbounded.
    #[serde(default)]
    pub default_channel_capacity: Option<usize>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            dead_letter_channel: default_dead_letter_channel(),
            operator_channel: default_operator_channel(),
            lock_timeout_ms: default_lock_timeout_ms(),
            resource_retries: default_resource_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            default_channel_capacity: None,
        }
    }
}

impl EngineSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.resource_retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub name: String,
    #[serde(default)]
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub settings: EngineSettings,
    /// Seeded when missing; existing rows keep their balance.
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub channels: Vec<ChannelSpec>,
    pub routes: Vec<Route>,
}

impl EngineConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that need no runtime state.
    fn validate(&self) -> Result<()> {
        if self.settings.dead_letter_channel.is_empty() {
            return Err(RouteError::ConfigError(
                "dead_letter_channel must not be empty".to_string(),
            ));
        }
        if self.settings.operator_channel.is_empty() {
            return Err(RouteError::ConfigError(
                "operator_channel must not be empty".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if !seen.insert(account.name.as_str()) {
                return Err(RouteError::ConfigError(format!(
                    "account '{}' listed twice",
                    account.name
                )));
            }
        }
        Ok(())
    }
}
