//! Layered application configuration.
//!
//! Loaded `set_default → File::with_name(..).required(false) →
//! Environment::with_prefix("ALEX").separator("__")`, so every option can be
//! pinned in a config file and overridden per-deployment by environment
//! variables such as `ALEX__EXECUTION__GLOBAL_MAX_IN_FLIGHT`.

pub mod error;

use std::time::Duration;

use serde::Deserialize;

use error::{ConfigResult, ConfigurationError};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub global_max_in_flight: usize,
    pub pending_queue_capacity: usize,
    pub lease_duration_secs: u64,
    pub lease_renew_interval_secs: u64,
    pub execute_max_runtime_secs: u64,
    pub idle_watchdog_secs: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            global_max_in_flight: 64,
            pending_queue_capacity: 512,
            lease_duration_secs: 30,
            lease_renew_interval_secs: 8,
            execute_max_runtime_secs: 600,
            idle_watchdog_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcasterSettings {
    pub buffer_size: usize,
    pub last_seen_cache_size: usize,
    pub drops_per_session_cap: usize,
    pub drops_per_session_ttl_secs: u64,
}

impl Default for BroadcasterSettings {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            last_seen_cache_size: 2048,
            drops_per_session_cap: 2048,
            drops_per_session_ttl_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistorySettings {
    pub buffer_size: usize,
    pub batch_max: usize,
    pub flush_interval_ms: u64,
    pub retry_min_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self { buffer_size: 10_000, batch_max: 256, flush_interval_ms: 500, retry_min_ms: 250, retry_max_ms: 5_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub chat_slot_ttl_secs: u64,
    pub chat_dedup_ttl_secs: u64,
    pub pending_input_capacity: usize,
    pub command_global_cap: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self { chat_slot_ttl_secs: 60 * 60, chat_dedup_ttl_secs: 5 * 60, pending_input_capacity: 16, command_global_cap: 8 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerConcurrencyPolicy {
    Skip,
    Delay,
}

impl Default for SchedulerConcurrencyPolicy {
    fn default() -> Self {
        Self::Delay
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DurableSettings {
    pub db_path: String,
    pub history_prune_ttl_secs: u64,
}

impl Default for DurableSettings {
    fn default() -> Self {
        Self { db_path: "alex.db".into(), history_prune_ttl_secs: 7 * 24 * 60 * 60 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub http_response_byte_cap: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { bind_addr: "0.0.0.0:8080".into(), http_response_byte_cap: 1024 * 1024 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub execution: ExecutionSettings,
    pub broadcaster: BroadcasterSettings,
    pub history: HistorySettings,
    pub gateway: GatewaySettings,
    pub durable: DurableSettings,
    pub server: ServerSettings,
    pub scheduler_concurrency_policy: SchedulerConcurrencyPolicy,
}

impl AppConfig {
    /// Load layered configuration: built-in defaults, then an optional
    /// `config.{toml,yaml,json}` file, then `ALEX__SECTION__KEY` env vars.
    pub fn load() -> ConfigResult<Self> {
        let _ = dotenvy::dotenv();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("ALEX").separator("__"));

        let built = builder.build().map_err(|e| {
            ConfigurationError::invalid(format!("failed to assemble configuration layers: {e}"), "check config.toml and ALEX__* environment variables for typos")
        })?;

        built.try_deserialize().map_err(|e| {
            ConfigurationError::invalid(format!("failed to parse configuration: {e}"), "check that every ALEX__* value has the expected type")
        })
    }

    #[must_use]
    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.execution.lease_duration_secs as i64)
    }

    #[must_use]
    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_secs(self.execution.lease_renew_interval_secs)
    }

    #[must_use]
    pub fn execute_max_runtime(&self) -> Duration {
        Duration::from_secs(self.execution.execute_max_runtime_secs)
    }

    #[must_use]
    pub fn idle_watchdog(&self) -> Duration {
        Duration::from_secs(self.execution.idle_watchdog_secs)
    }

    /// Cross-field validation that a single field's `Deserialize` can't express.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if self.execution.lease_renew_interval_secs >= self.execution.lease_duration_secs {
            errors.push(ConfigurationError::incompatible(
                format!("execution.lease_duration_secs={}", self.execution.lease_duration_secs),
                format!("execution.lease_renew_interval_secs={}", self.execution.lease_renew_interval_secs),
                "lease_renew_interval must be shorter than lease_duration or leases will expire before renewal",
            ));
        }

        if self.history.retry_min_ms > self.history.retry_max_ms {
            errors.push(ConfigurationError::incompatible(
                format!("history.retry_min_ms={}", self.history.retry_min_ms),
                format!("history.retry_max_ms={}", self.history.retry_max_ms),
                "retry_min_ms must not exceed retry_max_ms",
            ));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.into_iter().next().expect("checked len == 1")),
            _ => Err(ConfigurationError::multiple(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn lease_renew_interval_not_shorter_than_lease_duration_is_rejected() {
        let mut config = AppConfig::default();
        config.execution.lease_duration_secs = 5;
        config.execution.lease_renew_interval_secs = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_retry_bounds_are_rejected() {
        let mut config = AppConfig::default();
        config.history.retry_min_ms = 5_000;
        config.history.retry_max_ms = 250;
        assert!(config.validate().is_err());
    }
}
