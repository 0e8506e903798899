//! Runtime configuration.
//!
//! Priority: `UAR_`-prefixed environment variables > config file > defaults.
//! Nested keys use `__` in environment names, e.g.
//! `UAR_QUEUE__MAX_CONCURRENCY=4` or `UAR_STREAM__GRACE_WINDOW_MS=250`.

use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

pub use crate::export::queue::QueueConfig;

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub queue: QueueConfig,
    pub history: HistoryConfig,
    pub stream: StreamConfig,
    pub agent: AgentConfig,
    pub exporter: ExporterConfig,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct HistoryConfig {
    /// Retained run records; `0` keeps everything.
    pub max_entries: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// How long a finished primary stream keeps accepting sub-agent events.
    pub grace_window_ms: u64,
    /// Capacity of the merged stream channel.
    pub buffer_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            grace_window_ms: 100,
            buffer_size: 256,
        }
    }
}

impl StreamConfig {
    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Maximum model turns per run.
    pub max_steps: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { max_steps: 10 }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ExporterConfig {
    /// Telemetry API base URL. Export is disabled when unset.
    pub base_url: Option<String>,
    pub public_key: Option<String>,
    pub secret_key: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            public_key: None,
            secret_key: None,
            request_timeout_ms: 10_000,
        }
    }
}

impl RuntimeConfig {
    /// Load defaults, then `path` (YAML, TOML or JSON by extension), then
    /// `UAR_*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let defaults = Self::default();
        let mut builder = Config::builder()
            .set_default(
                "queue.max_concurrency",
                defaults.queue.max_concurrency as u64,
            )?
            .set_default("queue.default_timeout_ms", defaults.queue.default_timeout_ms)?
            .set_default(
                "queue.default_retries",
                u64::from(defaults.queue.default_retries),
            )?
            .set_default("queue.retry_base_delay_ms", defaults.queue.retry_base_delay_ms)?
            .set_default("queue.max_retry_delay_ms", defaults.queue.max_retry_delay_ms)?
            .set_default("history.max_entries", defaults.history.max_entries as u64)?
            .set_default("stream.grace_window_ms", defaults.stream.grace_window_ms)?
            .set_default("stream.buffer_size", defaults.stream.buffer_size as u64)?
            .set_default("agent.max_steps", defaults.agent.max_steps as u64)?
            .set_default(
                "exporter.request_timeout_ms",
                defaults.exporter.request_timeout_ms,
            )?;

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("UAR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
