//! Event schema engine configuration.
//!
//! Controls ingestion concurrency, flush cadence, sampling and the
//! capacity/offload limits that bound memory.

use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Event schema engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSchemasConfig {
    /// Number of ingestion workers draining the batch queue.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Depth of the bounded ingestion queue. Batches arriving while the
    /// queue is full are dropped.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Seconds between persistence flushes.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Reservoir size, shared by event models and schema versions.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    /// Maximum event models per write key (hot + offloaded).
    #[serde(default = "default_event_model_limit")]
    pub event_model_limit: usize,

    /// Maximum schema versions kept per event model.
    #[serde(default = "default_schema_version_per_model_limit")]
    pub schema_version_per_model_limit: usize,

    /// Seconds between idle-model offload sweeps.
    #[serde(default = "default_offload_interval_secs")]
    pub offload_interval_secs: u64,

    /// Models not seen for this many seconds are offloaded.
    #[serde(default = "default_offload_threshold_secs")]
    pub offload_threshold_secs: u64,

    /// Record null fields as `unknown` instead of omitting them.
    #[serde(default)]
    pub capture_unknowns: bool,

    /// Skip pre-warming the in-memory maps from the store at startup.
    #[serde(default)]
    pub disable_cache: bool,

    /// Distinct values tracked per field by each frequency counter.
    #[serde(default = "default_frequency_counter_capacity")]
    pub frequency_counter_capacity: usize,

    /// Upper bound for reloading an offloaded model on demand.
    #[serde(default = "default_reload_timeout_ms")]
    pub reload_timeout_ms: u64,
}

fn default_workers() -> usize {
    128
}
fn default_queue_depth() -> usize {
    10_000
}
fn default_flush_interval_secs() -> u64 {
    120
}
fn default_sample_size() -> usize {
    5
}
fn default_event_model_limit() -> usize {
    200
}
fn default_schema_version_per_model_limit() -> usize {
    20
}
fn default_offload_interval_secs() -> u64 {
    60
}
fn default_offload_threshold_secs() -> u64 {
    1800
}
fn default_frequency_counter_capacity() -> usize {
    20
}
fn default_reload_timeout_ms() -> u64 {
    5_000
}

impl Default for EventSchemasConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_depth: default_queue_depth(),
            flush_interval_secs: default_flush_interval_secs(),
            sample_size: default_sample_size(),
            event_model_limit: default_event_model_limit(),
            schema_version_per_model_limit:
                default_schema_version_per_model_limit(),
            offload_interval_secs: default_offload_interval_secs(),
            offload_threshold_secs: default_offload_threshold_secs(),
            capture_unknowns: false,
            disable_cache: false,
            frequency_counter_capacity: default_frequency_counter_capacity(),
            reload_timeout_ms: default_reload_timeout_ms(),
        }
    }
}

impl EventSchemasConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn offload_interval(&self) -> Duration {
        Duration::from_secs(self.offload_interval_secs)
    }

    pub fn offload_threshold(&self) -> Duration {
        Duration::from_secs(self.offload_threshold_secs)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_millis(self.reload_timeout_ms)
    }

    /// Reject settings that would make the engine unable to hold anything.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, u64); 9] = [
            ("workers", self.workers as u64),
            ("queue_depth", self.queue_depth as u64),
            ("flush_interval_secs", self.flush_interval_secs),
            ("sample_size", self.sample_size as u64),
            ("event_model_limit", self.event_model_limit as u64),
            (
                "schema_version_per_model_limit",
                self.schema_version_per_model_limit as u64,
            ),
            ("offload_interval_secs", self.offload_interval_secs),
            (
                "frequency_counter_capacity",
                self.frequency_counter_capacity as u64,
            ),
            ("reload_timeout_ms", self.reload_timeout_ms),
        ];
        for (name, value) in checks {
            if value == 0 {
                bail!("event_schemas.{name} must be at least 1");
            }
        }
        Ok(())
    }
}
