//! Configuration for the telemetry producer and the sensor simulator.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use verdant_core::retry::RetryPolicy;
use verdant_core::schema::parse_declared_fields;

fn default_topic() -> String {
    "raw-sensor-data".to_string()
}

fn default_client_id() -> String {
    "sensor-data-producer".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

fn default_retry_backoff_max_ms() -> u64 {
    2000
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_flush_timeout_secs() -> u64 {
    30
}

fn fields(pairs: &[(&str, &str)]) -> Option<IndexMap<String, String>> {
    Some(
        pairs
            .iter()
            .map(|(name, declared)| (name.to_string(), declared.to_string()))
            .collect(),
    )
}

fn default_device_types() -> IndexMap<String, Option<IndexMap<String, String>>> {
    IndexMap::from([
        (
            "soil_moisture".to_string(),
            fields(&[("moisture", "float"), ("ph", "float")]),
        ),
        (
            "poultry_temp".to_string(),
            fields(&[("temp_celsius", "float"), ("humidity", "float")]),
        ),
        (
            "bird_feeder".to_string(),
            fields(&[("food_level", "float"), ("battery", "float")]),
        ),
    ])
}

/// Telemetry producer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProducerConfig {
    /// Topic shared by every device type.
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Identifies this producer in logs.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Send retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Cap on any single backoff.
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    /// Accepted but unsent messages before `emit` rejects with `QueueFull`.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_flush_timeout_secs")]
    pub flush_timeout_secs: u64,
    /// Device type → declared fields (`float`, `int`, `str`, `bool`).
    ///
    /// A type without fields must already be registered; its current schema
    /// is resolved instead.
    #[serde(default = "default_device_types")]
    pub device_types: IndexMap<String, Option<IndexMap<String, String>>>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            client_id: default_client_id(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            queue_capacity: default_queue_capacity(),
            flush_timeout_secs: default_flush_timeout_secs(),
            device_types: default_device_types(),
        }
    }
}

impl ProducerConfig {
    /// Retry policy for a single message: the first attempt plus `max_retries`.
    pub fn delivery_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries.saturating_add(1),
            Duration::from_millis(self.retry_backoff_ms),
        )
        .with_max_delay(Duration::from_millis(self.retry_backoff_max_ms))
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }

    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.topic.is_empty() {
            errors.push("producer.topic cannot be empty".to_string());
        }
        if self.queue_capacity == 0 {
            errors.push("producer.queue_capacity must be greater than 0".to_string());
        }
        if self.retry_backoff_max_ms < self.retry_backoff_ms {
            errors.push(format!(
                "producer.retry_backoff_max_ms ({}) must be at least retry_backoff_ms ({})",
                self.retry_backoff_max_ms, self.retry_backoff_ms
            ));
        }
        if self.device_types.is_empty() {
            errors.push("producer.device_types cannot be empty".to_string());
        }
        for (device_type, declared) in &self.device_types {
            if device_type.is_empty()
                || !device_type
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                errors.push(format!(
                    "producer.device_types: '{device_type}' must match [a-zA-Z0-9_]+"
                ));
            }
            if let Some(declared) = declared
                && let Err(e) = parse_declared_fields(device_type, declared)
            {
                errors.push(format!("producer.device_types: {e}"));
            }
        }
    }
}

fn default_interval_secs() -> u64 {
    15
}

fn default_farm_count() -> u32 {
    100
}

/// Sensor simulator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulatorConfig {
    /// Seconds between rounds. Each round emits one reading per device type.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Readings are attributed to `farm_1` ..= `farm_{farm_count}`.
    #[serde(default = "default_farm_count")]
    pub farm_count: u32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            farm_count: default_farm_count(),
        }
    }
}

impl SimulatorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.interval_secs == 0 {
            errors.push("simulator.interval_secs must be greater than 0".to_string());
        }
        if self.farm_count == 0 {
            errors.push("simulator.farm_count must be greater than 0".to_string());
        }
    }
}
