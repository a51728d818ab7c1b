//! Configuration for the ingestion engine.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use verdant_core::config::RetryConfig;

use crate::window::WindowSpec;

fn default_name() -> String {
    "bronze-sensor-events".to_string()
}

fn default_topic() -> String {
    "raw-sensor-data".to_string()
}

fn default_max_schema_stall_batches() -> u32 {
    10
}

/// Streaming ingestion engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Identifies the engine in logs and metrics.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub window: WindowConfig,
    /// Backoff for transport fetches.
    #[serde(default)]
    pub fetch_retry: RetryConfig,
    /// Consecutive batches a schema id may hold back its partitions before
    /// its records are dropped.
    #[serde(default = "default_max_schema_stall_batches")]
    pub max_schema_stall_batches: u32,
    /// Aborted batches in a row before the engine stops (0 = unlimited).
    #[serde(default)]
    pub max_consecutive_failures: u32,
    /// Device type → aggregate. Types not listed are counted.
    #[serde(default)]
    pub metrics: IndexMap<String, MetricSpec>,
    pub sink: SinkConfig,
}

impl EngineConfig {
    /// Configuration with defaults for everything but the sink location.
    pub fn new(table_uri: impl Into<String>) -> Self {
        Self {
            name: default_name(),
            topic: default_topic(),
            batch: BatchConfig::default(),
            window: WindowConfig::default(),
            fetch_retry: RetryConfig::default(),
            max_schema_stall_batches: default_max_schema_stall_batches(),
            max_consecutive_failures: 0,
            metrics: IndexMap::new(),
            sink: SinkConfig::new(table_uri),
        }
    }

    /// Aggregate for a device type.
    pub fn metric_for(&self, device_type: &str) -> MetricSpec {
        self.metrics.get(device_type).cloned().unwrap_or_default()
    }

    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.name.is_empty() {
            errors.push("engine.name cannot be empty".to_string());
        }
        if self.topic.is_empty() {
            errors.push("engine.topic cannot be empty".to_string());
        }
        if self.batch.max_records == 0 {
            errors.push("engine.batch.max_records must be greater than 0".to_string());
        }
        self.window.validate(errors);
        self.fetch_retry.validate("engine.fetch_retry", errors);
        for (device_type, spec) in &self.metrics {
            if let Err(message) = spec.validate() {
                errors.push(format!("engine.metrics.{device_type}: {message}"));
            }
        }
        if self.sink.table_uri.is_empty() {
            errors.push("engine.sink.table_uri cannot be empty".to_string());
        }
    }
}

fn default_max_records() -> usize {
    10_000
}

fn default_interval_ms() -> u64 {
    1000
}

/// Micro-batch sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    /// Upper bound on records fetched per batch, across all partitions.
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    /// Wait between polls when the previous batch found nothing.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl BatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_size_secs() -> u64 {
    300
}

fn default_slide_secs() -> u64 {
    15
}

fn default_allowed_lateness_secs() -> u64 {
    600
}

/// Event-time windowing. `slide_secs == size_secs` gives tumbling windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowConfig {
    #[serde(default = "default_size_secs")]
    pub size_secs: u64,
    #[serde(default = "default_slide_secs")]
    pub slide_secs: u64,
    /// Subtracted from the maximum observed event time to form the watermark.
    #[serde(default = "default_allowed_lateness_secs")]
    pub allowed_lateness_secs: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size_secs: default_size_secs(),
            slide_secs: default_slide_secs(),
            allowed_lateness_secs: default_allowed_lateness_secs(),
        }
    }
}

impl WindowConfig {
    pub fn spec(&self) -> WindowSpec {
        WindowSpec::new(
            Duration::from_secs(self.size_secs),
            Duration::from_secs(self.slide_secs),
            Duration::from_secs(self.allowed_lateness_secs),
        )
    }

    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.size_secs == 0 {
            errors.push("engine.window.size_secs must be greater than 0".to_string());
        }
        if self.slide_secs == 0 {
            errors.push("engine.window.slide_secs must be greater than 0".to_string());
        }
        if self.slide_secs > self.size_secs {
            errors.push(format!(
                "engine.window.slide_secs ({}) cannot exceed size_secs ({})",
                self.slide_secs, self.size_secs
            ));
        }
    }
}

/// Aggregate function applied per window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricFunction {
    #[default]
    Count,
    Sum,
    Mean,
    Min,
    Max,
}

impl MetricFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricFunction::Count => "count",
            MetricFunction::Sum => "sum",
            MetricFunction::Mean => "mean",
            MetricFunction::Min => "min",
            MetricFunction::Max => "max",
        }
    }
}

/// What a device type's windows compute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricSpec {
    #[serde(default)]
    pub function: MetricFunction,
    /// Numeric field the function reads. Unused by `count`.
    #[serde(default)]
    pub field: Option<String>,
}

impl MetricSpec {
    pub fn new(function: MetricFunction, field: impl Into<String>) -> Self {
        Self {
            function,
            field: Some(field.into()),
        }
    }

    fn validate(&self) -> Result<(), String> {
        match (self.function, self.field.as_deref()) {
            (MetricFunction::Count, _) => Ok(()),
            (function, None | Some("")) => Err(format!("'{}' requires a field", function.as_str())),
            (_, Some(_)) => Ok(()),
        }
    }
}

impl fmt::Display for MetricSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.function, &self.field) {
            (MetricFunction::Count, _) | (_, None) => f.write_str(self.function.as_str()),
            (function, Some(field)) => write!(f, "{}({field})", function.as_str()),
        }
    }
}

/// Where aggregates are committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    /// Delta table location (`file://`, `s3://`), or `memory://` for an
    /// in-process sink.
    pub table_uri: String,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
    /// Write a Delta checkpoint every N commits (0 = never).
    #[serde(default = "default_delta_checkpoint_interval")]
    pub delta_checkpoint_interval: usize,
}

fn default_delta_checkpoint_interval() -> usize {
    10
}

impl SinkConfig {
    pub fn new(table_uri: impl Into<String>) -> Self {
        Self {
            table_uri: table_uri.into(),
            storage_options: HashMap::new(),
            delta_checkpoint_interval: default_delta_checkpoint_interval(),
        }
    }
}
