//! Configuration types shared by every verdant component.

mod vars;

pub use vars::{InterpolationResult, interpolate};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{
    ConfigError, EnvInterpolationSnafu, ReadFileSnafu, UnsupportedFormatSnafu, YamlParseSnafu,
};
use crate::metrics::DEFAULT_METRICS_ADDR;
use crate::retry::RetryPolicy;
use crate::transport::TopicSpec;

/// Check if a path has a YAML extension.
pub fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}

/// Read a YAML config file, interpolate environment references and deserialize it.
pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    ensure!(
        is_yaml_file(path),
        UnsupportedFormatSnafu {
            path: path.to_path_buf()
        }
    );
    let text = std::fs::read_to_string(path).context(ReadFileSnafu {
        path: path.to_path_buf(),
    })?;
    parse_yaml(&text)
}

/// Interpolate environment references in `text` and deserialize it.
pub fn parse_yaml<T: DeserializeOwned>(text: &str) -> Result<T, ConfigError> {
    let interpolated = interpolate(text);
    ensure!(
        interpolated.is_ok(),
        EnvInterpolationSnafu {
            message: interpolated.errors.join("\n")
        }
    );
    serde_yaml::from_str(&interpolated.text).context(YamlParseSnafu)
}

/// Metrics configuration for Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    DEFAULT_METRICS_ADDR.to_string()
}

/// Backoff settings for registry calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.initial_delay_ms))
            .with_multiplier(self.multiplier)
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
    }

    /// Collect validation errors, prefixing field names with `scope`.
    pub fn validate(&self, scope: &str, errors: &mut Vec<String>) {
        if self.max_attempts == 0 {
            errors.push(format!("{scope}.max_attempts must be at least 1"));
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            errors.push(format!("{scope}.multiplier must be >= 1.0"));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            errors.push(format!("{scope}.max_delay_ms must be >= initial_delay_ms"));
        }
    }
}

/// Which schema registry implementation to talk to.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    /// Confluent-compatible REST registry.
    #[default]
    Http,
    /// Process-local registry, only meaningful for `run`.
    Memory,
}

/// Schema registry connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    #[serde(default)]
    pub kind: RegistryKind,
    /// Base URL, required for `kind: http`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_registry_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_registry_timeout_secs() -> u64 {
    10
}

impl RegistryConfig {
    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.kind == RegistryKind::Http && self.url.as_deref().is_none_or(str::is_empty) {
            errors.push("registry.url is required for kind 'http'".to_string());
        }
        self.retry.validate("registry.retry", errors);
    }
}

/// Transport log location and the topics it must carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    /// Storage URL of the log (`file://`, `s3://`, `s3::http://host:port/bucket`, `memory://`).
    pub url: String,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
    #[serde(default = "default_topics")]
    pub topics: Vec<TopicSpec>,
}

fn default_topics() -> Vec<TopicSpec> {
    vec![
        TopicSpec::new("alert", 4, 2),
        TopicSpec::new("raw-sensor-data", 10, 3),
    ]
}

impl TransportConfig {
    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.url.is_empty() {
            errors.push("transport.url cannot be empty".to_string());
        }
        for topic in &self.topics {
            if let Err(e) = topic.validate() {
                errors.push(e.to_string());
            }
        }
    }

    pub fn has_topic(&self, name: &str) -> bool {
        self.topics.iter().any(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_yaml_file() {
        assert!(is_yaml_file(Path::new("config.yaml")));
        assert!(is_yaml_file(Path::new("/etc/verdant/pipeline.yml")));
        assert!(!is_yaml_file(Path::new("config.json")));
        assert!(!is_yaml_file(Path::new("config")));
    }

    #[test]
    fn test_retry_config_defaults() {
        let config: RetryConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, RetryConfig::default());

        let policy = config.policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
    }

    #[test]
    fn test_retry_config_validation() {
        let config = RetryConfig {
            max_attempts: 0,
            initial_delay_ms: 100,
            multiplier: 0.5,
            max_delay_ms: 10,
        };
        let mut errors = Vec::new();
        config.validate("registry.retry", &mut errors);
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|e| e.starts_with("registry.retry.")));
    }

    #[test]
    fn test_registry_config_requires_url_for_http() {
        let config: RegistryConfig = serde_yaml::from_str("kind: http").unwrap();
        let mut errors = Vec::new();
        config.validate(&mut errors);
        assert_eq!(errors.len(), 1);

        let config: RegistryConfig = serde_yaml::from_str("kind: memory").unwrap();
        let mut errors = Vec::new();
        config.validate(&mut errors);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_transport_config_default_topics() {
        let config: TransportConfig = serde_yaml::from_str("url: memory://").unwrap();
        assert!(config.has_topic("raw-sensor-data"));
        assert!(config.has_topic("alert"));
        let raw = config
            .topics
            .iter()
            .find(|t| t.name == "raw-sensor-data")
            .unwrap();
        assert_eq!(raw.partitions, 10);
        assert_eq!(raw.replication_factor, 3);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: Result<MetricsConfig, _> = serde_yaml::from_str("address: x\nport: 1");
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_yaml_reports_interpolation_errors() {
        let result: Result<MetricsConfig, _> =
            parse_yaml("address: ${VERDANT_TEST_DEFINITELY_UNSET_ADDR}");
        assert!(matches!(result, Err(ConfigError::EnvInterpolation { .. })));
    }
}
