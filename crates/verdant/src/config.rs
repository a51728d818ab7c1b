//! Top-level configuration of the `verdant` binary.
//!
//! One YAML file describes every component; each subcommand uses the
//! sections it needs. Environment references are interpolated before
//! parsing.

use serde::{Deserialize, Serialize};
use std::path::Path;

use verdant_bronze::EngineConfig;
use verdant_core::config::{
    MetricsConfig, RegistryConfig, RetryConfig, TransportConfig, load_yaml, parse_yaml,
};
use verdant_core::error::ConfigError;
use verdant_core::schema::{FieldType, parse_declared_fields};
use verdant_producer::{ProducerConfig, SimulatorConfig};

/// Full pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub transport: TransportConfig,
    pub registry: RegistryConfig,
    /// Backoff for topic creation.
    #[serde(default)]
    pub provision_retry: RetryConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
    /// Required by `ingest` and `run`.
    #[serde(default)]
    pub engine: Option<EngineConfig>,
}

impl AppConfig {
    /// Load and validate a configuration file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Self = parse_yaml(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section, reporting all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        self.transport.validate(&mut errors);
        self.registry.validate(&mut errors);
        self.provision_retry.validate("provision_retry", &mut errors);
        self.producer.validate(&mut errors);
        self.simulator.validate(&mut errors);

        if !self.transport.has_topic(&self.producer.topic) {
            errors.push(format!(
                "producer.topic '{}' is not listed in transport.topics",
                self.producer.topic
            ));
        }

        if let Some(engine) = &self.engine {
            engine.validate(&mut errors);
            if !self.transport.has_topic(&engine.topic) {
                errors.push(format!(
                    "engine.topic '{}' is not listed in transport.topics",
                    engine.topic
                ));
            }
            self.validate_metric_fields(engine, &mut errors);
        }

        match errors.len() {
            0 => Ok(()),
            _ => Err(ConfigError::MultipleErrors { errors }),
        }
    }

    /// Metric fields must name numeric fields of the device types the
    /// producer declares.
    fn validate_metric_fields(&self, engine: &EngineConfig, errors: &mut Vec<String>) {
        for (device_type, spec) in &engine.metrics {
            let Some(field) = spec.field.as_deref().filter(|f| !f.is_empty()) else {
                continue;
            };
            let Some(Some(declared)) = self.producer.device_types.get(device_type) else {
                continue;
            };
            let Ok(fields) = parse_declared_fields(device_type, declared) else {
                continue;
            };
            match fields.get(field) {
                Some(FieldType::Numeric) => {}
                Some(_) => errors.push(format!(
                    "engine.metrics.{device_type}: field '{field}' is not numeric"
                )),
                None => errors.push(format!(
                    "engine.metrics.{device_type}: '{field}' is not a field of {device_type}"
                )),
            }
        }
    }

    /// Engine section, for the subcommands that need one.
    pub fn engine(&self) -> Result<&EngineConfig, ConfigError> {
        self.engine.as_ref().ok_or_else(|| ConfigError::InvalidValue {
            field: "engine".to_string(),
            message: "an engine section is required to ingest".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
transport:
  url: memory://log
registry:
  kind: memory
"#;

    fn with_engine(engine: &str) -> String {
        format!("{MINIMAL}engine:\n{engine}")
    }

    #[test]
    fn test_minimal_config_uses_deployment_defaults() {
        let config = AppConfig::parse(MINIMAL).unwrap();

        let topics: Vec<(&str, u32, u32)> = config
            .transport
            .topics
            .iter()
            .map(|t| (t.name.as_str(), t.partitions, t.replication_factor))
            .collect();
        assert!(topics.contains(&("raw-sensor-data", 10, 3)));
        assert!(topics.contains(&("alert", 4, 2)));
        assert_eq!(config.producer.client_id, "sensor-data-producer");
        assert_eq!(config.producer.max_retries, 5);
        assert_eq!(config.simulator.interval_secs, 15);
        assert!(config.engine.is_none());
        assert!(config.engine().is_err());
    }

    #[test]
    fn test_engine_section() {
        let text = with_engine(
            "  sink:\n    table_uri: memory://bronze\n  metrics:\n    soil_moisture:\n      function: mean\n      field: moisture\n",
        );
        let config = AppConfig::parse(&text).unwrap();
        let engine = config.engine().unwrap();
        assert_eq!(engine.topic, "raw-sensor-data");
        assert_eq!(engine.window.size_secs, 300);
        assert_eq!(engine.window.slide_secs, 15);
        assert_eq!(engine.window.allowed_lateness_secs, 600);
        assert_eq!(engine.metric_for("soil_moisture").to_string(), "mean(moisture)");
    }

    #[test]
    fn test_errors_are_collected() {
        let text = format!(
            "{MINIMAL}producer:\n  topic: telemetry\nengine:\n  topic: other\n  window:\n    size_secs: 10\n    slide_secs: 20\n  metrics:\n    soil_moisture:\n      function: max\n      field: colour\n  sink:\n    table_uri: memory://bronze\n"
        );
        let err = AppConfig::parse(&text).unwrap_err();
        let ConfigError::MultipleErrors { errors } = err else {
            panic!("expected collected errors, got {err}");
        };
        assert!(errors.iter().any(|e| e.contains("producer.topic 'telemetry'")));
        assert!(errors.iter().any(|e| e.contains("engine.topic 'other'")));
        assert!(errors.iter().any(|e| e.contains("slide_secs")));
        assert!(errors.iter().any(|e| e.contains("'colour' is not a field")));
    }

    #[test]
    fn test_http_registry_requires_url() {
        let text = "transport:\n  url: memory://log\nregistry:\n  kind: http\n";
        let err = AppConfig::parse(text).unwrap_err();
        assert!(err.to_string().contains("registry.url"));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let text = format!("{MINIMAL}unexpected: true\n");
        assert!(matches!(
            AppConfig::parse(&text),
            Err(ConfigError::YamlParse { .. })
        ));
    }

    #[test]
    fn test_environment_interpolation() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("VERDANT_TEST_TABLE_URI", "memory://from-env") };
        let text = with_engine("  sink:\n    table_uri: ${VERDANT_TEST_TABLE_URI}\n");
        let config = AppConfig::parse(&text).unwrap();
        assert_eq!(config.engine().unwrap().sink.table_uri, "memory://from-env");
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/verdant.yaml");
        let config = AppConfig::from_path(&path).unwrap();
        assert_eq!(config.producer.device_types.len(), 3);
        assert_eq!(config.engine().unwrap().max_consecutive_failures, 5);
    }

    #[test]
    fn test_from_path_requires_yaml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("verdant.yaml");
        std::fs::write(&path, MINIMAL).unwrap();
        assert!(AppConfig::from_path(&path).is_ok());

        let json = dir.path().join("verdant.json");
        std::fs::write(&json, "{}").unwrap();
        assert!(matches!(
            AppConfig::from_path(&json),
            Err(ConfigError::UnsupportedFormat { .. })
        ));
    }
}
