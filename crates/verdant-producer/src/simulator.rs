//! Sensor simulator.
//!
//! Every interval, emits one random reading per device type the producer
//! publishes, attributed to a random farm. Values follow the field types of
//! the registered schema: numbers in `[0, 100)` rounded to two decimals,
//! booleans at random, strings from a small status vocabulary.

use chrono::Utc;
use indexmap::IndexMap;
use rand::Rng;
use rand::seq::IndexedRandom;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use verdant_core::emit;
use verdant_core::envelope::Reading;
use verdant_core::metrics::events::ReadingsSimulated;
use verdant_core::schema::{FieldType, FieldValue, SchemaDefinition};

use crate::config::SimulatorConfig;
use crate::error::ProducerError;
use crate::producer::TelemetryProducer;

const STATUSES: [&str; 3] = ["ok", "degraded", "offline"];

/// Totals reported when the simulator stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimulatorStats {
    pub rounds: u64,
    pub emitted: u64,
    pub rejected: u64,
}

pub struct Simulator {
    producer: Arc<TelemetryProducer>,
    config: SimulatorConfig,
}

fn random_value<R: Rng + ?Sized>(rng: &mut R, field_type: FieldType) -> FieldValue {
    match field_type {
        FieldType::Numeric => {
            let value: f64 = rng.random_range(0.0..100.0);
            FieldValue::Numeric((value * 100.0).round() / 100.0)
        }
        FieldType::Boolean => FieldValue::Boolean(rng.random_bool(0.5)),
        FieldType::String => {
            FieldValue::String(STATUSES.choose(rng).copied().unwrap_or("ok").to_string())
        }
    }
}

impl Simulator {
    pub fn new(producer: Arc<TelemetryProducer>, config: SimulatorConfig) -> Self {
        Self { producer, config }
    }

    fn random_reading(&self, schema: &SchemaDefinition) -> Reading {
        let mut rng = rand::rng();
        let farm = rng.random_range(1..=self.config.farm_count.max(1));
        let field_values: IndexMap<String, FieldValue> = schema
            .fields
            .iter()
            .map(|(name, field_type)| (name.clone(), random_value(&mut rng, *field_type)))
            .collect();

        Reading {
            device_type: schema.device_type.clone(),
            source_id: format!("farm_{farm}"),
            timestamp: Utc::now(),
            schema_id: schema.schema_id,
            field_values,
        }
    }

    /// One reading per device type.
    pub fn generate(&self) -> Vec<Reading> {
        self.producer
            .schemas()
            .map(|schema| self.random_reading(schema))
            .collect()
    }

    /// Emit one round of readings.
    pub fn tick(&self, stats: &mut SimulatorStats) {
        stats.rounds += 1;
        for reading in self.generate() {
            let device_type = reading.device_type.clone();
            match self.producer.emit(reading) {
                Ok(accepted) => {
                    stats.emitted += 1;
                    debug!(device_type = %device_type, sequence = accepted.sequence, "Sent reading");
                    emit!(ReadingsSimulated {
                        count: 1,
                        device_type,
                    });
                }
                Err(ProducerError::Closed) => {
                    stats.rejected += 1;
                    return;
                }
                Err(e) => {
                    stats.rejected += 1;
                    warn!(device_type = %device_type, error = %e, "Failed to emit simulated reading");
                }
            }
        }
    }

    /// Emit a round every interval until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> SimulatorStats {
        info!(
            interval_secs = self.config.interval_secs,
            farms = self.config.farm_count,
            "Starting sensor simulation"
        );
        let mut stats = SimulatorStats::default();
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while shutdown
            .run_until_cancelled(interval.tick())
            .await
            .is_some()
        {
            self.tick(&mut stats);
        }

        info!(
            rounds = stats.rounds,
            emitted = stats.emitted,
            rejected = stats.rejected,
            "Sensor simulation stopped"
        );
        stats
    }
}
