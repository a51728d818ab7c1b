//! Wire envelope: magic byte, big-endian schema id, JSON payload.
//!
//! ```text
//! +------+----------------+---------------------------------------------+
//! | 0x00 | schema id (BE) | {"source_id": .., "timestamp": .., fields..} |
//! +------+----------------+---------------------------------------------+
//!   1 B        4 B                        N B
//! ```
//!
//! The header is enough to route a record to its schema; the payload is only
//! interpreted against the definition the header names.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use snafu::prelude::*;

use crate::error::{
    EnvelopeError, PayloadJsonSnafu, PayloadMismatchSnafu, PayloadShapeSnafu, TruncatedSnafu,
    UnknownMagicSnafu,
};
use crate::schema::{FieldValue, SOURCE_ID_FIELD, SchemaDefinition, SchemaId, TIMESTAMP_FIELD};

pub const MAGIC_BYTE: u8 = 0x00;
pub const HEADER_LEN: usize = 5;

/// One typed sensor reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device_type: String,
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub schema_id: SchemaId,
    pub field_values: IndexMap<String, FieldValue>,
}

impl Reading {
    /// Event time in epoch milliseconds.
    pub fn event_time_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

#[derive(Serialize)]
struct PayloadRef<'a> {
    source_id: &'a str,
    timestamp: i64,
    #[serde(flatten)]
    fields: &'a IndexMap<String, FieldValue>,
}

/// The immutable wire unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub schema_id: SchemaId,
    pub payload: Bytes,
}

impl Envelope {
    /// Serialize a reading's payload under its schema id.
    pub fn from_reading(reading: &Reading) -> Result<Self, EnvelopeError> {
        let payload = serde_json::to_vec(&PayloadRef {
            source_id: &reading.source_id,
            timestamp: reading.event_time_ms(),
            fields: &reading.field_values,
        })
        .context(PayloadJsonSnafu)?;

        Ok(Self {
            schema_id: reading.schema_id,
            payload: Bytes::from(payload),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(MAGIC_BYTE);
        buf.put_u32(self.schema_id.0);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Read only the schema id from an encoded envelope.
    pub fn decode_header(bytes: &[u8]) -> Result<SchemaId, EnvelopeError> {
        ensure!(bytes.len() >= HEADER_LEN, TruncatedSnafu { len: bytes.len() });
        ensure!(bytes[0] == MAGIC_BYTE, UnknownMagicSnafu { byte: bytes[0] });
        let id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        Ok(SchemaId(id))
    }

    pub fn decode(bytes: Bytes) -> Result<Self, EnvelopeError> {
        let schema_id = Self::decode_header(&bytes)?;
        Ok(Self {
            schema_id,
            payload: bytes.slice(HEADER_LEN..),
        })
    }

    /// Interpret the payload against `schema`, which must be the definition
    /// named by this envelope's schema id.
    pub fn decode_reading(&self, schema: &SchemaDefinition) -> Result<Reading, EnvelopeError> {
        ensure!(
            schema.schema_id == self.schema_id,
            PayloadShapeSnafu {
                message: format!(
                    "envelope carries schema {} but was decoded with {}",
                    self.schema_id, schema.schema_id
                ),
            }
        );

        let mut object: IndexMap<String, Value> =
            serde_json::from_slice(&self.payload).context(PayloadJsonSnafu)?;

        let source_id = match object.shift_remove(SOURCE_ID_FIELD) {
            Some(Value::String(source_id)) => source_id,
            other => {
                return PayloadShapeSnafu {
                    message: format!("'{SOURCE_ID_FIELD}' must be a string, got {other:?}"),
                }
                .fail();
            }
        };
        let timestamp = object
            .shift_remove(TIMESTAMP_FIELD)
            .and_then(|value| value.as_i64())
            .and_then(DateTime::from_timestamp_millis)
            .context(PayloadShapeSnafu {
                message: format!("'{TIMESTAMP_FIELD}' must be epoch milliseconds"),
            })?;

        let field_values = object
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    Value::Number(n) => n.as_f64().map(FieldValue::Numeric),
                    Value::String(s) => Some(FieldValue::String(s)),
                    Value::Bool(b) => Some(FieldValue::Boolean(b)),
                    _ => None,
                };
                match value {
                    Some(value) => Ok((name, value)),
                    None => PayloadShapeSnafu {
                        message: format!("field '{name}' is not a primitive value"),
                    }
                    .fail(),
                }
            })
            .collect::<Result<IndexMap<_, _>, EnvelopeError>>()?;

        schema.validate(&field_values).context(PayloadMismatchSnafu)?;

        Ok(Reading {
            device_type: schema.device_type.clone(),
            source_id,
            timestamp,
            schema_id: self.schema_id,
            field_values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;

    fn schema() -> SchemaDefinition {
        SchemaDefinition {
            device_type: "soil_moisture".into(),
            schema_id: SchemaId(3),
            version: 1,
            fields: IndexMap::from([
                ("moisture".to_string(), FieldType::Numeric),
                ("ph".to_string(), FieldType::Numeric),
            ]),
            registered_at: Utc::now(),
        }
    }

    fn reading() -> Reading {
        Reading {
            device_type: "soil_moisture".into(),
            source_id: "farm-1".into(),
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
            schema_id: SchemaId(3),
            field_values: IndexMap::from([
                ("moisture".to_string(), FieldValue::from(42.0)),
                ("ph".to_string(), FieldValue::from(6.5)),
            ]),
        }
    }

    #[test]
    fn test_header_layout() {
        let encoded = Envelope::from_reading(&reading()).unwrap().encode();
        assert_eq!(&encoded[..HEADER_LEN], &[0x00, 0, 0, 0, 3]);

        let payload: Value = serde_json::from_slice(&encoded[HEADER_LEN..]).unwrap();
        assert_eq!(payload["source_id"], "farm-1");
        assert_eq!(payload["timestamp"], 1_700_000_000_123i64);
        assert_eq!(payload["moisture"], 42.0);
    }

    #[test]
    fn test_decode_reading() {
        let encoded = Envelope::from_reading(&reading()).unwrap().encode();
        let envelope = Envelope::decode(encoded).unwrap();
        assert_eq!(envelope.schema_id, SchemaId(3));
        assert_eq!(envelope.decode_reading(&schema()).unwrap(), reading());
    }

    #[test]
    fn test_malformed_headers() {
        assert!(matches!(
            Envelope::decode_header(&[0, 1]),
            Err(EnvelopeError::Truncated { len: 2 })
        ));
        assert!(matches!(
            Envelope::decode_header(&[0x7f, 0, 0, 0, 1]),
            Err(EnvelopeError::UnknownMagic { byte: 0x7f })
        ));
    }

    #[test]
    fn test_payload_errors() {
        let schema = schema();
        let decode = |payload: &'static str| {
            Envelope {
                schema_id: SchemaId(3),
                payload: Bytes::from_static(payload.as_bytes()),
            }
            .decode_reading(&schema)
        };

        assert!(matches!(decode("{"), Err(EnvelopeError::PayloadJson { .. })));
        assert!(matches!(
            decode(r#"{"source_id": 1, "timestamp": 0, "moisture": 1, "ph": 1}"#),
            Err(EnvelopeError::PayloadShape { .. })
        ));
        assert!(matches!(
            decode(r#"{"source_id": "a", "moisture": 1, "ph": 1}"#),
            Err(EnvelopeError::PayloadShape { .. })
        ));
        assert!(matches!(
            decode(r#"{"source_id": "a", "timestamp": 0, "moisture": [1], "ph": 1}"#),
            Err(EnvelopeError::PayloadShape { .. })
        ));
        assert!(matches!(
            decode(r#"{"source_id": "a", "timestamp": 0, "moisture": 1}"#),
            Err(EnvelopeError::PayloadMismatch { .. })
        ));
    }

    #[test]
    fn test_wrong_schema_is_rejected() {
        let mut other = schema();
        other.schema_id = SchemaId(4);
        let envelope = Envelope::from_reading(&reading()).unwrap();
        assert!(envelope.decode_reading(&other).is_err());
    }
}
