//! The Avro-style record document stored in the schema registry.
//!
//! ```json
//! {"type": "record", "name": "soil_moisture", "namespace": "com.verdantiq.sensors",
//!  "fields": [{"name": "source_id", "type": "string"},
//!             {"name": "timestamp", "type": "long"},
//!             {"name": "moisture", "type": "double"}]}
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

use super::{FieldType, SOURCE_ID_FIELD, TIMESTAMP_FIELD};

/// Namespace of every sensor record schema.
pub const NAMESPACE: &str = "com.verdantiq.sensors";

#[derive(Debug, Serialize, Deserialize)]
struct RecordDocument {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    fields: Vec<FieldDocument>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FieldDocument {
    name: String,
    #[serde(rename = "type")]
    kind: serde_json::Value,
}

fn avro_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Numeric => "double",
        FieldType::String => "string",
        FieldType::Boolean => "boolean",
    }
}

fn field_type_of(kind: &serde_json::Value) -> Option<FieldType> {
    match kind.as_str()? {
        "int" | "long" | "float" | "double" => Some(FieldType::Numeric),
        "string" => Some(FieldType::String),
        "boolean" => Some(FieldType::Boolean),
        _ => None,
    }
}

/// Render the registry document for a device type.
pub fn render_document(device_type: &str, fields: &IndexMap<String, FieldType>) -> String {
    let envelope_fields = [
        FieldDocument {
            name: SOURCE_ID_FIELD.to_string(),
            kind: "string".into(),
        },
        FieldDocument {
            name: TIMESTAMP_FIELD.to_string(),
            kind: "long".into(),
        },
    ];
    let document = RecordDocument {
        kind: "record".to_string(),
        name: device_type.to_string(),
        namespace: Some(NAMESPACE.to_string()),
        fields: envelope_fields
            .into_iter()
            .chain(fields.iter().map(|(name, field_type)| FieldDocument {
                name: name.clone(),
                kind: avro_type(*field_type).into(),
            }))
            .collect(),
    };
    // Plain strings and enums only; serialization cannot fail.
    serde_json::to_string(&document).unwrap_or_default()
}

/// Parse a registry document into its device type and declared fields.
///
/// The envelope fields (`source_id`, `timestamp`) are stripped.
pub fn parse_document(
    subject: &str,
    document: &str,
) -> Result<(String, IndexMap<String, FieldType>), SchemaError> {
    let invalid = |message: String| SchemaError::InvalidDocument {
        subject: subject.to_string(),
        message,
    };

    let record: RecordDocument =
        serde_json::from_str(document).map_err(|e| invalid(e.to_string()))?;
    if record.kind != "record" {
        return Err(invalid(format!("expected a record, got '{}'", record.kind)));
    }

    let mut fields = IndexMap::new();
    for field in record.fields {
        if field.name == SOURCE_ID_FIELD || field.name == TIMESTAMP_FIELD {
            continue;
        }
        let field_type = field_type_of(&field.kind).ok_or_else(|| {
            invalid(format!(
                "field '{}' has unsupported type {}",
                field.name, field.kind
            ))
        })?;
        fields.insert(field.name, field_type);
    }
    Ok((record.name, fields))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_then_parse() {
        let fields = IndexMap::from([
            ("food_level".to_string(), FieldType::Numeric),
            ("status".to_string(), FieldType::String),
            ("jammed".to_string(), FieldType::Boolean),
        ]);
        let document = render_document("bird_feeder", &fields);

        assert!(document.contains(NAMESPACE));
        assert!(document.contains(r#"{"name":"timestamp","type":"long"}"#));

        let (name, parsed) = parse_document("bird_feeder-value", &document).unwrap();
        assert_eq!(name, "bird_feeder");
        assert_eq!(parsed, fields);
        assert_eq!(
            parsed.keys().collect::<Vec<_>>(),
            vec!["food_level", "status", "jammed"]
        );
    }

    #[test]
    fn test_parse_accepts_float_and_int() {
        let document = r#"{"type":"record","name":"soil_moisture","namespace":"com.verdantiq.sensors",
            "fields":[{"name":"farm_id","type":"string"},{"name":"moisture","type":"float"},{"name":"count","type":"int"}]}"#;
        let (_, fields) = parse_document("soil_moisture-value", document).unwrap();
        assert_eq!(fields["moisture"], FieldType::Numeric);
        assert_eq!(fields["count"], FieldType::Numeric);
        assert_eq!(fields["farm_id"], FieldType::String);
    }

    #[test]
    fn test_parse_rejects_unions_and_non_records() {
        let union = r#"{"type":"record","name":"x","fields":[{"name":"a","type":["null","string"]}]}"#;
        assert!(matches!(
            parse_document("x-value", union),
            Err(SchemaError::InvalidDocument { .. })
        ));

        let enumeration = r#"{"type":"enum","name":"x","fields":[]}"#;
        assert!(parse_document("x-value", enumeration).is_err());
        assert!(parse_document("x-value", "not json").is_err());
    }
}
