//! Structural schemas for device types.
//!
//! A [`SchemaDefinition`] is created by the registrar and shared as
//! `Arc<SchemaDefinition>`; it is never mutated after construction. A newer
//! version is a new value.

mod document;

pub use document::{NAMESPACE, parse_document, render_document};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::fmt;

use crate::error::{
    EmptyFieldsSnafu, InvalidFieldTypeSnafu, ReservedFieldSnafu, SchemaError, SchemaMismatch,
};

/// Payload key carrying the reading's source.
pub const SOURCE_ID_FIELD: &str = "source_id";
/// Payload key carrying the event time in epoch milliseconds.
pub const TIMESTAMP_FIELD: &str = "timestamp";

const RESERVED_FIELDS: [&str; 2] = [SOURCE_ID_FIELD, TIMESTAMP_FIELD];

/// Registry subject for a device type.
pub fn subject_for(device_type: &str) -> String {
    format!("{device_type}-value")
}

/// Registry-assigned schema identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaId(pub u32);

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The closed set of primitive field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Numeric,
    String,
    Boolean,
}

impl FieldType {
    /// Map a declared type name onto the primitive set.
    pub fn from_declared(declared: &str) -> Option<Self> {
        match declared.trim().to_ascii_lowercase().as_str() {
            "int" | "integer" | "long" | "float" | "double" | "numeric" | "number" => {
                Some(FieldType::Numeric)
            }
            "str" | "string" => Some(FieldType::String),
            "bool" | "boolean" => Some(FieldType::Boolean),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Numeric => "numeric",
            FieldType::String => "string",
            FieldType::Boolean => "boolean",
        }
    }
}

/// A single typed value in a reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Numeric(f64),
    String(String),
    Boolean(bool),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Numeric(_) => FieldType::Numeric,
            FieldValue::String(_) => FieldType::String,
            FieldValue::Boolean(_) => FieldType::Boolean,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Numeric(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Numeric(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Numeric(v as f64)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

/// Validate declared field types for `device_type`.
pub fn parse_declared_fields(
    device_type: &str,
    declared: &IndexMap<String, String>,
) -> Result<IndexMap<String, FieldType>, SchemaError> {
    ensure!(!declared.is_empty(), EmptyFieldsSnafu { device_type });

    declared
        .iter()
        .map(|(field, type_name)| -> Result<(String, FieldType), SchemaError> {
            ensure!(
                !RESERVED_FIELDS.contains(&field.as_str()),
                ReservedFieldSnafu { device_type, field }
            );
            let field_type = FieldType::from_declared(type_name).context(InvalidFieldTypeSnafu {
                device_type,
                field,
                declared: type_name,
            })?;
            Ok((field.clone(), field_type))
        })
        .collect()
}

/// A registered structural schema for one device type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub device_type: String,
    pub schema_id: SchemaId,
    pub version: u32,
    pub fields: IndexMap<String, FieldType>,
    /// When this process first observed the schema.
    pub registered_at: DateTime<Utc>,
}

impl SchemaDefinition {
    pub fn subject(&self) -> String {
        subject_for(&self.device_type)
    }

    /// Same set of (name, type) pairs, ignoring order.
    pub fn has_fields(&self, fields: &IndexMap<String, FieldType>) -> bool {
        self.fields == *fields
    }

    /// Check that `values` carries exactly this schema's fields with matching types.
    /// Numeric values must be finite.
    pub fn validate(&self, values: &IndexMap<String, FieldValue>) -> Result<(), SchemaMismatch> {
        let mut missing = Vec::new();
        let mut mistyped = Vec::new();
        for (name, field_type) in &self.fields {
            match values.get(name) {
                None => missing.push(name.clone()),
                Some(value) if value.field_type() != *field_type => mistyped.push(name.clone()),
                // JSON has no NaN or infinity; they would arrive as null.
                Some(FieldValue::Numeric(v)) if !v.is_finite() => mistyped.push(name.clone()),
                Some(_) => {}
            }
        }
        let unexpected: Vec<String> = values
            .keys()
            .filter(|name| !self.fields.contains_key(*name))
            .cloned()
            .collect();

        if missing.is_empty() && unexpected.is_empty() && mistyped.is_empty() {
            return Ok(());
        }
        Err(SchemaMismatch {
            device_type: self.device_type.clone(),
            schema_id: self.schema_id.0,
            missing,
            unexpected,
            mistyped,
        })
    }
}
