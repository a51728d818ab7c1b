//! Error types shared by the producer, the ingestion engine and the CLI.
//!
//! Errors are grouped by concern: storage, configuration, metrics, the schema
//! registry protocol, schema registration and resolution, the wire envelope,
//! and the transport log.

use snafu::prelude::*;

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Required regex capture group missing (internal error).
    #[snafu(display("Missing required URL component: {group}"))]
    RegexGroupMissing { group: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error: {source}"))]
    S3Config { source: object_store::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::ObjectStore {
                source: object_store::Error::NotFound { .. }
            }
        )
    }

    /// Check if a conditional create lost against an existing object.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            StorageError::ObjectStore {
                source: object_store::Error::AlreadyExists { .. }
                    | object_store::Error::Precondition { .. }
            }
        )
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file {}: {source}", path.display()))]
    ReadFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// Unsupported config file format.
    #[snafu(display("Unsupported config format for {}: only .yaml/.yml supported", path.display()))]
    UnsupportedFormat { path: std::path::PathBuf },

    /// A single setting failed validation.
    #[snafu(display("Invalid value for '{field}': {message}"))]
    InvalidValue { field: String, message: String },

    /// Multiple configuration errors occurred.
    #[snafu(display("Multiple config errors:\n{}", errors.join("\n")))]
    MultipleErrors { errors: Vec<String> },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Metrics server already initialized (double-init attempted).
    #[snafu(display("Metrics server already initialized"))]
    AlreadyInitialized,

    /// Metrics server not initialized (controller accessed before init).
    #[snafu(display("Metrics server not initialized"))]
    NotInitialized,

    /// Failed to parse metrics address.
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },
}

// ============ Registry Errors ============

/// Errors returned by a schema registry client.
///
/// These describe what the registry said. [`SchemaError`] is what the
/// registrar reports to its callers after retries and classification.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RegistryError {
    /// The subject has no registered versions.
    #[snafu(display("Subject '{subject}' not found in registry"))]
    SubjectNotFound { subject: String },

    /// No schema is registered under this id.
    #[snafu(display("Schema id {id} not found in registry"))]
    SchemaIdNotFound { id: u32 },

    /// The registry reported that the schema is already registered.
    #[snafu(display("Schema already registered under subject '{subject}'"))]
    SchemaExists { subject: String },

    /// The registry answered with a server-side or throttling error.
    #[snafu(display("Registry unavailable: {message}"))]
    RegistryUnavailable { message: String },

    /// The registry rejected the request (bad schema, incompatible version, ...).
    #[snafu(display("Registry rejected request ({status}, code {code}): {message}"))]
    RegistryRejected {
        status: u16,
        code: i64,
        message: String,
    },

    /// Transport-level HTTP failure.
    #[snafu(display("Registry request failed: {source}"))]
    RegistryHttp { source: reqwest::Error },

    /// The HTTP client could not be constructed.
    #[snafu(display("Failed to build registry client: {source}"))]
    RegistryClient { source: reqwest::Error },
}

impl RegistryError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RegistryError::RegistryUnavailable { .. } => true,
            RegistryError::RegistryHttp { source } => !source.is_decode() && !source.is_builder(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::SubjectNotFound { .. } | RegistryError::SchemaIdNotFound { .. }
        )
    }
}

// ============ Schema Errors ============

/// Errors surfaced by the schema registrar.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SchemaError {
    /// A declared field type is outside the supported primitive set.
    #[snafu(display(
        "Device type '{device_type}': field '{field}' has unsupported type '{declared}' (expected int, float, str or bool)"
    ))]
    InvalidFieldType {
        device_type: String,
        field: String,
        declared: String,
    },

    /// A declared field collides with an envelope field.
    #[snafu(display("Device type '{device_type}': field '{field}' is reserved"))]
    ReservedField { device_type: String, field: String },

    /// A device type was declared without any fields.
    #[snafu(display("Device type '{device_type}' declares no fields"))]
    EmptyFields { device_type: String },

    /// The device type was never registered.
    #[snafu(display("No schema registered for device type '{device_type}'"))]
    NotFound { device_type: String },

    /// The schema id carried by a record is unknown to the registry.
    #[snafu(display("Schema id {schema_id} is not registered"))]
    UnknownSchemaId { schema_id: u32 },

    /// The registry stayed unavailable through the whole retry budget.
    #[snafu(display("Registry unavailable for {operation} after {attempts} attempt(s): {source}"))]
    TransientRegistry {
        operation: String,
        attempts: u32,
        source: RegistryError,
    },

    /// The registry failed with a non-retriable error.
    #[snafu(display("Registry error during {operation}: {source}"))]
    Registry {
        operation: String,
        source: RegistryError,
    },

    /// The stored schema document could not be interpreted.
    #[snafu(display("Schema document for '{subject}' is invalid: {message}"))]
    InvalidDocument { subject: String, message: String },
}

impl SchemaError {
    /// Bad declarations: fatal at startup, never retried.
    pub fn is_registration(&self) -> bool {
        matches!(
            self,
            SchemaError::InvalidFieldType { .. }
                | SchemaError::ReservedField { .. }
                | SchemaError::EmptyFields { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SchemaError::NotFound { .. } | SchemaError::UnknownSchemaId { .. }
        )
    }
}

/// A reading whose fields do not match its schema.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
#[snafu(display(
    "Reading does not match schema {schema_id} of '{device_type}' (missing: {missing:?}, unexpected: {unexpected:?}, mistyped: {mistyped:?})"
))]
pub struct SchemaMismatch {
    pub device_type: String,
    pub schema_id: u32,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub mistyped: Vec<String>,
}

// ============ Envelope Errors ============

/// Errors decoding a wire envelope or its payload.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EnvelopeError {
    /// Fewer bytes than the envelope header.
    #[snafu(display("Envelope truncated: {len} byte(s)"))]
    Truncated { len: usize },

    /// The first byte is not the envelope magic byte.
    #[snafu(display("Unknown envelope magic byte 0x{byte:02x}"))]
    UnknownMagic { byte: u8 },

    /// The payload is not valid JSON.
    #[snafu(display("Payload is not valid JSON: {source}"))]
    PayloadJson { source: serde_json::Error },

    /// The payload is valid JSON but not a reading object.
    #[snafu(display("Payload is malformed: {message}"))]
    PayloadShape { message: String },

    /// The payload disagrees with the schema it names.
    #[snafu(display("Payload does not match its schema: {source}"))]
    PayloadMismatch { source: SchemaMismatch },
}

// ============ Transport Errors ============

/// Errors from the transport log and topic administration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    /// The topic has not been provisioned.
    #[snafu(display("Topic '{topic}' does not exist"))]
    TopicNotFound { topic: String },

    /// Partition index beyond the topic's partition count.
    #[snafu(display("Topic '{topic}' has {partitions} partition(s), got partition {partition}"))]
    PartitionOutOfRange {
        topic: String,
        partition: u32,
        partitions: u32,
    },

    /// A topic definition failed validation.
    #[snafu(display("Invalid topic '{topic}': {message}"))]
    InvalidTopicSpec { topic: String, message: String },

    /// The backing store failed.
    #[snafu(display("Log storage error: {source}"))]
    LogStorage { source: StorageError },

    /// Failed to serialize a stored record or topic descriptor.
    #[snafu(display("Failed to encode log entry: {source}"))]
    EntryEncode { source: serde_json::Error },

    /// A stored record or topic descriptor is corrupt.
    #[snafu(display("Failed to decode log entry at {path}: {message}"))]
    EntryDecode { path: String, message: String },

    /// A producer sent a sequence older than one already appended.
    #[snafu(display(
        "Producer {producer_id} sent sequence {sequence} after {last_sequence} on '{topic}'"
    ))]
    OutOfOrderSequence {
        topic: String,
        producer_id: u64,
        sequence: u64,
        last_sequence: u64,
    },

    /// The transport cannot be reached.
    #[snafu(display("Transport unavailable: {message}"))]
    TransportUnavailable { message: String },

    /// One or more topics could not be provisioned.
    #[snafu(display("Failed to provision topic(s): {}", topics.join(", ")))]
    ProvisionFailed { topics: Vec<String> },
}

impl TransportError {
    /// Whether a send or fetch may succeed if repeated.
    pub fn is_retriable(&self) -> bool {
        match self {
            TransportError::TransportUnavailable { .. } => true,
            TransportError::LogStorage { source } => !source.is_not_found(),
            _ => false,
        }
    }
}
