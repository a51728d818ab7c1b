//! Schema registry clients.
//!
//! The registry is an external service shared by every producer and engine.
//! [`HttpSchemaRegistry`] speaks the Confluent REST protocol;
//! [`MemorySchemaRegistry`] keeps the same semantics inside the process.

mod http;
mod memory;

pub use http::HttpSchemaRegistry;
pub use memory::MemorySchemaRegistry;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{RegistryConfig, RegistryKind};
use crate::error::RegistryError;

/// One version of a subject as stored by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredSchema {
    pub subject: String,
    pub id: u32,
    pub version: u32,
    pub schema: String,
}

/// The registry protocol consumed by the registrar.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Register `schema` under `subject` and return its id.
    ///
    /// Registering a document that is already present returns the existing
    /// id; some registries report it as [`RegistryError::SchemaExists`]
    /// instead.
    async fn register(&self, subject: &str, schema: &str) -> Result<u32, RegistryError>;

    /// The latest version registered under `subject`.
    async fn latest(&self, subject: &str) -> Result<RegisteredSchema, RegistryError>;

    /// The schema stored under `id`, with the subject and version it was
    /// registered as.
    async fn by_id(&self, id: u32) -> Result<RegisteredSchema, RegistryError>;
}

/// Build the registry client described by `config`.
pub fn from_config(config: &RegistryConfig) -> Result<Arc<dyn SchemaRegistry>, RegistryError> {
    match config.kind {
        RegistryKind::Http => {
            let url = config.url.as_deref().unwrap_or_default();
            let client =
                HttpSchemaRegistry::new(url, Duration::from_secs(config.timeout_secs))?;
            Ok(Arc::new(client))
        }
        RegistryKind::Memory => Ok(Arc::new(MemorySchemaRegistry::new())),
    }
}
