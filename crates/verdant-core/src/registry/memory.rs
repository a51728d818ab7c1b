//! In-process registry with Confluent registration semantics.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{RegistryError, SchemaIdNotFoundSnafu, SubjectNotFoundSnafu};

use super::{RegisteredSchema, SchemaRegistry};

#[derive(Default)]
struct Inner {
    /// Document → id, shared across subjects.
    ids: HashMap<String, u32>,
    /// Subject → versions in registration order.
    subjects: HashMap<String, Vec<RegisteredSchema>>,
    next_id: u32,
}

/// A registry living inside the process.
///
/// Registering a document already present under a subject returns its id
/// without creating a version, as the HTTP registry does.
#[derive(Default)]
pub struct MemorySchemaRegistry {
    inner: Mutex<Inner>,
}

impl MemorySchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // State is always consistent between statements; recover from poison.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of versions stored under `subject`.
    pub fn version_count(&self, subject: &str) -> usize {
        self.lock().subjects.get(subject).map_or(0, Vec::len)
    }
}

#[async_trait]
impl SchemaRegistry for MemorySchemaRegistry {
    async fn register(&self, subject: &str, schema: &str) -> Result<u32, RegistryError> {
        let mut inner = self.lock();

        if let Some(existing) = inner
            .subjects
            .get(subject)
            .and_then(|versions| versions.iter().find(|v| v.schema == schema))
        {
            return Ok(existing.id);
        }

        let id = match inner.ids.get(schema) {
            Some(id) => *id,
            None => {
                inner.next_id += 1;
                let id = inner.next_id;
                inner.ids.insert(schema.to_string(), id);
                id
            }
        };

        let versions = inner.subjects.entry(subject.to_string()).or_default();
        let version = versions.last().map_or(1, |v| v.version + 1);
        versions.push(RegisteredSchema {
            subject: subject.to_string(),
            id,
            version,
            schema: schema.to_string(),
        });
        Ok(id)
    }

    async fn latest(&self, subject: &str) -> Result<RegisteredSchema, RegistryError> {
        self.lock()
            .subjects
            .get(subject)
            .and_then(|versions| versions.last().cloned())
            .ok_or_else(|| SubjectNotFoundSnafu { subject }.build())
    }

    async fn by_id(&self, id: u32) -> Result<RegisteredSchema, RegistryError> {
        let inner = self.lock();
        let mut matches = inner
            .subjects
            .values()
            .flat_map(|versions| versions.iter().filter(|v| v.id == id));
        let first = matches.next().cloned();
        first.ok_or_else(|| SchemaIdNotFoundSnafu { id }.build())
    }
}
