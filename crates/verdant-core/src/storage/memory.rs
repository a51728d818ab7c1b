//! In-process backend, used for all-in-one runs and tests.

use object_store::memory::InMemory;
use object_store::path::Path;
use std::collections::HashMap;
use std::sync::Arc;

use super::{BackendConfig, StorageProvider};

/// In-memory store configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    pub key: Option<Path>,
}

impl StorageProvider {
    /// Each call creates a fresh, empty store.
    pub(super) fn construct_memory(config: MemoryConfig) -> Self {
        let canonical_url = match &config.key {
            Some(key) => format!("memory://{key}"),
            None => "memory://".to_string(),
        };
        Self {
            config: BackendConfig::Memory(config),
            object_store: Arc::new(InMemory::new()),
            canonical_url,
            storage_options: HashMap::new(),
        }
    }
}
