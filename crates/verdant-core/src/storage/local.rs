//! Local directory backend for development and tests.

use object_store::local::LocalFileSystem;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{IoSnafu, ObjectStoreSnafu, StorageError};

use super::{BackendConfig, StorageProvider};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    pub path: String,
}

impl StorageProvider {
    /// Create the directory if missing and root the store at its absolute
    /// path, so relative and absolute spellings name the same log or table.
    pub(super) async fn construct_local(config: LocalConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.path)
            .await
            .context(IoSnafu)?;
        let root = tokio::fs::canonicalize(&config.path)
            .await
            .context(IoSnafu)?;
        let root = root.display().to_string();

        let store = LocalFileSystem::new_with_prefix(&root).context(ObjectStoreSnafu)?;
        Ok(Self {
            canonical_url: format!("file://{root}"),
            config: BackendConfig::Local(LocalConfig { path: root }),
            object_store: Arc::new(store),
            storage_options: HashMap::new(),
        })
    }
}
