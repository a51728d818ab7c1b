//! Object storage abstraction over S3 (including MinIO), the local
//! filesystem and process memory.
//!
//! The transport log and the sink both address storage through a
//! [`StorageProvider`], which prefixes every path with the URL's key and
//! records request metrics.

mod local;
mod memory;
mod s3;
mod url;

pub use local::LocalConfig;
pub use memory::MemoryConfig;
pub use s3::S3Config;
pub use url::BackendConfig;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::emit;
use crate::error::{ObjectStoreSnafu, StorageError};
use crate::metrics::events::{RequestStatus, StorageOperation, StorageRequest};

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Storage provider that abstracts over the supported backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) canonical_url: String,
    pub(crate) storage_options: HashMap<String, String>,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

fn status_of<T>(result: &Result<T, object_store::Error>) -> RequestStatus {
    match result {
        Ok(_) => RequestStatus::Success,
        Err(object_store::Error::NotFound { .. }) => RequestStatus::NotFound,
        Err(object_store::Error::AlreadyExists { .. } | object_store::Error::Precondition { .. }) => {
            RequestStatus::Conflict
        }
        Err(_) => RequestStatus::Error,
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::S3(config) => Self::construct_s3(config, options),
            BackendConfig::Local(config) => Self::construct_local(config).await,
            BackendConfig::Memory(config) => Ok(Self::construct_memory(config)),
        }
    }

    /// Create a storage provider for the given URL.
    pub async fn for_url(url: &str) -> Result<Self, StorageError> {
        Self::for_url_with_options(url, HashMap::new()).await
    }

    /// Canonical URL of the storage root, including the key prefix.
    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    /// Get storage options for external integrations (e.g., Delta Lake).
    pub fn storage_options(&self) -> &HashMap<String, String> {
        &self.storage_options
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Get the contents of an object.
    pub async fn get(&self, path: &Path) -> Result<Bytes, StorageError> {
        let start = Instant::now();
        let result = match self.object_store.get(&self.qualify_path(path)).await {
            Ok(response) => response.bytes().await,
            Err(e) => Err(e),
        };
        emit!(StorageRequest {
            operation: StorageOperation::Get,
            status: status_of(&result),
            duration: start.elapsed(),
        });
        result.context(ObjectStoreSnafu)
    }

    /// Get the contents of an object, or `None` if it does not exist.
    pub async fn get_opt(&self, path: &Path) -> Result<Option<Bytes>, StorageError> {
        match self.get(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write an object, replacing any previous version.
    pub async fn put(&self, path: &Path, bytes: Bytes) -> Result<(), StorageError> {
        self.put_with_mode(path, bytes, PutMode::Overwrite, StorageOperation::Put)
            .await
    }

    /// Write an object only if nothing exists at `path` yet.
    ///
    /// Losing the race surfaces as an error for which
    /// [`StorageError::is_already_exists`] is true.
    pub async fn put_if_absent(&self, path: &Path, bytes: Bytes) -> Result<(), StorageError> {
        self.put_with_mode(path, bytes, PutMode::Create, StorageOperation::PutIfAbsent)
            .await
    }

    async fn put_with_mode(
        &self,
        path: &Path,
        bytes: Bytes,
        mode: PutMode,
        operation: StorageOperation,
    ) -> Result<(), StorageError> {
        let opts = PutOptions {
            mode,
            ..Default::default()
        };
        let start = Instant::now();
        let result = self
            .object_store
            .put_opts(&self.qualify_path(path), PutPayload::from(bytes), opts)
            .await;
        emit!(StorageRequest {
            operation,
            status: status_of(&result),
            duration: start.elapsed(),
        });
        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Delete an object. Deleting a missing object is not an error.
    pub async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        let start = Instant::now();
        let result = match self.object_store.delete(&self.qualify_path(path)).await {
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            other => other,
        };
        emit!(StorageRequest {
            operation: StorageOperation::Delete,
            status: status_of(&result),
            duration: start.elapsed(),
        });
        result.context(ObjectStoreSnafu)
    }

    /// List objects under `prefix` (relative to the configured key).
    ///
    /// Returned paths are relative to the configured key as well.
    pub async fn list_with_prefix(&self, prefix: &Path) -> Result<Vec<Path>, StorageError> {
        let full_prefix = self.qualify_path(prefix);
        let key_part_count = self
            .config
            .key()
            .map(|key| key.parts().count())
            .unwrap_or_default();

        let start = Instant::now();
        let result: Result<Vec<_>, _> = self
            .object_store
            .list(Some(&*full_prefix))
            .map_ok(|meta| meta.location.parts().skip(key_part_count).collect::<Path>())
            .try_collect()
            .await;
        emit!(StorageRequest {
            operation: StorageOperation::List,
            status: status_of(&result),
            duration: start.elapsed(),
        });
        result.context(ObjectStoreSnafu)
    }
}
