//! The schema registrar: the single source of truth for what a record of a
//! device type looks like.
//!
//! Definitions are cached per device type and per schema id. The per-id
//! cache never changes once filled (an id always names the same document).
//! The per-type cache is replaced when a newer version is observed.

use chrono::Utc;
use dashmap::DashMap;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::emit;
use crate::error::{RegistryError, SchemaError};
use crate::metrics::events::{SchemaCacheInvalidated, SchemaRegistered, SchemaResolved};
use crate::registry::{RegisteredSchema, SchemaRegistry};
use crate::retry::{RetryError, RetryPolicy, retry_with_policy};
use crate::schema::{
    SchemaDefinition, SchemaId, parse_declared_fields, parse_document, render_document,
    subject_for,
};

fn registry_failure(operation: &str, err: RetryError<RegistryError>) -> SchemaError {
    if err.exhausted {
        SchemaError::TransientRegistry {
            operation: operation.to_string(),
            attempts: err.attempts,
            source: err.source,
        }
    } else {
        SchemaError::Registry {
            operation: operation.to_string(),
            source: err.source,
        }
    }
}

/// Registers and resolves device-type schemas against a shared registry.
pub struct Registrar {
    registry: Arc<dyn SchemaRegistry>,
    retry: RetryPolicy,
    current: DashMap<String, Arc<SchemaDefinition>>,
    by_id: DashMap<SchemaId, Arc<SchemaDefinition>>,
}

impl Registrar {
    pub fn new(registry: Arc<dyn SchemaRegistry>, retry: RetryPolicy) -> Self {
        Self {
            registry,
            retry,
            current: DashMap::new(),
            by_id: DashMap::new(),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Register `declared` fields for `device_type` and return their
    /// definition.
    ///
    /// An identical field set already in the registry is returned as is and
    /// creates no new version. The cached current definition stays at the
    /// registry's latest version, which may be newer than the one returned.
    pub async fn register(
        &self,
        device_type: &str,
        declared: &IndexMap<String, String>,
    ) -> Result<Arc<SchemaDefinition>, SchemaError> {
        let fields = parse_declared_fields(device_type, declared)?;

        if let Some(existing) = self.fetch_latest(device_type).await?
            && existing.has_fields(&fields)
        {
            debug!(device_type, schema_id = %existing.schema_id, "Schema already current");
            emit!(SchemaRegistered {
                device_type: device_type.to_string(),
                created: false,
            });
            return Ok(existing);
        }

        let subject = subject_for(device_type);
        let document = render_document(device_type, &fields);
        let registered = retry_with_policy(
            &self.retry,
            "registry.register",
            RegistryError::is_transient,
            |_| self.registry.register(&subject, &document),
        )
        .await;

        let definition = match registered {
            Ok(id) => self.fetch_id(SchemaId(id)).await?,
            // Reported as a conflict by some registries: the document is there.
            Err(err) if matches!(err.source, RegistryError::SchemaExists { .. }) => {
                match self.fetch_latest(device_type).await? {
                    Some(latest) if latest.has_fields(&fields) => latest,
                    _ => return Err(registry_failure("registry.register", err)),
                }
            }
            Err(err) => return Err(registry_failure("registry.register", err)),
        };

        info!(
            device_type,
            schema_id = %definition.schema_id,
            version = definition.version,
            "Schema registered"
        );
        emit!(SchemaRegistered {
            device_type: device_type.to_string(),
            created: true,
        });
        Ok(definition)
    }

    /// The current definition of `device_type`, from cache when available.
    pub async fn resolve(&self, device_type: &str) -> Result<Arc<SchemaDefinition>, SchemaError> {
        if let Some(cached) = self.cached(device_type) {
            emit!(SchemaResolved {
                device_type: device_type.to_string(),
                cache_hit: true,
            });
            return Ok(cached);
        }
        let definition = self.refresh(device_type).await?;
        emit!(SchemaResolved {
            device_type: device_type.to_string(),
            cache_hit: false,
        });
        Ok(definition)
    }

    /// Re-read the latest definition from the registry, replacing the cached
    /// one if the version moved.
    pub async fn refresh(&self, device_type: &str) -> Result<Arc<SchemaDefinition>, SchemaError> {
        self.fetch_latest(device_type)
            .await?
            .ok_or_else(|| SchemaError::NotFound {
                device_type: device_type.to_string(),
            })
    }

    /// The definition named by a schema id carried on the wire.
    pub async fn resolve_id(&self, id: SchemaId) -> Result<Arc<SchemaDefinition>, SchemaError> {
        if let Some(cached) = self.by_id.get(&id).map(|entry| Arc::clone(entry.value())) {
            emit!(SchemaResolved {
                device_type: cached.device_type.clone(),
                cache_hit: true,
            });
            return Ok(cached);
        }
        let definition = self.fetch_id(id).await?;
        emit!(SchemaResolved {
            device_type: definition.device_type.clone(),
            cache_hit: false,
        });
        Ok(definition)
    }

    /// Cached current definition, without touching the registry.
    pub fn cached(&self, device_type: &str) -> Option<Arc<SchemaDefinition>> {
        self.current
            .get(device_type)
            .map(|entry| Arc::clone(entry.value()))
    }

    async fn fetch_latest(
        &self,
        device_type: &str,
    ) -> Result<Option<Arc<SchemaDefinition>>, SchemaError> {
        let subject = subject_for(device_type);
        let latest = retry_with_policy(
            &self.retry,
            "registry.latest",
            RegistryError::is_transient,
            |_| self.registry.latest(&subject),
        )
        .await;

        match latest {
            Ok(registered) => {
                let definition = self.definition_from(device_type, registered)?;
                Ok(Some(self.install(definition)))
            }
            Err(err) if err.source.is_not_found() => Ok(None),
            Err(err) => Err(registry_failure("registry.latest", err)),
        }
    }

    async fn fetch_id(&self, id: SchemaId) -> Result<Arc<SchemaDefinition>, SchemaError> {
        let registered = retry_with_policy(
            &self.retry,
            "registry.by_id",
            RegistryError::is_transient,
            |_| self.registry.by_id(id.0),
        )
        .await
        .map_err(|err| {
            if err.source.is_not_found() {
                SchemaError::UnknownSchemaId { schema_id: id.0 }
            } else {
                registry_failure("registry.by_id", err)
            }
        })?;

        let device_type = registered
            .subject
            .strip_suffix("-value")
            .unwrap_or(&registered.subject)
            .to_string();
        let definition = self.definition_from(&device_type, registered)?;
        Ok(self.install(definition))
    }

    fn definition_from(
        &self,
        device_type: &str,
        registered: RegisteredSchema,
    ) -> Result<SchemaDefinition, SchemaError> {
        let (_, fields) = parse_document(&registered.subject, &registered.schema)?;
        Ok(SchemaDefinition {
            device_type: device_type.to_string(),
            schema_id: SchemaId(registered.id),
            version: registered.version,
            fields,
            registered_at: Utc::now(),
        })
    }

    /// Cache `definition` and return the shared value.
    ///
    /// The per-type entry moves only to a newer version, so re-registering
    /// an older field set does not roll the current definition back.
    fn install(&self, definition: SchemaDefinition) -> Arc<SchemaDefinition> {
        let definition = Arc::clone(
            self.by_id
                .entry(definition.schema_id)
                .or_insert_with(|| Arc::new(definition))
                .value(),
        );

        let mut entry = self
            .current
            .entry(definition.device_type.clone())
            .or_insert_with(|| Arc::clone(&definition));
        let cached = entry.value();
        let replace =
            cached.schema_id != definition.schema_id && definition.version > cached.version;
        if replace {
            debug!(
                device_type = %definition.device_type,
                old_version = cached.version,
                new_version = definition.version,
                "Replacing cached schema"
            );
            emit!(SchemaCacheInvalidated {
                device_type: definition.device_type.clone(),
            });
            *entry.value_mut() = Arc::clone(&definition);
        }
        definition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemorySchemaRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn declared(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn registrar_for(registry: Arc<dyn SchemaRegistry>) -> Registrar {
        Registrar::new(registry, RetryPolicy::new(3, Duration::from_millis(10)))
    }

    /// Fails the first `failures` calls of every operation as unavailable.
    struct FlakyRegistry {
        inner: MemorySchemaRegistry,
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyRegistry {
        fn fail(&self) -> Result<(), RegistryError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(RegistryError::RegistryUnavailable {
                    message: "connection refused".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SchemaRegistry for FlakyRegistry {
        async fn register(&self, subject: &str, schema: &str) -> Result<u32, RegistryError> {
            self.fail()?;
            self.inner.register(subject, schema).await
        }
        async fn latest(&self, subject: &str) -> Result<RegisteredSchema, RegistryError> {
            self.fail()?;
            self.inner.latest(subject).await
        }
        async fn by_id(&self, id: u32) -> Result<RegisteredSchema, RegistryError> {
            self.fail()?;
            self.inner.by_id(id).await
        }
    }

    #[tokio::test]
    async fn test_register_twice_returns_same_id() {
        let registry = Arc::new(MemorySchemaRegistry::new());
        let registrar = registrar_for(registry.clone());
        let fields = declared(&[("moisture", "float"), ("ph", "float")]);

        let first = registrar.register("soil_moisture", &fields).await.unwrap();
        let second = registrar.register("soil_moisture", &fields).await.unwrap();

        assert_eq!(first.schema_id, second.schema_id);
        assert_eq!(first.version, 1);
        assert_eq!(registry.version_count("soil_moisture-value"), 1);

        // A fresh registrar sees the same id without creating a version.
        let other = registrar_for(registry.clone());
        let third = other.register("soil_moisture", &fields).await.unwrap();
        assert_eq!(third.schema_id, first.schema_id);
        assert_eq!(registry.version_count("soil_moisture-value"), 1);
    }

    #[tokio::test]
    async fn test_new_fields_create_new_version_and_invalidate() {
        let registry = Arc::new(MemorySchemaRegistry::new());
        let registrar = registrar_for(registry.clone());

        let v1 = registrar
            .register("poultry_temp", &declared(&[("temp_celsius", "float")]))
            .await
            .unwrap();
        let v2 = registrar
            .register(
                "poultry_temp",
                &declared(&[("temp_celsius", "float"), ("humidity", "float")]),
            )
            .await
            .unwrap();

        assert_ne!(v1.schema_id, v2.schema_id);
        assert_eq!(v2.version, 2);
        assert_eq!(registrar.cached("poultry_temp").unwrap().schema_id, v2.schema_id);

        // Old ids stay resolvable for records already on the wire.
        let old = registrar.resolve_id(v1.schema_id).await.unwrap();
        assert_eq!(old.fields.len(), 1);
        assert_eq!(registrar.cached("poultry_temp").unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_reregistering_older_fields_keeps_latest_current() {
        let registry = Arc::new(MemorySchemaRegistry::new());
        let registrar = registrar_for(registry.clone());
        let a = declared(&[("temp_celsius", "float")]);
        let b = declared(&[("temp_celsius", "float"), ("humidity", "float")]);

        let v1 = registrar.register("poultry_temp", &a).await.unwrap();
        let v2 = registrar.register("poultry_temp", &b).await.unwrap();
        let again = registrar.register("poultry_temp", &a).await.unwrap();

        assert_eq!(again.schema_id, v1.schema_id);
        assert_eq!(again.version, 1);
        assert_eq!(registry.version_count("poultry_temp-value"), 2);
        assert_eq!(registrar.cached("poultry_temp").unwrap().schema_id, v2.schema_id);
        assert_eq!(registrar.resolve("poultry_temp").await.unwrap().version, 2);

        // A fresh registrar agrees with the registry's latest version.
        let other = registrar_for(registry.clone());
        other.register("poultry_temp", &a).await.unwrap();
        assert_eq!(other.cached("poultry_temp").unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_refresh_observes_version_bump_from_elsewhere() {
        let registry = Arc::new(MemorySchemaRegistry::new());
        let ours = registrar_for(registry.clone());
        let theirs = registrar_for(registry.clone());

        ours.register("bird_feeder", &declared(&[("food_level", "float")]))
            .await
            .unwrap();
        theirs
            .register(
                "bird_feeder",
                &declared(&[("food_level", "float"), ("battery", "float")]),
            )
            .await
            .unwrap();

        assert_eq!(ours.resolve("bird_feeder").await.unwrap().version, 1);
        assert_eq!(ours.refresh("bird_feeder").await.unwrap().version, 2);
        assert_eq!(ours.resolve("bird_feeder").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_bad_declarations_are_registration_errors() {
        let registrar = registrar_for(Arc::new(MemorySchemaRegistry::new()));
        let err = registrar
            .register("soil_moisture", &declared(&[("samples", "list")]))
            .await
            .unwrap_err();
        assert!(err.is_registration());
    }

    #[tokio::test]
    async fn test_unknown_type_and_id_are_not_found() {
        let registrar = registrar_for(Arc::new(MemorySchemaRegistry::new()));
        assert!(matches!(
            registrar.resolve("unknown_sensor").await,
            Err(SchemaError::NotFound { .. })
        ));
        assert!(matches!(
            registrar.resolve_id(SchemaId(404)).await,
            Err(SchemaError::UnknownSchemaId { schema_id: 404 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let registry = Arc::new(FlakyRegistry {
            inner: MemorySchemaRegistry::new(),
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let registrar = registrar_for(registry);

        let definition = registrar
            .register("soil_moisture", &declared(&[("moisture", "float")]))
            .await
            .unwrap();
        assert_eq!(definition.version, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_transient_error() {
        let registry = Arc::new(FlakyRegistry {
            inner: MemorySchemaRegistry::new(),
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let registrar = registrar_for(registry.clone());

        let err = registrar.resolve("soil_moisture").await.unwrap_err();
        assert!(matches!(
            err,
            SchemaError::TransientRegistry { attempts: 3, .. }
        ));
        assert_eq!(registry.calls.load(Ordering::SeqCst), 3);
    }
}
