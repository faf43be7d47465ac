//! Adapter registry and factories
//!
//! Warehouse adapters register a factory under a string type id. Factories
//! take the raw destination config as a `serde_yaml::Value` and return a
//! connected adapter; a process-wide default registry mirrors the instance
//! API for binaries that compose adapters at startup.

use crate::adapter::WarehouseAdapter;
use crate::destination::Destination;
use crate::error::{IngestError, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Factory for one adapter type.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    /// Registry type id, e.g. `"postgres"`.
    fn type_id(&self) -> &'static str;

    /// Parse the raw destination config, connect, and return the adapter.
    async fn create(
        &self,
        destination_id: &str,
        config: &serde_yaml::Value,
    ) -> Result<Arc<dyn WarehouseAdapter>>;
}

/// Registry of adapter factories keyed by type id.
///
/// Users compose their own registry with only the adapters they need; the
/// process-wide default registry serves the common single-binary case.
#[derive(Default)]
pub struct AdapterRegistry {
    factories: HashMap<String, Arc<dyn AdapterFactory>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn AdapterFactory>) {
        self.factories
            .insert(factory.type_id().to_string(), factory);
    }

    pub fn get(&self, type_id: &str) -> Option<&Arc<dyn AdapterFactory>> {
        self.factories.get(type_id)
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.factories.contains_key(type_id)
    }

    pub fn list(&self) -> Vec<&str> {
        self.factories.keys().map(|k| k.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Create a connected [`Destination`] from a registered factory.
    pub async fn create_destination(
        &self,
        destination_id: &str,
        type_id: &str,
        config: &serde_yaml::Value,
    ) -> Result<Destination> {
        let factory = self.get(type_id).ok_or_else(|| {
            IngestError::config(format!("unknown destination type: {type_id}"))
        })?;
        let adapter = factory.create(destination_id, config).await?;
        Ok(Destination::new(destination_id, adapter))
    }
}

static DEFAULT_REGISTRY: Lazy<RwLock<AdapterRegistry>> =
    Lazy::new(|| RwLock::new(AdapterRegistry::new()));

/// Register an adapter factory in the process-wide default registry.
pub fn register_adapter(factory: Arc<dyn AdapterFactory>) {
    DEFAULT_REGISTRY.write().register(factory);
}

/// Type ids registered in the process-wide default registry.
pub fn registered_adapters() -> Vec<String> {
    DEFAULT_REGISTRY
        .read()
        .list()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Create a connected [`Destination`] from the process-wide default registry.
pub async fn create_destination(
    destination_id: &str,
    type_id: &str,
    config: &serde_yaml::Value,
) -> Result<Destination> {
    let factory = DEFAULT_REGISTRY
        .read()
        .get(type_id)
        .cloned()
        .ok_or_else(|| IngestError::config(format!("unknown destination type: {type_id}")))?;
    let adapter = factory.create(destination_id, config).await?;
    Ok(Destination::new(destination_id, adapter))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyFactory;

    #[async_trait]
    impl AdapterFactory for DummyFactory {
        fn type_id(&self) -> &'static str {
            "dummy"
        }

        async fn create(
            &self,
            _destination_id: &str,
            _config: &serde_yaml::Value,
        ) -> Result<Arc<dyn WarehouseAdapter>> {
            Err(IngestError::connect("dummy adapter never connects"))
        }
    }

    #[test]
    fn test_registry_basics() {
        let mut registry = AdapterRegistry::new();
        assert!(registry.is_empty());

        registry.register(Arc::new(DummyFactory));
        assert!(registry.contains("dummy"));
        assert!(!registry.contains("postgres"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.list(), vec!["dummy"]);
    }

    #[tokio::test]
    async fn test_unknown_type_is_config_error() {
        let registry = AdapterRegistry::new();
        let result = registry
            .create_destination("d1", "nope", &serde_yaml::Value::Null)
            .await;
        match result {
            Err(err) => assert!(matches!(err, IngestError::Config(_))),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[tokio::test]
    async fn test_factory_error_propagates() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(DummyFactory));
        let result = registry
            .create_destination("d1", "dummy", &serde_yaml::Value::Null)
            .await;
        match result {
            Err(err) => assert!(matches!(err, IngestError::Connect(_))),
            Ok(_) => panic!("expected an error"),
        }
    }
}
