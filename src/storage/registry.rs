//! Storage backend registry.
//!
//! Backends are selected by name from an explicit registry built at
//! process start and passed to whoever opens the store.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::error::{FmdError, FmdResult};
use crate::observability::Metrics;

use super::Storage;

/// Constructor of a storage backend.
pub type StorageFactory = fn(&StorageConfig, Arc<dyn Metrics>) -> FmdResult<Arc<dyn Storage>>;

/// Mapping from backend name to constructor.
#[derive(Clone, Default)]
pub struct StorageRegistry {
    factories: BTreeMap<String, StorageFactory>,
}

impl std::fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

impl StorageRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every backend compiled into this build.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("sqlite", super::sqlite::open_backend);
        #[cfg(feature = "storage-postgres")]
        registry.register("postgres", super::postgres::open_backend);
        registry
    }

    /// Add or replace a backend.
    pub fn register(&mut self, name: &str, factory: StorageFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Construct the configured backend and validate its schema.
    pub fn open(&self, config: &StorageConfig, metrics: Arc<dyn Metrics>) -> FmdResult<Arc<dyn Storage>> {
        let factory = self
            .factories
            .get(&config.backend)
            .ok_or_else(|| FmdError::UnknownBackend {
                name: config.backend.clone(),
            })?;
        let store = factory(config, metrics)?;
        store.init()?;
        tracing::info!(backend = %config.backend, "Storage opened");
        Ok(store)
    }
}
