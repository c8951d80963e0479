//! Static registration table for provider routines
//!
//! A provider registration stores a loader key in its `path` column. The key
//! is resolved here against factories the embedding application registered
//! at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::StorageError;
use crate::host::HostDirectory;

use super::DataCaptureRoutines;

/// Collaborators handed to routine factories
#[derive(Clone)]
pub struct RoutineContext {
    pub host: Arc<dyn HostDirectory>,
    /// Base URL for permalinks
    pub link_base: String,
}

pub type RoutineFactory =
    Arc<dyn Fn(&RoutineContext) -> Result<Arc<dyn DataCaptureRoutines>, StorageError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct RoutineTable {
    factories: BTreeMap<String, RoutineFactory>,
}

impl RoutineTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a loader key, replacing any previous one
    pub fn register<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn(&RoutineContext) -> Result<Arc<dyn DataCaptureRoutines>, StorageError> + Send + Sync + 'static,
    {
        self.factories.insert(key.into(), Arc::new(factory));
    }

    /// Builder form of [`register`](Self::register)
    pub fn with<F>(mut self, key: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&RoutineContext) -> Result<Arc<dyn DataCaptureRoutines>, StorageError> + Send + Sync + 'static,
    {
        self.register(key, factory);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build the routines behind a loader key
    pub fn instantiate(
        &self,
        key: &str,
        context: &RoutineContext,
    ) -> Result<Arc<dyn DataCaptureRoutines>, StorageError> {
        let factory = self
            .factories
            .get(key)
            .ok_or_else(|| StorageError::NotFound(format!("No routines registered under '{}'", key)))?;
        factory(context)
    }
}

impl std::fmt::Debug for RoutineTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutineTable")
            .field("keys", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
