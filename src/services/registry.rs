//! Provider registry - registrations of capture routine providers

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::db::providers::{self, NewProvider};
use crate::db::{ProviderRow, QueueDb};
use crate::error::StorageError;
use crate::routines::{DataCaptureRoutines, DefaultRoutines, RoutineContext, RoutineOverrides, RoutineTable};

use super::events::{EventBus, QueueEvent};

/// Registry of capture routine providers
///
/// Every operation reads the register table, nothing is cached between calls.
pub struct ProviderRegistry {
    db: Arc<QueueDb>,
    table: Arc<RoutineTable>,
    context: RoutineContext,
    events: Arc<EventBus>,
}

impl ProviderRegistry {
    pub fn new(db: Arc<QueueDb>, table: Arc<RoutineTable>, context: RoutineContext, events: Arc<EventBus>) -> Self {
        Self {
            db,
            table,
            context,
            events,
        }
    }

    pub fn table(&self) -> &Arc<RoutineTable> {
        &self.table
    }

    pub fn context(&self) -> &RoutineContext {
        &self.context
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Register a provider
    ///
    /// Registering a namespace twice is a successful no-op. Returns false when
    /// the routines behind `path` cannot be instantiated.
    pub fn register(&self, name: &str, namespace: &str, path: &str, has_overrides: bool) -> bool {
        match self.try_register(name, namespace, path, has_overrides) {
            Ok(registered) => registered,
            Err(e) => {
                error!(provider = %name, namespace = %namespace, error = %e, "Provider registration failed");
                false
            }
        }
    }

    fn try_register(&self, name: &str, namespace: &str, path: &str, has_overrides: bool) -> Result<bool, StorageError> {
        if name.is_empty() || namespace.is_empty() {
            return Err(StorageError::InvalidInput("provider name and namespace are required".into()));
        }

        if self.db.with_conn(|conn| providers::namespace_exists(conn, namespace))? {
            debug!(provider = %name, namespace = %namespace, "Provider namespace already registered");
            return Ok(true);
        }

        let active_overrides = if has_overrides {
            let routines = self.table.instantiate(path, &self.context)?;
            self.snapshot_overrides(routines.as_ref())
        } else {
            RoutineOverrides::default()
        };

        let input = NewProvider {
            name,
            namespace,
            path,
            has_overrides,
            active_overrides,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.db.with_conn(|conn| providers::insert_provider(conn, &input))?;

        info!(
            provider = %name,
            namespace = %namespace,
            overrides = ?active_overrides.categories(),
            "Registered capture provider"
        );
        self.events.emit(QueueEvent::ProviderRegistered {
            name: name.to_string(),
            namespace: namespace.to_string(),
            overrides: active_overrides.categories(),
        });

        Ok(true)
    }

    /// Declared overrides limited to what the capability supports
    fn snapshot_overrides(&self, routines: &dyn DataCaptureRoutines) -> RoutineOverrides {
        let supported = DefaultRoutines::from_context(&self.context).available_overrides();
        let declared = routines.overrides();
        let snapshot = declared.intersect(&supported);

        if snapshot != declared {
            warn!(
                declared = ?declared.categories(),
                kept = ?snapshot.categories(),
                "Provider declares unsupported overrides"
            );
        }
        snapshot
    }

    /// Update the path (and optionally the overrides flag) of an existing
    /// (name, namespace) registration. The override snapshot is kept.
    pub fn update(&self, name: &str, namespace: &str, path: &str, has_overrides: Option<bool>) -> bool {
        let now = chrono::Utc::now().timestamp();
        match self
            .db
            .with_conn(|conn| providers::update_provider(conn, name, namespace, path, has_overrides, now))
        {
            Ok(true) => {
                info!(provider = %name, namespace = %namespace, path = %path, "Updated capture provider");
                self.events.emit(QueueEvent::ProviderUpdated {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                });
                true
            }
            Ok(false) => {
                debug!(provider = %name, namespace = %namespace, "No provider to update");
                false
            }
            Err(e) => {
                error!(provider = %name, namespace = %namespace, error = %e, "Provider update failed");
                false
            }
        }
    }

    pub fn unregister(&self, name: &str, namespace: &str) -> bool {
        match self.db.with_conn(|conn| providers::delete_provider(conn, name, namespace)) {
            Ok(true) => {
                self.events.emit(QueueEvent::ProviderUnregistered {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                });
                true
            }
            Ok(false) => false,
            Err(e) => {
                error!(provider = %name, namespace = %namespace, error = %e, "Provider removal failed");
                false
            }
        }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Every registration in registration order
    pub fn providers(&self) -> Result<Vec<ProviderRow>, StorageError> {
        self.db.with_conn(providers::list_providers)
    }

    /// All registrations keyed by name
    pub fn load(&self) -> Result<BTreeMap<String, ProviderRow>, StorageError> {
        self.load_where(|_| true)
    }

    pub fn load_by_name(&self, name: &str) -> Result<BTreeMap<String, ProviderRow>, StorageError> {
        self.load_where(|row| row.name == name)
    }

    pub fn load_by_namespace(&self, namespace: &str) -> Result<BTreeMap<String, ProviderRow>, StorageError> {
        self.load_where(|row| row.namespace == namespace)
    }

    fn load_where<F>(&self, keep: F) -> Result<BTreeMap<String, ProviderRow>, StorageError>
    where
        F: Fn(&ProviderRow) -> bool,
    {
        Ok(self
            .providers()?
            .into_iter()
            .filter(|row| keep(row))
            .map(|row| (row.name.clone(), row))
            .collect())
    }
}
