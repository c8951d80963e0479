//! Service layer for the event queue
//!
//! Services hold the capture pipeline between host callbacks and the
//! repository functions:
//!
//! ```text
//! Host callback
//!     ↓
//! EventCapture → RoutineResolver (ProviderRegistry) → Processor
//!     ↓
//! QueueWriter (SettingsService)
//!     ↓
//! Repository Layer (db/*.rs) → SQLite
//! ```
//!
//! Every collaborator is passed in explicitly; nothing is looked up globally.

pub mod events;
pub mod settings;
pub mod registry;
pub mod resolver;
pub mod processor;
pub mod writer;
pub mod capture;
pub mod query;

// Re-exports
pub use events::{spawn_listener, spawn_logging_listener, EventBus, EventListener, QueueEvent};
pub use settings::{Settings, SettingsService};
pub use registry::ProviderRegistry;
pub use resolver::{RoutineChains, RoutineResolver};
pub use processor::Processor;
pub use writer::QueueWriter;
pub use capture::{EventCapture, EventParams};
pub use query::QueryService;

use std::sync::Arc;

use crate::db::QueueDb;
use crate::host::HostDirectory;
use crate::routines::{DefaultRoutines, RoutineContext, RoutineTable};

/// Service container for dependency injection
pub struct Services {
    pub db: Arc<QueueDb>,
    pub host: Arc<dyn HostDirectory>,
    pub settings: Arc<SettingsService>,
    pub registry: Arc<ProviderRegistry>,
    pub resolver: Arc<RoutineResolver>,
    pub writer: Arc<QueueWriter>,
    pub capture: Arc<EventCapture>,
    pub query: Arc<QueryService>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Wire all services around one database and host
    pub fn new(
        db: Arc<QueueDb>,
        host: Arc<dyn HostDirectory>,
        table: RoutineTable,
        link_base: impl Into<String>,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        let context = RoutineContext {
            host: host.clone(),
            link_base: link_base.into(),
        };

        let settings = Arc::new(SettingsService::new(db.clone()));
        let registry = Arc::new(ProviderRegistry::new(
            db.clone(),
            Arc::new(table),
            context.clone(),
            events.clone(),
        ));
        let resolver = Arc::new(RoutineResolver::new(
            registry.clone(),
            Arc::new(DefaultRoutines::from_context(&context)),
        ));
        let writer = Arc::new(QueueWriter::new(db.clone(), settings.clone(), events.clone()));
        let capture = Arc::new(EventCapture::new(
            host.clone(),
            resolver.clone(),
            writer.clone(),
            settings.clone(),
            events.clone(),
        ));

        Self {
            query: Arc::new(QueryService::new(db.clone())),
            db,
            host,
            settings,
            registry,
            resolver,
            writer,
            capture,
            events,
        }
    }
}
