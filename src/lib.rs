//! LP Event Queue - learning-progress event capture for an LMS host
//!
//! Captures host lifecycle events (course membership, object changes,
//! learning-progress updates), enriches them with user, object and course
//! context, and appends them to a queue that external consumers page
//! through.
//!
//! ## Architecture
//!
//! - **Capture**: host callbacks are turned into records by chains of data
//!   capture routines. Registered providers may override any of the five
//!   sections; the built-in routines always come last.
//! - **Queue**: an append-only SQLite table with JSON blobs for user,
//!   object and membership data. Settings decide which user fields are kept.
//! - **Backfill**: a resumable bulk initializer writes the historical state
//!   of every (object, user) pair, checkpointing after each page.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/lp-event-queue/
//! ├── lerq.db        # Queue, provider register, settings, host read model
//! └── config.toml    # Configuration
//! ```

pub mod error;
pub mod config;
pub mod db;
pub mod host;
pub mod models;
pub mod routines;
pub mod services;
pub mod backfill;

// Re-exports
pub use config::Config;
pub use error::StorageError;
pub use db::{QueueDb, QueueFilter, TimeDirection};
pub use db::host::SqliteHost;
pub use host::HostDirectory;
pub use models::{AggregatedRecord, CapturedEvent, EventDescriptor, EventType, QueueModel};
pub use routines::{Category, DataCaptureRoutines, DefaultRoutines, RoutineOverrides, RoutineTable};
pub use services::{EventCapture, EventParams, QueryService, QueueEvent, Services};
pub use backfill::{BackfillConfig, BackfillJob, JobOutcome, TaskInfo, TaskState};
