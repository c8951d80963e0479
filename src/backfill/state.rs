//! Persisted task state of the bulk initializer

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StorageError;
use crate::host::KeyValueStore;

/// Host setting holding the task info blob
pub const TASK_INFO_KEY: &str = "lerq_bgtask_init";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    #[serde(rename = "not started")]
    NotStarted,
    /// Never written by this crate. Blobs from other writers of the same
    /// host setting may carry it, it is admitted like `Running`.
    #[serde(rename = "started")]
    Started,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "stopped")]
    Stopped,
    #[serde(rename = "finished")]
    Finished,
    #[serde(rename = "failed")]
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::NotStarted => "not started",
            TaskState::Started => "started",
            TaskState::Running => "running",
            TaskState::Stopped => "stopped",
            TaskState::Finished => "finished",
            TaskState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task info blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskInfo {
    pub lock: bool,
    pub state: TaskState,
    pub found_items: i64,
    pub processed_items: i64,
    pub progress: i64,
    pub started_ts: Option<i64>,
    pub finished_ts: Option<i64>,
    /// Reference id of the last processed pair
    pub last_item: i64,
    /// User id of the last processed pair
    pub last_usr: i64,
    pub heartbeat_ts: Option<i64>,
    pub last_error: Option<String>,
}

impl Default for TaskInfo {
    fn default() -> Self {
        Self {
            lock: false,
            state: TaskState::NotStarted,
            found_items: 0,
            processed_items: 0,
            progress: 0,
            started_ts: None,
            finished_ts: None,
            last_item: 0,
            last_usr: 0,
            heartbeat_ts: None,
            last_error: None,
        }
    }
}

impl TaskInfo {
    pub fn measure_progress(&self) -> i64 {
        measure_progress(self.found_items, self.processed_items)
    }

    /// Past the completion tolerance band
    pub fn is_complete(&self) -> bool {
        self.measure_progress() > 99
    }
}

/// Rounded percentage of processed items; nothing to do counts as done
pub fn measure_progress(found: i64, processed: i64) -> i64 {
    if found <= 0 {
        return 100;
    }
    (100.0 / found as f64 * processed as f64).round() as i64
}

/// Task info as loaded, remembering the raw blob for compare-and-swap
#[derive(Debug, Clone)]
pub struct TaskHandle {
    raw: Option<String>,
    pub info: TaskInfo,
}

impl TaskHandle {
    /// Info as of the last load or commit, dropping uncommitted changes
    pub fn rollback(&mut self) {
        self.info = self
            .raw
            .as_deref()
            .and_then(|blob| serde_json::from_str(blob).ok())
            .unwrap_or_default();
    }
}

/// Reads and writes the task info blob
pub struct TaskStore {
    kv: Arc<dyn KeyValueStore>,
}

impl TaskStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn load(&self) -> Result<TaskHandle, StorageError> {
        let raw = self.kv.get(TASK_INFO_KEY)?;
        let info = match raw.as_deref() {
            None | Some("") => TaskInfo::default(),
            Some(blob) => serde_json::from_str(blob).unwrap_or_else(|e| {
                warn!(error = %e, "Malformed backfill task info, starting over");
                TaskInfo::default()
            }),
        };
        Ok(TaskHandle { raw, info })
    }

    /// Write the handle's info if nobody else wrote since it was loaded
    pub fn commit(&self, handle: &mut TaskHandle) -> Result<(), StorageError> {
        let blob = serde_json::to_string(&handle.info)?;
        if !self.kv.compare_and_swap(TASK_INFO_KEY, handle.raw.as_deref(), &blob)? {
            return Err(StorageError::Conflict(
                "backfill task info changed by another run".into(),
            ));
        }
        handle.raw = Some(blob);
        Ok(())
    }

    /// Unconditionally restore the initial task info
    pub fn reset(&self) -> Result<TaskInfo, StorageError> {
        let info = TaskInfo::default();
        self.kv.set(TASK_INFO_KEY, &serde_json::to_string(&info)?)?;
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::host::SqliteHost;
    use crate::db::QueueDb;

    fn store() -> TaskStore {
        let db = Arc::new(QueueDb::open_in_memory().unwrap());
        TaskStore::new(Arc::new(SqliteHost::new(db)))
    }

    #[test]
    fn test_progress_rounding() {
        assert_eq!(measure_progress(3, 3), 100);
        assert_eq!(measure_progress(3, 2), 67);
        assert_eq!(measure_progress(0, 0), 100);
        assert_eq!(measure_progress(1000, 995), 100);
        assert_eq!(measure_progress(1000, 994), 99);
    }

    #[test]
    fn test_completion_band() {
        let info = TaskInfo { found_items: 3, processed_items: 3, ..Default::default() };
        assert!(info.is_complete());

        let short = TaskInfo { found_items: 200, processed_items: 198, ..Default::default() };
        assert!(!short.is_complete());
    }

    #[test]
    fn test_state_blob_names() {
        let blob = serde_json::to_value(TaskInfo::default()).unwrap();
        assert_eq!(blob["state"], "not started");
        assert_eq!(blob["lock"], false);
    }

    #[test]
    fn test_commit_detects_concurrent_write() {
        let store = store();
        let mut first = store.load().unwrap();
        let mut second = store.load().unwrap();

        first.info.lock = true;
        store.commit(&mut first).unwrap();

        second.info.state = TaskState::Running;
        assert!(matches!(store.commit(&mut second), Err(StorageError::Conflict(_))));

        // The winner keeps committing from its own handle
        first.info.processed_items = 5;
        store.commit(&mut first).unwrap();
        assert_eq!(store.load().unwrap().info.processed_items, 5);
    }

    #[test]
    fn test_reset() {
        let store = store();
        let mut handle = store.load().unwrap();
        handle.info.state = TaskState::Failed;
        store.commit(&mut handle).unwrap();

        store.reset().unwrap();
        assert_eq!(store.load().unwrap().info, TaskInfo::default());
    }
}
