//! Backfill job - one resumable invocation of the bulk initializer

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{queue, QueueDb};
use crate::error::StorageError;
use crate::host::HostDirectory;
use crate::services::{EventBus, QueueEvent, QueueWriter, Services, SettingsService};

use super::collector::{Cursor, InitialCollector};
use super::state::{TaskHandle, TaskInfo, TaskState, TaskStore};
use super::{BackfillConfig, JobOutcome, ResumePolicy};

/// How an invocation may proceed given the stored task info
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Start,
    Resume,
    Refuse(JobOutcome),
}

fn admit(info: &TaskInfo, config: &BackfillConfig, now: i64) -> Admission {
    match info.state {
        TaskState::NotStarted => Admission::Start,
        TaskState::Finished => Admission::Refuse(JobOutcome::Success),
        TaskState::Failed => Admission::Refuse(JobOutcome::Failed),
        TaskState::Stopped if info.lock => Admission::Refuse(JobOutcome::Locked),
        TaskState::Stopped => Admission::Resume,
        TaskState::Started | TaskState::Running if info.lock => {
            let stale = info
                .heartbeat_ts
                .map_or(true, |beat| now - beat > config.stale_after_secs as i64);
            if stale && config.resume_policy == ResumePolicy::ResumeStale {
                warn!(heartbeat_ts = ?info.heartbeat_ts, "Taking over stale backfill run");
                Admission::Resume
            } else {
                Admission::Refuse(JobOutcome::AlreadyRunning)
            }
        }
        // A slice that yielded its lock
        TaskState::Started | TaskState::Running => Admission::Resume,
    }
}

pub struct BackfillJob {
    db: Arc<QueueDb>,
    host: Arc<dyn HostDirectory>,
    store: TaskStore,
    writer: Arc<QueueWriter>,
    settings: Arc<SettingsService>,
    events: Arc<EventBus>,
    link_base: String,
    config: BackfillConfig,
}

impl BackfillJob {
    pub fn new(services: &Services, config: BackfillConfig) -> Self {
        Self {
            db: services.db.clone(),
            host: services.host.clone(),
            store: TaskStore::new(Arc::new(services.host.clone())),
            writer: services.writer.clone(),
            settings: services.settings.clone(),
            events: services.events.clone(),
            link_base: services.registry.context().link_base.clone(),
            config,
        }
    }

    /// Current task info
    pub fn status(&self) -> Result<TaskInfo, StorageError> {
        Ok(self.store.load()?.info)
    }

    /// Empty the queue and forget all backfill progress
    pub fn reset(&self) -> Result<usize, StorageError> {
        let removed = self.db.with_conn_mut(queue::truncate)?;
        self.store.reset()?;
        info!(removed, "Queue and backfill state reset");
        self.events.emit(QueueEvent::QueueReset { removed });
        Ok(removed)
    }

    /// Run one invocation: start, resume or refuse, then page until done
    /// or until the slice budget is spent
    pub fn run(&self) -> JobOutcome {
        let run_id = Uuid::new_v4().to_string();

        let mut handle = match self.store.load() {
            Ok(handle) => handle,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Cannot load backfill state");
                return JobOutcome::Failed;
            }
        };

        let fresh = match admit(&handle.info, &self.config, Utc::now().timestamp()) {
            Admission::Start => true,
            Admission::Resume => false,
            Admission::Refuse(outcome) => {
                info!(run_id = %run_id, state = %handle.info.state, outcome = %outcome, "Backfill not started");
                return outcome;
            }
        };

        match self.execute(&run_id, &mut handle, fresh) {
            Ok(outcome) => outcome,
            Err(StorageError::Conflict(reason)) => {
                warn!(run_id = %run_id, reason = %reason, "Another backfill run owns the task");
                JobOutcome::AlreadyRunning
            }
            Err(e) => self.fail(&run_id, &mut handle, e),
        }
    }

    fn execute(&self, run_id: &str, handle: &mut TaskHandle, fresh: bool) -> Result<JobOutcome, StorageError> {
        let settings = self.settings.load()?;
        let mut collector = InitialCollector::new(
            self.db.clone(),
            self.host.clone(),
            &self.link_base,
            self.config.clone(),
            settings.obj_select().map(str::to_string),
        )?;

        let now = Utc::now().timestamp();
        if fresh {
            handle.info.found_items = collector.count()?;
            handle.info.processed_items = 0;
            handle.info.last_item = 0;
            handle.info.last_usr = 0;
            handle.info.started_ts = Some(now);
        }
        handle.info.lock = true;
        handle.info.state = TaskState::Running;
        handle.info.heartbeat_ts = Some(now);
        handle.info.last_error = None;
        handle.info.progress = handle.info.measure_progress();
        self.store.commit(handle)?;

        if fresh {
            self.events.emit(QueueEvent::BackfillStarted {
                run_id: run_id.to_string(),
                found_items: handle.info.found_items,
            });
        } else {
            info!(
                run_id = %run_id,
                processed = handle.info.processed_items,
                found = handle.info.found_items,
                last_item = handle.info.last_item,
                "Resuming backfill"
            );
        }

        let page_size = self.config.page_size.max(1) as usize;
        let mut pages = 0u32;

        loop {
            let cursor = Cursor {
                ref_id: handle.info.last_item,
                usr_id: handle.info.last_usr,
            };
            let units = collector.fetch_page(cursor)?;
            if units.is_empty() {
                break;
            }

            for unit in &units {
                let (member, progress) = collector.build_events(unit)?;
                if !self.writer.save_pair(&member, &progress, &settings) {
                    warn!(ref_id = unit.ref_id, usr_id = unit.usr_id, "Pair not written, continuing");
                }
                handle.info.processed_items += 1;
                handle.info.last_item = unit.ref_id;
                handle.info.last_usr = unit.usr_id;
            }

            handle.info.progress = handle.info.measure_progress();
            handle.info.heartbeat_ts = Some(Utc::now().timestamp());
            self.store.commit(handle)?;
            self.events.emit(QueueEvent::BackfillCheckpoint {
                run_id: run_id.to_string(),
                processed_items: handle.info.processed_items,
                progress: handle.info.progress,
                last_item: handle.info.last_item,
            });

            pages += 1;
            if units.len() < page_size {
                break;
            }
            if self.config.max_pages_per_run > 0 && pages >= self.config.max_pages_per_run {
                handle.info.lock = false;
                self.store.commit(handle)?;
                info!(run_id = %run_id, pages, progress = handle.info.progress, "Backfill slice done, yielding");
                return Ok(JobOutcome::Pending);
            }
        }

        self.finish(run_id, handle)
    }

    fn finish(&self, run_id: &str, handle: &mut TaskHandle) -> Result<JobOutcome, StorageError> {
        handle.info.progress = handle.info.measure_progress();

        let outcome = if handle.info.is_complete() {
            handle.info.state = TaskState::Finished;
            handle.info.lock = false;
            handle.info.finished_ts = Some(Utc::now().timestamp());
            JobOutcome::Success
        } else {
            // Lock stays set so the short run needs an explicit reset
            handle.info.state = TaskState::Stopped;
            handle.info.lock = true;
            warn!(
                run_id = %run_id,
                found = handle.info.found_items,
                processed = handle.info.processed_items,
                "Backfill ran out of pairs before reaching its item count"
            );
            JobOutcome::Stopped
        };
        self.store.commit(handle)?;

        self.events.emit(QueueEvent::BackfillFinished {
            run_id: run_id.to_string(),
            state: handle.info.state.to_string(),
            processed_items: handle.info.processed_items,
        });
        Ok(outcome)
    }

    fn fail(&self, run_id: &str, handle: &mut TaskHandle, e: StorageError) -> JobOutcome {
        // Cursor and counts stay at the last checkpoint
        handle.rollback();
        handle.info.state = TaskState::Failed;
        handle.info.lock = false;
        handle.info.last_error = Some(e.to_string());
        if let Err(commit_err) = self.store.commit(handle) {
            error!(run_id = %run_id, error = %commit_err, "Cannot record backfill failure");
        }

        self.events.emit(QueueEvent::BackfillFailed {
            run_id: run_id.to_string(),
            reason: e.to_string(),
        });
        JobOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(lock: bool, heartbeat_ts: Option<i64>) -> TaskInfo {
        TaskInfo {
            lock,
            state: TaskState::Running,
            heartbeat_ts,
            ..Default::default()
        }
    }

    #[test]
    fn test_admission_by_state() {
        let config = BackfillConfig::default();

        assert_eq!(admit(&TaskInfo::default(), &config, 0), Admission::Start);

        let finished = TaskInfo { state: TaskState::Finished, ..Default::default() };
        assert_eq!(admit(&finished, &config, 0), Admission::Refuse(JobOutcome::Success));

        let failed = TaskInfo { state: TaskState::Failed, ..Default::default() };
        assert_eq!(admit(&failed, &config, 0), Admission::Refuse(JobOutcome::Failed));

        let stopped = TaskInfo { state: TaskState::Stopped, lock: true, ..Default::default() };
        assert_eq!(admit(&stopped, &config, 0), Admission::Refuse(JobOutcome::Locked));

        assert_eq!(admit(&running(false, Some(0)), &config, 10), Admission::Resume);
    }

    #[test]
    fn test_started_blob_is_admitted_as_running() {
        let info: TaskInfo = serde_json::from_str(r#"{"lock": false, "state": "started", "last_item": 200}"#).unwrap();
        assert_eq!(info.state, TaskState::Started);
        assert_eq!(admit(&info, &BackfillConfig::default(), 0), Admission::Resume);

        let locked = TaskInfo { lock: true, heartbeat_ts: Some(0), ..info };
        assert_eq!(
            admit(&locked, &BackfillConfig::default(), 10),
            Admission::Refuse(JobOutcome::AlreadyRunning)
        );
    }

    #[test]
    fn test_stale_lock_policy() {
        let now = 10_000;
        let stale = running(true, Some(now - 1_000));
        let fresh = running(true, Some(now - 10));

        let refuse = BackfillConfig::default();
        assert_eq!(admit(&stale, &refuse, now), Admission::Refuse(JobOutcome::AlreadyRunning));

        let take_over = BackfillConfig {
            resume_policy: ResumePolicy::ResumeStale,
            ..Default::default()
        };
        assert_eq!(admit(&stale, &take_over, now), Admission::Resume);
        assert_eq!(admit(&fresh, &take_over, now), Admission::Refuse(JobOutcome::AlreadyRunning));
    }
}
