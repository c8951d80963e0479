//! Queue writer - redacts and persists captured events

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::db::{queue, NewQueueRecord, QueueDb};
use crate::error::StorageError;
use crate::models::{
    map_init_event, value_as_i64, CapturedEvent, EventType, MemberData, ObjectData, Section, UserData,
};

use super::events::{EventBus, QueueEvent};
use super::settings::{Settings, SettingsService, UDF_FIELDS, USER_FIELDS, USER_FIELD_TOGGLES};

/// Writes queue records for real-time capture and backfill
pub struct QueueWriter {
    db: Arc<QueueDb>,
    settings: Arc<SettingsService>,
    events: Arc<EventBus>,
}

impl QueueWriter {
    pub fn new(db: Arc<QueueDb>, settings: Arc<SettingsService>, events: Arc<EventBus>) -> Self {
        Self { db, settings, events }
    }

    /// Persist one captured event with the current settings
    ///
    /// Returns true when the record was written or deliberately skipped by
    /// the object type selection.
    pub fn save(&self, captured: &CapturedEvent) -> bool {
        match self.settings.load() {
            Ok(settings) => self.save_with(captured, &settings),
            Err(e) => {
                error!(event = %captured.event, error = %e, "Cannot load capture settings");
                false
            }
        }
    }

    /// Persist one captured event with a settings snapshot
    pub fn save_with(&self, captured: &CapturedEvent, settings: &Settings) -> bool {
        let record = match build_record(captured, settings) {
            Ok(Some(record)) => record,
            Ok(None) => return self.skipped(captured),
            Err(e) => return self.failed(&captured.event, e),
        };

        match self.db.with_conn(|conn| queue::insert_record(conn, &record)) {
            Ok(id) => {
                self.events.emit(QueueEvent::RecordWritten {
                    id,
                    event: record.event,
                    event_type: record.event_type,
                });
                true
            }
            Err(e) => self.failed(&captured.event, e),
        }
    }

    /// Persist a member record and a learning progress record atomically
    pub fn save_pair(&self, member: &CapturedEvent, progress: &CapturedEvent, settings: &Settings) -> bool {
        let records = match (build_record(member, settings), build_record(progress, settings)) {
            (Ok(Some(m)), Ok(Some(p))) => vec![m, p],
            (Ok(None), _) | (_, Ok(None)) => return self.skipped(member),
            (Err(e), _) | (_, Err(e)) => return self.failed(&member.event, e),
        };

        match self.db.with_conn_mut(|conn| queue::insert_records(conn, &records)) {
            Ok(ids) => {
                for (id, record) in ids.into_iter().zip(records) {
                    self.events.emit(QueueEvent::RecordWritten {
                        id,
                        event: record.event,
                        event_type: record.event_type,
                    });
                }
                true
            }
            Err(e) => self.failed(&member.event, e),
        }
    }

    fn skipped(&self, captured: &CapturedEvent) -> bool {
        let obj_type = captured.record.object_type().unwrap_or_default();
        debug!(event = %captured.event, obj_type = %obj_type, "Object type not selected, record skipped");
        self.events.emit(QueueEvent::RecordSkipped {
            event: captured.event.clone(),
            obj_type,
        });
        true
    }

    fn failed(&self, event: &str, e: StorageError) -> bool {
        error!(event = %event, error = %e, "Failed to write queue record");
        self.events.emit(QueueEvent::WriteFailed {
            event: event.to_string(),
            reason: e.to_string(),
        });
        false
    }
}

/// Map a captured event to a queue row, `None` when its object type is not selected
pub fn build_record(captured: &CapturedEvent, settings: &Settings) -> Result<Option<NewQueueRecord>, StorageError> {
    let record = &captured.record;

    if let Some(selected) = settings.obj_select() {
        if record.object_type().as_deref() != Some(selected) {
            return Ok(None);
        }
    }

    let event = map_init_event(&captured.event);
    let event_type = EventType::for_event(event)
        .ok_or_else(|| StorageError::InvalidInput(format!("Unknown event '{}'", captured.event)))?;

    let obj_data = ObjectData::from_section(&record.object_data);
    if obj_data.id == -1 {
        error!(event = %event, "No object found for event, storing object id -1");
    } else if obj_data.ref_id == -1 {
        info!(event = %event, obj_id = obj_data.id, "Event object has no reference id");
    }

    let user_data = redact_user_data(&record.user_data, &record.udf_data, settings);
    let mem_data = MemberData::from_section(&record.member_data);

    Ok(Some(NewQueueRecord {
        timestamp: captured.timestamp,
        event: event.to_string(),
        event_type: event_type.as_str().to_string(),
        progress: captured.progress.clone(),
        assignment: captured.assignment.clone(),
        course_start: record.lp_period.get("course_start").and_then(value_as_i64),
        course_end: record.lp_period.get("course_end").and_then(value_as_i64),
        user_data: serde_json::to_string(&user_data)?,
        obj_data: serde_json::to_string(&obj_data)?,
        mem_data: serde_json::to_string(&mem_data)?,
        progress_changed: captured.progress_changed,
    }))
}

/// Keep only user fields whose toggle is enabled
pub fn redact_user_data(user: &Section, udf: &Section, settings: &Settings) -> UserData {
    if !settings.is_enabled(USER_FIELDS) {
        return UserData::default();
    }

    let kept: Section = USER_FIELD_TOGGLES
        .iter()
        .filter(|(toggle, _)| settings.is_enabled(toggle))
        .filter_map(|(_, key)| user.get(*key).map(|value| (key.to_string(), value.clone())))
        .collect();

    let udf = if settings.is_enabled(UDF_FIELDS) {
        udf.clone()
    } else {
        Section::new()
    };

    UserData::from_section(&kept, udf)
}
