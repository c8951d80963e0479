//! Real-time capture of host lifecycle callbacks

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::StorageError;
use crate::host::{HostDirectory, CONTAINER_TYPES};
use crate::models::{
    is_init_event, progress_label, role_label, AggregatedRecord, CapturedEvent, EventDescriptor,
};

use super::events::EventBus;
use super::processor::Processor;
use super::resolver::RoutineResolver;
use super::settings::{SettingsService, USER_FIELDS};
use super::writer::QueueWriter;

pub const COMPONENT_COURSE: &str = "Modules/Course";
pub const COMPONENT_OBJECT: &str = "Services/Object";
pub const COMPONENT_TRACKING: &str = "Services/Tracking";

/// Assignment label when no role applies
pub const NO_ASSIGNMENT: &str = "-";

/// Parameters the host passes with a callback
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventParams {
    pub obj_id: Option<i64>,
    pub ref_id: Option<i64>,
    pub parent_ref_id: Option<i64>,
    pub old_parent_ref_id: Option<i64>,
    pub obj_type: Option<String>,
    pub usr_id: Option<i64>,
    pub role_id: Option<i64>,
    pub status: Option<i64>,
    pub percentage: Option<i64>,
    pub status_changed: Option<i64>,
}

impl EventParams {
    fn descriptor(&self, event: &str) -> EventDescriptor {
        EventDescriptor {
            obj_id: self.obj_id.unwrap_or(-1),
            ref_id: self.ref_id.unwrap_or(-1),
            parent_ref_id: self.old_parent_ref_id.or(self.parent_ref_id),
            obj_type: self.obj_type.clone().unwrap_or_default(),
            usr_id: self.usr_id.unwrap_or(-1),
            role_id: self.role_id,
            status: self.status,
            percentage: self.percentage,
            event: event.to_string(),
        }
    }

    /// Host change time of an initial event, if usable
    fn init_timestamp(&self, event: &str) -> Option<i64> {
        if is_init_event(event) {
            self.status_changed.filter(|ts| *ts > 0)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    LearningProgress,
    Member,
    Object,
}

fn handler_for(component: &str, event: &str) -> Option<Handler> {
    match (component, event) {
        (
            COMPONENT_COURSE,
            "addParticipant" | "deleteParticipant" | "addToWaitingList" | "removeFromWaitingList"
            | "createAssignment" | "deleteAssignment" | "updateAssignment",
        ) => Some(Handler::Member),
        (COMPONENT_OBJECT, "create" | "update" | "delete" | "toTrash" | "undelete" | "putObjectInTree") => {
            Some(Handler::Object)
        }
        (COMPONENT_TRACKING, "updateStatus" | "init_event_lp") => Some(Handler::LearningProgress),
        (COMPONENT_TRACKING, "init_event_mem") => Some(Handler::Member),
        _ => None,
    }
}

/// Entry point for host callbacks
pub struct EventCapture {
    host: Arc<dyn HostDirectory>,
    resolver: Arc<RoutineResolver>,
    writer: Arc<QueueWriter>,
    settings: Arc<SettingsService>,
    events: Arc<EventBus>,
}

impl EventCapture {
    pub fn new(
        host: Arc<dyn HostDirectory>,
        resolver: Arc<RoutineResolver>,
        writer: Arc<QueueWriter>,
        settings: Arc<SettingsService>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            host,
            resolver,
            writer,
            settings,
            events,
        }
    }

    /// Handle one host callback; returns true when a record was written
    pub fn handle_event(&self, component: &str, event: &str, params: &EventParams) -> bool {
        let Some(handler) = handler_for(component, event) else {
            debug!(component = %component, event = %event, "Ignoring host event");
            return false;
        };

        match self.settings.load() {
            Ok(settings) if settings.is_enabled(USER_FIELDS) => {}
            Ok(_) => {
                debug!(event = %event, "User capture disabled, event ignored");
                return false;
            }
            Err(e) => {
                error!(event = %event, error = %e, "Cannot load capture settings");
                return false;
            }
        }

        match self.capture(handler, event, params) {
            Ok(captured) => self.writer.save(&captured),
            Err(e) => {
                error!(component = %component, event = %event, error = %e, "Event capture failed");
                false
            }
        }
    }

    fn capture(&self, handler: Handler, event: &str, params: &EventParams) -> Result<CapturedEvent, StorageError> {
        let descriptor = params.descriptor(event);
        let processor = Processor::new(self.resolver.resolve()?, self.events.clone());
        let record = processor.capture(&descriptor);

        let now = chrono::Utc::now().timestamp();
        let timestamp = params.init_timestamp(event).unwrap_or(now);

        let (progress, progress_changed) = match handler {
            Handler::LearningProgress => (progress_label(params.status).to_string(), Some(timestamp)),
            Handler::Object => (progress_label(None).to_string(), None),
            Handler::Member => {
                let mark = if descriptor.obj_id > 0 && descriptor.usr_id > 0 {
                    self.host.lp_mark(descriptor.obj_id, descriptor.usr_id)?
                } else {
                    None
                };
                (
                    progress_label(mark.map(|m| m.status)).to_string(),
                    mark.and_then(|m| m.status_changed),
                )
            }
        };

        let assignment = self.assignment_label(&record, &descriptor).unwrap_or_else(|e| {
            warn!(event = %event, error = %e, "Cannot resolve assignment");
            NO_ASSIGNMENT.to_string()
        });

        Ok(CapturedEvent {
            record,
            event: event.to_string(),
            timestamp,
            progress,
            progress_changed,
            assignment,
        })
    }

    /// Role label of the member section, else of the user's role in the
    /// nearest course, group or study programme
    fn assignment_label(&self, record: &AggregatedRecord, event: &EventDescriptor) -> Result<String, StorageError> {
        if let Some(role) = record.member_role() {
            return self.role_title_label(role);
        }

        if event.event == "toTrash" || event.usr_id <= 0 {
            return Ok(NO_ASSIGNMENT.to_string());
        }

        let Some(search_ref) = event.search_ref_id().or_else(|| record.member_course_ref_id()) else {
            return Ok(NO_ASSIGNMENT.to_string());
        };

        let path = self.host.path_to_root(search_ref)?;
        for node in path.iter().rev().filter(|n| CONTAINER_TYPES.contains(&n.obj_type.as_str())) {
            if let Some(role) = self.host.role_at_ref(event.usr_id, node.ref_id)? {
                return self.role_title_label(role);
            }
        }

        Ok(NO_ASSIGNMENT.to_string())
    }

    fn role_title_label(&self, rol_id: i64) -> Result<String, StorageError> {
        Ok(self
            .host
            .role_title(rol_id)?
            .map(|title| role_label(&title).to_string())
            .unwrap_or_default())
    }
}
