//! Captured event descriptors and the fixed event vocabularies

use serde::{Deserialize, Serialize};

/// What happened, as reported by a host lifecycle callback
///
/// Ids use `-1` when the host did not provide them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDescriptor {
    pub obj_id: i64,
    pub ref_id: i64,
    pub parent_ref_id: Option<i64>,
    pub obj_type: String,
    pub usr_id: i64,
    pub role_id: Option<i64>,
    pub status: Option<i64>,
    pub percentage: Option<i64>,
    pub event: String,
}

impl EventDescriptor {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            obj_id: -1,
            ref_id: -1,
            parent_ref_id: None,
            obj_type: String::new(),
            usr_id: -1,
            role_id: None,
            status: None,
            percentage: None,
            event: event.into(),
        }
    }

    pub fn has_ref_id(&self) -> bool {
        self.ref_id > 0
    }

    /// Reference to search containers from (own ref, else parent ref)
    pub fn search_ref_id(&self) -> Option<i64> {
        if self.has_ref_id() {
            Some(self.ref_id)
        } else {
            self.parent_ref_id.filter(|r| *r > 0)
        }
    }
}

/// Event family stored in `lerq_queue.event_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    LpEvent,
    MemberEvent,
    ObjectEvent,
}

impl EventType {
    /// Derive the family from an event name
    pub fn for_event(event: &str) -> Option<Self> {
        match event {
            "addParticipant" | "deleteParticipant" | "addToWaitingList" | "removeFromWaitingList"
            | "createAssignment" | "deleteAssignment" | "updateAssignment" | "init_event_mem" => {
                Some(EventType::MemberEvent)
            }
            "updateStatus" | "init_event_lp" => Some(EventType::LpEvent),
            "create" | "delete" | "toTrash" | "undelete" | "update" | "putObjectInTree" => {
                Some(EventType::ObjectEvent)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::LpEvent => "lp_event",
            EventType::MemberEvent => "member_event",
            EventType::ObjectEvent => "object_event",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const INIT_EVENT_LP: &str = "init_event_lp";
pub const INIT_EVENT_MEM: &str = "init_event_mem";

/// Bulk initializer events are stored under their real-time names
pub fn map_init_event(event: &str) -> &str {
    match event {
        INIT_EVENT_LP => "updateStatus",
        INIT_EVENT_MEM => "addParticipant",
        other => other,
    }
}

pub fn is_init_event(event: &str) -> bool {
    event == INIT_EVENT_LP || event == INIT_EVENT_MEM
}

/// Progress label of a learning progress status code
pub fn progress_label(status: Option<i64>) -> &'static str {
    match status {
        Some(1) => "in_progress",
        Some(2) => "completed",
        Some(3) => "failed",
        _ => "no_attempted",
    }
}

/// Assignment label of a raw role title
///
/// The leftmost of `member`, `tutor` or `admin` wins; titles without any of
/// them map to an empty label.
pub fn role_label(title: &str) -> &'static str {
    [("member", "member"), ("tutor", "tutor"), ("admin", "administrator")]
        .iter()
        .filter_map(|(needle, label)| title.find(needle).map(|pos| (pos, *label)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, label)| label)
        .unwrap_or("")
}
