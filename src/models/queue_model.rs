//! Queue blobs and the decoded queue record
//!
//! The three JSON blobs of a queue row keep a fixed key set so downstream
//! decoders can rely on every key being present, with `null` for values that
//! were not captured or were redacted.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::db::QueueRow;
use crate::error::StorageError;

use super::record::{value_as_bool, value_as_i64, value_as_string, Section};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserData {
    pub usr_id: i64,
    pub username: Option<String>,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub title: Option<String>,
    pub gender: Option<String>,
    pub email: Option<String>,
    pub institution: Option<String>,
    pub street: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub phone_office: Option<String>,
    pub hobby: Option<String>,
    pub department: Option<String>,
    pub phone_home: Option<String>,
    pub phone_mobile: Option<String>,
    pub phone_fax: Option<String>,
    pub referral_comment: Option<String>,
    pub matriculation: Option<String>,
    pub active: Option<bool>,
    pub approval_date: Option<String>,
    pub agree_date: Option<String>,
    pub auth_mode: Option<String>,
    pub ext_account: Option<String>,
    pub birthday: Option<String>,
    pub import_id: Option<String>,
    pub udf_data: Section,
}

impl Default for UserData {
    fn default() -> Self {
        Self {
            usr_id: -1,
            username: None,
            firstname: None,
            lastname: None,
            title: None,
            gender: None,
            email: None,
            institution: None,
            street: None,
            city: None,
            country: None,
            phone_office: None,
            hobby: None,
            department: None,
            phone_home: None,
            phone_mobile: None,
            phone_fax: None,
            referral_comment: None,
            matriculation: None,
            active: None,
            approval_date: None,
            agree_date: None,
            auth_mode: None,
            ext_account: None,
            birthday: None,
            import_id: None,
            udf_data: Section::new(),
        }
    }
}

impl UserData {
    /// Build the blob from a (possibly filtered) user section
    pub fn from_section(user: &Section, udf: Section) -> Self {
        let text = |key: &str| user.get(key).and_then(value_as_string);

        Self {
            usr_id: user.get("user_id").and_then(value_as_i64).unwrap_or(-1),
            username: text("username"),
            firstname: text("firstname"),
            lastname: text("lastname"),
            title: text("title"),
            gender: text("gender"),
            email: text("email"),
            institution: text("institution"),
            street: text("street"),
            city: text("city"),
            country: text("country"),
            phone_office: text("phone_office"),
            hobby: text("hobby"),
            department: text("department"),
            phone_home: text("phone_home"),
            phone_mobile: text("phone_mobile"),
            phone_fax: text("phone_fax"),
            referral_comment: text("referral_comment"),
            matriculation: text("matriculation"),
            active: user.get("active").and_then(value_as_bool),
            approval_date: text("approval_date"),
            agree_date: text("agree_date"),
            auth_mode: text("auth_mode"),
            ext_account: text("ext_account"),
            birthday: text("birthday"),
            import_id: text("import_id"),
            udf_data: udf,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectData {
    pub id: i64,
    pub title: String,
    pub ref_id: i64,
    pub link: String,
    #[serde(rename = "type")]
    pub obj_type: String,
    pub type_hr: String,
    pub course_title: Option<String>,
    pub course_id: i64,
    pub course_ref_id: i64,
}

impl Default for ObjectData {
    fn default() -> Self {
        Self {
            id: -1,
            title: String::new(),
            ref_id: -1,
            link: String::new(),
            obj_type: String::new(),
            type_hr: String::new(),
            course_title: None,
            course_id: -1,
            course_ref_id: -1,
        }
    }
}

impl ObjectData {
    pub fn from_section(object: &Section) -> Self {
        let obj_type = object.get("type").and_then(value_as_string).unwrap_or_default();

        Self {
            id: object.get("id").and_then(value_as_i64).unwrap_or(-1),
            title: object.get("title").and_then(value_as_string).unwrap_or_default(),
            ref_id: object.get("ref_id").and_then(value_as_i64).unwrap_or(-1),
            link: object.get("link").and_then(value_as_string).unwrap_or_default(),
            type_hr: type_name(&obj_type).to_string(),
            obj_type,
            course_title: object.get("course_title").and_then(value_as_string),
            course_id: object.get("course_id").and_then(value_as_i64).unwrap_or(-1),
            course_ref_id: object.get("course_ref_id").and_then(value_as_i64).unwrap_or(-1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberData {
    pub role: Option<i64>,
    pub course_title: Option<String>,
    pub course_id: i64,
    pub course_ref_id: i64,
}

impl Default for MemberData {
    fn default() -> Self {
        Self {
            role: None,
            course_title: None,
            course_id: -1,
            course_ref_id: -1,
        }
    }
}

impl MemberData {
    pub fn from_section(member: &Section) -> Self {
        Self {
            role: member.get("role").and_then(value_as_i64),
            course_title: member.get("course_title").and_then(value_as_string),
            course_id: member.get("course_id").and_then(value_as_i64).unwrap_or(-1),
            course_ref_id: member.get("course_ref_id").and_then(value_as_i64).unwrap_or(-1),
        }
    }
}

/// Human readable name of an object type tag
pub fn type_name(obj_type: &str) -> &'static str {
    match obj_type {
        "adm" => "SystemFolder",
        "assf" => "AssessmentFolder",
        "bibl" => "Bibliographic",
        "blog" => "Blog",
        "book" => "BookingPool",
        "cat" => "Category",
        "catr" => "CategoryReference",
        "crs" => "Course",
        "crsr" => "CourseReference",
        "dcl" => "DataCollection",
        "exc" => "Exercise",
        "fold" => "Folder",
        "frm" => "Forum",
        "glo" => "Glossary",
        "grp" => "Group",
        "grpr" => "GroupReference",
        "iass" => "IndividualAssessment",
        "lm" => "LearningModule",
        "prg" => "StudyProgramme",
        "role" => "Role",
        "rolf" => "RoleFolder",
        "sahs" => "SAHSLearningModule",
        "sess" => "Session",
        "trac" => "UserTracking",
        "tst" => "Test",
        "usr" => "User",
        _ => "",
    }
}

/// A queue row with its blobs decoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueModel {
    pub id: i64,
    pub timestamp: i64,
    pub event: String,
    pub event_type: String,
    pub progress: String,
    pub progress_changed: Option<i64>,
    pub assignment: String,
    pub course_start: Option<i64>,
    pub course_end: Option<i64>,
    pub user_data: UserData,
    pub obj_data: ObjectData,
    pub mem_data: MemberData,
}

impl QueueModel {
    pub fn from_row(row: &QueueRow) -> Result<Self, StorageError> {
        Ok(Self {
            id: row.id,
            timestamp: row.timestamp,
            event: row.event.clone(),
            event_type: row.event_type.clone(),
            progress: row.progress.clone(),
            progress_changed: row.progress_changed,
            assignment: row.assignment.clone(),
            course_start: row.course_start,
            course_end: row.course_end,
            user_data: decode_blob(&row.user_data, "user_data", row.id)?,
            obj_data: decode_blob(&row.obj_data, "obj_data", row.id)?,
            mem_data: decode_blob(&row.mem_data, "mem_data", row.id)?,
        })
    }

    /// Export document with timestamps rendered as ISO-8601
    pub fn to_document(&self) -> Value {
        json!({
            "id": self.id,
            "timestamp": iso8601(Some(self.timestamp)),
            "event": self.event,
            "event_type": self.event_type,
            "progress": self.progress,
            "progress_changed": iso8601(self.progress_changed),
            "assignment": self.assignment,
            "course_start": iso8601(self.course_start),
            "course_end": iso8601(self.course_end),
            "user_data": self.user_data,
            "obj_data": self.obj_data,
            "mem_data": self.mem_data,
        })
    }
}

fn decode_blob<T: serde::de::DeserializeOwned + Default>(
    raw: &str,
    column: &str,
    id: i64,
) -> Result<T, StorageError> {
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(raw)
        .map_err(|e| StorageError::Parse(format!("Record {} has malformed {}: {}", id, column, e)))
}

fn iso8601(ts: Option<i64>) -> Value {
    ts.and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true)))
        .unwrap_or(Value::Null)
}

/// Primitive kinds of the collection schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaKind {
    Integer,
    String,
    Timestamp,
    List,
    /// Entry point into a nested object, not a leaf value
    Object,
}

/// Dot-path schema of exported queue documents
pub fn collection_schema() -> BTreeMap<&'static str, SchemaKind> {
    use SchemaKind::*;

    [
        ("id", Integer),
        ("timestamp", Timestamp),
        ("event", String),
        ("event_type", String),
        ("progress", String),
        ("progress_changed", Timestamp),
        ("assignment", String),
        ("course_start", Timestamp),
        ("course_end", Timestamp),
        ("user_data", Object),
        ("user_data.usr_id", Integer),
        ("user_data.username", String),
        ("user_data.firstname", String),
        ("user_data.lastname", String),
        ("user_data.title", String),
        ("user_data.gender", String),
        ("user_data.email", String),
        ("user_data.institution", String),
        ("user_data.street", String),
        ("user_data.city", String),
        ("user_data.country", String),
        ("user_data.phone_office", String),
        ("user_data.hobby", String),
        ("user_data.department", String),
        ("user_data.phone_home", String),
        ("user_data.phone_mobile", String),
        ("user_data.phone_fax", String),
        ("user_data.referral_comment", String),
        ("user_data.matriculation", String),
        ("user_data.active", Integer),
        ("user_data.approval_date", Timestamp),
        ("user_data.agree_date", Timestamp),
        ("user_data.auth_mode", String),
        ("user_data.ext_account", String),
        ("user_data.birthday", Timestamp),
        ("user_data.import_id", String),
        ("user_data.udf_data", List),
        ("obj_data", Object),
        ("obj_data.id", Integer),
        ("obj_data.title", String),
        ("obj_data.ref_id", Integer),
        ("obj_data.link", String),
        ("obj_data.type", String),
        ("obj_data.type_hr", String),
        ("obj_data.course_title", String),
        ("obj_data.course_id", Integer),
        ("obj_data.course_ref_id", Integer),
        ("mem_data", Object),
        ("mem_data.role", String),
        ("mem_data.course_title", String),
        ("mem_data.course_id", Integer),
        ("mem_data.course_ref_id", Integer),
    ]
    .into_iter()
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(user_data: &str) -> QueueRow {
        QueueRow {
            id: 3,
            timestamp: 1_600_000_000,
            event: "updateStatus".into(),
            event_type: "lp_event".into(),
            progress: "completed".into(),
            assignment: "member".into(),
            course_start: None,
            course_end: Some(1_700_000_000),
            user_data: user_data.into(),
            obj_data: r#"{"id":7,"type":"tst"}"#.into(),
            mem_data: String::new(),
            progress_changed: None,
        }
    }

    #[test]
    fn test_blob_defaults_fill_missing_keys() {
        let model = QueueModel::from_row(&row(r#"{"usr_id":42,"username":"jdoe"}"#)).unwrap();

        assert_eq!(model.user_data.usr_id, 42);
        assert_eq!(model.user_data.email, None);
        assert_eq!(model.obj_data.id, 7);
        assert_eq!(model.obj_data.ref_id, -1);
        assert_eq!(model.mem_data, MemberData::default());
    }

    #[test]
    fn test_malformed_blob_is_parse_error() {
        let err = QueueModel::from_row(&row("{not json")).unwrap_err();
        assert!(matches!(err, StorageError::Parse(_)));
    }

    #[test]
    fn test_document_uses_iso_timestamps() {
        let model = QueueModel::from_row(&row("{}")).unwrap();
        let doc = model.to_document();

        assert_eq!(doc["timestamp"], "2020-09-13T12:26:40Z");
        assert_eq!(doc["course_start"], Value::Null);
        assert_eq!(doc["user_data"]["usr_id"], -1);
    }

    #[test]
    fn test_serialized_user_blob_keeps_every_key() {
        let blob = serde_json::to_value(UserData::default()).unwrap();
        let keys = blob.as_object().unwrap();

        for (path, _) in collection_schema().iter().filter(|(p, _)| p.starts_with("user_data.")) {
            let key = path.trim_start_matches("user_data.");
            assert!(keys.contains_key(key), "missing {}", key);
        }
    }

    #[test]
    fn test_object_section_gets_type_name() {
        let mut section = Section::new();
        section.insert("type".into(), json!("prg"));
        section.insert("ref_id".into(), json!("55"));

        let data = ObjectData::from_section(&section);
        assert_eq!(data.type_hr, "StudyProgramme");
        assert_eq!(data.ref_id, 55);
        assert_eq!(data.id, -1);
    }
}
