//! Built-in capture routines backed by the host directory

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use url::Url;

use crate::error::StorageError;
use crate::host::{HostDirectory, HostObject, UdfDefinition, UserProfile};
use crate::models::{EventDescriptor, Section};

use super::{DataCaptureRoutines, RoutineContext};

/// Course an event belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct CourseRef {
    pub obj_id: i64,
    pub ref_id: i64,
    pub title: String,
}

/// Fallback routines answering every category
pub struct DefaultRoutines {
    host: Arc<dyn HostDirectory>,
    link_base: String,
}

impl DefaultRoutines {
    pub fn new(host: Arc<dyn HostDirectory>, link_base: impl Into<String>) -> Self {
        Self {
            host,
            link_base: link_base.into(),
        }
    }

    pub fn from_context(context: &RoutineContext) -> Self {
        Self::new(context.host.clone(), context.link_base.clone())
    }

    /// Nearest course of the event's reference, falling back to the first
    /// live reference of the object id
    pub fn find_course(&self, event: &EventDescriptor) -> Result<Option<CourseRef>, StorageError> {
        let search_ref = match event.search_ref_id() {
            Some(ref_id) => Some(ref_id),
            None if event.obj_id > 0 => self
                .host
                .object_by_obj_id(event.obj_id)?
                .and_then(|object| object.ref_id),
            None => None,
        };

        let Some(ref_id) = search_ref else {
            return Ok(None);
        };

        Ok(self.host.parent_of_type(ref_id, &["crs"])?.map(|node| CourseRef {
            obj_id: node.obj_id,
            ref_id: node.ref_id,
            title: node.title,
        }))
    }

    fn resolve_object(&self, event: &EventDescriptor) -> Result<Option<(HostObject, bool)>, StorageError> {
        if event.has_ref_id() {
            return Ok(self.host.object_by_ref_id(event.ref_id)?.map(|object| (object, false)));
        }
        if event.obj_id > 0 {
            return Ok(self.host.object_by_obj_id(event.obj_id)?.map(|object| (object, true)));
        }
        Ok(None)
    }

    /// `<base>/goto.php?target=<type>_<ref_id>`
    pub fn permalink(&self, obj_type: &str, ref_id: i64, ambiguous: bool) -> Result<String, StorageError> {
        let base = if self.link_base.ends_with('/') {
            self.link_base.clone()
        } else {
            format!("{}/", self.link_base)
        };

        let mut url = Url::parse(&base)
            .and_then(|url| url.join("goto.php"))
            .map_err(|e| StorageError::Config(format!("Invalid http_path '{}': {}", self.link_base, e)))?;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("target", &format!("{}_{}", obj_type, ref_id));
            if ambiguous {
                query.append_pair("ambiguous", "true");
            }
        }

        Ok(url.into())
    }
}

/// User section of a host profile
pub fn user_section(user: &UserProfile) -> Section {
    let mut section = Section::new();
    section.insert("user_id".into(), json!(user.usr_id));
    section.insert("username".into(), json!(user.login));
    section.insert("firstname".into(), json!(user.firstname));
    section.insert("lastname".into(), json!(user.lastname));
    section.insert("title".into(), json!(user.title));
    section.insert("gender".into(), json!(user.gender));
    section.insert("email".into(), json!(user.email));
    section.insert("institution".into(), json!(user.institution));
    section.insert("street".into(), json!(user.street));
    section.insert("city".into(), json!(user.city));
    section.insert("country".into(), json!(user.country));
    section.insert("phone_office".into(), json!(user.phone_office));
    section.insert("hobby".into(), json!(user.hobby));
    section.insert("department".into(), json!(user.department));
    section.insert("phone_home".into(), json!(user.phone_home));
    section.insert("phone_mobile".into(), json!(user.phone_mobile));
    section.insert("phone_fax".into(), json!(user.fax));
    section.insert("referral_comment".into(), json!(user.referral_comment));
    section.insert("matriculation".into(), json!(user.matriculation));
    section.insert("active".into(), json!(user.active));
    section.insert("approval_date".into(), json!(user.approve_date));
    section.insert("agree_date".into(), json!(user.agree_date));
    section.insert("auth_mode".into(), json!(user.auth_mode));
    section.insert("ext_account".into(), json!(user.ext_account));
    section.insert("birthday".into(), json!(user.birthday));
    section.insert("import_id".into(), json!(user.import_id));
    section
}

/// Every visible field as `f_<id>`, null when the user has no value
pub fn udf_section(definitions: &[UdfDefinition], values: &HashMap<i64, String>) -> Section {
    definitions
        .iter()
        .map(|def| {
            let value = values
                .get(&def.field_id)
                .map(|v| Value::String(v.clone()))
                .unwrap_or(Value::Null);
            (format!("f_{}", def.field_id), value)
        })
        .collect()
}

fn course_fields(section: &mut Section, course: Option<&CourseRef>) {
    section.insert("course_title".into(), json!(course.map(|c| c.title.clone())));
    section.insert("course_id".into(), json!(course.map(|c| c.obj_id).unwrap_or(-1)));
    section.insert("course_ref_id".into(), json!(course.map(|c| c.ref_id).unwrap_or(-1)));
}

impl DataCaptureRoutines for DefaultRoutines {
    fn collect_user_data(&self, event: &EventDescriptor) -> Result<Section, StorageError> {
        if event.usr_id <= 0 {
            return Ok(Section::new());
        }
        Ok(self
            .host
            .user_by_id(event.usr_id)?
            .map(|user| user_section(&user))
            .unwrap_or_default())
    }

    fn collect_udf_data(&self, event: &EventDescriptor) -> Result<Section, StorageError> {
        if event.usr_id <= 0 {
            return Ok(Section::new());
        }
        let definitions = self.host.visible_udf_definitions()?;
        if definitions.is_empty() {
            return Ok(Section::new());
        }
        let values = self.host.udf_values(event.usr_id)?;
        Ok(udf_section(&definitions, &values))
    }

    fn collect_member_data(&self, event: &EventDescriptor) -> Result<Section, StorageError> {
        let course = self.find_course(event)?;

        let role = match event.role_id.filter(|r| *r > 0) {
            Some(role) => Some(role),
            None if event.usr_id > 0 => {
                let at_ref = course.as_ref().map(|c| c.ref_id).or_else(|| event.search_ref_id());
                match at_ref {
                    Some(ref_id) => self.host.role_at_ref(event.usr_id, ref_id)?,
                    None => None,
                }
            }
            None => None,
        };

        if role.is_none() && course.is_none() {
            return Ok(Section::new());
        }

        let mut section = Section::new();
        section.insert("role".into(), json!(role));
        course_fields(&mut section, course.as_ref());
        Ok(section)
    }

    fn collect_lp_period(&self, event: &EventDescriptor) -> Result<Section, StorageError> {
        let Some(course) = self.find_course(event)? else {
            return Ok(Section::new());
        };
        let Some(period) = self.host.course_period(course.obj_id)? else {
            return Ok(Section::new());
        };

        let mut section = Section::new();
        section.insert("course_start".into(), json!(period.start));
        section.insert("course_end".into(), json!(period.end));
        Ok(section)
    }

    fn collect_object_data(&self, event: &EventDescriptor) -> Result<Section, StorageError> {
        let mut section = Section::new();

        match self.resolve_object(event)? {
            Some((object, ambiguous)) => {
                let ref_id = object.ref_id.unwrap_or(-1);
                let link = if ref_id > 0 {
                    self.permalink(&object.obj_type, ref_id, ambiguous)?
                } else {
                    String::new()
                };
                section.insert("id".into(), json!(object.obj_id));
                section.insert("title".into(), json!(object.title));
                section.insert("ref_id".into(), json!(ref_id));
                section.insert("link".into(), json!(link));
                section.insert("type".into(), json!(object.obj_type));
            }
            None if event.obj_id > 0 || event.has_ref_id() => {
                // Object already gone from the host, keep what the event carried
                section.insert("id".into(), json!(event.obj_id));
                section.insert("title".into(), json!(""));
                section.insert("ref_id".into(), json!(event.ref_id));
                section.insert("link".into(), json!(""));
                section.insert("type".into(), json!(event.obj_type));
            }
            None => return Ok(section),
        }

        let course = self.find_course(event)?;
        course_fields(&mut section, course.as_ref());
        Ok(section)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::host::SqliteHost;
    use crate::db::QueueDb;

    fn routines() -> DefaultRoutines {
        let db = Arc::new(QueueDb::open_in_memory().unwrap());
        db.with_conn(|conn| {
            conn.execute_batch(
                r#"
                INSERT INTO object_data (obj_id, type, title) VALUES
                    (1, 'root', 'Repository'), (20, 'crs', 'Rust 101'), (40, 'tst', 'Quiz'),
                    (500, 'role', 'il_crs_member_200');
                INSERT INTO object_reference (ref_id, obj_id) VALUES (1, 1), (200, 20), (400, 40);
                INSERT INTO tree (child, parent, depth) VALUES (1, 0, 1), (200, 1, 2), (400, 200, 3);
                INSERT INTO rbac_fa (rol_id, parent) VALUES (500, 200);
                INSERT INTO rbac_ua (usr_id, rol_id) VALUES (42, 500);
                INSERT INTO crs_settings (obj_id, crs_start, crs_end) VALUES (20, 1000, 2000);
                INSERT INTO usr_data (usr_id, login, email) VALUES (42, 'jdoe', 'jdoe@example.org');
                INSERT INTO udf_definition (field_id, field_name) VALUES (3, 'Company'), (5, 'Badge');
                INSERT INTO udf_text (usr_id, field_id, value) VALUES (42, 3, 'Acme');
                "#,
            )
            .map_err(|e| StorageError::Internal(e.to_string()))
        })
        .unwrap();

        DefaultRoutines::new(Arc::new(SqliteHost::new(db)), "https://lms.example.org/ilias")
    }

    fn quiz_event() -> EventDescriptor {
        EventDescriptor {
            obj_id: 40,
            ref_id: 400,
            obj_type: "tst".into(),
            usr_id: 42,
            ..EventDescriptor::new("updateStatus")
        }
    }

    #[test]
    fn test_permalink() {
        let routines = routines();
        assert_eq!(
            routines.permalink("crs", 200, false).unwrap(),
            "https://lms.example.org/ilias/goto.php?target=crs_200"
        );
        assert_eq!(
            routines.permalink("tst", 400, true).unwrap(),
            "https://lms.example.org/ilias/goto.php?target=tst_400&ambiguous=true"
        );
    }

    #[test]
    fn test_object_data_with_course_triad() {
        let section = routines().collect_object_data(&quiz_event()).unwrap();

        assert_eq!(section["id"], 40);
        assert_eq!(section["title"], "Quiz");
        assert_eq!(section["course_title"], "Rust 101");
        assert_eq!(section["course_ref_id"], 200);
    }

    #[test]
    fn test_object_by_obj_id_is_ambiguous() {
        let event = EventDescriptor { ref_id: -1, ..quiz_event() };
        let section = routines().collect_object_data(&event).unwrap();

        assert_eq!(section["ref_id"], 400);
        assert!(section["link"].as_str().unwrap().ends_with("ambiguous=true"));
    }

    #[test]
    fn test_member_role_and_period() {
        let routines = routines();
        let member = routines.collect_member_data(&quiz_event()).unwrap();
        assert_eq!(member["role"], 500);
        assert_eq!(member["course_id"], 20);

        let period = routines.collect_lp_period(&quiz_event()).unwrap();
        assert_eq!(period["course_start"], 1000);
        assert_eq!(period["course_end"], 2000);
    }

    #[test]
    fn test_udf_keys_are_null_filled() {
        let section = routines().collect_udf_data(&quiz_event()).unwrap();

        assert_eq!(section.len(), 2);
        assert_eq!(section["f_3"], "Acme");
        assert_eq!(section["f_5"], Value::Null);
    }

    #[test]
    fn test_unknown_user_has_no_user_data() {
        let routines = routines();
        let event = EventDescriptor { usr_id: 99, ..quiz_event() };
        assert!(routines.collect_user_data(&event).unwrap().is_empty());

        let user = routines.collect_user_data(&quiz_event()).unwrap();
        assert_eq!(user["username"], "jdoe");
        assert_eq!(user["user_id"], 42);
    }
}
