//! Initial collector - reads historical pairs straight from the host tables
//!
//! Backfill bypasses the routine chains: it walks the whole object graph, so
//! course, role and object data come from direct queries plus caches that
//! live as long as one collector (one job invocation).

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use tracing::{debug, info};

use crate::db::QueueDb;
use crate::error::StorageError;
use crate::host::{HostDirectory, UdfDefinition};
use crate::models::{
    progress_label, role_label, AggregatedRecord, CapturedEvent, Section, INIT_EVENT_LP, INIT_EVENT_MEM,
};
use crate::routines::default::{udf_section, user_section};
use crate::routines::DefaultRoutines;
use crate::services::capture::NO_ASSIGNMENT;

use super::{BackfillConfig, SelectionMode};

/// User ids never captured (anonymous and system users)
const EXCLUDED_USERS: &str = "0, 6";

/// Administrative containers left out of the parent map
const ADMIN_TYPES: &[&str] = &[
    "usrf", "rolf", "adm", "objf", "lngf", "mail", "recf", "cals", "trac", "auth", "assf", "stys", "seas",
    "extt", "adve", "ps", "nwss", "pdts", "mds", "cmps", "facs", "svyf", "mcts", "tags", "cert", "lrss",
    "accs", "mobs", "file", "qpl", "root", "typ", "usr",
];

/// One (object reference, user) pair
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillUnit {
    pub ref_id: i64,
    pub obj_id: i64,
    pub obj_type: String,
    pub title: String,
    pub usr_id: i64,
    pub rol_id: Option<i64>,
    pub status: Option<i64>,
    pub status_changed: Option<i64>,
    pub percentage: Option<i64>,
}

/// Resume position, exclusive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub ref_id: i64,
    pub usr_id: i64,
}

#[derive(Debug, Clone)]
struct ParentEntry {
    parent: i64,
    parent_type: String,
}

/// Child → parent pointers of the repository tree, loaded once per run.
/// Keyed by every child whose parent is a non-administrative container,
/// so leaves of any type resolve without touching the tree again.
#[derive(Debug, Default)]
pub struct ParentMap {
    nodes: HashMap<i64, ParentEntry>,
}

impl ParentMap {
    pub fn load(conn: &Connection) -> Result<Self, StorageError> {
        let excluded = ADMIN_TYPES.iter().map(|t| format!("'{}'", t)).collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT t.child, t.parent, d.type FROM tree t \
             JOIN object_reference r ON r.ref_id = t.parent \
             JOIN object_data d ON d.obj_id = r.obj_id \
             WHERE t.depth > 1 AND r.deleted IS NULL AND d.type NOT IN ({})",
            excluded
        );

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StorageError::Internal(format!("Prepare failed: {}", e)))?;

        let nodes = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    ParentEntry {
                        parent: row.get(1)?,
                        parent_type: row.get(2)?,
                    },
                ))
            })
            .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))?
            .collect::<Result<HashMap<_, _>, _>>()
            .map_err(|e| StorageError::Internal(format!("Row parse failed: {}", e)))?;

        Ok(Self { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, ref_id: i64) -> bool {
        self.nodes.contains_key(&ref_id)
    }

    /// Nearest course reference above `ref_id`
    pub fn course_of(&self, ref_id: i64) -> Option<i64> {
        let mut current = ref_id;
        // Bounded walk, the tree table is not trusted to be acyclic
        for _ in 0..=self.nodes.len() {
            let node = self.nodes.get(&current)?;
            if node.parent_type == "crs" {
                return Some(node.parent);
            }
            current = node.parent;
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
struct CourseData {
    obj_id: i64,
    ref_id: i64,
    title: String,
    start: Option<i64>,
    end: Option<i64>,
}

/// Pages host pairs and turns them into captured events
pub struct InitialCollector {
    db: Arc<QueueDb>,
    host: Arc<dyn HostDirectory>,
    links: DefaultRoutines,
    config: BackfillConfig,
    obj_select: Option<String>,
    parents: ParentMap,
    udf_definitions: Vec<UdfDefinition>,
    courses: HashMap<i64, Option<CourseData>>,
    course_roles: HashMap<i64, HashMap<i64, i64>>,
    role_labels: HashMap<i64, String>,
}

impl InitialCollector {
    /// Load the per-run structures (parent map, custom field definitions)
    pub fn new(
        db: Arc<QueueDb>,
        host: Arc<dyn HostDirectory>,
        link_base: &str,
        config: BackfillConfig,
        obj_select: Option<String>,
    ) -> Result<Self, StorageError> {
        let parents = db.with_conn(ParentMap::load)?;
        let udf_definitions = host.visible_udf_definitions()?;
        info!(tree_nodes = parents.len(), udf_fields = udf_definitions.len(), "Loaded backfill structures");

        Ok(Self {
            links: DefaultRoutines::new(host.clone(), link_base),
            db,
            host,
            config,
            obj_select,
            parents,
            udf_definitions,
            courses: HashMap::new(),
            course_roles: HashMap::new(),
            role_labels: HashMap::new(),
        })
    }

    // =========================================================================
    // Base query
    // =========================================================================

    fn user_column(&self) -> &'static str {
        match self.config.selection {
            SelectionMode::RoleAssignment => "ua.usr_id",
            SelectionMode::LearningProgress => "lp.usr_id",
        }
    }

    /// FROM/WHERE shared by count and page queries
    fn base_clause(&self) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];

        let mut sql = match self.config.selection {
            SelectionMode::RoleAssignment => String::from(
                " FROM object_reference oref \
                 JOIN object_data od ON od.obj_id = oref.obj_id \
                 JOIN rbac_fa fa ON fa.parent = oref.ref_id AND fa.assign = 'y' \
                 JOIN rbac_ua ua ON ua.rol_id = fa.rol_id \
                 LEFT JOIN ut_lp_marks lp ON lp.obj_id = oref.obj_id AND lp.usr_id = ua.usr_id",
            ),
            SelectionMode::LearningProgress => String::from(
                " FROM ut_lp_marks lp \
                 JOIN object_reference oref ON oref.obj_id = lp.obj_id \
                 JOIN object_data od ON od.obj_id = oref.obj_id \
                 LEFT JOIN rbac_fa fa ON fa.parent = oref.ref_id AND fa.assign = 'y' \
                 LEFT JOIN rbac_ua ua ON ua.rol_id = fa.rol_id AND ua.usr_id = lp.usr_id",
            ),
        };

        sql.push_str(&format!(
            " WHERE oref.deleted IS NULL AND {} NOT IN ({})",
            self.user_column(),
            EXCLUDED_USERS
        ));

        match &self.obj_select {
            Some(obj_type) => {
                sql.push_str(" AND od.type = ?");
                params.push(Box::new(obj_type.clone()));
            }
            None => sql.push_str(" AND od.type NOT IN ('rolf', 'role')"),
        }

        if !self.config.status_filter.is_empty() {
            let placeholders = vec!["?"; self.config.status_filter.len()].join(", ");
            sql.push_str(&format!(" AND COALESCE(lp.status, 0) IN ({})", placeholders));
            for status in &self.config.status_filter {
                params.push(Box::new(*status));
            }
        }

        (sql, params)
    }

    /// Number of pairs the walk will visit
    pub fn count(&self) -> Result<i64, StorageError> {
        let (clause, params) = self.base_clause();
        let sql = format!(
            "SELECT COUNT(*) FROM (SELECT 1{} GROUP BY oref.ref_id, {})",
            clause,
            self.user_column()
        );

        self.db.with_conn(|conn| {
            let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
            conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))
                .map_err(|e| StorageError::Internal(format!("Count failed: {}", e)))
        })
    }

    /// Next page of pairs strictly after `cursor`, ordered by (ref_id, usr_id)
    pub fn fetch_page(&self, cursor: Cursor) -> Result<Vec<BackfillUnit>, StorageError> {
        let (clause, mut params) = self.base_clause();
        let usr = self.user_column();

        let sql = format!(
            "SELECT oref.ref_id, oref.obj_id, od.type, od.title, {usr} AS usr_id, MIN(ua.rol_id) AS rol_id, \
             MAX(lp.status) AS status, MAX(lp.status_changed) AS status_changed, MAX(lp.percentage) AS percentage\
             {clause} AND (oref.ref_id > ? OR (oref.ref_id = ? AND {usr} > ?)) \
             GROUP BY oref.ref_id, {usr} ORDER BY oref.ref_id ASC, {usr} ASC LIMIT ?",
            usr = usr,
            clause = clause,
        );
        params.push(Box::new(cursor.ref_id));
        params.push(Box::new(cursor.ref_id));
        params.push(Box::new(cursor.usr_id));
        params.push(Box::new(self.config.page_size.max(1) as i64));

        debug!(ref_id = cursor.ref_id, usr_id = cursor.usr_id, "Fetching backfill page");

        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| StorageError::Internal(format!("Prepare failed: {}", e)))?;
            let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

            let units = stmt
                .query_map(param_refs.as_slice(), |row| {
                    Ok(BackfillUnit {
                        ref_id: row.get("ref_id")?,
                        obj_id: row.get("obj_id")?,
                        obj_type: row.get("type")?,
                        title: row.get("title")?,
                        usr_id: row.get("usr_id")?,
                        rol_id: row.get("rol_id")?,
                        status: row.get("status")?,
                        status_changed: row.get("status_changed")?,
                        percentage: row.get("percentage")?,
                    })
                })
                .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StorageError::Internal(format!("Row parse failed: {}", e)))?;

            Ok(units)
        })
    }

    // =========================================================================
    // Per-unit resolution
    // =========================================================================

    fn course_ref_of(&self, unit: &BackfillUnit) -> Result<Option<i64>, StorageError> {
        if unit.obj_type == "crs" {
            return Ok(Some(unit.ref_id));
        }
        if let Some(course) = self.parents.course_of(unit.ref_id) {
            return Ok(Some(course));
        }
        if self.parents.contains(unit.ref_id) {
            return Ok(None);
        }
        // Children of administrative containers
        Ok(self.host.parent_of_type(unit.ref_id, &["crs"])?.map(|node| node.ref_id))
    }

    fn course_data(&mut self, course_ref: i64) -> Result<Option<CourseData>, StorageError> {
        if let Some(cached) = self.courses.get(&course_ref) {
            return Ok(cached.clone());
        }

        let course = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT d.obj_id, r.ref_id, d.title, c.crs_start, c.crs_end \
                 FROM object_reference r JOIN object_data d ON d.obj_id = r.obj_id \
                 LEFT JOIN crs_settings c ON c.obj_id = d.obj_id WHERE r.ref_id = ?",
                params![course_ref],
                |row| {
                    Ok(CourseData {
                        obj_id: row.get(0)?,
                        ref_id: row.get(1)?,
                        title: row.get(2)?,
                        start: row.get(3)?,
                        end: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))
        })?;

        self.courses.insert(course_ref, course.clone());
        Ok(course)
    }

    /// Role each user holds at a course, loaded once per course
    fn course_role(&mut self, course_ref: i64, usr_id: i64) -> Result<Option<i64>, StorageError> {
        if !self.course_roles.contains_key(&course_ref) {
            let roles = self.db.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT ua.usr_id, MIN(ua.rol_id) FROM rbac_fa fa \
                         JOIN rbac_ua ua ON ua.rol_id = fa.rol_id \
                         WHERE fa.parent = ? AND fa.assign = 'y' GROUP BY ua.usr_id",
                    )
                    .map_err(|e| StorageError::Internal(format!("Prepare failed: {}", e)))?;
                let roles = stmt
                    .query_map(params![course_ref], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))
                    .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))?
                    .collect::<Result<HashMap<_, _>, _>>()
                    .map_err(|e| StorageError::Internal(format!("Row parse failed: {}", e)))?;
                Ok(roles)
            })?;
            self.course_roles.insert(course_ref, roles);
        }

        Ok(self
            .course_roles
            .get(&course_ref)
            .and_then(|roles| roles.get(&usr_id))
            .copied())
    }

    fn assignment(&mut self, rol_id: Option<i64>) -> Result<String, StorageError> {
        let Some(rol_id) = rol_id else {
            return Ok(NO_ASSIGNMENT.to_string());
        };
        if let Some(label) = self.role_labels.get(&rol_id) {
            return Ok(label.clone());
        }

        let label = self
            .host
            .role_title(rol_id)?
            .map(|title| role_label(&title).to_string())
            .unwrap_or_default();
        self.role_labels.insert(rol_id, label.clone());
        Ok(label)
    }

    /// Member record and learning progress record of one pair
    pub fn build_events(&mut self, unit: &BackfillUnit) -> Result<(CapturedEvent, CapturedEvent), StorageError> {
        let course = match self.course_ref_of(unit)? {
            Some(course_ref) => self.course_data(course_ref)?,
            None => None,
        };

        let role = match &course {
            Some(course) => self.course_role(course.ref_id, unit.usr_id)?.or(unit.rol_id),
            None => unit.rol_id,
        };

        let mut record = AggregatedRecord::default();

        if let Some(user) = self.host.user_by_id(unit.usr_id)? {
            record.user_data = user_section(&user);
            if !self.udf_definitions.is_empty() {
                let values = self.host.udf_values(unit.usr_id)?;
                record.udf_data = udf_section(&self.udf_definitions, &values);
            }
        }

        let mut course_fields = Section::new();
        course_fields.insert("course_title".into(), json!(course.as_ref().map(|c| c.title.clone())));
        course_fields.insert("course_id".into(), json!(course.as_ref().map(|c| c.obj_id).unwrap_or(-1)));
        course_fields.insert("course_ref_id".into(), json!(course.as_ref().map(|c| c.ref_id).unwrap_or(-1)));

        record.member_data = course_fields.clone();
        record.member_data.insert("role".into(), json!(role));

        if let Some(course) = &course {
            record.lp_period.insert("course_start".into(), json!(course.start));
            record.lp_period.insert("course_end".into(), json!(course.end));
        }

        record.object_data = course_fields;
        record.object_data.insert("id".into(), json!(unit.obj_id));
        record.object_data.insert("title".into(), json!(unit.title));
        record.object_data.insert("ref_id".into(), json!(unit.ref_id));
        record.object_data.insert("link".into(), json!(self.links.permalink(&unit.obj_type, unit.ref_id, false)?));
        record.object_data.insert("type".into(), json!(unit.obj_type));

        let assignment = self.assignment(role)?;
        let status_changed = unit.status_changed.filter(|ts| *ts > 0);
        let timestamp = status_changed.unwrap_or_else(|| chrono::Utc::now().timestamp());
        let progress = progress_label(unit.status).to_string();

        let member = CapturedEvent {
            record: record.clone(),
            event: INIT_EVENT_MEM.to_string(),
            timestamp,
            progress: progress.clone(),
            progress_changed: status_changed,
            assignment: assignment.clone(),
        };
        let lp = CapturedEvent {
            record,
            event: INIT_EVENT_LP.to_string(),
            timestamp,
            progress,
            progress_changed: status_changed,
            assignment,
        };

        Ok((member, lp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_map_walks_to_course() {
        let db = QueueDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute_batch(
                r#"
                INSERT INTO object_data (obj_id, type, title) VALUES
                    (1, 'root', 'Repository'), (10, 'cat', 'Faculty'), (20, 'crs', 'Rust 101'),
                    (30, 'fold', 'Week 1'), (40, 'grp', 'Team'), (50, 'file', 'Slides');
                INSERT INTO object_reference (ref_id, obj_id) VALUES
                    (1, 1), (100, 10), (200, 20), (300, 30), (400, 40), (500, 50);
                INSERT INTO tree (child, parent, depth) VALUES
                    (1, 0, 1), (100, 1, 2), (200, 100, 3), (300, 200, 4), (400, 300, 5), (500, 300, 5);
                "#,
            )
            .map_err(|e| StorageError::Internal(e.to_string()))
        })
        .unwrap();

        let map = db.with_conn(ParentMap::load).unwrap();

        assert_eq!(map.course_of(400), Some(200));
        assert_eq!(map.course_of(300), Some(200));
        // Nothing above the course is a course
        assert_eq!(map.course_of(200), None);
        assert_eq!(map.course_of(100), None);
        // Children of the root node are left out
        assert!(!map.contains(100));
        assert!(!map.contains(1));
    }

    #[test]
    fn test_parent_map_resolves_leaf_objects() {
        let db = QueueDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute_batch(
                r#"
                INSERT INTO object_data (obj_id, type, title) VALUES
                    (1, 'root', 'Repository'), (20, 'crs', 'Rust 101'), (30, 'fold', 'Week 1'),
                    (50, 'file', 'Slides'), (60, 'qpl', 'Question Pool'), (70, 'file', 'Notes');
                INSERT INTO object_reference (ref_id, obj_id) VALUES
                    (1, 1), (200, 20), (300, 30), (500, 50), (600, 60), (700, 70);
                INSERT INTO tree (child, parent, depth) VALUES
                    (1, 0, 1), (200, 1, 2), (300, 200, 3), (500, 200, 3), (600, 200, 3), (700, 300, 4);
                "#,
            )
            .map_err(|e| StorageError::Internal(e.to_string()))
        })
        .unwrap();

        let map = db.with_conn(ParentMap::load).unwrap();

        assert!(map.contains(500));
        assert!(map.contains(600));
        assert_eq!(map.course_of(500), Some(200));
        assert_eq!(map.course_of(600), Some(200));
        assert_eq!(map.course_of(700), Some(200));
    }

    #[test]
    fn test_parent_map_survives_cycles() {
        let db = QueueDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute_batch(
                r#"
                INSERT INTO object_data (obj_id, type, title) VALUES (1, 'fold', 'A'), (2, 'fold', 'B');
                INSERT INTO object_reference (ref_id, obj_id) VALUES (10, 1), (20, 2);
                INSERT INTO tree (child, parent, depth) VALUES (10, 20, 2), (20, 10, 3);
                "#,
            )
            .map_err(|e| StorageError::Internal(e.to_string()))
        })
        .unwrap();

        let map = db.with_conn(ParentMap::load).unwrap();
        assert_eq!(map.course_of(10), None);
    }
}
