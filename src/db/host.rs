//! Host read model backed by the shared SQLite database

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::StorageError;
use crate::host::{
    CoursePeriod, HostObject, KeyValueStore, LearningProgress, LpMark, ObjectTree, RoleAssignments,
    TreeNode, UdfDefinition, UserProfile, UserProfiles,
};

use super::{settings, QueueDb};

/// Host collaborator answering from the host tables of a `QueueDb`
pub struct SqliteHost {
    db: Arc<QueueDb>,
    /// Role titles never change while a process runs
    role_titles: DashMap<i64, Option<String>>,
}

impl SqliteHost {
    pub fn new(db: Arc<QueueDb>) -> Self {
        Self {
            db,
            role_titles: DashMap::new(),
        }
    }

    pub fn db(&self) -> &Arc<QueueDb> {
        &self.db
    }
}

fn object_from_row(row: &Row) -> Result<HostObject, rusqlite::Error> {
    Ok(HostObject {
        obj_id: row.get("obj_id")?,
        ref_id: row.get("ref_id")?,
        obj_type: row.get("type")?,
        title: row.get("title")?,
        import_id: row.get("import_id")?,
    })
}

fn user_from_row(row: &Row) -> Result<UserProfile, rusqlite::Error> {
    Ok(UserProfile {
        usr_id: row.get("usr_id")?,
        login: row.get("login")?,
        firstname: row.get("firstname")?,
        lastname: row.get("lastname")?,
        title: row.get("title")?,
        gender: row.get("gender")?,
        email: row.get("email")?,
        institution: row.get("institution")?,
        street: row.get("street")?,
        city: row.get("city")?,
        country: row.get("country")?,
        phone_office: row.get("phone_office")?,
        hobby: row.get("hobby")?,
        department: row.get("department")?,
        phone_home: row.get("phone_home")?,
        phone_mobile: row.get("phone_mobile")?,
        fax: row.get("fax")?,
        referral_comment: row.get("referral_comment")?,
        matriculation: row.get("matriculation")?,
        active: row.get::<_, i64>("active")? != 0,
        approve_date: row.get("approve_date")?,
        agree_date: row.get("agree_date")?,
        auth_mode: row.get("auth_mode")?,
        ext_account: row.get("ext_account")?,
        birthday: row.get("birthday")?,
        import_id: row.get("import_id")?,
    })
}

/// Load a user profile row
pub fn get_user(conn: &Connection, usr_id: i64) -> Result<Option<UserProfile>, StorageError> {
    conn.query_row("SELECT * FROM usr_data WHERE usr_id = ?", params![usr_id], |row| user_from_row(row))
        .optional()
        .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))
}

pub fn list_visible_udf_definitions(conn: &Connection) -> Result<Vec<UdfDefinition>, StorageError> {
    let mut stmt = conn
        .prepare("SELECT field_id, field_name FROM udf_definition WHERE visible = 1 ORDER BY field_id")
        .map_err(|e| StorageError::Internal(format!("Prepare failed: {}", e)))?;

    let defs = stmt
        .query_map([], |row| {
            Ok(UdfDefinition {
                field_id: row.get(0)?,
                field_name: row.get(1)?,
            })
        })
        .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StorageError::Internal(format!("Row parse failed: {}", e)))?;

    Ok(defs)
}

/// Text and long-text custom field values of one user
pub fn get_udf_values(conn: &Connection, usr_id: i64) -> Result<HashMap<i64, String>, StorageError> {
    let mut stmt = conn
        .prepare(
            "SELECT field_id, value FROM udf_text WHERE usr_id = ?1 AND value IS NOT NULL \
             UNION ALL \
             SELECT field_id, value FROM udf_clob WHERE usr_id = ?1 AND value IS NOT NULL",
        )
        .map_err(|e| StorageError::Internal(format!("Prepare failed: {}", e)))?;

    let values = stmt
        .query_map(params![usr_id], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
        .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))?
        .collect::<Result<HashMap<_, _>, _>>()
        .map_err(|e| StorageError::Internal(format!("Row parse failed: {}", e)))?;

    Ok(values)
}

pub fn get_course_period(conn: &Connection, obj_id: i64) -> Result<Option<CoursePeriod>, StorageError> {
    conn.query_row(
        "SELECT crs_start, crs_end FROM crs_settings WHERE obj_id = ?",
        params![obj_id],
        |row| {
            Ok(CoursePeriod {
                start: row.get(0)?,
                end: row.get(1)?,
            })
        },
    )
    .optional()
    .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))
}

/// Raw role title from the role object
pub fn get_role_title(conn: &Connection, rol_id: i64) -> Result<Option<String>, StorageError> {
    conn.query_row(
        "SELECT title FROM object_data WHERE obj_id = ?",
        params![rol_id],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))
}

impl ObjectTree for SqliteHost {
    fn object_by_ref_id(&self, ref_id: i64) -> Result<Option<HostObject>, StorageError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT r.ref_id, d.obj_id, d.type, d.title, d.import_id \
                 FROM object_reference r JOIN object_data d ON d.obj_id = r.obj_id \
                 WHERE r.ref_id = ?",
                params![ref_id],
                |row| object_from_row(row),
            )
            .optional()
            .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))
        })
    }

    fn object_by_obj_id(&self, obj_id: i64) -> Result<Option<HostObject>, StorageError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT (SELECT MIN(r.ref_id) FROM object_reference r \
                         WHERE r.obj_id = d.obj_id AND r.deleted IS NULL) AS ref_id, \
                        d.obj_id, d.type, d.title, d.import_id \
                 FROM object_data d WHERE d.obj_id = ?",
                params![obj_id],
                |row| object_from_row(row),
            )
            .optional()
            .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))
        })
    }

    fn path_to_root(&self, ref_id: i64) -> Result<Vec<TreeNode>, StorageError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    r#"
                    WITH RECURSIVE path(child, parent, depth) AS (
                        SELECT child, parent, depth FROM tree WHERE child = ?
                        UNION ALL
                        SELECT t.child, t.parent, t.depth FROM tree t
                        JOIN path p ON t.child = p.parent
                        WHERE p.depth > 1 AND t.depth < p.depth
                    )
                    SELECT p.child AS ref_id, d.obj_id, d.type, d.title, p.depth
                    FROM path p
                    JOIN object_reference r ON r.ref_id = p.child
                    JOIN object_data d ON d.obj_id = r.obj_id
                    ORDER BY p.depth ASC
                    "#,
                )
                .map_err(|e| StorageError::Internal(format!("Prepare failed: {}", e)))?;

            let nodes = stmt
                .query_map(params![ref_id], |row| {
                    Ok(TreeNode {
                        ref_id: row.get("ref_id")?,
                        obj_id: row.get("obj_id")?,
                        obj_type: row.get("type")?,
                        title: row.get("title")?,
                        depth: row.get("depth")?,
                    })
                })
                .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StorageError::Internal(format!("Row parse failed: {}", e)))?;

            Ok(nodes)
        })
    }

    fn course_period(&self, obj_id: i64) -> Result<Option<CoursePeriod>, StorageError> {
        self.db.with_conn(|conn| get_course_period(conn, obj_id))
    }
}

impl RoleAssignments for SqliteHost {
    fn role_at_ref(&self, usr_id: i64, ref_id: i64) -> Result<Option<i64>, StorageError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT MIN(ua.rol_id) FROM rbac_ua ua \
                 JOIN rbac_fa fa ON fa.rol_id = ua.rol_id \
                 WHERE fa.parent = ? AND fa.assign = 'y' AND ua.usr_id = ?",
                params![ref_id, usr_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))
        })
    }

    fn role_title(&self, rol_id: i64) -> Result<Option<String>, StorageError> {
        if let Some(cached) = self.role_titles.get(&rol_id) {
            return Ok(cached.clone());
        }

        let title = self.db.with_conn(|conn| get_role_title(conn, rol_id))?;
        self.role_titles.insert(rol_id, title.clone());
        Ok(title)
    }
}

impl UserProfiles for SqliteHost {
    fn user_by_id(&self, usr_id: i64) -> Result<Option<UserProfile>, StorageError> {
        self.db.with_conn(|conn| get_user(conn, usr_id))
    }

    fn visible_udf_definitions(&self) -> Result<Vec<UdfDefinition>, StorageError> {
        self.db.with_conn(list_visible_udf_definitions)
    }

    fn udf_values(&self, usr_id: i64) -> Result<HashMap<i64, String>, StorageError> {
        self.db.with_conn(|conn| get_udf_values(conn, usr_id))
    }
}

impl LearningProgress for SqliteHost {
    fn lp_mark(&self, obj_id: i64, usr_id: i64) -> Result<Option<LpMark>, StorageError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT status, status_changed, percentage FROM ut_lp_marks WHERE obj_id = ? AND usr_id = ?",
                params![obj_id, usr_id],
                |row| {
                    Ok(LpMark {
                        status: row.get(0)?,
                        status_changed: row.get(1)?,
                        percentage: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))
        })
    }
}

impl KeyValueStore for SqliteHost {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.db.with_conn(|conn| settings::get_host_setting(conn, key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.db.with_conn(|conn| settings::set_host_setting(conn, key, value))
    }

    fn compare_and_swap(&self, key: &str, expected: Option<&str>, value: &str) -> Result<bool, StorageError> {
        self.db.with_conn(|conn| settings::compare_and_swap_host_setting(conn, key, expected, value))
    }
}
