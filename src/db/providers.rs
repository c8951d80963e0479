//! Provider register CRUD operations

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::routines::RoutineOverrides;

/// Registered capture routine provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRow {
    pub id: i64,
    pub name: String,
    pub namespace: String,
    /// Loader key into the routine table
    pub path: String,
    pub has_overrides: bool,
    pub active_overrides: RoutineOverrides,
    pub created_at: i64,
    pub updated_at: Option<i64>,
}

impl ProviderRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let overrides_json: String = row.get("active_overrides")?;
        let active_overrides = serde_json::from_str(&overrides_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            namespace: row.get("namespace")?,
            path: row.get("path")?,
            has_overrides: row.get::<_, i64>("has_overrides")? != 0,
            active_overrides,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Input for a new registration
#[derive(Debug, Clone)]
pub struct NewProvider<'a> {
    pub name: &'a str,
    pub namespace: &'a str,
    pub path: &'a str,
    pub has_overrides: bool,
    pub active_overrides: RoutineOverrides,
    pub created_at: i64,
}

/// Insert a registration, returning its id
pub fn insert_provider(conn: &Connection, input: &NewProvider<'_>) -> Result<i64, StorageError> {
    let overrides = serde_json::to_string(&input.active_overrides)?;

    conn.execute(
        r#"
        INSERT INTO lerq_provider_register (
            name, namespace, path, has_overrides, active_overrides, created_at
        ) VALUES (?, ?, ?, ?, ?, ?)
        "#,
        params![
            input.name,
            input.namespace,
            input.path,
            input.has_overrides as i64,
            overrides,
            input.created_at,
        ],
    ).map_err(|e| StorageError::Internal(format!("Insert failed: {}", e)))?;

    Ok(conn.last_insert_rowid())
}

/// Update path and optionally the overrides flag of a (name, namespace) registration
pub fn update_provider(
    conn: &Connection,
    name: &str,
    namespace: &str,
    path: &str,
    has_overrides: Option<bool>,
    updated_at: i64,
) -> Result<bool, StorageError> {
    let changed = match has_overrides {
        Some(flag) => conn.execute(
            "UPDATE lerq_provider_register SET path = ?, has_overrides = ?, updated_at = ? \
             WHERE name = ? AND namespace = ?",
            params![path, flag as i64, updated_at, name, namespace],
        ),
        None => conn.execute(
            "UPDATE lerq_provider_register SET path = ?, updated_at = ? \
             WHERE name = ? AND namespace = ?",
            params![path, updated_at, name, namespace],
        ),
    }
    .map_err(|e| StorageError::Internal(format!("Update failed: {}", e)))?;

    Ok(changed > 0)
}

/// Delete a (name, namespace) registration
pub fn delete_provider(conn: &Connection, name: &str, namespace: &str) -> Result<bool, StorageError> {
    let deleted = conn
        .execute(
            "DELETE FROM lerq_provider_register WHERE name = ? AND namespace = ?",
            params![name, namespace],
        )
        .map_err(|e| StorageError::Internal(format!("Delete failed: {}", e)))?;

    Ok(deleted > 0)
}

/// Whether any registration uses the namespace
pub fn namespace_exists(conn: &Connection, namespace: &str) -> Result<bool, StorageError> {
    conn.query_row(
        "SELECT 1 FROM lerq_provider_register WHERE namespace = ? LIMIT 1",
        params![namespace],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))
}

/// All registrations in registration order (created_at, then id)
pub fn list_providers(conn: &Connection) -> Result<Vec<ProviderRow>, StorageError> {
    let mut stmt = conn
        .prepare("SELECT * FROM lerq_provider_register ORDER BY created_at ASC, id ASC")
        .map_err(|e| StorageError::Internal(format!("Prepare failed: {}", e)))?;

    let rows = stmt
        .query_map([], |row| ProviderRow::from_row(row))
        .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StorageError::Internal(format!("Row parse failed: {}", e)))?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::QueueDb;
    use crate::routines::Category;

    fn new_provider<'a>(name: &'a str, namespace: &'a str, created_at: i64) -> NewProvider<'a> {
        NewProvider {
            name,
            namespace,
            path: "acme/routines",
            has_overrides: true,
            active_overrides: RoutineOverrides::from_categories(&[Category::ObjectData]),
            created_at,
        }
    }

    #[test]
    fn test_insert_and_list_in_registration_order() {
        let db = QueueDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert_provider(conn, &new_provider("Late", "Acme\\Late", 20))?;
            insert_provider(conn, &new_provider("Early", "Acme\\Early", 10))?;
            Ok(())
        })
        .unwrap();

        let rows = db.with_conn(list_providers).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "Early");
        assert_eq!(rows[1].name, "Late");
        assert!(rows[0].active_overrides.is_set(Category::ObjectData));
        assert!(!rows[0].active_overrides.is_set(Category::UserData));
    }

    #[test]
    fn test_name_namespace_unique() {
        let db = QueueDb::open_in_memory().unwrap();
        db.with_conn(|conn| insert_provider(conn, &new_provider("P", "NS", 1))).unwrap();

        let second = db.with_conn(|conn| insert_provider(conn, &new_provider("P", "NS", 2)));
        assert!(second.is_err());
    }

    #[test]
    fn test_update_requires_name_and_namespace() {
        let db = QueueDb::open_in_memory().unwrap();
        db.with_conn(|conn| insert_provider(conn, &new_provider("P", "NS", 1))).unwrap();

        let wrong_name = db
            .with_conn(|conn| update_provider(conn, "Other", "NS", "new/path", None, 5))
            .unwrap();
        assert!(!wrong_name);

        let updated = db
            .with_conn(|conn| update_provider(conn, "P", "NS", "new/path", Some(false), 5))
            .unwrap();
        assert!(updated);

        let row = db.with_conn(list_providers).unwrap().remove(0);
        assert_eq!(row.path, "new/path");
        assert!(!row.has_overrides);
        assert_eq!(row.updated_at, Some(5));
        // Snapshot is untouched by updates
        assert!(row.active_overrides.is_set(Category::ObjectData));
    }

    #[test]
    fn test_delete_and_namespace_exists() {
        let db = QueueDb::open_in_memory().unwrap();
        db.with_conn(|conn| insert_provider(conn, &new_provider("P", "NS", 1))).unwrap();

        assert!(db.with_conn(|conn| namespace_exists(conn, "NS")).unwrap());
        assert!(!db.with_conn(|conn| delete_provider(conn, "Q", "NS")).unwrap());
        assert!(db.with_conn(|conn| delete_provider(conn, "P", "NS")).unwrap());
        assert!(!db.with_conn(|conn| namespace_exists(conn, "NS")).unwrap());
    }
}
