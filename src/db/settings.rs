//! Capture settings and host key-value settings

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Capture setting row (`lerq_settings`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsRow {
    pub keyword: String,
    pub value: Option<String>,
    #[serde(rename = "type")]
    pub value_type: String,
}

impl SettingsRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            keyword: row.get("keyword")?,
            value: row.get("value")?,
            value_type: row.get("type")?,
        })
    }
}

/// Load every capture setting
pub fn list_settings(conn: &Connection) -> Result<Vec<SettingsRow>, StorageError> {
    let mut stmt = conn
        .prepare("SELECT keyword, value, type FROM lerq_settings ORDER BY keyword")
        .map_err(|e| StorageError::Internal(format!("Prepare failed: {}", e)))?;

    let rows = stmt
        .query_map([], |row| SettingsRow::from_row(row))
        .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StorageError::Internal(format!("Row parse failed: {}", e)))?;

    Ok(rows)
}

/// Insert a setting only if the keyword is not present yet
pub fn insert_setting_if_missing(conn: &Connection, row: &SettingsRow) -> Result<bool, StorageError> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO lerq_settings (keyword, value, type) VALUES (?, ?, ?)",
            params![row.keyword, row.value, row.value_type],
        )
        .map_err(|e| StorageError::Internal(format!("Insert failed: {}", e)))?;

    Ok(inserted > 0)
}

/// Full-row upsert
pub fn upsert_setting(conn: &Connection, row: &SettingsRow) -> Result<(), StorageError> {
    conn.execute(
        r#"
        INSERT INTO lerq_settings (keyword, value, type) VALUES (?, ?, ?)
        ON CONFLICT(keyword) DO UPDATE SET value = excluded.value, type = excluded.type
        "#,
        params![row.keyword, row.value, row.value_type],
    ).map_err(|e| StorageError::Internal(format!("Upsert failed: {}", e)))?;

    Ok(())
}

pub fn delete_setting(conn: &Connection, keyword: &str) -> Result<bool, StorageError> {
    let deleted = conn
        .execute("DELETE FROM lerq_settings WHERE keyword = ?", params![keyword])
        .map_err(|e| StorageError::Internal(format!("Delete failed: {}", e)))?;

    Ok(deleted > 0)
}

// =========================================================================
// Host key-value settings
// =========================================================================

pub fn get_host_setting(conn: &Connection, keyword: &str) -> Result<Option<String>, StorageError> {
    conn.query_row(
        "SELECT value FROM settings WHERE keyword = ?",
        params![keyword],
        |row| row.get::<_, Option<String>>(0),
    )
    .optional()
    .map(Option::flatten)
    .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))
}

pub fn set_host_setting(conn: &Connection, keyword: &str, value: &str) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO settings (keyword, value) VALUES (?, ?) \
         ON CONFLICT(keyword) DO UPDATE SET value = excluded.value",
        params![keyword, value],
    ).map_err(|e| StorageError::Internal(format!("Upsert failed: {}", e)))?;

    Ok(())
}

/// Replace a host setting only if it still holds `expected` (None = absent)
pub fn compare_and_swap_host_setting(
    conn: &Connection,
    keyword: &str,
    expected: Option<&str>,
    value: &str,
) -> Result<bool, StorageError> {
    let changed = match expected {
        Some(current) => conn.execute(
            "UPDATE settings SET value = ? WHERE keyword = ? AND value = ?",
            params![value, keyword, current],
        ),
        None => conn.execute(
            "INSERT OR IGNORE INTO settings (keyword, value) VALUES (?, ?)",
            params![keyword, value],
        ),
    }
    .map_err(|e| StorageError::Internal(format!("Compare-and-swap failed: {}", e)))?;

    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::QueueDb;

    fn toggle(keyword: &str, value: &str) -> SettingsRow {
        SettingsRow {
            keyword: keyword.to_string(),
            value: Some(value.to_string()),
            value_type: "boolean".to_string(),
        }
    }

    #[test]
    fn test_insert_if_missing_keeps_existing_value() {
        let db = QueueDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            assert!(insert_setting_if_missing(conn, &toggle("email", "0"))?);
            assert!(!insert_setting_if_missing(conn, &toggle("email", "1"))?);
            Ok(())
        })
        .unwrap();

        let rows = db.with_conn(list_settings).unwrap();
        assert_eq!(rows, vec![toggle("email", "0")]);
    }

    #[test]
    fn test_upsert_and_delete() {
        let db = QueueDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            upsert_setting(conn, &toggle("login", "1"))?;
            upsert_setting(conn, &toggle("login", "0"))?;
            Ok(())
        })
        .unwrap();

        assert_eq!(db.with_conn(list_settings).unwrap(), vec![toggle("login", "0")]);
        assert!(db.with_conn(|conn| delete_setting(conn, "login")).unwrap());
        assert!(db.with_conn(list_settings).unwrap().is_empty());
    }

    #[test]
    fn test_host_compare_and_swap() {
        let db = QueueDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            assert!(compare_and_swap_host_setting(conn, "task", None, "a")?);
            // Absent expectation fails once the key exists
            assert!(!compare_and_swap_host_setting(conn, "task", None, "b")?);
            assert!(!compare_and_swap_host_setting(conn, "task", Some("stale"), "b")?);
            assert!(compare_and_swap_host_setting(conn, "task", Some("a"), "b")?);
            assert_eq!(get_host_setting(conn, "task")?, Some("b".to_string()));

            set_host_setting(conn, "task", "c")?;
            assert_eq!(get_host_setting(conn, "task")?, Some("c".to_string()));
            assert_eq!(get_host_setting(conn, "missing")?, None);
            Ok(())
        })
        .unwrap();
    }
}
