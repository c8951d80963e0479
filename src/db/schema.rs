//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::StorageError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, StorageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    ).map_err(|e| StorageError::Internal(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StorageError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| StorageError::Internal(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| StorageError::Internal(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(QUEUE_SCHEMA)
        .map_err(|e| StorageError::Internal(format!("Failed to create queue tables: {}", e)))?;

    conn.execute_batch(HOST_SCHEMA)
        .map_err(|e| StorageError::Internal(format!("Failed to create host tables: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| StorageError::Internal(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

/// Migrate schema from older version
fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), StorageError> {
    if from_version < 2 && !column_exists(conn, "lerq_queue", "progress_changed")? {
        // v1 queues were written before progress change tracking
        conn.execute("ALTER TABLE lerq_queue ADD COLUMN progress_changed INTEGER", [])
            .map_err(|e| StorageError::Internal(format!("Failed to add progress_changed: {}", e)))?;
    }

    // Tables added since v1 use IF NOT EXISTS
    create_tables(conn)?;

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, StorageError> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", table))
        .map_err(|e| StorageError::Internal(format!("Prepare failed: {}", e)))?;

    let names: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StorageError::Internal(format!("Row parse failed: {}", e)))?;

    Ok(names.iter().any(|n| n == column))
}

/// Tables owned by the event queue
const QUEUE_SCHEMA: &str = r#"
-- Denormalized event records, append-only
-- AUTOINCREMENT keeps ids monotonic so cursor paging never revisits a row
CREATE TABLE IF NOT EXISTS lerq_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    event TEXT NOT NULL,
    event_type TEXT NOT NULL,
    progress TEXT NOT NULL DEFAULT '',
    assignment TEXT NOT NULL DEFAULT '',
    course_start INTEGER,
    course_end INTEGER,
    user_data TEXT NOT NULL,
    obj_data TEXT NOT NULL,
    mem_data TEXT NOT NULL,
    progress_changed INTEGER
);

-- Capture routine providers
CREATE TABLE IF NOT EXISTS lerq_provider_register (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    namespace TEXT NOT NULL,
    path TEXT NOT NULL,
    has_overrides INTEGER NOT NULL DEFAULT 0,
    active_overrides TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER,
    UNIQUE (name, namespace)
);

-- Capture toggles
CREATE TABLE IF NOT EXISTS lerq_settings (
    keyword TEXT PRIMARY KEY NOT NULL,
    value TEXT,
    type TEXT NOT NULL DEFAULT 'boolean'
);
"#;

/// Read model of the host tables
const HOST_SCHEMA: &str = r#"
-- Host key-value settings
CREATE TABLE IF NOT EXISTS settings (
    keyword TEXT PRIMARY KEY NOT NULL,
    value TEXT
);

CREATE TABLE IF NOT EXISTS object_data (
    obj_id INTEGER PRIMARY KEY NOT NULL,
    type TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    import_id TEXT
);

CREATE TABLE IF NOT EXISTS object_reference (
    ref_id INTEGER PRIMARY KEY NOT NULL,
    obj_id INTEGER NOT NULL,
    deleted INTEGER
);

CREATE TABLE IF NOT EXISTS tree (
    tree INTEGER NOT NULL DEFAULT 1,
    child INTEGER NOT NULL,
    parent INTEGER NOT NULL,
    depth INTEGER NOT NULL,
    PRIMARY KEY (tree, child)
);

-- Role folders: which roles are local to which reference
CREATE TABLE IF NOT EXISTS rbac_fa (
    rol_id INTEGER NOT NULL,
    parent INTEGER NOT NULL,
    assign TEXT NOT NULL DEFAULT 'y',
    PRIMARY KEY (rol_id, parent)
);

-- User role assignments
CREATE TABLE IF NOT EXISTS rbac_ua (
    usr_id INTEGER NOT NULL,
    rol_id INTEGER NOT NULL,
    PRIMARY KEY (usr_id, rol_id)
);

CREATE TABLE IF NOT EXISTS usr_data (
    usr_id INTEGER PRIMARY KEY NOT NULL,
    login TEXT NOT NULL,
    firstname TEXT,
    lastname TEXT,
    title TEXT,
    gender TEXT,
    email TEXT,
    institution TEXT,
    street TEXT,
    city TEXT,
    country TEXT,
    phone_office TEXT,
    hobby TEXT,
    department TEXT,
    phone_home TEXT,
    phone_mobile TEXT,
    fax TEXT,
    referral_comment TEXT,
    matriculation TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    approve_date TEXT,
    agree_date TEXT,
    auth_mode TEXT,
    ext_account TEXT,
    birthday TEXT,
    import_id TEXT
);

CREATE TABLE IF NOT EXISTS udf_definition (
    field_id INTEGER PRIMARY KEY NOT NULL,
    field_name TEXT NOT NULL,
    visible INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS udf_text (
    usr_id INTEGER NOT NULL,
    field_id INTEGER NOT NULL,
    value TEXT,
    PRIMARY KEY (usr_id, field_id)
);

CREATE TABLE IF NOT EXISTS udf_clob (
    usr_id INTEGER NOT NULL,
    field_id INTEGER NOT NULL,
    value TEXT,
    PRIMARY KEY (usr_id, field_id)
);

-- Learning progress marks, status_changed as unix timestamp
CREATE TABLE IF NOT EXISTS ut_lp_marks (
    obj_id INTEGER NOT NULL,
    usr_id INTEGER NOT NULL,
    status INTEGER NOT NULL DEFAULT 0,
    status_changed INTEGER,
    percentage INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (obj_id, usr_id)
);

CREATE TABLE IF NOT EXISTS crs_settings (
    obj_id INTEGER PRIMARY KEY NOT NULL,
    crs_start INTEGER,
    crs_end INTEGER
);
"#;

/// Performance indexes
const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_queue_event_type ON lerq_queue(event_type);
CREATE INDEX IF NOT EXISTS idx_queue_timestamp ON lerq_queue(timestamp);
CREATE INDEX IF NOT EXISTS idx_provider_namespace ON lerq_provider_register(namespace);
CREATE INDEX IF NOT EXISTS idx_object_reference_obj ON object_reference(obj_id);
CREATE INDEX IF NOT EXISTS idx_tree_parent ON tree(parent);
CREATE INDEX IF NOT EXISTS idx_rbac_fa_parent ON rbac_fa(parent);
CREATE INDEX IF NOT EXISTS idx_rbac_ua_rol ON rbac_ua(rol_id);
CREATE INDEX IF NOT EXISTS idx_lp_marks_usr ON ut_lp_marks(usr_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_migrate_v1_adds_progress_changed() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE schema_version (version INTEGER NOT NULL);
            INSERT INTO schema_version (version) VALUES (1);
            CREATE TABLE lerq_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                event TEXT NOT NULL,
                event_type TEXT NOT NULL,
                progress TEXT NOT NULL DEFAULT '',
                assignment TEXT NOT NULL DEFAULT '',
                course_start INTEGER,
                course_end INTEGER,
                user_data TEXT NOT NULL,
                obj_data TEXT NOT NULL,
                mem_data TEXT NOT NULL
            );
            "#,
        )
        .unwrap();

        init_schema(&conn).unwrap();

        assert!(column_exists(&conn, "lerq_queue", "progress_changed").unwrap());
        assert!(column_exists(&conn, "lerq_settings", "keyword").unwrap());
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }
}
