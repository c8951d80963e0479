//! Shared fixture for integration tests
//!
//! Host tree used throughout:
//!
//! ```text
//! 1 root
//! └── 100 cat "Faculty"
//!     └── 200 crs "Rust 101"        roles 500 member (42, 43, 6), 501 tutor (44)
//!         └── 300 fold "Week 1"
//!             └── 700 tst "Ownership Quiz"   (obj 7)
//! ```

#![allow(dead_code)]

use std::sync::Arc;

use lp_event_queue::{QueueDb, RoutineTable, Services, SqliteHost, StorageError};
use tempfile::TempDir;

pub const LINK_BASE: &str = "https://lms.example.org/ilias";

pub const HOST_FIXTURE: &str = r#"
INSERT INTO object_data (obj_id, type, title) VALUES
    (1, 'root', 'Repository'),
    (10, 'cat', 'Faculty'),
    (20, 'crs', 'Rust 101'),
    (30, 'fold', 'Week 1'),
    (7, 'tst', 'Ownership Quiz'),
    (500, 'role', 'il_crs_member_200'),
    (501, 'role', 'il_crs_tutor_200');

INSERT INTO object_reference (ref_id, obj_id) VALUES
    (1, 1), (100, 10), (200, 20), (300, 30), (700, 7);

INSERT INTO tree (child, parent, depth) VALUES
    (1, 0, 1), (100, 1, 2), (200, 100, 3), (300, 200, 4), (700, 300, 5);

INSERT INTO rbac_fa (rol_id, parent, assign) VALUES (500, 200, 'y'), (501, 200, 'y');
INSERT INTO rbac_ua (usr_id, rol_id) VALUES (42, 500), (43, 500), (6, 500), (44, 501);

INSERT INTO usr_data (usr_id, login, firstname, lastname, email) VALUES
    (6, 'root', 'System', 'Administrator', 'root@example.org'),
    (42, 'jdoe', 'John', 'Doe', 'john.doe@example.org'),
    (43, 'asmith', 'Alice', 'Smith', 'alice@example.org'),
    (44, 'ttutor', 'Terry', 'Tutor', 'terry@example.org');

INSERT INTO udf_definition (field_id, field_name, visible) VALUES (1, 'Faculty', 1);
INSERT INTO udf_text (usr_id, field_id, value) VALUES (42, 1, 'Computer Science');

INSERT INTO crs_settings (obj_id, crs_start, crs_end) VALUES (20, 1000, 2000);

INSERT INTO ut_lp_marks (obj_id, usr_id, status, status_changed, percentage) VALUES
    (7, 42, 2, 1600000000, 100),
    (20, 43, 1, 1600000500, 50);
"#;

pub struct TestQueue {
    pub services: Services,
    pub db: Arc<QueueDb>,
    _temp: TempDir,
}

pub fn seed(db: &QueueDb, sql: &str) {
    db.with_conn(|conn| {
        conn.execute_batch(sql)
            .map_err(|e| StorageError::Internal(e.to_string()))
    })
    .unwrap();
}

/// On-disk queue with the host fixture and default settings installed
pub fn test_queue(table: RoutineTable) -> TestQueue {
    let temp = TempDir::new().unwrap();
    let db = Arc::new(QueueDb::open(temp.path()).unwrap());
    seed(&db, HOST_FIXTURE);

    let host = Arc::new(SqliteHost::new(db.clone()));
    let services = Services::new(db.clone(), host, table, LINK_BASE);
    services.settings.install_defaults().unwrap();

    TestQueue {
        services,
        db,
        _temp: temp,
    }
}

pub fn queue_len(queue: &TestQueue) -> i64 {
    queue.services.query.count().unwrap()
}
