//! Query service - filtered reads of the queue

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::db::{queue, QueueDb, QueueFilter, QueueRow};
use crate::error::StorageError;
use crate::models::{collection_schema, QueueModel, SchemaKind};

pub struct QueryService {
    db: Arc<QueueDb>,
}

impl QueryService {
    pub fn new(db: Arc<QueueDb>) -> Self {
        Self { db }
    }

    /// Rows as stored, blobs left encoded
    pub fn collect_raw(&self, filter: &QueueFilter) -> Result<Vec<QueueRow>, StorageError> {
        self.db.with_conn(|conn| queue::list_records(conn, filter))
    }

    /// Records with decoded blobs
    pub fn collect(&self, filter: &QueueFilter) -> Result<Vec<QueueModel>, StorageError> {
        self.collect_raw(filter)?.iter().map(QueueModel::from_row).collect()
    }

    /// Export documents with ISO-8601 timestamps
    pub fn export_documents(&self, filter: &QueueFilter) -> Result<Vec<Value>, StorageError> {
        Ok(self.collect(filter)?.iter().map(QueueModel::to_document).collect())
    }

    pub fn get(&self, id: i64) -> Result<Option<QueueModel>, StorageError> {
        self.db
            .with_conn(|conn| queue::get_record(conn, id))?
            .as_ref()
            .map(QueueModel::from_row)
            .transpose()
    }

    pub fn count(&self) -> Result<i64, StorageError> {
        self.db.with_conn(queue::count_records)
    }

    pub fn collection_schema(&self) -> BTreeMap<&'static str, SchemaKind> {
        collection_schema()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewQueueRecord;

    fn seeded(n: i64) -> QueryService {
        let db = Arc::new(QueueDb::open_in_memory().unwrap());
        db.with_conn(|conn| {
            for i in 1..=n {
                queue::insert_record(
                    conn,
                    &NewQueueRecord {
                        timestamp: 1_600_000_000 + i,
                        event: "updateStatus".into(),
                        event_type: "lp_event".into(),
                        progress: "in_progress".into(),
                        assignment: "member".into(),
                        course_start: None,
                        course_end: None,
                        user_data: format!(r#"{{"usr_id":{},"username":"user{}"}}"#, i, i),
                        obj_data: r#"{"id":7}"#.into(),
                        mem_data: "{}".into(),
                        progress_changed: None,
                    },
                )?;
            }
            Ok(())
        })
        .unwrap();
        QueryService::new(db)
    }

    #[test]
    fn test_pager_bounds() {
        let service = seeded(150);

        let forward = service.collect(&QueueFilter::default().page_start(100)).unwrap();
        assert_eq!(forward.len(), 50);
        assert!(forward.iter().all(|r| r.id > 100));

        let backward = service
            .collect(&QueueFilter::default().page_start(100).negative_pager(true))
            .unwrap();
        assert_eq!(backward.len(), 99);
        assert!(backward.iter().all(|r| r.id < 100));
        assert_eq!(backward[0].id, 99);
    }

    #[test]
    fn test_collect_decodes_and_raw_does_not() {
        let service = seeded(2);

        let models = service.collect(&QueueFilter::default()).unwrap();
        assert_eq!(models[1].user_data.usr_id, 2);
        assert_eq!(models[1].user_data.username.as_deref(), Some("user2"));

        let raw = service.collect_raw(&QueueFilter::default()).unwrap();
        assert_eq!(raw[1].user_data, r#"{"usr_id":2,"username":"user2"}"#);
        assert_eq!(service.count().unwrap(), 2);
    }

    #[test]
    fn test_export_and_schema() {
        let service = seeded(1);
        let docs = service.export_documents(&QueueFilter::default()).unwrap();
        assert_eq!(docs[0]["timestamp"], "2020-09-13T12:26:41Z");

        let schema = service.collection_schema();
        assert_eq!(schema["user_data"], SchemaKind::Object);
        assert_eq!(schema["obj_data.course_ref_id"], SchemaKind::Integer);
        assert!(service.get(1).unwrap().is_some());
        assert!(service.get(2).unwrap().is_none());
    }
}
