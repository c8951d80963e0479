//! Queue record storage and filtered retrieval

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StorageError;

/// Queue row as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRow {
    pub id: i64,
    pub timestamp: i64,
    pub event: String,
    pub event_type: String,
    pub progress: String,
    pub assignment: String,
    pub course_start: Option<i64>,
    pub course_end: Option<i64>,
    pub user_data: String,
    pub obj_data: String,
    pub mem_data: String,
    pub progress_changed: Option<i64>,
}

impl QueueRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            timestamp: row.get("timestamp")?,
            event: row.get("event")?,
            event_type: row.get("event_type")?,
            progress: row.get("progress")?,
            assignment: row.get("assignment")?,
            course_start: row.get("course_start")?,
            course_end: row.get("course_end")?,
            user_data: row.get("user_data")?,
            obj_data: row.get("obj_data")?,
            mem_data: row.get("mem_data")?,
            progress_changed: row.get("progress_changed")?,
        })
    }
}

/// A record ready to be appended (id is assigned by the sequence)
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueRecord {
    pub timestamp: i64,
    pub event: String,
    pub event_type: String,
    pub progress: String,
    pub assignment: String,
    pub course_start: Option<i64>,
    pub course_end: Option<i64>,
    pub user_data: String,
    pub obj_data: String,
    pub mem_data: String,
    pub progress_changed: Option<i64>,
}

/// Direction of a time filter relative to its timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeDirection {
    Before = 0,
    After = 1,
}

impl TimeDirection {
    fn operator(self) -> &'static str {
        match self {
            TimeDirection::Before => "<=",
            TimeDirection::After => ">=",
        }
    }
}

/// Filter for queue retrieval - camelCase for URL/JSON params
///
/// Every active filter is AND-combined. An empty filter returns the first
/// `page_length` records in id order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueFilter {
    #[serde(default)]
    pub course_start: Option<i64>,
    #[serde(default = "direction_after")]
    pub course_start_direction: TimeDirection,
    #[serde(default)]
    pub course_end: Option<i64>,
    #[serde(default = "direction_before")]
    pub course_end_direction: TimeDirection,
    #[serde(default)]
    pub event_happened: Option<i64>,
    #[serde(default = "direction_after")]
    pub event_happened_direction: TimeDirection,
    /// Window start, replaces `event_happened` when set
    #[serde(default)]
    pub event_happened_start: Option<i64>,
    /// Window end, replaces `event_happened` when set
    #[serde(default)]
    pub event_happened_end: Option<i64>,
    #[serde(default)]
    pub progress_changed: Option<i64>,
    #[serde(default = "direction_after")]
    pub progress_changed_direction: TimeDirection,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub excluded_progress: Option<String>,
    #[serde(default)]
    pub assignment: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    /// Exclusive id cursor (0 = from the beginning)
    #[serde(default)]
    pub page_start: i64,
    /// Maximum records, -1 disables the limit
    #[serde(default = "default_page_length")]
    pub page_length: i64,
    /// Page backwards from `page_start`
    #[serde(default)]
    pub negative_pager: bool,
}

fn direction_after() -> TimeDirection { TimeDirection::After }
fn direction_before() -> TimeDirection { TimeDirection::Before }
fn default_page_length() -> i64 { 500 }

impl Default for QueueFilter {
    fn default() -> Self {
        Self {
            course_start: None,
            course_start_direction: TimeDirection::After,
            course_end: None,
            course_end_direction: TimeDirection::Before,
            event_happened: None,
            event_happened_direction: TimeDirection::After,
            event_happened_start: None,
            event_happened_end: None,
            progress_changed: None,
            progress_changed_direction: TimeDirection::After,
            progress: None,
            excluded_progress: None,
            assignment: None,
            event_type: None,
            event: None,
            page_start: 0,
            page_length: default_page_length(),
            negative_pager: false,
        }
    }
}

impl QueueFilter {
    pub fn course_start(mut self, ts: i64, direction: TimeDirection) -> Self {
        self.course_start = Some(ts);
        self.course_start_direction = direction;
        self
    }

    pub fn course_end(mut self, ts: i64, direction: TimeDirection) -> Self {
        self.course_end = Some(ts);
        self.course_end_direction = direction;
        self
    }

    pub fn event_happened(mut self, ts: i64, direction: TimeDirection) -> Self {
        self.event_happened = Some(ts);
        self.event_happened_direction = direction;
        self
    }

    pub fn event_happened_between(mut self, start: Option<i64>, end: Option<i64>) -> Self {
        self.event_happened_start = start;
        self.event_happened_end = end;
        self
    }

    pub fn progress_changed(mut self, ts: i64, direction: TimeDirection) -> Self {
        self.progress_changed = Some(ts);
        self.progress_changed_direction = direction;
        self
    }

    pub fn progress(mut self, progress: impl Into<String>) -> Self {
        self.progress = Some(progress.into());
        self
    }

    pub fn excluded_progress(mut self, progress: impl Into<String>) -> Self {
        self.excluded_progress = Some(progress.into());
        self
    }

    pub fn assignment(mut self, assignment: impl Into<String>) -> Self {
        self.assignment = Some(assignment.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn page_start(mut self, id: i64) -> Self {
        self.page_start = id;
        self
    }

    pub fn page_length(mut self, length: i64) -> Self {
        self.page_length = length;
        self
    }

    pub fn negative_pager(mut self, negative: bool) -> Self {
        self.negative_pager = negative;
        self
    }
}

/// `*` and empty strings mean "no filter"
fn categorical(value: &Option<String>) -> Option<&str> {
    match value.as_deref() {
        None | Some("") | Some("*") => None,
        Some(v) => Some(v),
    }
}

/// Append one record, returning its sequence id
pub fn insert_record(conn: &Connection, record: &NewQueueRecord) -> Result<i64, StorageError> {
    conn.execute(
        r#"
        INSERT INTO lerq_queue (
            timestamp, event, event_type, progress, assignment,
            course_start, course_end, user_data, obj_data, mem_data, progress_changed
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            record.timestamp,
            record.event,
            record.event_type,
            record.progress,
            record.assignment,
            record.course_start,
            record.course_end,
            record.user_data,
            record.obj_data,
            record.mem_data,
            record.progress_changed,
        ],
    ).map_err(|e| StorageError::Internal(format!("Insert failed: {}", e)))?;

    Ok(conn.last_insert_rowid())
}

/// Append several records atomically
pub fn insert_records(conn: &mut Connection, records: &[NewQueueRecord]) -> Result<Vec<i64>, StorageError> {
    let tx = conn.transaction()
        .map_err(|e| StorageError::Internal(format!("Transaction failed: {}", e)))?;

    let mut ids = Vec::with_capacity(records.len());
    for record in records {
        ids.push(insert_record(&tx, record)?);
    }

    tx.commit()
        .map_err(|e| StorageError::Internal(format!("Commit failed: {}", e)))?;

    Ok(ids)
}

/// Get a record by id
pub fn get_record(conn: &Connection, id: i64) -> Result<Option<QueueRow>, StorageError> {
    conn.query_row("SELECT * FROM lerq_queue WHERE id = ?", params![id], |row| QueueRow::from_row(row))
        .optional()
        .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))
}

/// List records matching a filter, ordered by id in pager direction
pub fn list_records(conn: &Connection, filter: &QueueFilter) -> Result<Vec<QueueRow>, StorageError> {
    let mut sql = String::from(
        "SELECT id, timestamp, event, event_type, progress, assignment, course_start, course_end, \
         user_data, obj_data, mem_data, progress_changed FROM lerq_queue",
    );
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];
    let mut conditions = vec![];

    if let Some(ts) = filter.course_start {
        conditions.push(format!("course_start {} ?", filter.course_start_direction.operator()));
        params.push(Box::new(ts));
    }

    if let Some(ts) = filter.course_end {
        conditions.push(format!("course_end {} ?", filter.course_end_direction.operator()));
        params.push(Box::new(ts));
    }

    if filter.event_happened_start.is_none() && filter.event_happened_end.is_none() {
        if let Some(ts) = filter.event_happened {
            conditions.push(format!("timestamp {} ?", filter.event_happened_direction.operator()));
            params.push(Box::new(ts));
        }
    }
    if let Some(ts) = filter.event_happened_start {
        conditions.push("timestamp >= ?".to_string());
        params.push(Box::new(ts));
    }
    if let Some(ts) = filter.event_happened_end {
        conditions.push("timestamp <= ?".to_string());
        params.push(Box::new(ts));
    }

    if let Some(ts) = filter.progress_changed {
        conditions.push(format!("progress_changed {} ?", filter.progress_changed_direction.operator()));
        params.push(Box::new(ts));
    }

    if let Some(excluded) = filter.excluded_progress.as_deref().filter(|p| !p.is_empty()) {
        conditions.push("progress <> ?".to_string());
        params.push(Box::new(excluded.to_string()));
    }

    if let Some(progress) = categorical(&filter.progress) {
        conditions.push("progress = ?".to_string());
        params.push(Box::new(progress.to_string()));
    }

    if let Some(assignment) = categorical(&filter.assignment) {
        conditions.push("assignment = ?".to_string());
        params.push(Box::new(assignment.to_string()));
    }

    if let Some(event_type) = categorical(&filter.event_type) {
        conditions.push("event_type = ?".to_string());
        params.push(Box::new(event_type.to_string()));
    }

    if let Some(event) = categorical(&filter.event) {
        conditions.push("event = ?".to_string());
        params.push(Box::new(event.to_string()));
    }

    // Cursor is exclusive in both directions
    if filter.page_start > 0 {
        if filter.negative_pager {
            conditions.push("id < ?".to_string());
        } else {
            conditions.push("id > ?".to_string());
        }
        params.push(Box::new(filter.page_start));
    }

    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    if filter.negative_pager {
        sql.push_str(" ORDER BY id DESC");
    } else {
        sql.push_str(" ORDER BY id ASC");
    }

    if filter.page_length != -1 {
        sql.push_str(" LIMIT ?");
        params.push(Box::new(filter.page_length.max(0)));
    }

    debug!("Executing query: {}", sql);

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StorageError::Internal(format!("Prepare failed: {}", e)))?;

    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let rows = stmt
        .query_map(param_refs.as_slice(), |row| QueueRow::from_row(row))
        .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StorageError::Internal(format!("Row parse failed: {}", e)))?;

    Ok(rows)
}

/// Count all records
pub fn count_records(conn: &Connection) -> Result<i64, StorageError> {
    conn.query_row("SELECT COUNT(*) FROM lerq_queue", [], |row| row.get(0))
        .map_err(|e| StorageError::Internal(format!("Query failed: {}", e)))
}

/// Remove every record and restart the id sequence
pub fn truncate(conn: &mut Connection) -> Result<usize, StorageError> {
    let tx = conn.transaction()
        .map_err(|e| StorageError::Internal(format!("Transaction failed: {}", e)))?;

    let removed = tx.execute("DELETE FROM lerq_queue", [])
        .map_err(|e| StorageError::Internal(format!("Delete failed: {}", e)))?;
    tx.execute("DELETE FROM sqlite_sequence WHERE name = 'lerq_queue'", [])
        .map_err(|e| StorageError::Internal(format!("Sequence reset failed: {}", e)))?;

    tx.commit()
        .map_err(|e| StorageError::Internal(format!("Commit failed: {}", e)))?;

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::QueueDb;

    fn record(event: &str, event_type: &str, timestamp: i64, progress: &str) -> NewQueueRecord {
        NewQueueRecord {
            timestamp,
            event: event.to_string(),
            event_type: event_type.to_string(),
            progress: progress.to_string(),
            assignment: "member".to_string(),
            course_start: Some(1_000),
            course_end: Some(2_000),
            user_data: r#"{"usr_id":42}"#.to_string(),
            obj_data: r#"{"id":7}"#.to_string(),
            mem_data: r#"{"role":null}"#.to_string(),
            progress_changed: Some(timestamp),
        }
    }

    fn seeded(n: i64) -> QueueDb {
        let db = QueueDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            for i in 1..=n {
                let (event, event_type) = if i % 2 == 0 {
                    ("updateStatus", "lp_event")
                } else {
                    ("addParticipant", "member_event")
                };
                let progress = if i % 3 == 0 { "completed" } else { "in_progress" };
                insert_record(conn, &record(event, event_type, 100 * i, progress))?;
            }
            Ok(())
        })
        .unwrap();
        db
    }

    #[test]
    fn test_empty_filter_returns_ascending_page() {
        let db = seeded(10);
        let rows = db.with_conn(|conn| list_records(conn, &QueueFilter::default())).unwrap();

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_forward_cursor_is_exclusive() {
        let db = seeded(10);
        let filter = QueueFilter::default().page_start(4).page_length(3);
        let rows = db.with_conn(|conn| list_records(conn, &filter)).unwrap();

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![5, 6, 7]);
    }

    #[test]
    fn test_negative_pager_descends_below_cursor() {
        let db = seeded(10);
        let filter = QueueFilter::default().page_start(4).negative_pager(true);
        let rows = db.with_conn(|conn| list_records(conn, &filter)).unwrap();

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn test_unlimited_page_length() {
        let db = seeded(12);
        let filter = QueueFilter::default().page_length(-1);
        let rows = db.with_conn(|conn| list_records(conn, &filter)).unwrap();
        assert_eq!(rows.len(), 12);

        let limited = QueueFilter::default().page_length(5);
        let rows = db.with_conn(|conn| list_records(conn, &limited)).unwrap();
        assert_eq!(rows.len(), 5);
    }

    #[test]
    fn test_filters_are_and_combined() {
        let db = seeded(12);
        let filter = QueueFilter::default()
            .event_type("lp_event")
            .progress("completed");
        let rows = db.with_conn(|conn| list_records(conn, &filter)).unwrap();

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![6, 12]);
    }

    #[test]
    fn test_wildcard_means_no_filter() {
        let db = seeded(4);
        let filter = QueueFilter::default().event_type("*").assignment("");
        let rows = db.with_conn(|conn| list_records(conn, &filter)).unwrap();
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn test_time_filters() {
        let db = seeded(10);

        let after = QueueFilter::default().event_happened(800, TimeDirection::After);
        let rows = db.with_conn(|conn| list_records(conn, &after)).unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![8, 9, 10]);

        let before = QueueFilter::default().event_happened(200, TimeDirection::Before);
        let rows = db.with_conn(|conn| list_records(conn, &before)).unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);

        // Window replaces the single-sided filter
        let window = QueueFilter::default()
            .event_happened(900, TimeDirection::After)
            .event_happened_between(Some(300), Some(500));
        let rows = db.with_conn(|conn| list_records(conn, &window)).unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[test]
    fn test_excluded_progress() {
        let db = seeded(6);
        let filter = QueueFilter::default().excluded_progress("in_progress");
        let rows = db.with_conn(|conn| list_records(conn, &filter)).unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 6]);
    }

    #[test]
    fn test_truncate_restarts_sequence() {
        let db = seeded(3);
        let removed = db.with_conn_mut(|conn| truncate(conn)).unwrap();
        assert_eq!(removed, 3);

        let id = db.with_conn(|conn| insert_record(conn, &record("create", "object_event", 1, ""))).unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn test_filter_from_camel_case_json() {
        let filter: QueueFilter = serde_json::from_str(
            r#"{"pageStart": 100, "negativePager": true, "eventType": "lp_event", "courseEnd": 5}"#,
        )
        .unwrap();

        assert_eq!(filter.page_start, 100);
        assert!(filter.negative_pager);
        assert_eq!(filter.page_length, 500);
        assert_eq!(filter.course_end_direction, TimeDirection::Before);
        assert_eq!(filter.course_start_direction, TimeDirection::After);
    }
}
