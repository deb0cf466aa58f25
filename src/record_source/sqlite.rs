//! SQLite record mirror
//!
//! A local copy of upstream records, laid out like the remote list-by-index
//! queries: one row per record with indexed `created_at` / `updated_at`
//! columns per account and model, and the remaining attributes kept as JSON.
//! Pages are cut with a rowid cursor that doubles as the continuation token.

use super::{FetchError, PageRequest, RecordPage, RecordPageQuery};
use crate::record_types::TimeIndexField;
use crate::sqlite_pragma::apply_optimized_pragmas;
use crate::time_window::parse_timestamp;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Mutex;

/// Canonical text form for stored timestamps; sorts lexicographically.
fn canonical(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub struct SqliteRecordQuery {
    conn: Mutex<Connection>,
}

impl SqliteRecordQuery {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, FetchError> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FetchError::Database(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(db_path)?;
        apply_optimized_pragmas(&conn)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                id TEXT NOT NULL,
                model TEXT NOT NULL,
                account_id TEXT NOT NULL,
                created_at TEXT,
                updated_at TEXT,
                attributes TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (model, id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_records_created
             ON records(account_id, model, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_records_updated
             ON records(account_id, model, updated_at)",
            [],
        )?;

        log::debug!("✅ SQLite record mirror ready");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace documents of one model in a single transaction.
    ///
    /// `id`, `createdAt` and `updatedAt` are lifted into columns; parseable
    /// timestamps are stored in canonical UTC form so range predicates compare
    /// correctly.
    pub fn insert_records(
        &self,
        model: &str,
        account_id: &str,
        documents: &[Value],
    ) -> Result<usize, FetchError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        for document in documents {
            let id = match document.get("id") {
                Some(Value::String(id)) => id.clone(),
                Some(Value::Number(id)) => id.to_string(),
                _ => return Err(FetchError::Decode("record without an id".into())),
            };
            let timestamp_column = |field: &str| {
                document.get(field).and_then(Value::as_str).map(|raw| {
                    parse_timestamp(raw).map(canonical).unwrap_or_else(|| raw.to_string())
                })
            };

            let mut attributes = match document {
                Value::Object(map) => map.clone(),
                _ => Map::new(),
            };
            for lifted in ["id", "accountId", "createdAt", "updatedAt"] {
                attributes.remove(lifted);
            }

            tx.execute(
                "INSERT OR REPLACE INTO records
                 (id, model, account_id, created_at, updated_at, attributes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    model,
                    account_id,
                    timestamp_column("createdAt"),
                    timestamp_column("updatedAt"),
                    Value::Object(attributes).to_string(),
                ],
            )?;
        }

        tx.commit()?;
        log::debug!("✅ Mirrored {} {} records", documents.len(), model);
        Ok(documents.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RecordPageQuery for SqliteRecordQuery {
    async fn fetch_page(&self, request: &PageRequest) -> Result<RecordPage, FetchError> {
        let cursor: i64 = match request.next_token.as_deref() {
            None => 0,
            Some(token) => token
                .parse()
                .map_err(|_| FetchError::Remote(format!("invalid continuation token '{}'", token)))?,
        };
        let column = match request.time_index {
            TimeIndexField::CreatedAt => "created_at",
            TimeIndexField::UpdatedAt => "updated_at",
        };
        let (filter_path, filter_value) = match &request.filter {
            Some(filter) => (Some(format!("$.{}", filter.field)), Some(filter.equals.clone())),
            None => (None, None),
        };

        let sql = format!(
            "SELECT rowid, id, account_id, created_at, updated_at, attributes
             FROM records
             WHERE account_id = ?1
               AND model = ?2
               AND {column} >= ?3 AND {column} < ?4
               AND rowid > ?5
               AND (?6 IS NULL OR json_extract(attributes, ?6) = ?7)
             ORDER BY rowid ASC
             LIMIT ?8"
        );

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                request.account_id,
                request.model,
                canonical(request.window.start),
                canonical(request.window.end),
                cursor,
                filter_path,
                filter_value,
                request.limit as i64,
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )?;

        let mut items = Vec::new();
        let mut last_rowid = cursor;
        for row in rows {
            let (rowid, id, account_id, created_at, updated_at, attributes) = row?;
            let mut document = match serde_json::from_str::<Value>(&attributes)? {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            document.insert("id".into(), Value::String(id));
            document.insert("accountId".into(), Value::String(account_id));
            if let Some(created_at) = created_at {
                document.insert("createdAt".into(), Value::String(created_at));
            }
            if let Some(updated_at) = updated_at {
                document.insert("updatedAt".into(), Value::String(updated_at));
            }
            items.push(Value::Object(document));
            last_rowid = rowid;
        }

        let next_token = (items.len() == request.limit).then(|| last_rowid.to_string());
        Ok(RecordPage { items, next_token })
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_source::RecordSource;
    use crate::record_types::RecordTypeRegistry;
    use crate::time_window::TimeWindow;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn window(start: &str, end: &str) -> TimeWindow {
        TimeWindow::new(parse_timestamp(start).unwrap(), parse_timestamp(end).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_range_and_account_filtering() {
        let dir = tempdir().unwrap();
        let mirror = SqliteRecordQuery::new(dir.path().join("records.db")).unwrap();

        mirror
            .insert_records(
                "Item",
                "acct",
                &[
                    json!({"id": "in-1", "createdAt": "2024-11-19T14:00:00Z"}),
                    json!({"id": "in-2", "createdAt": "2024-11-19T16:00:00+02:00"}),
                    json!({"id": "out", "createdAt": "2024-11-19T16:00:00Z"}),
                    json!({"id": "at-end", "createdAt": "2024-11-19T15:00:00Z"}),
                ],
            )
            .unwrap();
        mirror
            .insert_records("Item", "other", &[json!({"id": "x", "createdAt": "2024-11-19T14:00:00Z"})])
            .unwrap();

        let source = RecordSource::new(Arc::new(mirror));
        let registry = RecordTypeRegistry::default();
        let outcome = source
            .fetch(
                registry.lookup("items").unwrap(),
                "acct",
                &window("2024-11-19T13:00:00Z", "2024-11-19T15:00:00Z"),
            )
            .await;

        let mut ids: Vec<_> = outcome.records.iter().map(|r| r.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["in-1", "in-2"]);
        assert!(outcome.records.iter().all(|r| r.timestamp.is_some()));
    }

    #[tokio::test]
    async fn test_pagination_with_rowid_cursor() {
        let dir = tempdir().unwrap();
        let mirror = SqliteRecordQuery::new(dir.path().join("records.db")).unwrap();
        let documents: Vec<Value> = (0..25)
            .map(|i| json!({"id": format!("r{:02}", i), "createdAt": "2024-11-19T14:10:00Z"}))
            .collect();
        mirror.insert_records("Item", "acct", &documents).unwrap();

        let source = RecordSource::new(Arc::new(mirror)).with_page_size(10);
        let registry = RecordTypeRegistry::default();
        let outcome = source
            .fetch(
                registry.lookup("items").unwrap(),
                "acct",
                &window("2024-11-19T14:00:00Z", "2024-11-19T15:00:00Z"),
            )
            .await;

        assert_eq!(outcome.records.len(), 25);
        assert_eq!(outcome.pages, 3);
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_filter_pushdown_and_update_index() {
        let dir = tempdir().unwrap();
        let mirror = SqliteRecordQuery::new(dir.path().join("records.db")).unwrap();
        mirror
            .insert_records(
                "ScoreResult",
                "acct",
                &[
                    json!({"id": "p", "createdAt": "2024-11-19T14:00:00Z", "type": "prediction"}),
                    json!({"id": "e", "createdAt": "2024-11-19T14:00:00Z", "type": "evaluation"}),
                ],
            )
            .unwrap();
        mirror
            .insert_records(
                "Task",
                "acct",
                &[
                    json!({"id": "t1", "createdAt": "2024-11-18T09:00:00Z", "updatedAt": "2024-11-19T14:20:00Z"}),
                    json!({"id": "t2", "createdAt": "2024-11-19T14:05:00Z", "updatedAt": "2024-11-20T09:00:00Z"}),
                ],
            )
            .unwrap();

        let source = RecordSource::new(Arc::new(mirror));
        let registry = RecordTypeRegistry::default();
        let range = window("2024-11-19T14:00:00Z", "2024-11-19T15:00:00Z");

        let predictions = source
            .fetch(registry.lookup("predictionScoreResults").unwrap(), "acct", &range)
            .await;
        assert_eq!(predictions.records.len(), 1);
        assert_eq!(predictions.records[0].id, "p");
        assert_eq!(predictions.filtered_out, 0);

        let tasks = source.fetch(registry.lookup("tasks").unwrap(), "acct", &range).await;
        assert_eq!(tasks.records.len(), 1);
        assert_eq!(tasks.records[0].id, "t1");
        assert_eq!(
            tasks.records[0].timestamp,
            parse_timestamp("2024-11-19T14:20:00Z")
        );
    }
}
