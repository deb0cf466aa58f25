//! SQLite metrics store
//!
//! Table `aggregated_metrics`, one row per `(account_id, composite_key)`:
//!
//! ```sql
//! PRIMARY KEY (account_id, composite_key)
//! INDEX idx_metrics_range (account_id, bucket_start, record_type)
//! ```
//!
//! `update` and `create` are separate statements so the update-else-create
//! strategy sees the same `NotFound` / `AlreadyExists` outcomes as against the
//! remote API; `put` is the native `INSERT ... ON CONFLICT DO UPDATE`.

use super::{index_timestamp, BucketQuery, MetricsStore, Page, StoreError, StoreFactory};
use crate::buckets::TimeBucket;
use crate::sqlite_pragma::apply_optimized_pragmas;
use crate::time_window::parse_timestamp;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS aggregated_metrics (
    account_id TEXT NOT NULL,
    composite_key TEXT NOT NULL,
    record_type TEXT NOT NULL,
    bucket_start TEXT NOT NULL,
    bucket_end TEXT NOT NULL,
    bucket_minutes INTEGER NOT NULL,
    count INTEGER NOT NULL,
    complete INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (account_id, composite_key)
);
CREATE INDEX IF NOT EXISTS idx_metrics_range
    ON aggregated_metrics(account_id, bucket_start, record_type);
";

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

pub struct SqliteMetricsStore {
    conn: Mutex<Connection>,
}

impl SqliteMetricsStore {
    /// Open (creating if needed) the metrics database at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connect(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(db_path).map_err(|e| StoreError::Connect(e.to_string()))?;
        apply_optimized_pragmas(&conn).map_err(|e| StoreError::Connect(e.to_string()))?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn row_to_bucket(row: &rusqlite::Row<'_>) -> rusqlite::Result<TimeBucket> {
    let decode = |index: usize, raw: String| {
        parse_timestamp(&raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                index,
                rusqlite::types::Type::Text,
                format!("invalid timestamp '{}'", raw).into(),
            )
        })
    };

    Ok(TimeBucket {
        account_id: row.get(0)?,
        record_type: row.get(1)?,
        bucket_start: decode(2, row.get(2)?)?,
        bucket_end: decode(3, row.get(3)?)?,
        size_minutes: row.get(4)?,
        count: row.get::<_, i64>(5)?.max(0) as u64,
        complete: row.get(6)?,
    })
}

#[async_trait]
impl MetricsStore for SqliteMetricsStore {
    async fn update(&self, bucket: &TimeBucket) -> Result<TimeBucket, StoreError> {
        let key = bucket.composite_key();
        let changed = self.lock().execute(
            "UPDATE aggregated_metrics
             SET bucket_end = ?3, count = ?4, complete = ?5, updated_at = ?6
             WHERE account_id = ?1 AND composite_key = ?2",
            params![
                bucket.account_id,
                key,
                index_timestamp(bucket.bucket_end),
                bucket.count as i64,
                bucket.complete,
                Utc::now().to_rfc3339(),
            ],
        )?;

        if changed == 0 {
            return Err(StoreError::NotFound(key));
        }
        Ok(bucket.clone())
    }

    async fn create(&self, bucket: &TimeBucket) -> Result<TimeBucket, StoreError> {
        let key = bucket.composite_key();
        let now = Utc::now().to_rfc3339();
        let result = self.lock().execute(
            "INSERT INTO aggregated_metrics
             (account_id, composite_key, record_type, bucket_start, bucket_end,
              bucket_minutes, count, complete, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                bucket.account_id,
                key,
                bucket.record_type,
                index_timestamp(bucket.bucket_start),
                index_timestamp(bucket.bucket_end),
                bucket.size_minutes,
                bucket.count as i64,
                bucket.complete,
                now,
            ],
        );

        match result {
            Ok(_) => Ok(bucket.clone()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyExists(key)),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, bucket: &TimeBucket) -> Result<TimeBucket, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.lock().execute(
            "INSERT INTO aggregated_metrics
             (account_id, composite_key, record_type, bucket_start, bucket_end,
              bucket_minutes, count, complete, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(account_id, composite_key) DO UPDATE SET
                bucket_end = excluded.bucket_end,
                count = excluded.count,
                complete = excluded.complete,
                updated_at = excluded.updated_at",
            params![
                bucket.account_id,
                bucket.composite_key(),
                bucket.record_type,
                index_timestamp(bucket.bucket_start),
                index_timestamp(bucket.bucket_end),
                bucket.size_minutes,
                bucket.count as i64,
                bucket.complete,
                now,
            ],
        )?;
        Ok(bucket.clone())
    }

    async fn query_page(
        &self,
        query: &BucketQuery,
        next_token: Option<&str>,
    ) -> Result<Page<TimeBucket>, StoreError> {
        let cursor: i64 = match next_token {
            None => 0,
            Some(token) => token
                .parse()
                .map_err(|_| StoreError::Backend(format!("invalid continuation token '{}'", token)))?,
        };

        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT account_id, record_type, bucket_start, bucket_end,
                    bucket_minutes, count, complete, rowid
             FROM aggregated_metrics
             WHERE account_id = ?1
               AND bucket_start GLOB ?2 || '*'
               AND (?3 IS NULL OR record_type = ?3)
               AND rowid > ?4
             ORDER BY rowid ASC
             LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            params![
                query.account_id,
                query.start_prefix,
                query.record_type,
                cursor,
                query.limit as i64,
            ],
            |row| Ok((row_to_bucket(row)?, row.get::<_, i64>(7)?)),
        )?;

        let mut items = Vec::new();
        let mut last_rowid = cursor;
        for row in rows {
            let (bucket, rowid) = row?;
            items.push(bucket);
            last_rowid = rowid;
        }

        let next_token = (items.len() == query.limit).then(|| last_rowid.to_string());
        Ok(Page { items, next_token })
    }

    async fn delete_all(&self, account_id: &str, dry_run: bool) -> Result<usize, StoreError> {
        let conn = self.lock();
        if dry_run {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM aggregated_metrics WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )?;
            return Ok(count as usize);
        }

        let deleted = conn.execute(
            "DELETE FROM aggregated_metrics WHERE account_id = ?1",
            params![account_id],
        )?;
        log::info!("🗑️  Deleted {} metric rows for account {}", deleted, account_id);
        Ok(deleted)
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}

/// Opens a fresh connection per `connect`.
#[derive(Debug, Clone)]
pub struct SqliteStoreFactory {
    db_path: PathBuf,
}

impl SqliteStoreFactory {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }
}

impl StoreFactory for SqliteStoreFactory {
    fn connect(&self) -> Result<Box<dyn MetricsStore>, StoreError> {
        Ok(Box::new(SqliteMetricsStore::open(&self.db_path)?))
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}
