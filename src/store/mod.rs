//! Metrics persistence
//!
//! `MetricsStore` mirrors the remote row protocol: `update` fails with
//! `NotFound` when the key does not exist yet, `create` fails with
//! `AlreadyExists` when it does, and `put` is the native conditional upsert
//! where a backend has one. `upsert` composes them according to an
//! `UpsertStrategy`:
//!
//! ```text
//! Native            → put
//! UpdateElseCreate  → update ─NotFound→ create ─AlreadyExists→ (backoff, update)×N
//! ```
//!
//! The update-first order matches the common case of recomputing buckets that
//! already exist. When two writers race to create the same new key, the loser
//! sees `AlreadyExists` and retries as an update.
//!
//! Range reads go through the secondary index `(account_id, bucket_start,
//! record_type)` with a coarse `beginsWith` prefix on `bucket_start`, so
//! `query_range` filters the rows back down to the exact window and type.

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryMetricsStore, MemoryStoreFactory};
pub use sqlite::{SqliteMetricsStore, SqliteStoreFactory};

use crate::backoff::ExponentialBackoff;
use crate::buckets::TimeBucket;
use crate::time_window::TimeWindow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// Rows requested per `query_page` call.
pub const QUERY_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Bucket {0} not found")]
    NotFound(String),
    #[error("Bucket {0} already exists")]
    AlreadyExists(String),
    #[error("Store backend error: {0}")]
    Backend(String),
    #[error("Could not connect to store: {0}")]
    Connect(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Text form of `bucket_start` used by the secondary index.
pub fn index_timestamp(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Longest common prefix of the window's index timestamps.
///
/// This is the `beginsWith` predicate sent to the index. It can match rows
/// outside the window, never fewer rows than the window holds.
pub fn index_prefix(window: &TimeWindow) -> String {
    let start = index_timestamp(window.start);
    let end = index_timestamp(window.end);
    start
        .chars()
        .zip(end.chars())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a)
        .collect()
}

/// One page request against the secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketQuery {
    pub account_id: String,
    pub record_type: Option<String>,
    pub start_prefix: String,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Overwrite an existing row; `NotFound` when the key is new.
    async fn update(&self, bucket: &TimeBucket) -> Result<TimeBucket, StoreError>;

    /// Insert a new row; `AlreadyExists` when the key is taken.
    async fn create(&self, bucket: &TimeBucket) -> Result<TimeBucket, StoreError>;

    /// Native insert-or-update in one call.
    async fn put(&self, bucket: &TimeBucket) -> Result<TimeBucket, StoreError>;

    async fn query_page(
        &self,
        query: &BucketQuery,
        next_token: Option<&str>,
    ) -> Result<Page<TimeBucket>, StoreError>;

    /// Remove every row of an account, or only count them when `dry_run`.
    async fn delete_all(&self, account_id: &str, dry_run: bool) -> Result<usize, StoreError>;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}

/// Opens store clients. Each upsert worker calls `connect` once and keeps the
/// client for its lifetime.
pub trait StoreFactory: Send + Sync {
    fn connect(&self) -> Result<Box<dyn MetricsStore>, StoreError>;

    fn backend_type(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStrategy {
    /// Single native conditional upsert.
    Native,
    /// Update, create on `NotFound`, and retry as update up to
    /// `create_conflict_retries` times on `AlreadyExists`.
    UpdateElseCreate { create_conflict_retries: u32 },
}

impl Default for UpsertStrategy {
    fn default() -> Self {
        UpsertStrategy::UpdateElseCreate {
            create_conflict_retries: 2,
        }
    }
}

impl fmt::Display for UpsertStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpsertStrategy::Native => write!(f, "native"),
            UpsertStrategy::UpdateElseCreate {
                create_conflict_retries,
            } => write!(
                f,
                "update-else-create ({} conflict retries)",
                create_conflict_retries
            ),
        }
    }
}

impl FromStr for UpsertStrategy {
    type Err = String;

    /// Parses the mode name; conflict retries take the default.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "put" => Ok(UpsertStrategy::Native),
            "update-else-create" | "update_else_create" => Ok(UpsertStrategy::default()),
            other => Err(format!(
                "unknown upsert mode '{}' (expected 'native' or 'update-else-create')",
                other
            )),
        }
    }
}

/// Idempotent write of one bucket by composite key.
pub async fn upsert(
    store: &dyn MetricsStore,
    bucket: &TimeBucket,
    strategy: UpsertStrategy,
) -> Result<TimeBucket, StoreError> {
    let retries = match strategy {
        UpsertStrategy::Native => return store.put(bucket).await,
        UpsertStrategy::UpdateElseCreate {
            create_conflict_retries,
        } => create_conflict_retries,
    };

    match store.update(bucket).await {
        Err(StoreError::NotFound(_)) => {}
        other => return other,
    }

    let key = match store.create(bucket).await {
        Err(StoreError::AlreadyExists(key)) => key,
        other => return other,
    };

    log::debug!("🔁 Lost create race for {}, retrying as update", key);
    let mut backoff = ExponentialBackoff::new(25, 400, retries);
    while backoff.sleep().await.is_ok() {
        match store.update(bucket).await {
            Err(StoreError::NotFound(_)) => continue,
            other => return other,
        }
    }

    log::warn!(
        "⚠️  {} still not updatable after {} retries",
        key,
        backoff.attempts()
    );
    Err(StoreError::AlreadyExists(key))
}

/// All stored buckets of one record type whose start lies inside `window`.
pub async fn query_range(
    store: &dyn MetricsStore,
    account_id: &str,
    record_type: &str,
    window: &TimeWindow,
) -> Result<Vec<TimeBucket>, StoreError> {
    let query = BucketQuery {
        account_id: account_id.to_string(),
        record_type: Some(record_type.to_string()),
        start_prefix: index_prefix(window),
        limit: QUERY_PAGE_SIZE,
    };

    let mut buckets = Vec::new();
    let mut next_token: Option<String> = None;
    let mut pages = 0usize;
    let mut discarded = 0usize;

    loop {
        let page = store.query_page(&query, next_token.as_deref()).await?;
        pages += 1;

        for bucket in page.items {
            if bucket.record_type == record_type && window.contains(bucket.bucket_start) {
                buckets.push(bucket);
            } else {
                discarded += 1;
            }
        }

        match page.next_token {
            Some(token) if next_token.as_deref() != Some(token.as_str()) => {
                next_token = Some(token)
            }
            Some(token) => {
                return Err(StoreError::Backend(format!(
                    "continuation token '{}' returned twice",
                    token
                )));
            }
            None => break,
        }
    }

    log::debug!(
        "📤 Loaded {} stored {} buckets over {} pages ({} outside window)",
        buckets.len(),
        record_type,
        pages,
        discarded
    );

    Ok(buckets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_window::parse_timestamp;

    fn at(s: &str) -> DateTime<Utc> {
        parse_timestamp(s).unwrap()
    }

    fn bucket(start: &str, size: u32, count: u64) -> TimeBucket {
        TimeBucket::new("acct", "items", at(start), size, count, at("2030-01-01T00:00:00Z"))
    }

    #[test]
    fn test_index_prefix() {
        let same_hour = TimeWindow::new(at("2024-11-19T13:00:00Z"), at("2024-11-19T15:00:00Z")).unwrap();
        assert_eq!(index_prefix(&same_hour), "2024-11-19T1");

        let across_months = TimeWindow::new(at("2024-10-31T23:00:00Z"), at("2024-11-01T01:00:00Z")).unwrap();
        assert_eq!(index_prefix(&across_months), "2024-1");
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("native".parse::<UpsertStrategy>(), Ok(UpsertStrategy::Native));
        assert_eq!(
            "Update-Else-Create".parse::<UpsertStrategy>(),
            Ok(UpsertStrategy::default())
        );
        assert!("append".parse::<UpsertStrategy>().is_err());
    }

    #[tokio::test]
    async fn test_update_else_create_creates_then_updates() {
        let store = MemoryMetricsStore::new();
        let strategy = UpsertStrategy::default();

        upsert(&store, &bucket("2024-11-19T14:30:00Z", 5, 3), strategy).await.unwrap();
        assert_eq!(store.stats().creates, 1);

        upsert(&store, &bucket("2024-11-19T14:30:00Z", 5, 4), strategy).await.unwrap();
        let stats = store.stats();
        assert_eq!(stats.creates, 1);
        assert_eq!(stats.updates, 2);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get("acct", "items#2024-11-19T14:30:00Z#5").unwrap().count,
            4
        );
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        for strategy in [UpsertStrategy::Native, UpsertStrategy::default()] {
            let store = MemoryMetricsStore::new();
            let b = bucket("2024-11-19T14:30:00Z", 1, 7);

            upsert(&store, &b, strategy).await.unwrap();
            let once = store.snapshot();
            upsert(&store, &b, strategy).await.unwrap();

            assert_eq!(store.snapshot(), once);
            assert_eq!(store.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_lost_create_race_retries_as_update() {
        let store = MemoryMetricsStore::new();
        let b = bucket("2024-11-19T14:30:00Z", 1, 9);
        store.simulate_create_race(&b.composite_key());

        let stored = upsert(&store, &b, UpsertStrategy::default()).await.unwrap();

        assert_eq!(stored.count, 9);
        let stats = store.stats();
        assert_eq!(stats.creates, 1);
        assert_eq!(stats.updates, 2);
        assert_eq!(store.get("acct", &b.composite_key()).unwrap().count, 9);
    }

    #[tokio::test]
    async fn test_lost_create_race_without_retries_fails() {
        let store = MemoryMetricsStore::new();
        let b = bucket("2024-11-19T14:30:00Z", 1, 9);
        store.simulate_create_race(&b.composite_key());

        let result = upsert(
            &store,
            &b,
            UpsertStrategy::UpdateElseCreate {
                create_conflict_retries: 0,
            },
        )
        .await;

        assert_eq!(result, Err(StoreError::AlreadyExists(b.composite_key())));
    }

    #[tokio::test]
    async fn test_query_range_filters_client_side() {
        let store = MemoryMetricsStore::new();
        let strategy = UpsertStrategy::Native;
        for b in [
            bucket("2024-11-19T13:15:00Z", 15, 1),
            bucket("2024-11-19T14:00:00Z", 60, 2),
            bucket("2024-11-19T15:00:00Z", 60, 6),
            bucket("2024-11-19T10:00:00Z", 60, 3),
            bucket("2024-11-18T14:00:00Z", 60, 4),
        ] {
            upsert(&store, &b, strategy).await.unwrap();
        }
        let mut other_type = bucket("2024-11-19T14:00:00Z", 60, 5);
        other_type.record_type = "tasks".into();
        upsert(&store, &other_type, strategy).await.unwrap();

        let window = TimeWindow::new(at("2024-11-19T13:00:00Z"), at("2024-11-19T15:00:00Z")).unwrap();
        let mut found = query_range(&store, "acct", "items", &window).await.unwrap();
        found.sort_by_key(|b| b.bucket_start);

        let counts: Vec<u64> = found.iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![1, 2]);
    }
}
