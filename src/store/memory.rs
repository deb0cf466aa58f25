//! In-process metrics store
//!
//! Clones share one table, so a `MemoryStoreFactory` hands every worker a
//! client onto the same rows. Failure hooks let tests make individual keys
//! fail, make range queries fail, or simulate losing a create race.

use super::{index_timestamp, BucketQuery, MetricsStore, Page, StoreError, StoreFactory};
use crate::buckets::TimeBucket;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Calls received, successful or not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub updates: usize,
    pub creates: usize,
    pub puts: usize,
    pub queries: usize,
}

#[derive(Default)]
struct Table {
    rows: BTreeMap<(String, String), TimeBucket>,
    stats: StoreStats,
    failing_keys: HashSet<String>,
    create_races: HashSet<String>,
    fail_queries: bool,
    failing_query_types: HashSet<String>,
}

impl Table {
    fn check_failing(&self, key: &str) -> Result<(), StoreError> {
        if self.failing_keys.contains(key) {
            return Err(StoreError::Backend(format!("injected failure for {}", key)));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryMetricsStore {
    table: Arc<Mutex<Table>>,
}

impl MemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a row directly, bypassing stats and failure hooks.
    pub fn insert(&self, bucket: TimeBucket) {
        let key = (bucket.account_id.clone(), bucket.composite_key());
        self.lock().rows.insert(key, bucket);
    }

    pub fn get(&self, account_id: &str, composite_key: &str) -> Option<TimeBucket> {
        self.lock()
            .rows
            .get(&(account_id.to_string(), composite_key.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> BTreeMap<(String, String), TimeBucket> {
        self.lock().rows.clone()
    }

    pub fn stats(&self) -> StoreStats {
        self.lock().stats
    }

    /// Every write touching `composite_key` fails with a backend error.
    pub fn fail_key(&self, composite_key: &str) {
        self.lock().failing_keys.insert(composite_key.to_string());
    }

    /// The next create of `composite_key` finds that another writer created
    /// the row first.
    pub fn simulate_create_race(&self, composite_key: &str) {
        self.lock().create_races.insert(composite_key.to_string());
    }

    pub fn fail_queries(&self, fail: bool) {
        self.lock().fail_queries = fail;
    }

    /// Queries scoped to `record_type` fail; other types still read.
    pub fn fail_queries_for(&self, record_type: &str) {
        self.lock().failing_query_types.insert(record_type.to_string());
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MetricsStore for MemoryMetricsStore {
    async fn update(&self, bucket: &TimeBucket) -> Result<TimeBucket, StoreError> {
        let mut table = self.lock();
        table.stats.updates += 1;
        let key = bucket.composite_key();
        table.check_failing(&key)?;

        match table.rows.get_mut(&(bucket.account_id.clone(), key.clone())) {
            Some(row) => {
                *row = bucket.clone();
                Ok(bucket.clone())
            }
            None => Err(StoreError::NotFound(key)),
        }
    }

    async fn create(&self, bucket: &TimeBucket) -> Result<TimeBucket, StoreError> {
        let mut table = self.lock();
        table.stats.creates += 1;
        let key = bucket.composite_key();
        table.check_failing(&key)?;

        let row_key = (bucket.account_id.clone(), key.clone());
        if table.create_races.remove(&key) {
            let mut winner = bucket.clone();
            winner.count = 0;
            table.rows.insert(row_key, winner);
            return Err(StoreError::AlreadyExists(key));
        }
        if table.rows.contains_key(&row_key) {
            return Err(StoreError::AlreadyExists(key));
        }
        table.rows.insert(row_key, bucket.clone());
        Ok(bucket.clone())
    }

    async fn put(&self, bucket: &TimeBucket) -> Result<TimeBucket, StoreError> {
        let mut table = self.lock();
        table.stats.puts += 1;
        let key = bucket.composite_key();
        table.check_failing(&key)?;

        table
            .rows
            .insert((bucket.account_id.clone(), key), bucket.clone());
        Ok(bucket.clone())
    }

    async fn query_page(
        &self,
        query: &BucketQuery,
        next_token: Option<&str>,
    ) -> Result<Page<TimeBucket>, StoreError> {
        let mut table = self.lock();
        table.stats.queries += 1;
        let failing_type = query
            .record_type
            .as_ref()
            .is_some_and(|record_type| table.failing_query_types.contains(record_type));
        if table.fail_queries || failing_type {
            return Err(StoreError::Backend("injected query failure".into()));
        }

        let offset = match next_token {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| StoreError::Backend(format!("invalid continuation token '{}'", token)))?,
        };

        let mut matching: Vec<&TimeBucket> = table
            .rows
            .values()
            .filter(|b| b.account_id == query.account_id)
            .filter(|b| index_timestamp(b.bucket_start).starts_with(&query.start_prefix))
            .filter(|b| {
                query
                    .record_type
                    .as_ref()
                    .map_or(true, |record_type| &b.record_type == record_type)
            })
            .collect();
        matching.sort_by(|a, b| {
            a.bucket_start
                .cmp(&b.bucket_start)
                .then_with(|| a.record_type.cmp(&b.record_type))
                .then(a.size_minutes.cmp(&b.size_minutes))
        });

        let total = matching.len();
        let items: Vec<TimeBucket> = matching
            .into_iter()
            .skip(offset)
            .take(query.limit)
            .cloned()
            .collect();
        let consumed = offset + items.len();
        let next_token = (consumed < total).then(|| consumed.to_string());

        Ok(Page { items, next_token })
    }

    async fn delete_all(&self, account_id: &str, dry_run: bool) -> Result<usize, StoreError> {
        let mut table = self.lock();
        let before = table.rows.len();
        if dry_run {
            return Ok(table.rows.keys().filter(|(account, _)| account == account_id).count());
        }
        table.rows.retain(|(account, _), _| account != account_id);
        Ok(before - table.rows.len())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

/// Hands out clients onto one shared `MemoryMetricsStore`.
#[derive(Clone)]
pub struct MemoryStoreFactory {
    store: MemoryMetricsStore,
    connections: Arc<AtomicUsize>,
    refuse: bool,
}

impl MemoryStoreFactory {
    pub fn new(store: MemoryMetricsStore) -> Self {
        Self {
            store,
            connections: Arc::new(AtomicUsize::new(0)),
            refuse: false,
        }
    }

    /// A factory whose every `connect` fails.
    pub fn refusing(store: MemoryMetricsStore) -> Self {
        Self {
            refuse: true,
            ..Self::new(store)
        }
    }

    /// Number of successful `connect` calls so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl StoreFactory for MemoryStoreFactory {
    fn connect(&self) -> Result<Box<dyn MetricsStore>, StoreError> {
        if self.refuse {
            return Err(StoreError::Connect("memory store refused connection".into()));
        }
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.store.clone()))
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
