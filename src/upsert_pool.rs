//! Bounded worker pool for bucket upserts
//!
//! ```text
//! producer (sorted jobs) → mpsc(bounded) → Arc<Mutex<Receiver>> → N workers
//!                                                                   │
//!                                               one lazily connected store client each
//! ```
//!
//! Every job is taken by exactly one worker. A failed upsert is logged with
//! the bucket key and tallied; it never stops the other workers.

use crate::buckets::TimeBucket;
use crate::store::{upsert, MetricsStore, StoreError, StoreFactory, UpsertStrategy};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const MAX_CONCURRENCY: usize = 50;

/// Clamp a requested worker count to `1..=MAX_CONCURRENCY` and to the number
/// of jobs.
pub fn effective_concurrency(requested: usize, jobs: usize) -> usize {
    if requested > MAX_CONCURRENCY {
        log::warn!(
            "⚠️  Concurrency {} exceeds the maximum of {}, using {}",
            requested,
            MAX_CONCURRENCY,
            MAX_CONCURRENCY
        );
    }
    requested.clamp(1, MAX_CONCURRENCY).min(jobs.max(1))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolOutcome {
    pub updated: usize,
    pub errors: usize,
    pub failed_keys: Vec<String>,
    pub workers: usize,
}

#[derive(Debug, Default)]
struct WorkerTally {
    updated: usize,
    failed_keys: Vec<String>,
}

pub struct UpsertPool {
    stores: Arc<dyn StoreFactory>,
    strategy: UpsertStrategy,
    concurrency: usize,
}

impl UpsertPool {
    pub fn new(stores: Arc<dyn StoreFactory>, strategy: UpsertStrategy, concurrency: usize) -> Self {
        Self {
            stores,
            strategy,
            concurrency,
        }
    }

    /// Upsert every bucket, dispatching in the order given.
    pub async fn run(&self, jobs: Vec<TimeBucket>) -> PoolOutcome {
        let total = jobs.len();
        if total == 0 {
            return PoolOutcome::default();
        }

        let workers = effective_concurrency(self.concurrency, total);
        let (tx, rx) = mpsc::channel::<TimeBucket>(workers * 2);
        let rx = Arc::new(Mutex::new(rx));

        log::debug!(
            "🔧 Starting {} upsert workers for {} buckets ({}, {})",
            workers,
            total,
            self.stores.backend_type(),
            self.strategy
        );

        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            set.spawn(run_worker(
                worker_id,
                Arc::clone(&rx),
                Arc::clone(&self.stores),
                self.strategy,
            ));
        }

        let mut outcome = PoolOutcome {
            workers,
            ..Default::default()
        };

        let mut jobs = jobs.into_iter();
        while let Some(bucket) = jobs.next() {
            if let Err(mpsc::error::SendError(bucket)) = tx.send(bucket).await {
                // Every worker is gone; nothing left can be written.
                for lost in std::iter::once(bucket).chain(jobs.by_ref()) {
                    log::error!("❌ {}: no upsert worker available", lost.composite_key());
                    outcome.failed_keys.push(lost.composite_key());
                }
                break;
            }
        }
        drop(tx);

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(tally) => {
                    outcome.updated += tally.updated;
                    outcome.failed_keys.extend(tally.failed_keys);
                }
                Err(e) => log::error!("❌ Upsert worker panicked: {}", e),
            }
        }

        outcome.errors = total - outcome.updated;
        outcome
    }
}

async fn run_worker(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<TimeBucket>>>,
    stores: Arc<dyn StoreFactory>,
    strategy: UpsertStrategy,
) -> WorkerTally {
    let mut tally = WorkerTally::default();
    let mut client: Option<Result<Box<dyn MetricsStore>, StoreError>> = None;

    loop {
        let job = rx.lock().await.recv().await;
        let Some(bucket) = job else {
            break;
        };
        let key = bucket.composite_key();

        let connected = client.get_or_insert_with(|| {
            let connected = stores.connect();
            if let Err(e) = &connected {
                log::error!("❌ Worker {} could not connect to store: {}", worker_id, e);
            }
            connected
        });

        let result = match connected {
            Ok(store) => upsert(&**store, &bucket, strategy).await.map(|_| ()),
            Err(e) => Err(e.clone()),
        };

        match result {
            Ok(()) => {
                tally.updated += 1;
                log::debug!("💾 Worker {} upserted {} = {}", worker_id, key, bucket.count);
            }
            Err(e) => {
                log::error!("❌ Failed to upsert {} (count {}): {}", key, bucket.count, e);
                tally.failed_keys.push(key);
            }
        }
    }

    tally
}
