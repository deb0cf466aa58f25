//! Recompute buckets for a window and write back the ones that changed
//!
//! ```text
//! fetch → count → diff against stored (unless force) → sort newest first → UpsertPool
//! ```
//!
//! The window is first widened to whole buckets of every resolution, so edge
//! buckets are always recounted from all of their records and compared with
//! their stored rows.
//!
//! A record type fails fast when its stored buckets cannot be read; individual
//! upsert failures are only tallied.

use crate::buckets::{BucketCounter, TimeBucket};
use crate::record_source::{FetchWarning, RecordSource};
use crate::record_types::{RecordTypeRegistry, RecordTypeSpec, UnknownRecordType};
use crate::store::{query_range, StoreError, StoreFactory, UpsertStrategy};
use crate::time_window::TimeWindow;
use crate::upsert_pool::{UpsertPool, DEFAULT_CONCURRENCY};
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error(transparent)]
    UnknownRecordType(#[from] UnknownRecordType),
    #[error("Could not connect to store: {0}")]
    Connect(StoreError),
    #[error("Failed to load stored buckets for {record_type}: {source}")]
    StoredQuery {
        record_type: String,
        source: StoreError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Re-upsert every computed bucket without reading the store first.
    pub force: bool,
    pub concurrency: usize,
    /// Run the counting self-checks and log their result.
    pub verbose: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            force: false,
            concurrency: DEFAULT_CONCURRENCY,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateSummary {
    pub record_type: String,
    pub computed: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
    pub unparsable: usize,
    pub fetch_warnings: Vec<FetchWarning>,
}

impl fmt::Display for UpdateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} computed, {} updated, {} skipped, {} errors",
            self.record_type, self.computed, self.updated, self.skipped, self.errors
        )?;
        if self.unparsable > 0 {
            write!(f, ", {} unparsable", self.unparsable)?;
        }
        if !self.fetch_warnings.is_empty() {
            write!(f, " (partial fetch: {} warnings)", self.fetch_warnings.len())?;
        }
        Ok(())
    }
}

/// Result of `update_all` for one record type.
#[derive(Debug)]
pub struct RecordTypeResult {
    pub record_type: String,
    pub result: Result<UpdateSummary, UpdateError>,
}

/// Exit code for an `update_all` run.
///
/// 2 when any record type failed before writing, 0 otherwise. Individual
/// upsert errors only show in the summary lines.
pub fn exit_code(results: &[RecordTypeResult]) -> u8 {
    if results.iter().any(|entry| entry.result.is_err()) {
        2
    } else {
        0
    }
}

/// Newest bucket first; among equal starts, finer resolutions first.
pub fn dispatch_order(buckets: &mut [TimeBucket]) {
    buckets.sort_by(|a, b| {
        b.bucket_start
            .cmp(&a.bucket_start)
            .then(a.size_minutes.cmp(&b.size_minutes))
    });
}

/// Split computed buckets into those needing a write and the skipped count.
///
/// A bucket is unchanged when a stored row with the same key has the same
/// count and the same completeness.
pub fn changed_buckets(computed: Vec<TimeBucket>, stored: &[TimeBucket]) -> (Vec<TimeBucket>, usize) {
    let stored: HashMap<String, &TimeBucket> = stored
        .iter()
        .map(|bucket| (bucket.composite_key(), bucket))
        .collect();

    let mut skipped = 0;
    let changed = computed
        .into_iter()
        .filter(|bucket| match stored.get(&bucket.composite_key()) {
            Some(existing) if existing.count == bucket.count && existing.complete == bucket.complete => {
                skipped += 1;
                false
            }
            _ => true,
        })
        .collect();

    (changed, skipped)
}

pub struct AggregationUpdater {
    source: RecordSource,
    counter: BucketCounter,
    stores: Arc<dyn StoreFactory>,
    strategy: UpsertStrategy,
}

impl AggregationUpdater {
    pub fn new(
        source: RecordSource,
        counter: BucketCounter,
        stores: Arc<dyn StoreFactory>,
        strategy: UpsertStrategy,
    ) -> Self {
        Self {
            source,
            counter,
            stores,
            strategy,
        }
    }

    pub async fn update(
        &self,
        spec: &RecordTypeSpec,
        account_id: &str,
        window: &TimeWindow,
        options: UpdateOptions,
    ) -> Result<UpdateSummary, UpdateError> {
        let window = &self.counter.resolutions().covering(window);
        log::debug!("📐 {}: counting whole buckets over {}", spec.name, window);

        let outcome = self.source.fetch(spec, account_id, window).await;
        let counted = self
            .counter
            .count(&outcome.records, account_id, &spec.name, Utc::now());

        if options.verbose {
            let problems = counted.self_check(self.counter.resolutions());
            if problems.is_empty() {
                log::debug!(
                    "🔍 {}: self-check passed for {} records in {} buckets",
                    spec.name,
                    counted.counted,
                    counted.len()
                );
            } else {
                for problem in &problems {
                    log::warn!("⚠️  {}: self-check failed: {}", spec.name, problem);
                }
            }
        }

        let mut summary = UpdateSummary {
            record_type: spec.name.clone(),
            computed: counted.len(),
            unparsable: counted.unparsable,
            fetch_warnings: outcome.warnings,
            ..Default::default()
        };

        let (mut pending, skipped) = if options.force {
            (counted.buckets, 0)
        } else {
            let store = self.stores.connect().map_err(UpdateError::Connect)?;
            let stored = query_range(store.as_ref(), account_id, &spec.name, window)
                .await
                .map_err(|source| UpdateError::StoredQuery {
                    record_type: spec.name.clone(),
                    source,
                })?;
            changed_buckets(counted.buckets, &stored)
        };
        summary.skipped = skipped;

        dispatch_order(&mut pending);
        let pool = UpsertPool::new(Arc::clone(&self.stores), self.strategy, options.concurrency);
        let pooled = pool.run(pending).await;
        summary.updated = pooled.updated;
        summary.errors = pooled.errors;

        if summary.errors > 0 {
            log::warn!("⚠️  {}", summary);
        } else {
            log::info!("✅ {}", summary);
        }

        Ok(summary)
    }

    /// Update each selected record type in sequence. A record type that fails
    /// fast is reported and the rest still run.
    pub async fn update_all(
        &self,
        registry: &RecordTypeRegistry,
        selector: &str,
        account_id: &str,
        window: &TimeWindow,
        options: UpdateOptions,
    ) -> Result<Vec<RecordTypeResult>, UnknownRecordType> {
        let specs = registry.select(selector)?;
        let total = specs.len();
        let mut results = Vec::with_capacity(total);

        for (index, spec) in specs.into_iter().enumerate() {
            log::info!("📊 [{}/{}] Updating {} over {}", index + 1, total, spec.name, window);
            let result = self.update(spec, account_id, window, options).await;
            if let Err(e) = &result {
                log::error!("❌ {}: {}", spec.name, e);
            }
            results.push(RecordTypeResult {
                record_type: spec.name.clone(),
                result,
            });
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn bucket(start: &str, size: u32, count: u64) -> TimeBucket {
        TimeBucket::new("acct", "items", at(start), size, count, at("2024-11-19T15:00:00Z"))
    }

    #[test]
    fn test_dispatch_order_newest_first() {
        let mut buckets = vec![
            bucket("2024-11-19T14:00:00Z", 60, 1),
            bucket("2024-11-19T14:30:00Z", 15, 1),
            bucket("2024-11-19T14:30:00Z", 1, 1),
            bucket("2024-11-19T14:31:00Z", 1, 1),
        ];
        dispatch_order(&mut buckets);

        let keys: Vec<String> = buckets.iter().map(TimeBucket::composite_key).collect();
        assert_eq!(
            keys,
            vec![
                "items#2024-11-19T14:31:00Z#1",
                "items#2024-11-19T14:30:00Z#1",
                "items#2024-11-19T14:30:00Z#15",
                "items#2024-11-19T14:00:00Z#60",
            ]
        );
    }

    #[test]
    fn test_changed_buckets_skips_identical() {
        let stored = vec![
            bucket("2024-11-19T14:30:00Z", 1, 3),
            bucket("2024-11-19T14:30:00Z", 5, 2),
        ];
        let computed = vec![
            bucket("2024-11-19T14:30:00Z", 1, 3),
            bucket("2024-11-19T14:30:00Z", 5, 3),
            bucket("2024-11-19T14:30:00Z", 15, 3),
        ];

        let (changed, skipped) = changed_buckets(computed, &stored);

        assert_eq!(skipped, 1);
        let sizes: Vec<u32> = changed.iter().map(|b| b.size_minutes).collect();
        assert_eq!(sizes, vec![5, 15]);
    }

    #[test]
    fn test_completion_counts_as_change() {
        let provisional = TimeBucket::new(
            "acct",
            "items",
            at("2024-11-19T14:00:00Z"),
            60,
            4,
            at("2024-11-19T14:30:00Z"),
        );
        let mut finished = provisional.clone();
        finished.complete = true;

        let (changed, skipped) = changed_buckets(vec![finished], &[provisional]);
        assert_eq!(skipped, 0);
        assert_eq!(changed.len(), 1);
    }

    #[test]
    fn test_summary_display() {
        let summary = UpdateSummary {
            record_type: "items".into(),
            computed: 4,
            updated: 3,
            skipped: 1,
            unparsable: 2,
            ..Default::default()
        };
        assert_eq!(
            summary.to_string(),
            "items: 4 computed, 3 updated, 1 skipped, 0 errors, 2 unparsable"
        );
    }

    #[test]
    fn test_exit_code_flags_failed_record_types() {
        let ok = |name: &str| RecordTypeResult {
            record_type: name.into(),
            result: Ok(UpdateSummary {
                record_type: name.into(),
                errors: 1,
                ..Default::default()
            }),
        };
        let failed = RecordTypeResult {
            record_type: "tasks".into(),
            result: Err(UpdateError::Connect(StoreError::Connect("refused".into()))),
        };

        assert_eq!(exit_code(&[]), 0);
        assert_eq!(exit_code(&[ok("items"), ok("scoreResults")]), 0);
        assert_eq!(exit_code(&[ok("items"), failed]), 2);
    }
}
