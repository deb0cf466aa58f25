//! Read-only comparison of recomputed buckets against the store
//!
//! Buckets are matched by composite key. A key present on only one side
//! compares against 0, so a missing row shows up as a positive delta and an
//! orphaned row as a negative one.
//!
//! Like the updater, the comparison runs over the window widened to whole
//! buckets, so edge buckets are neither recounted from a partial slice nor
//! dropped from the stored side.

use crate::buckets::{BucketCounter, TimeBucket};
use crate::record_source::{FetchWarning, RecordSource};
use crate::record_types::{RecordTypeRegistry, RecordTypeSpec, UnknownRecordType};
use crate::store::{query_range, StoreError, StoreFactory};
use crate::time_window::TimeWindow;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("Failed to load stored buckets: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketDiff {
    pub key: String,
    pub size_minutes: u32,
    pub bucket_start: DateTime<Utc>,
    pub computed: u64,
    pub stored: u64,
    /// `computed - stored`
    pub delta: i64,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub record_type: String,
    /// One entry per key seen on either side, ordered by key.
    pub diffs: Vec<BucketDiff>,
    pub fetch_warnings: Vec<FetchWarning>,
    pub unparsable: usize,
}

impl VerifyReport {
    pub fn mismatches(&self) -> impl Iterator<Item = &BucketDiff> {
        self.diffs.iter().filter(|diff| diff.delta != 0)
    }

    pub fn is_consistent(&self) -> bool {
        self.mismatches().next().is_none()
    }
}

/// Result of `verify_all` for one record type.
#[derive(Debug)]
pub struct RecordTypeVerification {
    pub record_type: String,
    pub result: Result<VerifyReport, VerifyError>,
}

/// Exit code for a `verify_all` run.
///
/// 2 when any record type could not be verified, 1 when any bucket differs,
/// 0 when everything matched.
pub fn exit_code(results: &[RecordTypeVerification]) -> u8 {
    if results.iter().any(|entry| entry.result.is_err()) {
        return 2;
    }
    let mismatched = results
        .iter()
        .filter_map(|entry| entry.result.as_ref().ok())
        .any(|report| !report.is_consistent());
    if mismatched {
        1
    } else {
        0
    }
}

/// Diff computed against stored buckets by composite key.
pub fn diff_buckets(computed: &[TimeBucket], stored: &[TimeBucket]) -> Vec<BucketDiff> {
    let mut rows: BTreeMap<String, BucketDiff> = BTreeMap::new();

    for (bucket, is_computed) in computed
        .iter()
        .map(|b| (b, true))
        .chain(stored.iter().map(|b| (b, false)))
    {
        let entry = rows
            .entry(bucket.composite_key())
            .or_insert_with_key(|key| BucketDiff {
                key: key.clone(),
                size_minutes: bucket.size_minutes,
                bucket_start: bucket.bucket_start,
                computed: 0,
                stored: 0,
                delta: 0,
            });
        if is_computed {
            entry.computed += bucket.count;
        } else {
            entry.stored += bucket.count;
        }
    }

    rows.into_values()
        .map(|mut diff| {
            diff.delta = diff.computed as i64 - diff.stored as i64;
            diff
        })
        .collect()
}

pub struct ConsistencyVerifier {
    source: RecordSource,
    counter: BucketCounter,
    stores: Arc<dyn StoreFactory>,
}

impl ConsistencyVerifier {
    pub fn new(source: RecordSource, counter: BucketCounter, stores: Arc<dyn StoreFactory>) -> Self {
        Self {
            source,
            counter,
            stores,
        }
    }

    pub async fn verify(
        &self,
        spec: &RecordTypeSpec,
        account_id: &str,
        window: &TimeWindow,
    ) -> Result<VerifyReport, VerifyError> {
        let window = &self.counter.resolutions().covering(window);
        let store = self.stores.connect()?;

        let outcome = self.source.fetch(spec, account_id, window).await;
        let computed = self
            .counter
            .count(&outcome.records, account_id, &spec.name, Utc::now());
        let stored = query_range(store.as_ref(), account_id, &spec.name, window).await?;

        let report = VerifyReport {
            record_type: spec.name.clone(),
            diffs: diff_buckets(&computed.buckets, &stored),
            fetch_warnings: outcome.warnings,
            unparsable: computed.unparsable,
        };

        let mismatches = report.mismatches().count();
        if mismatches == 0 {
            log::info!(
                "✅ {}: {} buckets consistent ({} records)",
                spec.name,
                report.diffs.len(),
                computed.counted
            );
        } else {
            log::warn!(
                "❌ {}: {} of {} buckets differ",
                spec.name,
                mismatches,
                report.diffs.len()
            );
            for diff in report.mismatches() {
                log::warn!(
                    "   {} computed={} stored={} delta={:+}",
                    diff.key,
                    diff.computed,
                    diff.stored,
                    diff.delta
                );
            }
        }

        Ok(report)
    }

    /// Verify each selected record type in turn. A record type whose stored
    /// buckets cannot be read is reported and the rest still run.
    pub async fn verify_all(
        &self,
        registry: &RecordTypeRegistry,
        selector: &str,
        account_id: &str,
        window: &TimeWindow,
    ) -> Result<Vec<RecordTypeVerification>, UnknownRecordType> {
        let specs = registry.select(selector)?;
        let total = specs.len();
        let mut results = Vec::with_capacity(total);

        for (index, spec) in specs.into_iter().enumerate() {
            log::info!("🔍 [{}/{}] Verifying {} over {}", index + 1, total, spec.name, window);
            let result = self.verify(spec, account_id, window).await;
            if let Err(e) = &result {
                log::error!("❌ {}: {}", spec.name, e);
            }
            results.push(RecordTypeVerification {
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
    use crate::time_window::parse_timestamp;

    fn at(s: &str) -> DateTime<Utc> {
        parse_timestamp(s).unwrap()
    }

    fn bucket(start: &str, size: u32, count: u64) -> TimeBucket {
        TimeBucket::new("acct", "items", at(start), size, count, at("2024-11-19T15:00:00Z"))
    }

    #[test]
    fn test_diff_reports_delta() {
        let diffs = diff_buckets(
            &[bucket("2024-11-19T14:30:00Z", 5, 7)],
            &[bucket("2024-11-19T14:30:00Z", 5, 5)],
        );

        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].key, "items#2024-11-19T14:30:00Z#5");
        assert_eq!(diffs[0].delta, 2);
    }

    #[test]
    fn test_diff_one_sided_keys() {
        let diffs = diff_buckets(
            &[bucket("2024-11-19T14:30:00Z", 1, 3)],
            &[bucket("2024-11-19T14:00:00Z", 60, 4)],
        );

        let by_key: BTreeMap<&str, i64> = diffs.iter().map(|d| (d.key.as_str(), d.delta)).collect();
        assert_eq!(by_key["items#2024-11-19T14:30:00Z#1"], 3);
        assert_eq!(by_key["items#2024-11-19T14:00:00Z#60"], -4);
    }

    #[test]
    fn test_report_consistency() {
        let mut report = VerifyReport {
            record_type: "items".into(),
            diffs: diff_buckets(
                &[bucket("2024-11-19T14:30:00Z", 1, 3)],
                &[bucket("2024-11-19T14:30:00Z", 1, 3)],
            ),
            ..Default::default()
        };
        assert!(report.is_consistent());

        report.diffs[0].delta = 1;
        assert!(!report.is_consistent());
        assert_eq!(report.mismatches().count(), 1);
    }

    #[test]
    fn test_exit_code() {
        let report = |stored: u64| VerifyReport {
            record_type: "items".into(),
            diffs: diff_buckets(
                &[bucket("2024-11-19T14:30:00Z", 5, 7)],
                &[bucket("2024-11-19T14:30:00Z", 5, stored)],
            ),
            ..Default::default()
        };
        let entry = |result| RecordTypeVerification {
            record_type: "items".into(),
            result,
        };

        assert_eq!(exit_code(&[]), 0);
        assert_eq!(exit_code(&[entry(Ok(report(7)))]), 0);
        assert_eq!(exit_code(&[entry(Ok(report(7))), entry(Ok(report(5)))]), 1);
        assert_eq!(
            exit_code(&[
                entry(Ok(report(5))),
                entry(Err(VerifyError::Store(StoreError::Backend("disk I/O error".into())))),
            ]),
            2
        );
    }
}
