//! Multi-resolution time bucket counting
//!
//! A single pass over the fetched records assigns every record with a usable
//! timestamp to its aligned bucket at each tracked resolution:
//!
//! ```text
//! bucket_start = epoch + floor(minutes_since_epoch(t) / size) * size
//! ```
//!
//! Buckets of different sizes share the epoch as their alignment origin, so a
//! finer resolution that divides a coarser one nests exactly inside it. That
//! gives two cheap self-checks: every resolution sums to the number of counted
//! records, and the fine buckets inside a coarse bucket sum to its count.

use crate::record_source::RawRecord;
use crate::time_window::TimeWindow;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_RESOLUTIONS: [u32; 4] = [1, 5, 15, 60];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid resolutions: {0}")]
pub struct InvalidResolutions(pub String);

/// Bucket sizes in minutes, sorted ascending and deduplicated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolutions(Vec<u32>);

impl Resolutions {
    pub fn new(sizes: impl IntoIterator<Item = u32>) -> Result<Self, InvalidResolutions> {
        let mut sizes: Vec<u32> = sizes.into_iter().collect();
        if sizes.is_empty() {
            return Err(InvalidResolutions("at least one resolution is required".into()));
        }
        if sizes.contains(&0) {
            return Err(InvalidResolutions("resolutions must be positive".into()));
        }
        sizes.sort_unstable();
        sizes.dedup();
        Ok(Self(sizes))
    }

    /// Parse a comma-separated list such as `1,5,15,60`.
    pub fn parse(value: &str) -> Result<Self, InvalidResolutions> {
        let sizes = value
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u32>()
                    .map_err(|_| InvalidResolutions(format!("'{}' is not a number of minutes", part)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(sizes)
    }

    pub fn sizes(&self) -> &[u32] {
        &self.0
    }

    /// Pairs `(fine, coarse)` where `fine` divides `coarse`.
    pub fn nested_pairs(&self) -> Vec<(u32, u32)> {
        let mut pairs = Vec::new();
        for (i, &fine) in self.0.iter().enumerate() {
            for &coarse in &self.0[i + 1..] {
                if coarse % fine == 0 {
                    pairs.push((fine, coarse));
                }
            }
        }
        pairs
    }

    /// Widen `window` outward to whole buckets of every resolution.
    ///
    /// Counting over the widened window sees every record of each bucket it
    /// produces, so no edge bucket is built from a partial slice.
    pub fn covering(&self, window: &TimeWindow) -> TimeWindow {
        let mut covered = *window;
        loop {
            let mut widened = covered;
            for &size in &self.0 {
                widened.start = align(widened.start, size);
                widened.end = align_up(widened.end, size);
            }
            if widened == covered {
                return covered;
            }
            covered = widened;
        }
    }
}

impl Default for Resolutions {
    fn default() -> Self {
        Self(DEFAULT_RESOLUTIONS.to_vec())
    }
}

/// Deterministic storage identity of a bucket.
///
/// Existing rows were written with this exact byte format, so it must not
/// change: `{record_type}#{YYYY-MM-DDTHH:MM:SS}Z#{size_minutes}`.
pub fn composite_key(record_type: &str, bucket_start: DateTime<Utc>, size_minutes: u32) -> String {
    format!(
        "{}#{}Z#{}",
        record_type,
        bucket_start.format("%Y-%m-%dT%H:%M:%S"),
        size_minutes
    )
}

/// Align an instant down to the start of its `size_minutes` bucket.
pub fn align(instant: DateTime<Utc>, size_minutes: u32) -> DateTime<Utc> {
    let start_minute = aligned_minute(instant.timestamp().div_euclid(60), size_minutes);
    minute_to_instant(start_minute)
}

/// First bucket boundary at or after `instant`.
pub fn align_up(instant: DateTime<Utc>, size_minutes: u32) -> DateTime<Utc> {
    let floor = align(instant, size_minutes);
    if floor == instant {
        return floor;
    }
    floor
        .checked_add_signed(Duration::minutes(i64::from(size_minutes)))
        .unwrap_or(floor)
}

fn aligned_minute(minutes_since_epoch: i64, size_minutes: u32) -> i64 {
    let size = i64::from(size_minutes);
    minutes_since_epoch.div_euclid(size) * size
}

fn minute_to_instant(minute: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(minute * 60, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBucket {
    pub account_id: String,
    pub record_type: String,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub size_minutes: u32,
    pub count: u64,
    pub complete: bool,
}

impl TimeBucket {
    pub fn new(
        account_id: impl Into<String>,
        record_type: impl Into<String>,
        bucket_start: DateTime<Utc>,
        size_minutes: u32,
        count: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let bucket_end = bucket_start + Duration::minutes(i64::from(size_minutes));
        Self {
            account_id: account_id.into(),
            record_type: record_type.into(),
            bucket_start,
            bucket_end,
            size_minutes,
            count,
            complete: bucket_end <= now,
        }
    }

    pub fn composite_key(&self) -> String {
        composite_key(&self.record_type, self.bucket_start, self.size_minutes)
    }
}

/// Output of one counting pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketSet {
    /// Populated buckets, ordered by start then size.
    pub buckets: Vec<TimeBucket>,
    /// Records that were assigned to buckets.
    pub counted: usize,
    /// Records skipped for lack of a parseable timestamp.
    pub unparsable: usize,
}

impl BucketSet {
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn of_size(&self, size_minutes: u32) -> impl Iterator<Item = &TimeBucket> {
        self.buckets
            .iter()
            .filter(move |bucket| bucket.size_minutes == size_minutes)
    }

    /// Sum of counts across all buckets of one resolution.
    pub fn resolution_total(&self, size_minutes: u32) -> u64 {
        self.of_size(size_minutes).map(|bucket| bucket.count).sum()
    }

    /// Coarse buckets whose count differs from the sum of the fine buckets
    /// nested inside them, as `(coarse key, coarse count, fine sum)`.
    pub fn hierarchy_violations(&self, fine: u32, coarse: u32) -> Vec<(String, u64, u64)> {
        let mut nested: HashMap<DateTime<Utc>, u64> = HashMap::new();
        for bucket in self.of_size(fine) {
            *nested.entry(align(bucket.bucket_start, coarse)).or_insert(0) += bucket.count;
        }

        let mut violations = Vec::new();
        for bucket in self.of_size(coarse) {
            let fine_sum = nested.remove(&bucket.bucket_start).unwrap_or(0);
            if fine_sum != bucket.count {
                violations.push((bucket.composite_key(), bucket.count, fine_sum));
            }
        }
        for (start, fine_sum) in nested {
            violations.push((
                composite_key(&self.record_type_hint(), start, coarse),
                0,
                fine_sum,
            ));
        }
        violations
    }

    /// Run the counting self-checks and describe every failure.
    ///
    /// Empty when each resolution sums to `counted` and every nested pair of
    /// resolutions agrees.
    pub fn self_check(&self, resolutions: &Resolutions) -> Vec<String> {
        let mut problems = Vec::new();
        for &size in resolutions.sizes() {
            let total = self.resolution_total(size);
            if total != self.counted as u64 {
                problems.push(format!(
                    "{}-minute buckets sum to {} but {} records were counted",
                    size, total, self.counted
                ));
            }
        }
        for (fine, coarse) in resolutions.nested_pairs() {
            for (key, count, fine_sum) in self.hierarchy_violations(fine, coarse) {
                problems.push(format!(
                    "{} has count {} but its {}-minute buckets sum to {}",
                    key, count, fine, fine_sum
                ));
            }
        }
        problems
    }

    fn record_type_hint(&self) -> String {
        self.buckets
            .first()
            .map(|bucket| bucket.record_type.clone())
            .unwrap_or_default()
    }
}

/// Single-pass counter over a fixed set of resolutions.
#[derive(Debug, Clone, Default)]
pub struct BucketCounter {
    resolutions: Resolutions,
}

impl BucketCounter {
    pub fn new(resolutions: Resolutions) -> Self {
        Self { resolutions }
    }

    pub fn resolutions(&self) -> &Resolutions {
        &self.resolutions
    }

    pub fn count<'a, I>(
        &self,
        records: I,
        account_id: &str,
        record_type: &str,
        now: DateTime<Utc>,
    ) -> BucketSet
    where
        I: IntoIterator<Item = &'a RawRecord>,
    {
        let mut counts: HashMap<(i64, u32), u64> = HashMap::new();
        let mut counted = 0usize;
        let mut unparsable = 0usize;

        for record in records {
            let Some(timestamp) = record.timestamp else {
                unparsable += 1;
                log::debug!("Skipping record {} without a usable timestamp", record.id);
                continue;
            };

            let minute = timestamp.timestamp().div_euclid(60);
            for &size in self.resolutions.sizes() {
                *counts.entry((aligned_minute(minute, size), size)).or_insert(0) += 1;
            }
            counted += 1;
        }

        let mut buckets: Vec<TimeBucket> = counts
            .into_iter()
            .map(|((start_minute, size), count)| {
                TimeBucket::new(
                    account_id,
                    record_type,
                    minute_to_instant(start_minute),
                    size,
                    count,
                    now,
                )
            })
            .collect();
        buckets.sort_by(|a, b| {
            a.bucket_start
                .cmp(&b.bucket_start)
                .then(a.size_minutes.cmp(&b.size_minutes))
        });

        BucketSet {
            buckets,
            counted,
            unparsable,
        }
    }
}
