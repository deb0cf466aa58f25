//! Time window resolution for metric commands
//!
//! Turns the user-facing `--hours`, `--start` and `--end` arguments into a
//! concrete UTC interval. All parsing goes through `parse_time`, which accepts
//! absolute timestamps (RFC 3339, naive date-times interpreted as UTC, bare
//! dates) as well as relative expressions like `2 hours ago`, `90m ago`,
//! `-1d`, `yesterday` and `now`.
//!
//! `resolve_at` is the pure core; `resolve` binds it to the wall clock.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeWindowError {
    #[error("Could not parse time '{0}'")]
    TimeParse(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Half-open UTC interval `[start, end)` a command operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, TimeWindowError> {
        if end < start {
            return Err(TimeWindowError::InvalidArgument(format!(
                "end time {} is before start time {}",
                end.to_rfc3339(),
                start.to_rfc3339()
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} → {}",
            self.start.format("%Y-%m-%d %H:%M:%S UTC"),
            self.end.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

/// Resolve a window against the current wall clock.
pub fn resolve(
    hours: Option<f64>,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<TimeWindow, TimeWindowError> {
    resolve_at(Utc::now(), hours, start, end)
}

/// Resolve a window against an explicit `now`.
///
/// Precedence: `hours`, then `start`/`end`, then the default of the previous
/// and current calendar hour.
pub fn resolve_at(
    now: DateTime<Utc>,
    hours: Option<f64>,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<TimeWindow, TimeWindowError> {
    if let Some(hours) = hours {
        if !hours.is_finite() || hours <= 0.0 {
            return Err(TimeWindowError::InvalidArgument(format!(
                "hours must be positive, got {}",
                hours
            )));
        }
        let start = Duration::try_milliseconds((hours * 3_600_000.0).round() as i64)
            .and_then(|span| now.checked_sub_signed(span))
            .ok_or_else(|| {
                TimeWindowError::InvalidArgument(format!("{} hours reaches past the supported range", hours))
            })?;
        return TimeWindow::new(start, now);
    }

    match (start, end) {
        (Some(start), Some(end)) => {
            let start = parse_time(start, now)?;
            let end = parse_time(end, now)?;
            TimeWindow::new(start, end)
        }
        (Some(start), None) => TimeWindow::new(parse_time(start, now)?, now),
        (None, Some(end)) => Err(TimeWindowError::InvalidArgument(format!(
            "end time '{}' given without a start time",
            end
        ))),
        (None, None) => {
            let hour = floor_hour(now);
            TimeWindow::new(hour - Duration::hours(1), hour + Duration::hours(1))
        }
    }
}

/// Truncate an instant to the start of its hour.
pub fn floor_hour(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        .with_nanosecond(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_minute(0))
        .unwrap_or(instant)
}

/// Parse a free-form time argument relative to `now`.
pub fn parse_time(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, TimeWindowError> {
    let trimmed = input.trim();
    parse_relative(trimmed, now)
        .or_else(|| parse_timestamp(trimmed))
        .ok_or_else(|| TimeWindowError::TimeParse(input.to_string()))
}

/// Parse an absolute timestamp and normalize it to UTC.
///
/// Used for both user arguments and record timestamp fields. Naive values are
/// taken to already be UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(value, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn parse_relative(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let lower = value.to_ascii_lowercase();
    let midnight = |t: DateTime<Utc>| {
        t.date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive))
    };

    match lower.as_str() {
        "now" => return Some(now),
        "today" => return midnight(now),
        "yesterday" => return midnight(now - Duration::days(1)),
        _ => {}
    }

    let body = if let Some(body) = lower.strip_suffix(" ago") {
        body.trim()
    } else if let Some(body) = lower.strip_prefix('-') {
        body.trim()
    } else {
        return None;
    };

    parse_span(body).and_then(|span| now.checked_sub_signed(span))
}

/// Parse `2 hours`, `an hour`, `90m` or `1d` into a duration.
fn parse_span(body: &str) -> Option<Duration> {
    let tokens: Vec<&str> = body.split_whitespace().collect();
    let (amount, unit) = match tokens.as_slice() {
        [amount, unit] => {
            let amount = match *amount {
                "a" | "an" => 1,
                other => other.parse::<i64>().ok()?,
            };
            (amount, *unit)
        }
        [compact] => {
            let split = compact.find(|c: char| !c.is_ascii_digit())?;
            let (digits, unit) = compact.split_at(split);
            (digits.parse::<i64>().ok()?, unit)
        }
        _ => return None,
    };

    if amount < 0 {
        return None;
    }

    let unit_seconds = match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
        "d" | "day" | "days" => 86_400,
        "w" | "week" | "weeks" => 604_800,
        _ => return None,
    };

    amount.checked_mul(unit_seconds).and_then(Duration::try_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_default_window_covers_previous_and_current_hour() {
        let now = at("2024-11-19T14:37:12Z");
        let window = resolve_at(now, None, None, None).unwrap();

        assert_eq!(window.start, at("2024-11-19T13:00:00Z"));
        assert_eq!(window.end, at("2024-11-19T15:00:00Z"));
    }

    #[test]
    fn test_hours_window() {
        let now = at("2024-11-19T14:37:00Z");
        let window = resolve_at(now, Some(2.0), None, None).unwrap();

        assert_eq!(window.start, at("2024-11-19T12:37:00Z"));
        assert_eq!(window.end, now);

        let half = resolve_at(now, Some(0.5), None, None).unwrap();
        assert_eq!(half.start, at("2024-11-19T14:07:00Z"));
    }

    #[test]
    fn test_non_positive_hours_rejected() {
        let now = Utc::now();
        assert!(matches!(
            resolve_at(now, Some(0.0), None, None),
            Err(TimeWindowError::InvalidArgument(_))
        ));
        assert!(matches!(
            resolve_at(now, Some(-3.0), None, None),
            Err(TimeWindowError::InvalidArgument(_))
        ));
        assert!(matches!(
            resolve_at(now, Some(f64::NAN), None, None),
            Err(TimeWindowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_huge_hours_rejected() {
        let now = at("2024-11-19T14:37:00Z");
        for hours in [1e12, 1e300, f64::MAX] {
            assert!(matches!(
                resolve_at(now, Some(hours), None, None),
                Err(TimeWindowError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_out_of_range_relative_times_rejected() {
        let now = at("2024-11-19T14:37:00Z");
        for input in [
            "10000000000000 weeks ago",
            "100000000000 days ago",
            "9000000000000000 s ago",
            "-9223372036854775807s",
        ] {
            assert_eq!(
                parse_time(input, now),
                Err(TimeWindowError::TimeParse(input.to_string()))
            );
        }
        assert!(matches!(
            resolve_at(now, None, Some("100000000000 days ago"), None),
            Err(TimeWindowError::TimeParse(_))
        ));
    }

    #[test]
    fn test_window_end_is_exclusive() {
        let window = TimeWindow::new(at("2024-11-19T13:00:00Z"), at("2024-11-19T15:00:00Z")).unwrap();

        assert!(window.contains(at("2024-11-19T13:00:00Z")));
        assert!(window.contains(at("2024-11-19T14:59:59.999Z")));
        assert!(!window.contains(at("2024-11-19T15:00:00Z")));
        assert!(!window.contains(at("2024-11-19T12:59:59Z")));
    }

    #[test]
    fn test_start_and_end_normalized_to_utc() {
        let now = at("2024-11-19T20:00:00Z");
        let window = resolve_at(
            now,
            None,
            Some("2024-11-19T10:00:00+02:00"),
            Some("2024-11-19 12:30"),
        )
        .unwrap();

        assert_eq!(window.start, at("2024-11-19T08:00:00Z"));
        assert_eq!(window.end, at("2024-11-19T12:30:00Z"));
    }

    #[test]
    fn test_end_before_start_rejected() {
        let now = Utc::now();
        let result = resolve_at(now, None, Some("2024-11-19"), Some("2024-11-18"));
        assert!(matches!(result, Err(TimeWindowError::InvalidArgument(_))));
    }

    #[test]
    fn test_start_only_runs_until_now() {
        let now = at("2024-11-19T14:00:00Z");
        let window = resolve_at(now, None, Some("3 hours ago"), None).unwrap();

        assert_eq!(window.start, at("2024-11-19T11:00:00Z"));
        assert_eq!(window.end, now);
    }

    #[test]
    fn test_end_without_start_rejected() {
        let result = resolve_at(Utc::now(), None, None, Some("now"));
        assert!(matches!(result, Err(TimeWindowError::InvalidArgument(_))));
    }

    #[test]
    fn test_unparsable_time_names_input() {
        let result = resolve_at(Utc::now(), None, Some("next blue moon"), None);
        assert_eq!(
            result,
            Err(TimeWindowError::TimeParse("next blue moon".to_string()))
        );
    }

    #[test]
    fn test_relative_expressions() {
        let now = at("2024-11-19T14:37:00Z");

        assert_eq!(parse_time("now", now).unwrap(), now);
        assert_eq!(parse_time("90m ago", now).unwrap(), at("2024-11-19T13:07:00Z"));
        assert_eq!(parse_time("an hour ago", now).unwrap(), at("2024-11-19T13:37:00Z"));
        assert_eq!(parse_time("-1d", now).unwrap(), at("2024-11-18T14:37:00Z"));
        assert_eq!(parse_time("2 weeks ago", now).unwrap(), at("2024-11-05T14:37:00Z"));
        assert_eq!(parse_time("Yesterday", now).unwrap(), at("2024-11-18T00:00:00Z"));
        assert_eq!(parse_time("today", now).unwrap(), at("2024-11-19T00:00:00Z"));
    }

    #[test]
    fn test_parse_timestamp_variants() {
        assert_eq!(
            parse_timestamp("2024-11-19T14:00:00.123Z").unwrap(),
            at("2024-11-19T14:00:00.123Z")
        );
        assert_eq!(
            parse_timestamp("2024-11-19T14:00:00").unwrap(),
            at("2024-11-19T14:00:00Z")
        );
        assert_eq!(
            parse_timestamp("2024-11-19").unwrap(),
            at("2024-11-19T00:00:00Z")
        );
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("not a date").is_none());
    }

    #[test]
    fn test_floor_hour() {
        assert_eq!(
            floor_hour(at("2024-11-19T14:59:59.999Z")),
            at("2024-11-19T14:00:00Z")
        );
    }
}
