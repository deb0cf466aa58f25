//! Paginated record fetching
//!
//! ```text
//! RecordPageQuery (GraphQL | SQLite mirror | memory)
//!     ↓  one page per call, opaque continuation token
//! RecordSource::fetch  (loop until no token, sub-filter, timestamp policy)
//!     ↓
//! FetchOutcome { records: Vec<RawRecord>, warnings }
//! ```
//!
//! Backends may treat the window end as inclusive (the GraphQL `between`
//! operator does). Records whose timestamp falls outside the half-open window
//! are dropped here, so every backend yields the same set.
//!
//! A page that fails mid-pagination does not discard the pages already read.
//! The records gathered so far are returned and the failure is reported as a
//! warning, so one bad page cannot blank out a whole metrics window.

pub mod graphql;
pub mod memory;
pub mod sqlite;

pub use graphql::GraphqlRecordQuery;
pub use memory::MemoryRecordQuery;
pub use sqlite::SqliteRecordQuery;

use crate::record_types::{RecordFilter, RecordTypeSpec, TimeIndexField, TimestampPolicy};
use crate::time_window::TimeWindow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Upper bound on items per page requested from the remote store.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("Remote query error: {0}")]
    Remote(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Could not decode response: {0}")]
    Decode(String),
    #[error("Database error: {0}")]
    Database(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Decode(err.to_string())
    }
}

impl From<rusqlite::Error> for FetchError {
    fn from(err: rusqlite::Error) -> Self {
        FetchError::Database(err.to_string())
    }
}

/// A record reduced to what bucketing needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub id: String,
    /// `None` when no field of the timestamp policy parsed.
    pub timestamp: Option<DateTime<Utc>>,
}

impl RawRecord {
    pub fn from_document(document: &Value, policy: &TimestampPolicy) -> Self {
        let id = match document.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => "<unknown>".to_string(),
        };

        Self {
            id,
            timestamp: policy.timestamp(document),
        }
    }
}

/// One page request of the remote list-by-index protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub model: String,
    pub index_query: String,
    pub time_index: TimeIndexField,
    pub account_id: String,
    pub window: TimeWindow,
    pub limit: usize,
    pub next_token: Option<String>,
    pub filter: Option<RecordFilter>,
}

impl PageRequest {
    pub fn first(spec: &RecordTypeSpec, account_id: &str, window: &TimeWindow, limit: usize) -> Self {
        Self {
            model: spec.model.clone(),
            index_query: spec.index_query.clone(),
            time_index: spec.time_index,
            account_id: account_id.to_string(),
            window: *window,
            limit,
            next_token: None,
            filter: spec.filter.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPage {
    pub items: Vec<Value>,
    /// `None` once the result set is exhausted.
    pub next_token: Option<String>,
}

/// Backend trait for the remote paginated list query.
#[async_trait]
pub trait RecordPageQuery: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<RecordPage, FetchError>;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}

/// A page that failed and ended pagination early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchWarning {
    pub record_type: String,
    /// 1-based number of the page that failed.
    pub page: usize,
    pub error: FetchError,
}

impl fmt::Display for FetchWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: page {} failed, keeping earlier pages ({})",
            self.record_type, self.page, self.error
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    pub records: Vec<RawRecord>,
    pub pages: usize,
    /// Items dropped by the record type's sub-filter.
    pub filtered_out: usize,
    /// Items whose timestamp lies outside the requested window.
    pub outside_window: usize,
    pub warnings: Vec<FetchWarning>,
}

impl FetchOutcome {
    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Drives a `RecordPageQuery` through every page of a window.
#[derive(Clone)]
pub struct RecordSource {
    query: Arc<dyn RecordPageQuery>,
    page_size: usize,
}

impl RecordSource {
    pub fn new(query: Arc<dyn RecordPageQuery>) -> Self {
        Self {
            query,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub async fn fetch(
        &self,
        spec: &RecordTypeSpec,
        account_id: &str,
        window: &TimeWindow,
    ) -> FetchOutcome {
        let mut request = PageRequest::first(spec, account_id, window, self.page_size);
        let mut outcome = FetchOutcome::default();

        log::debug!(
            "📥 Fetching {} via {} ({} index, {})",
            spec.name,
            self.query.backend_type(),
            spec.time_index.field_name(),
            window
        );

        loop {
            let page = match self.query.fetch_page(&request).await {
                Ok(page) => page,
                Err(error) => {
                    let warning = FetchWarning {
                        record_type: spec.name.clone(),
                        page: outcome.pages + 1,
                        error,
                    };
                    log::warn!("⚠️  {}", warning);
                    outcome.warnings.push(warning);
                    break;
                }
            };

            outcome.pages += 1;
            for item in &page.items {
                if !spec.accepts(item) {
                    outcome.filtered_out += 1;
                    continue;
                }
                let record = RawRecord::from_document(item, &spec.timestamp_policy);
                match record.timestamp {
                    Some(timestamp) if !window.contains(timestamp) => outcome.outside_window += 1,
                    _ => outcome.records.push(record),
                }
            }

            match page.next_token.filter(|token| !token.is_empty()) {
                None => break,
                Some(token) if request.next_token.as_deref() == Some(token.as_str()) => {
                    let warning = FetchWarning {
                        record_type: spec.name.clone(),
                        page: outcome.pages + 1,
                        error: FetchError::Remote(format!(
                            "continuation token '{}' returned twice",
                            token
                        )),
                    };
                    log::warn!("⚠️  {}", warning);
                    outcome.warnings.push(warning);
                    break;
                }
                Some(token) => request.next_token = Some(token),
            }
        }

        log::debug!(
            "📥 {}: {} records over {} pages ({} filtered out, {} outside window)",
            spec.name,
            outcome.records.len(),
            outcome.pages,
            outcome.filtered_out,
            outcome.outside_window
        );

        outcome
    }
}
