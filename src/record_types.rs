//! Record type registry
//!
//! Each countable record type names the upstream model it is read from, the
//! secondary time index the list query runs against, the ordered timestamp
//! fields used for bucketing, and an optional discriminator filter for derived
//! types (`predictionItems` are `items` created by a prediction, and so on).
//!
//! Types that query by `updatedAt` do so because the upstream store cannot
//! index them by creation time. A record updated several times inside the
//! window is returned, and counted, once per matching index entry. That
//! imprecision is accepted and kept visible here rather than corrected.

use crate::time_window::parse_timestamp;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown record type '{0}'")]
pub struct UnknownRecordType(pub String);

/// Secondary index a list query filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TimeIndexField {
    CreatedAt,
    UpdatedAt,
}

impl TimeIndexField {
    pub fn field_name(&self) -> &'static str {
        match self {
            TimeIndexField::CreatedAt => "createdAt",
            TimeIndexField::UpdatedAt => "updatedAt",
        }
    }
}

/// Ordered list of record fields tried when extracting a bucketing timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimestampPolicy {
    fields: Vec<String>,
}

impl TimestampPolicy {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// `createdAt`, falling back to `updatedAt`.
    pub fn created_then_updated() -> Self {
        Self::new(["createdAt", "updatedAt"])
    }

    /// `updatedAt`, falling back to `createdAt`.
    pub fn updated_then_created() -> Self {
        Self::new(["updatedAt", "createdAt"])
    }

    /// Timestamp of the first field, in order, whose value parses.
    ///
    /// A present but malformed field falls through to the next one.
    pub fn timestamp(&self, record: &Value) -> Option<DateTime<Utc>> {
        self.fields.iter().find_map(|field| {
            record
                .get(field)
                .and_then(Value::as_str)
                .and_then(parse_timestamp)
        })
    }
}

/// Equality filter on a discriminator field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFilter {
    pub field: String,
    pub equals: String,
}

impl RecordFilter {
    pub fn new(field: impl Into<String>, equals: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            equals: equals.into(),
        }
    }

    pub fn matches(&self, record: &Value) -> bool {
        record.get(&self.field).and_then(Value::as_str) == Some(self.equals.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordTypeSpec {
    /// Name used in composite keys and on the command line.
    pub name: String,
    /// Upstream model the records live in.
    pub model: String,
    /// Name of the list-by-index query for this model and time index.
    pub index_query: String,
    pub time_index: TimeIndexField,
    pub timestamp_policy: TimestampPolicy,
    pub filter: Option<RecordFilter>,
}

impl RecordTypeSpec {
    pub fn new(name: &str, model: &str, time_index: TimeIndexField) -> Self {
        let suffix = match time_index {
            TimeIndexField::CreatedAt => "CreatedAt",
            TimeIndexField::UpdatedAt => "UpdatedAt",
        };
        let timestamp_policy = match time_index {
            TimeIndexField::CreatedAt => TimestampPolicy::created_then_updated(),
            TimeIndexField::UpdatedAt => TimestampPolicy::updated_then_created(),
        };
        Self {
            name: name.to_string(),
            model: model.to_string(),
            index_query: format!("list{}ByAccountIdAnd{}", model, suffix),
            time_index,
            timestamp_policy,
            filter: None,
        }
    }

    pub fn with_filter(mut self, field: &str, equals: &str) -> Self {
        self.filter = Some(RecordFilter::new(field, equals));
        self
    }

    pub fn accepts(&self, record: &Value) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter.matches(record))
    }
}

/// The set of record types a command can operate on.
#[derive(Debug, Clone)]
pub struct RecordTypeRegistry {
    specs: Vec<RecordTypeSpec>,
}

impl RecordTypeRegistry {
    pub fn new(specs: Vec<RecordTypeSpec>) -> Self {
        Self { specs }
    }

    pub fn all(&self) -> &[RecordTypeSpec] {
        &self.specs
    }

    pub fn lookup(&self, name: &str) -> Result<&RecordTypeSpec, UnknownRecordType> {
        self.specs
            .iter()
            .find(|spec| spec.name == name)
            .ok_or_else(|| UnknownRecordType(name.to_string()))
    }

    /// Expand a command-line selector. `all` yields every type in declaration
    /// order.
    pub fn select(&self, selector: &str) -> Result<Vec<&RecordTypeSpec>, UnknownRecordType> {
        if selector.eq_ignore_ascii_case("all") {
            return Ok(self.specs.iter().collect());
        }
        Ok(vec![self.lookup(selector)?])
    }
}

impl Default for RecordTypeRegistry {
    fn default() -> Self {
        use TimeIndexField::{CreatedAt, UpdatedAt};

        Self::new(vec![
            RecordTypeSpec::new("items", "Item", CreatedAt),
            RecordTypeSpec::new("predictionItems", "Item", CreatedAt)
                .with_filter("createdByType", "prediction"),
            RecordTypeSpec::new("evaluationItems", "Item", CreatedAt)
                .with_filter("createdByType", "evaluation"),
            RecordTypeSpec::new("scoreResults", "ScoreResult", CreatedAt),
            RecordTypeSpec::new("predictionScoreResults", "ScoreResult", CreatedAt)
                .with_filter("type", "prediction"),
            RecordTypeSpec::new("evaluationScoreResults", "ScoreResult", CreatedAt)
                .with_filter("type", "evaluation"),
            RecordTypeSpec::new("tasks", "Task", UpdatedAt),
            RecordTypeSpec::new("evaluations", "Evaluation", UpdatedAt),
            RecordTypeSpec::new("feedbackItems", "FeedbackItem", CreatedAt),
            RecordTypeSpec::new("procedures", "Procedure", UpdatedAt),
            RecordTypeSpec::new("chatSessions", "ChatSession", CreatedAt),
            RecordTypeSpec::new("chatMessages", "ChatMessage", CreatedAt),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timestamp_policy_falls_back_in_order() {
        let policy = TimestampPolicy::created_then_updated();

        let created = parse_timestamp("2024-11-19T14:00:00Z");
        let updated = parse_timestamp("2024-11-19T15:00:00Z");

        let both = json!({"createdAt": "2024-11-19T14:00:00Z", "updatedAt": "2024-11-19T15:00:00Z"});
        assert_eq!(policy.timestamp(&both), created);
        assert_eq!(TimestampPolicy::updated_then_created().timestamp(&both), updated);

        let updated_only = json!({"updatedAt": "2024-11-19T15:00:00Z"});
        assert_eq!(policy.timestamp(&updated_only), updated);

        let malformed = json!({"createdAt": "last tuesday", "updatedAt": "2024-11-19T15:00:00Z"});
        assert_eq!(policy.timestamp(&malformed), updated);

        let blank = json!({"createdAt": "", "updatedAt": null});
        assert_eq!(policy.timestamp(&blank), None);
    }

    #[test]
    fn test_derived_type_filter() {
        let registry = RecordTypeRegistry::default();
        let spec = registry.lookup("predictionItems").unwrap();

        assert_eq!(spec.model, "Item");
        assert!(spec.accepts(&json!({"createdByType": "prediction"})));
        assert!(!spec.accepts(&json!({"createdByType": "evaluation"})));
        assert!(!spec.accepts(&json!({})));
        assert!(registry.lookup("items").unwrap().accepts(&json!({})));
    }

    #[test]
    fn test_update_time_types_are_explicit() {
        let registry = RecordTypeRegistry::default();
        let tasks = registry.lookup("tasks").unwrap();

        assert_eq!(tasks.time_index, TimeIndexField::UpdatedAt);
        assert_eq!(tasks.index_query, "listTaskByAccountIdAndUpdatedAt");
        assert_eq!(tasks.timestamp_policy, TimestampPolicy::updated_then_created());
        assert_eq!(
            registry.lookup("scoreResults").unwrap().index_query,
            "listScoreResultByAccountIdAndCreatedAt"
        );
    }

    #[test]
    fn test_select() {
        let registry = RecordTypeRegistry::default();

        assert_eq!(registry.select("all").unwrap().len(), registry.all().len());
        assert_eq!(registry.select("tasks").unwrap()[0].name, "tasks");
        assert_eq!(
            registry.select("widgets").unwrap_err(),
            UnknownRecordType("widgets".to_string())
        );
    }
}
