//! GraphQL list-by-index backend
//!
//! Issues one `list<Model>ByAccountIdAnd<Field>` query per page against the
//! upstream API:
//!
//! ```text
//! POST {endpoint}
//! x-api-key: {api_key}
//! { "query": "...", "variables": { accountId, start, end, limit, nextToken, filter? } }
//! ```
//!
//! The response carries `data.<queryName>.items` and `data.<queryName>.nextToken`;
//! a non-empty `errors` array fails the page.

use super::{FetchError, PageRequest, RecordPage, RecordPageQuery};
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct GraphqlRequest<'a> {
    query: &'a str,
    variables: Value,
}

pub struct GraphqlRecordQuery {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl GraphqlRecordQuery {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }
}

/// Build the query document for one page request.
pub fn build_query(request: &PageRequest) -> String {
    let field = request.time_index.field_name();
    let (filter_decl, filter_arg, filter_field) = match &request.filter {
        Some(filter) => (
            format!(", $filter: Model{}FilterInput", request.model),
            ", filter: $filter",
            format!(" {}", filter.field),
        ),
        None => (String::new(), "", String::new()),
    };

    format!(
        "query ListRecords($accountId: String!, $start: String!, $end: String!, $limit: Int, $nextToken: String{filter_decl}) {{\n  \
         {query}(accountId: $accountId, {field}: {{between: [$start, $end]}}, limit: $limit, nextToken: $nextToken{filter_arg}) {{\n    \
         items {{ id accountId createdAt updatedAt{filter_field} }}\n    \
         nextToken\n  \
         }}\n}}",
        query = request.index_query,
    )
}

pub fn build_variables(request: &PageRequest) -> Value {
    let mut variables = json!({
        "accountId": request.account_id,
        "start": request.window.start.to_rfc3339_opts(SecondsFormat::Millis, true),
        "end": request.window.end.to_rfc3339_opts(SecondsFormat::Millis, true),
        "limit": request.limit,
        "nextToken": request.next_token,
    });
    if let Some(filter) = &request.filter {
        let mut condition = Map::new();
        condition.insert(filter.field.clone(), json!({ "eq": filter.equals }));
        variables["filter"] = Value::Object(condition);
    }
    variables
}

/// Extract a page from a GraphQL response body.
pub fn parse_response(index_query: &str, body: &Value) -> Result<RecordPage, FetchError> {
    if let Some(errors) = body.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            let messages: Vec<&str> = errors
                .iter()
                .map(|e| e.get("message").and_then(Value::as_str).unwrap_or("unknown error"))
                .collect();
            return Err(FetchError::Remote(messages.join("; ")));
        }
    }

    let result = body
        .get("data")
        .and_then(|data| data.get(index_query))
        .filter(|result| !result.is_null())
        .ok_or_else(|| FetchError::Decode(format!("response has no data.{}", index_query)))?;

    let items = match result.get("items") {
        Some(Value::Array(items)) => items.iter().filter(|item| !item.is_null()).cloned().collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => {
            return Err(FetchError::Decode(format!("items is not a list: {}", other)));
        }
    };
    let next_token = result
        .get("nextToken")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(RecordPage { items, next_token })
}

#[async_trait]
impl RecordPageQuery for GraphqlRecordQuery {
    async fn fetch_page(&self, request: &PageRequest) -> Result<RecordPage, FetchError> {
        let query = build_query(request);
        let body = GraphqlRequest {
            query: &query,
            variables: build_variables(request),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::Http(format!(
                "{} returned {}",
                request.index_query,
                response.status()
            )));
        }

        let body: Value = response.json().await?;
        parse_response(&request.index_query, &body)
    }

    fn backend_type(&self) -> &'static str {
        "GraphQL"
    }
}
