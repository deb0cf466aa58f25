//! Scripted in-memory page backend
//!
//! Pages are served in the order they were pushed, per model, with the page
//! index as continuation token. Injected failures are returned when their
//! page is reached. Time filtering is left to `RecordSource`; an item
//! carrying an `accountId` that differs from the request is dropped.

use super::{FetchError, PageRequest, RecordPage, RecordPageQuery};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type ScriptedPage = Result<Vec<Value>, FetchError>;

#[derive(Default)]
struct Script {
    pages: HashMap<String, Vec<ScriptedPage>>,
    requests: Vec<PageRequest>,
}

#[derive(Clone, Default)]
pub struct MemoryRecordQuery {
    script: Arc<Mutex<Script>>,
}

impl MemoryRecordQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_page(&self, model: &str, items: Vec<Value>) {
        self.lock().pages.entry(model.to_string()).or_default().push(Ok(items));
    }

    pub fn push_failure(&self, model: &str, error: FetchError) {
        self.lock().pages.entry(model.to_string()).or_default().push(Err(error));
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<PageRequest> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RecordPageQuery for MemoryRecordQuery {
    async fn fetch_page(&self, request: &PageRequest) -> Result<RecordPage, FetchError> {
        let mut script = self.lock();
        script.requests.push(request.clone());

        let index = match request.next_token.as_deref() {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| FetchError::Remote(format!("invalid continuation token '{}'", token)))?,
        };

        let Some(pages) = script.pages.get(&request.model) else {
            return Ok(RecordPage::default());
        };
        let Some(page) = pages.get(index) else {
            return Ok(RecordPage::default());
        };

        let items = page
            .clone()?
            .into_iter()
            .filter(|item| {
                item.get("accountId")
                    .and_then(Value::as_str)
                    .map_or(true, |account| account == request.account_id)
            })
            .collect();
        let next_token = (index + 1 < pages.len()).then(|| (index + 1).to_string());

        Ok(RecordPage { items, next_token })
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
