//! Offset-paginated retrieval with a per-resource retry policy.
//!
//! A fetch is a small state machine: `Fetching` requests one page, a
//! retryable status moves it to `Backoff` (same offset, fixed delay), and any
//! other stop condition moves it to `Terminated`, which is final. Pages
//! yielded before termination are never discarded.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::rank_tracker::UpstreamApi;

/// Pagination and retry rules for one upstream resource.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub page_size: u32,
    /// Statuses that pause and retry the same offset.
    pub retryable_statuses: Vec<u16>,
    pub retry_delay: Duration,
    /// Consecutive retries allowed at one offset.
    pub max_retries: u32,
    /// No request is made at or beyond this offset.
    pub max_offset: Option<u64>,
    /// Pause after every successful page.
    pub inter_page_delay: Duration,
    /// Treat a successful empty page as the end of the resource.
    pub stop_on_empty_page: bool,
}

impl RetryPolicy {
    /// Keywords: stop at the first non-200, no retries.
    pub fn keywords(page_size: u32) -> Self {
        Self {
            page_size,
            retryable_statuses: Vec::new(),
            retry_delay: Duration::ZERO,
            max_retries: 0,
            max_offset: None,
            inter_page_delay: Duration::ZERO,
            stop_on_empty_page: true,
        }
    }

    /// SERP pages: 524 is retried after a cooldown, pagination is capped.
    /// An empty page is skipped; only a non-200 or the ceiling ends the fetch.
    pub fn serp(page_size: u32) -> Self {
        Self {
            page_size,
            retryable_statuses: vec![524],
            retry_delay: Duration::from_secs(30),
            max_retries: 10,
            max_offset: Some(10_000),
            inter_page_delay: Duration::from_secs(1),
            stop_on_empty_page: false,
        }
    }

    pub fn with_max_offset(mut self, max_offset: u64) -> Self {
        self.max_offset = Some(max_offset);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_inter_page_delay(mut self, delay: Duration) -> Self {
        self.inter_page_delay = delay;
        self
    }

    /// Initial state for a fetch beginning at `offset`.
    pub fn start(&self, offset: u64) -> FetchState {
        if self.past_ceiling(offset) {
            FetchState::Terminated(Termination::OffsetCeiling { offset })
        } else {
            FetchState::Fetching { offset, attempt: 0 }
        }
    }

    /// State after the request at `offset` produced `outcome`.
    pub fn advance(&self, offset: u64, attempt: u32, outcome: &PageOutcome) -> FetchState {
        match outcome {
            PageOutcome::Records(0) if self.stop_on_empty_page => {
                FetchState::Terminated(Termination::Exhausted)
            }
            PageOutcome::Records(_) => {
                let next = offset + u64::from(self.page_size);
                if self.past_ceiling(next) {
                    FetchState::Terminated(Termination::OffsetCeiling { offset: next })
                } else {
                    FetchState::Fetching {
                        offset: next,
                        attempt: 0,
                    }
                }
            }
            PageOutcome::Status { status, .. } if self.retryable_statuses.contains(status) => {
                if attempt >= self.max_retries {
                    FetchState::Terminated(Termination::RetriesExhausted {
                        offset,
                        status: *status,
                        attempts: attempt + 1,
                    })
                } else {
                    FetchState::Backoff {
                        offset,
                        attempt: attempt + 1,
                        status: *status,
                    }
                }
            }
            PageOutcome::Status { status, message } => {
                FetchState::Terminated(Termination::Status {
                    status: *status,
                    message: message.clone(),
                })
            }
            PageOutcome::Transport(message) => {
                FetchState::Terminated(Termination::Transport {
                    message: message.clone(),
                })
            }
            PageOutcome::Decode(message) => {
                FetchState::Terminated(Termination::Decode {
                    message: message.clone(),
                })
            }
        }
    }

    fn past_ceiling(&self, offset: u64) -> bool {
        self.max_offset.is_some_and(|max| offset >= max)
    }
}

/// Where a fetch currently stands.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchState {
    Fetching { offset: u64, attempt: u32 },
    Backoff { offset: u64, attempt: u32, status: u16 },
    Terminated(Termination),
}

/// Result of one page request, as seen by the policy.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    Records(usize),
    Status { status: u16, message: String },
    Transport(String),
    Decode(String),
}

/// Why a fetch stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Termination {
    /// A successful page came back empty.
    Exhausted,
    OffsetCeiling { offset: u64 },
    Status { status: u16, message: String },
    RetriesExhausted { offset: u64, status: u16, attempts: u32 },
    Transport { message: String },
    Decode { message: String },
}

impl Termination {
    /// Exhausting the retry budget always fails a run. Other stops keep what
    /// was fetched, unless nothing was (see `FetchOutcome::into_records`).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Termination::RetriesExhausted { .. })
    }
}

/// A single, non-restartable paginated fetch of one resource.
pub struct PagedFetch {
    api: Arc<dyn UpstreamApi>,
    resource: String,
    path: String,
    filters: Vec<(String, String)>,
    policy: RetryPolicy,
    state: FetchState,
    pages: usize,
}

impl PagedFetch {
    pub fn new(
        api: Arc<dyn UpstreamApi>,
        resource: impl Into<String>,
        path: impl Into<String>,
        filters: Vec<(String, String)>,
        policy: RetryPolicy,
    ) -> Self {
        Self::starting_at(api, resource, path, filters, policy, 0)
    }

    /// Resume a resource from an explicit offset.
    pub fn starting_at(
        api: Arc<dyn UpstreamApi>,
        resource: impl Into<String>,
        path: impl Into<String>,
        filters: Vec<(String, String)>,
        policy: RetryPolicy,
        offset: u64,
    ) -> Self {
        let state = policy.start(offset);
        Self {
            api,
            resource: resource.into(),
            path: path.into(),
            filters,
            policy,
            state,
            pages: 0,
        }
    }

    pub fn state(&self) -> &FetchState {
        &self.state
    }

    /// Next non-empty page of records, or `None` once terminated.
    pub async fn next_page(&mut self) -> Option<Vec<Value>> {
        loop {
            match self.state.clone() {
                FetchState::Terminated(_) => return None,
                FetchState::Backoff {
                    offset,
                    attempt,
                    status,
                } => {
                    warn!(
                        resource = %self.resource,
                        offset,
                        attempt,
                        "Received status {}, waiting {:?} before retrying",
                        status,
                        self.policy.retry_delay
                    );
                    tokio::time::sleep(self.policy.retry_delay).await;
                    self.state = FetchState::Fetching { offset, attempt };
                }
                FetchState::Fetching { offset, attempt } => {
                    let (outcome, records) = self.request(offset).await;
                    self.state = self.policy.advance(offset, attempt, &outcome);

                    if let FetchState::Terminated(ref reason) = self.state {
                        debug!(resource = %self.resource, offset, ?reason, "Fetch terminated");
                    }

                    let Some(records) = records else { continue };
                    self.pages += 1;
                    info!(
                        resource = %self.resource,
                        offset,
                        "Fetched {} records",
                        records.len()
                    );

                    if matches!(self.state, FetchState::Fetching { .. }) {
                        tokio::time::sleep(self.policy.inter_page_delay).await;
                    }
                    if !records.is_empty() {
                        return Some(records);
                    }
                }
            }
        }
    }

    async fn request(&self, offset: u64) -> (PageOutcome, Option<Vec<Value>>) {
        let mut query = self.filters.clone();
        query.push(("limit".to_string(), self.policy.page_size.to_string()));
        query.push(("offset".to_string(), offset.to_string()));

        match self.api.get(&self.path, &query).await {
            Ok(resp) if resp.status == 200 => match resp.body {
                Value::Array(records) => (PageOutcome::Records(records.len()), Some(records)),
                other => (
                    PageOutcome::Decode(format!(
                        "expected a JSON array, got {}",
                        json_kind(&other)
                    )),
                    None,
                ),
            },
            Ok(resp) => (
                PageOutcome::Status {
                    status: resp.status,
                    message: resp.body.as_str().unwrap_or_default().to_string(),
                },
                None,
            ),
            Err(FetchError::Decode(message)) => (PageOutcome::Decode(message), None),
            Err(FetchError::Network(message)) => (PageOutcome::Transport(message), None),
            Err(e) => (PageOutcome::Transport(e.to_string()), None),
        }
    }

    /// Run the fetch to termination, keeping every page retrieved.
    pub async fn drain(mut self) -> FetchOutcome {
        let mut records = Vec::new();
        while let Some(page) = self.next_page().await {
            records.extend(page);
        }

        let termination = match self.state {
            FetchState::Terminated(reason) => reason,
            // next_page only returns None once terminated
            _ => Termination::Exhausted,
        };

        info!(
            resource = %self.resource,
            pages = self.pages,
            "Fetched {} records total ({:?})",
            records.len(),
            termination
        );

        FetchOutcome {
            resource: self.resource,
            records,
            pages: self.pages,
            termination,
        }
    }

    /// Lazily yield pages as they are fetched.
    pub fn into_stream(self) -> impl Stream<Item = Vec<Value>> {
        stream::unfold(self, |mut fetch| async move {
            fetch.next_page().await.map(|page| (page, fetch))
        })
    }
}

/// Everything a drained fetch produced.
#[derive(Debug)]
pub struct FetchOutcome {
    pub resource: String,
    pub records: Vec<Value>,
    pub pages: usize,
    pub termination: Termination,
}

impl FetchOutcome {
    /// Fail when the retry budget ran out, or when the fetch stopped on an
    /// error before its first page. Otherwise hand back the records.
    pub fn into_records(self) -> Result<(Vec<Value>, FetchSummary), FetchError> {
        if let Termination::RetriesExhausted {
            offset,
            status,
            attempts,
        } = self.termination
        {
            return Err(FetchError::RetriesExhausted {
                resource: self.resource,
                offset,
                status,
                attempts,
            });
        }

        if self.pages == 0 {
            match self.termination {
                Termination::Status { status, message } => {
                    return Err(FetchError::Upstream { status, message })
                }
                Termination::Transport { message } => return Err(FetchError::Network(message)),
                Termination::Decode { message } => return Err(FetchError::Decode(message)),
                _ => {}
            }
        }

        let summary = FetchSummary {
            resource: self.resource,
            records: self.records.len(),
            pages: self.pages,
            termination: self.termination,
        };
        Ok((self.records, summary))
    }
}

/// Per-resource line in a run report.
#[derive(Debug, Clone, Serialize)]
pub struct FetchSummary {
    pub resource: String,
    pub records: usize,
    pub pages: usize,
    pub termination: Termination,
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
