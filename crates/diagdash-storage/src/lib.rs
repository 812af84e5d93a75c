//! Remote record store contract plus PostgREST and in-memory backends.

use std::cmp::Ordering;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use diagdash_core::RawRecord;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "diagdash-storage";

/// One bounded `[offset, offset + limit)` read, ordered by `order_field`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRequest {
    pub order_field: String,
    pub descending: bool,
    pub offset: usize,
    pub limit: usize,
    pub with_count: bool,
}

impl WindowRequest {
    pub fn descending_by(order_field: impl Into<String>, offset: usize, limit: usize) -> Self {
        Self {
            order_field: order_field.into(),
            descending: true,
            offset,
            limit,
            with_count: false,
        }
    }

    pub fn counted(mut self) -> Self {
        self.with_count = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowPage {
    pub rows: Vec<RawRecord>,
    pub total_count: Option<usize>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response from {url}: {reason}")]
    Decode { url: String, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Windowed, ordered read access to the remote table.
///
/// A failed read yields no rows at all; callers never see a partially decoded page.
#[async_trait]
pub trait RecordStore: Send + Sync {
    fn backend_tag(&self) -> &'static str;

    async fn read_window(&self, request: &WindowRequest) -> Result<WindowPage, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    pub base_url: String,
    pub table: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for RestStoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321".to_string(),
            table: "diagnostico_cnc".to_string(),
            api_key: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// PostgREST (Supabase REST) table reader.
#[derive(Debug)]
pub struct RestStore {
    client: reqwest::Client,
    endpoint: String,
    backoff: BackoffPolicy,
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
            headers.insert(
                "apikey",
                HeaderValue::from_str(key).context("store api key is not a valid header value")?,
            );
            let mut bearer = HeaderValue::from_str(&format!("Bearer {key}"))
                .context("store api key is not a valid header value")?;
            bearer.set_sensitive(true);
            headers.insert(AUTHORIZATION, bearer);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let endpoint = format!(
            "{}/rest/v1/{}",
            config.base_url.trim_end_matches('/'),
            config.table
        );

        Ok(Self {
            client,
            endpoint,
            backoff: config.backoff,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn read_window_with_retries(
        &self,
        request: &WindowRequest,
    ) -> Result<WindowPage, StoreError> {
        let query = window_query(request);
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut builder = self.client.get(&self.endpoint).query(&query);
            if request.with_count {
                builder = builder.header("Prefer", "count=exact");
            }

            match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let url = resp.url().to_string();

                    if status == StatusCode::RANGE_NOT_SATISFIABLE {
                        // PostgREST answers 416 for an offset past the end of a counted range.
                        debug!(%url, "window starts past the end of the table");
                        return Ok(WindowPage::default());
                    }

                    if status.is_success() {
                        let total_count = resp
                            .headers()
                            .get(CONTENT_RANGE)
                            .and_then(|v| v.to_str().ok())
                            .and_then(parse_content_range_total);
                        let body = resp.bytes().await?;
                        let rows: Vec<RawRecord> =
                            serde_json::from_slice(&body).map_err(|err| StoreError::Decode {
                                url: url.clone(),
                                reason: err.to_string(),
                            })?;
                        return Ok(WindowPage {
                            rows,
                            total_count: if request.with_count { total_count } else { None },
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%url, status = status.as_u16(), attempt, "retrying window read");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying window read");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(StoreError::Request(err));
                }
            }
        }

        Err(match last_request_error {
            Some(err) => StoreError::Request(err),
            None => StoreError::Unavailable(format!("no response from {}", self.endpoint)),
        })
    }
}

#[async_trait]
impl RecordStore for RestStore {
    fn backend_tag(&self) -> &'static str {
        "postgrest"
    }

    async fn read_window(&self, request: &WindowRequest) -> Result<WindowPage, StoreError> {
        let span = info_span!(
            "http_window",
            endpoint = %self.endpoint,
            offset = request.offset,
            limit = request.limit
        );
        self.read_window_with_retries(request).instrument(span).await
    }
}

/// Query parameters for one PostgREST window read.
pub fn window_query(request: &WindowRequest) -> Vec<(&'static str, String)> {
    let direction = if request.descending { "desc" } else { "asc" };
    vec![
        ("select", "*".to_string()),
        ("order", format!("{}.{direction}", request.order_field)),
        ("offset", request.offset.to_string()),
        ("limit", request.limit.to_string()),
    ]
}

/// Total row count from a `Content-Range` header such as `0-999/2500` or `*/0`.
pub fn parse_content_range_total(value: &str) -> Option<usize> {
    let (_, total) = value.trim().rsplit_once('/')?;
    match total.trim() {
        "*" => None,
        n => n.parse().ok(),
    }
}

/// In-memory table used by tests and offline (fixture) mode.
///
/// Rows are ordered per request by the requested field, like the remote store would.
#[derive(Debug)]
pub struct MemoryStore {
    rows: Mutex<Vec<RawRecord>>,
    report_count: bool,
    max_limit: Option<usize>,
    fail_at_offset: Option<usize>,
    pending_inserts: Mutex<Option<(usize, Vec<RawRecord>)>>,
    requests: Mutex<Vec<WindowRequest>>,
}

impl MemoryStore {
    pub fn new(rows: Vec<RawRecord>) -> Self {
        Self {
            rows: Mutex::new(rows),
            report_count: true,
            max_limit: None,
            fail_at_offset: None,
            pending_inserts: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Never answer the exact-count request.
    pub fn without_count(mut self) -> Self {
        self.report_count = false;
        self
    }

    /// Serve at most `cap` rows per request regardless of the requested limit.
    pub fn with_page_cap(mut self, cap: usize) -> Self {
        self.max_limit = Some(cap);
        self
    }

    /// Fail the read whose offset equals `offset`.
    pub fn failing_at_offset(mut self, offset: usize) -> Self {
        self.fail_at_offset = Some(offset);
        self
    }

    /// Insert `rows` once `after_reads` windows have been served, mimicking writes that
    /// land while a client is paginating.
    pub fn inserting_after(mut self, after_reads: usize, rows: Vec<RawRecord>) -> Self {
        self.pending_inserts = Mutex::new(Some((after_reads, rows)));
        self
    }

    pub async fn requests(&self) -> Vec<WindowRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn backend_tag(&self) -> &'static str {
        "memory"
    }

    async fn read_window(&self, request: &WindowRequest) -> Result<WindowPage, StoreError> {
        let served = {
            let mut requests = self.requests.lock().await;
            requests.push(request.clone());
            requests.len() - 1
        };

        if self.fail_at_offset == Some(request.offset) {
            return Err(StoreError::Unavailable(format!(
                "injected failure at offset {}",
                request.offset
            )));
        }

        let mut rows = self.rows.lock().await;
        {
            let mut pending = self.pending_inserts.lock().await;
            if matches!(pending.as_ref(), Some((after, _)) if *after <= served) {
                if let Some((_, inserts)) = pending.take() {
                    rows.extend(inserts);
                }
            }
        }

        let mut ordered: Vec<&RawRecord> = rows.iter().collect();
        ordered.sort_by(|a, b| {
            let ord = compare_json(a.get(&request.order_field), b.get(&request.order_field));
            if request.descending {
                ord.reverse()
            } else {
                ord
            }
        });

        let limit = self
            .max_limit
            .map_or(request.limit, |cap| request.limit.min(cap));
        let page = ordered
            .into_iter()
            .skip(request.offset)
            .take(limit)
            .cloned()
            .collect();

        Ok(WindowPage {
            rows: page,
            total_count: (request.with_count && self.report_count).then_some(rows.len()),
        })
    }
}

fn compare_json(a: Option<&JsonValue>, b: Option<&JsonValue>) -> Ordering {
    match (a, b) {
        (Some(JsonValue::String(a)), Some(JsonValue::String(b))) => {
            match (parse_instant(a), parse_instant(b)) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => a.cmp(b),
            }
        }
        (Some(JsonValue::Number(a)), Some(JsonValue::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (None | Some(JsonValue::Null), None | Some(JsonValue::Null)) => Ordering::Equal,
        (None | Some(JsonValue::Null), _) => Ordering::Less,
        (_, None | Some(JsonValue::Null)) => Ordering::Greater,
        (Some(a), Some(b)) => a.to_string().cmp(&b.to_string()),
    }
}

/// Timestamps compare as instants so mixed UTC offsets order by time, not by text.
fn parse_instant(value: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%#z"))
        .ok()
}
