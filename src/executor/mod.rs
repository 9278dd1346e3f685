//! The unified HTTP send-and-persist path.
//!
//! Every outbound request a check or the hijacker makes goes through
//! `RequestExecutor::send`: one place that enforces the per-request
//! timeout, measures duration, classifies timeout outcomes, and — when
//! recording is requested — materialises exactly one history row per
//! attempt, whether the exchange succeeded, failed or timed out.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::time::Instant;
use url::Url;
use uuid::Uuid;

use crate::db::ScanStore;
use crate::error::ExecutorError;
use crate::models::history::{build_raw_request, build_raw_response};
use crate::models::{History, HistorySource};

pub mod limiter;

pub use limiter::RateLimiter;

/// Default per-request ceiling when the caller supplies none.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

const TIME_BASED_FLOOR: Duration = Duration::from_secs(30);
const TIME_BASED_CEILING: Duration = Duration::from_secs(300);

/// Substrings that mark a transport error as a timeout.
const TIMEOUT_MARKERS: &[&str] = &[
    "timeout",
    "deadline exceeded",
    "context deadline exceeded",
    "operation timed out",
];

/// Timeout for time-based payloads: twice the expected sleep, clamped to
/// [30s, 5min].
pub fn time_based_timeout(expected_sleep: Duration) -> Duration {
    (expected_sleep * 2).clamp(TIME_BASED_FLOOR, TIME_BASED_CEILING)
}

fn is_timeout_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TIMEOUT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// A request prepared for sending. Body bytes are kept alongside the
/// structured parts so the raw request can be materialised losslessly.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: String,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl PreparedRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: "GET".to_string(),
            url,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn new(method: impl Into<String>, url: Url) -> Self {
        Self {
            method: method.into(),
            url,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    fn header_map(&self) -> Result<HeaderMap, ExecutorError> {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            let name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| ExecutorError::Request {
                    reason: format!("invalid header name {name:?}: {e}"),
                })?;
            let value = HeaderValue::from_str(value).map_err(|e| ExecutorError::Request {
                reason: format!("invalid header value: {e}"),
            })?;
            map.append(name, value);
        }
        Ok(map)
    }
}

/// Owner references and labelling for the history row a send produces.
#[derive(Debug, Clone)]
pub struct HistoryOptions {
    pub workspace_id: i32,
    pub task_id: Option<Uuid>,
    pub scan_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
    pub playground_session_id: Option<Uuid>,
    pub source: HistorySource,
    pub note: Option<String>,
}

impl HistoryOptions {
    pub fn new(workspace_id: i32, source: HistorySource) -> Self {
        Self {
            workspace_id,
            task_id: None,
            scan_id: None,
            job_id: None,
            playground_session_id: None,
            source,
            note: None,
        }
    }

    pub fn with_owner(mut self, scan_id: Option<Uuid>, job_id: Option<Uuid>) -> Self {
        self.scan_id = scan_id;
        self.job_id = job_id;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Per-send knobs.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Ceiling for the whole exchange; `DEFAULT_TIMEOUT` when unset.
    pub timeout: Option<Duration>,
    /// Record a history row when set.
    pub record: Option<HistoryOptions>,
}

impl SendOptions {
    pub fn recorded(record: HistoryOptions) -> Self {
        Self {
            timeout: None,
            record: Some(record),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A fully read response. The body has always been consumed eagerly, so
/// callers can re-read it as often as they like.
#[derive(Debug, Clone)]
pub struct ExchangeResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub final_url: Url,
}

impl ExchangeResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Everything one send produced.
#[derive(Debug)]
pub struct ExecutionResult {
    pub response: Option<ExchangeResponse>,
    pub history: Option<History>,
    pub duration: Duration,
    pub timed_out: bool,
    pub error: Option<ExecutorError>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.response.is_some() && self.error.is_none()
    }
}

/// The one path that sends prepared requests.
pub struct RequestExecutor {
    client: reqwest::Client,
    store: Arc<dyn ScanStore>,
    limiter: Option<Arc<RateLimiter>>,
}

impl RequestExecutor {
    pub fn new(client: reqwest::Client, store: Arc<dyn ScanStore>) -> Self {
        Self {
            client,
            store,
            limiter: None,
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Send a prepared request. Transport errors come back in the result,
    /// not as `Err`; a history row is persisted for every attempt when
    /// recording is requested.
    pub async fn send(&self, request: PreparedRequest, options: SendOptions) -> ExecutionResult {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let timeout = options.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let raw_request = build_raw_request(
            &request.method,
            &request.url,
            &request.headers,
            &request.body,
        );
        let start = Instant::now();

        let built = match self.build(&request) {
            Ok(built) => built,
            Err(error) => {
                return ExecutionResult {
                    response: None,
                    history: None,
                    duration: start.elapsed(),
                    timed_out: false,
                    error: Some(error),
                };
            }
        };

        let outcome = tokio::time::timeout(timeout, self.execute(built)).await;
        let duration = start.elapsed();

        match outcome {
            Ok(Ok(response)) => {
                let history = match &options.record {
                    Some(record) => {
                        Some(
                            self.persist_history(
                                &request,
                                raw_request,
                                Some(&response),
                                duration,
                                record,
                                None,
                            )
                            .await,
                        )
                    }
                    None => None,
                };
                ExecutionResult {
                    response: Some(response),
                    history,
                    duration,
                    timed_out: false,
                    error: None,
                }
            }
            Ok(Err(error)) => {
                let timed_out = is_timeout_message(&error.to_string());
                let history = match &options.record {
                    Some(record) => {
                        let note = error.to_string();
                        Some(
                            self.persist_history(
                                &request,
                                raw_request,
                                None,
                                duration,
                                record,
                                Some(&note),
                            )
                            .await,
                        )
                    }
                    None => None,
                };
                ExecutionResult {
                    response: None,
                    history,
                    duration,
                    timed_out,
                    error: Some(ExecutorError::Transport(error)),
                }
            }
            Err(_elapsed) => {
                let history = match &options.record {
                    Some(record) => Some(
                        self.persist_history(
                            &request,
                            raw_request,
                            None,
                            duration,
                            record,
                            Some("operation timed out"),
                        )
                        .await,
                    ),
                    None => None,
                };
                ExecutionResult {
                    response: None,
                    history,
                    duration,
                    timed_out: true,
                    error: Some(ExecutorError::DeadlineElapsed(timeout)),
                }
            }
        }
    }

    fn build(&self, request: &PreparedRequest) -> Result<reqwest::Request, ExecutorError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            ExecutorError::Request {
                reason: format!("invalid method {:?}: {e}", request.method),
            }
        })?;
        self.client
            .request(method, request.url.clone())
            .headers(request.header_map()?)
            .body(request.body.clone())
            .build()
            .map_err(ExecutorError::Transport)
    }

    /// Execute and eagerly consume the body so no connection is left
    /// dangling on the caller's behalf.
    async fn execute(&self, request: reqwest::Request) -> Result<ExchangeResponse, reqwest::Error> {
        let response = self.client.execute(request).await?;
        let status = response.status();
        let final_url = response.url().clone();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes().await?;
        Ok(ExchangeResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body,
            final_url,
        })
    }

    /// Build and persist the history row. Persistence failures are logged,
    /// never surfaced: losing a record must not fail the exchange.
    async fn persist_history(
        &self,
        request: &PreparedRequest,
        raw_request: Vec<u8>,
        response: Option<&ExchangeResponse>,
        duration: Duration,
        record: &HistoryOptions,
        failure_note: Option<&str>,
    ) -> History {
        let mut history = History::new(
            record.workspace_id,
            &request.method,
            request.url.as_str(),
            record.source,
        )
        .with_duration(duration);
        history.task_id = record.task_id;
        history.scan_id = record.scan_id;
        history.job_id = record.job_id;
        history.playground_session_id = record.playground_session_id;
        history.note = record.note.clone();
        history.raw_request = raw_request;
        history.request_body_size = request.body.len() as i64;
        history.request_content_type = request
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.clone());

        match response {
            Some(response) => {
                history.status_code = response.status;
                history.response_content_type =
                    response.header("content-type").map(|v| v.to_string());
                history.raw_response = build_raw_response(
                    response.status,
                    &response.reason,
                    &response.headers,
                    &response.body,
                );
            }
            None => {
                // Synthetic status line naming the failure class.
                let reason = failure_note.unwrap_or("request failed");
                history.status_code = 0;
                history.raw_response = format!("HTTP/1.1 0 {reason}\r\n\r\n").into_bytes();
                if history.note.is_none() {
                    history.note = Some(reason.to_string());
                }
            }
        }

        if let Err(e) = self.store.save_history(&mut history).await {
            tracing::warn!("failed to persist history for {}: {}", request.url, e);
        }
        history
    }
}
