//! The service client: one connection pool, eight operations, a shared
//! retry helper, and a request/response trace hook.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::cancel::OrCancelExt;
use crate::error::{is_retryable, ApiError};
use crate::types::{
    CancelResp, ExchangeResp, GenerateReq, GenerateResp, JobStatusResp, JobTraceResp, ResultResp,
    RulesResolveResp,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const TCP_KEEP_ALIVE: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 10;

const RETRY_BACKOFF_BASE_MS: u64 = 300;
const RETRY_BACKOFF_MAX_MS: u64 = 4_000;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const EXCHANGE_MAX_ATTEMPTS: u32 = 5;
const GENERATE_MAX_ATTEMPTS: u32 = 3;
const JOB_POLL_MAX_ATTEMPTS: u32 = 5;

/// Bodies larger than this are truncated before they reach the trace hook
/// or an `HttpStatus` error.
const TRACE_BODY_LIMIT: usize = 2 << 20;

/// Which point of the request lifecycle a [`TraceEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceStage {
    #[default]
    Request,
    Response,
    Error,
    Retry,
}

impl TraceStage {
    pub fn as_str(self) -> &'static str {
        match self {
            TraceStage::Request => "request",
            TraceStage::Response => "response",
            TraceStage::Error => "error",
            TraceStage::Retry => "retry",
        }
    }
}

/// One observation handed to the installed trace hook. Bodies are capped at
/// 2 MiB and redacted when they are not valid UTF-8.
#[derive(Debug, Clone, Default)]
pub struct TraceEvent {
    pub stage: TraceStage,
    pub method: String,
    pub url: String,
    pub status_code: u16,
    pub duration_ms: i64,
    pub request: String,
    pub response: String,
    pub error: String,
}

/// Installed observer for request/response/error/retry events.
pub type TraceFn = Arc<dyn Fn(TraceEvent) + Send + Sync>;

pub struct Api {
    base_url: String,
    http: reqwest::Client,
    trace: Option<TraceFn>,
}

impl Api {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .tcp_keepalive(TCP_KEEP_ALIVE)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            trace: None,
        })
    }

    /// Install the trace hook. Must be called before the client is shared.
    pub fn set_trace(&mut self, hook: TraceFn) {
        self.trace = Some(hook);
    }

    fn emit(&self, event: TraceEvent) {
        if let Some(hook) = &self.trace {
            hook(event);
        }
    }

    pub async fn exchange(
        &self,
        cancel: &CancellationToken,
        syl_key: &str,
    ) -> Result<ExchangeResp, ApiError> {
        let url = format!("{}/v1/auth/exchange", self.base_url);
        self.request_json(cancel, EXCHANGE_MAX_ATTEMPTS, || {
            self.http.post(&url).bearer_auth(syl_key)
        })
        .await
    }

    pub async fn resolve_rules(
        &self,
        cancel: &CancellationToken,
        token: &str,
        current: &str,
    ) -> Result<RulesResolveResp, ApiError> {
        let url = format!("{}/v1/rules/resolve", self.base_url);
        self.request_json(cancel, DEFAULT_MAX_ATTEMPTS, || {
            let mut req = self.http.get(&url).bearer_auth(token);
            if !current.is_empty() {
                req = req.query(&[("current", current)]);
            }
            req
        })
        .await
    }

    pub async fn generate(
        &self,
        cancel: &CancellationToken,
        token: &str,
        req: &GenerateReq,
    ) -> Result<GenerateResp, ApiError> {
        let url = format!("{}/v1/generate", self.base_url);
        self.request_json(cancel, GENERATE_MAX_ATTEMPTS, || {
            self.http.post(&url).bearer_auth(token).json(req)
        })
        .await
    }

    pub async fn job(
        &self,
        cancel: &CancellationToken,
        token: &str,
        job_id: &str,
    ) -> Result<JobStatusResp, ApiError> {
        let url = format!("{}/v1/jobs/{job_id}", self.base_url);
        self.request_json(cancel, JOB_POLL_MAX_ATTEMPTS, || {
            self.http.get(&url).bearer_auth(token)
        })
        .await
    }

    pub async fn job_trace(
        &self,
        cancel: &CancellationToken,
        token: &str,
        job_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<JobTraceResp, ApiError> {
        let url = format!("{}/v1/jobs/{job_id}/trace", self.base_url);
        self.request_json(cancel, JOB_POLL_MAX_ATTEMPTS, || {
            let mut req = self.http.get(&url).bearer_auth(token);
            if offset > 0 {
                req = req.query(&[("offset", offset.to_string())]);
            }
            if limit > 0 {
                req = req.query(&[("limit", limit.to_string())]);
            }
            req
        })
        .await
    }

    pub async fn result(
        &self,
        cancel: &CancellationToken,
        token: &str,
        job_id: &str,
    ) -> Result<ResultResp, ApiError> {
        let url = format!("{}/v1/jobs/{job_id}/result", self.base_url);
        self.request_json(cancel, JOB_POLL_MAX_ATTEMPTS, || {
            self.http.get(&url).bearer_auth(token)
        })
        .await
    }

    pub async fn cancel_job(
        &self,
        cancel: &CancellationToken,
        token: &str,
        job_id: &str,
    ) -> Result<CancelResp, ApiError> {
        let url = format!("{}/v1/jobs/{job_id}/cancel", self.base_url);
        self.request_json(cancel, DEFAULT_MAX_ATTEMPTS, || {
            self.http.post(&url).bearer_auth(token)
        })
        .await
    }

    /// Fetch the rules archive. Returns the raw bytes together with their
    /// SHA-256 hex digest so the caller can check the advertised manifest.
    pub async fn download(
        &self,
        cancel: &CancellationToken,
        token: &str,
        url: &str,
    ) -> Result<(Vec<u8>, String), ApiError> {
        let body = self
            .with_retry(cancel, DEFAULT_MAX_ATTEMPTS, || {
                self.http.get(url).bearer_auth(token)
            })
            .await?;
        let sha = hex_digest(&body);
        Ok((body, sha))
    }

    async fn request_json<T, F>(
        &self,
        cancel: &CancellationToken,
        max_attempts: u32,
        build: F,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        F: Fn() -> reqwest::RequestBuilder,
    {
        let body = self.with_retry(cancel, max_attempts, build).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Drive one call through its attempt budget. Every attempt rebuilds the
    /// request from the factory so bodies restart cleanly; the backoff sleep
    /// loses to cancellation.
    async fn with_retry<F>(
        &self,
        cancel: &CancellationToken,
        max_attempts: u32,
        build: F,
    ) -> Result<Vec<u8>, ApiError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let req = build().build()?;
            let method = req.method().to_string();
            let url = req.url().to_string();
            match self.execute_once(cancel, req).await {
                Ok(body) => return Ok(body),
                Err(err) => {
                    if !is_retryable(&err) || attempt >= max_attempts {
                        return Err(err);
                    }
                    let backoff = retry_backoff(attempt);
                    self.emit(TraceEvent {
                        stage: TraceStage::Retry,
                        method,
                        url,
                        duration_ms: backoff.as_millis() as i64,
                        request: format!(
                            r#"{{"attempt":{attempt},"next_attempt":{}}}"#,
                            attempt + 1
                        ),
                        error: err.to_string(),
                        ..Default::default()
                    });
                    if sleep(backoff).or_cancel(cancel).await.is_err() {
                        return Err(ApiError::Canceled);
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn execute_once(
        &self,
        cancel: &CancellationToken,
        req: reqwest::Request,
    ) -> Result<Vec<u8>, ApiError> {
        let method = req.method().to_string();
        let url = req.url().to_string();
        let request_preview = req
            .body()
            .and_then(|b| b.as_bytes())
            .map(|b| trace_body(&b[..b.len().min(TRACE_BODY_LIMIT)]))
            .unwrap_or_default();

        self.emit(TraceEvent {
            stage: TraceStage::Request,
            method: method.clone(),
            url: url.clone(),
            request: request_preview.clone(),
            ..Default::default()
        });

        let start = Instant::now();
        let resp = match self.http.execute(req).or_cancel(cancel).await {
            Err(_) => {
                self.emit_error(&method, &url, start, &request_preview, "请求已取消");
                return Err(ApiError::Canceled);
            }
            Ok(Err(e)) => {
                self.emit_error(&method, &url, start, &request_preview, &e.to_string());
                return Err(e.into());
            }
            Ok(Ok(resp)) => resp,
        };

        let status = resp.status();
        let body = match resp.bytes().or_cancel(cancel).await {
            Err(_) => {
                self.emit_error(&method, &url, start, &request_preview, "请求已取消");
                return Err(ApiError::Canceled);
            }
            Ok(Err(e)) => {
                self.emit_error(&method, &url, start, &request_preview, &e.to_string());
                return Err(e.into());
            }
            Ok(Ok(bytes)) => bytes.to_vec(),
        };

        let capped = &body[..body.len().min(TRACE_BODY_LIMIT)];
        self.emit(TraceEvent {
            stage: TraceStage::Response,
            method,
            url,
            status_code: status.as_u16(),
            duration_ms: start.elapsed().as_millis() as i64,
            request: request_preview,
            response: trace_body(capped),
            ..Default::default()
        });

        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                status: status.as_u16(),
                body: String::from_utf8_lossy(capped).trim().to_string(),
            });
        }
        Ok(body)
    }

    fn emit_error(&self, method: &str, url: &str, start: Instant, request: &str, error: &str) {
        self.emit(TraceEvent {
            stage: TraceStage::Error,
            method: method.to_string(),
            url: url.to_string(),
            duration_ms: start.elapsed().as_millis() as i64,
            request: request.to_string(),
            error: error.to_string(),
            ..Default::default()
        });
    }
}

fn retry_backoff(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let ms = RETRY_BACKOFF_BASE_MS.saturating_mul(1 << shift);
    Duration::from_millis(ms.min(RETRY_BACKOFF_MAX_MS))
}

/// Render a body for the trace hook: plain text when valid UTF-8, a
/// `<binary ...>` placeholder otherwise.
fn trace_body(body: &[u8]) -> String {
    if body.is_empty() {
        return String::new();
    }
    match std::str::from_utf8(body) {
        Ok(text) => text.to_string(),
        Err(_) => format!(
            "<binary bytes={} sha256={}>",
            body.len(),
            hex_digest(body)
        ),
    }
}

fn hex_digest(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
