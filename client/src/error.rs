//! Transport error taxonomy and retry classification.

use thiserror::Error;

/// Errors surfaced by [`crate::Api`] calls.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport-level failure (DNS, connect, TLS, timeout, reset, ...).
    /// Retryable classes are absorbed by the per-call budget first; this is
    /// what remains once the budget is exhausted.
    #[error("网络请求失败: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-2xx final response. `body` carries the response text truncated
    /// to the trace cap.
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// 2xx response whose body is not the expected JSON shape.
    #[error("解析响应失败: {0}")]
    Decode(#[from] serde_json::Error),

    /// The caller's cancellation token fired during a request or a backoff
    /// sleep.
    #[error("请求已取消")]
    Canceled,
}

/// Message fragments that mark a transport failure as transient. Checked
/// case-insensitively against the full source chain, after the structured
/// reqwest predicates.
const RETRYABLE_HINTS: &[&str] = &[
    "timeout",
    "tls handshake",
    "connection reset",
    "connection refused",
    "broken pipe",
    "unexpected eof",
    "eof",
    "service unavailable",
    "bad gateway",
    "gateway timeout",
];

/// HTTP status codes worth another attempt.
const RETRYABLE_STATUS: &[u16] = &[408, 425, 429, 500, 502, 503, 504];

pub(crate) fn is_retryable(err: &ApiError) -> bool {
    match err {
        ApiError::HttpStatus { status, .. } => RETRYABLE_STATUS.contains(status),
        ApiError::Network(e) => {
            if e.is_timeout() || e.is_connect() {
                return true;
            }
            let text = error_chain_text(e).to_lowercase();
            RETRYABLE_HINTS.iter().any(|hint| text.contains(hint))
        }
        ApiError::Decode(_) | ApiError::Canceled => false,
    }
}

/// Flatten an error and its sources into one searchable string.
fn error_chain_text(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
