//! Wire types for the listing generation service.
//!
//! Field sets mirror the service contract. Responses default every field so
//! that older service builds which omit optionals still decode.

use serde::{Deserialize, Serialize};

/// `POST /v1/auth/exchange`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExchangeResp {
    pub access_token: String,
    pub expires_in: i64,
    pub tenant_id: String,
}

/// `GET /v1/rules/resolve`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RulesResolveResp {
    pub up_to_date: bool,
    pub rules_version: String,
    pub manifest_sha256: String,
    pub download_url: String,
    pub signature_base64: String,
    pub signature_url: String,
    pub signature_algo: String,
    pub signing_public_key_path_in_archive: String,
    pub signing_public_key_signature_base64: String,
    pub signing_public_key_signature_algo: String,
}

/// `POST /v1/generate` request body.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateReq {
    pub input_markdown: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub input_filename: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub candidate_count: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// `POST /v1/generate` response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GenerateResp {
    pub job_id: String,
    pub status: String,
}

/// `GET /v1/jobs/<id>`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JobStatusResp {
    pub job_id: String,
    pub status: String,
    pub error: String,
    pub updated_at: String,
}

/// `POST /v1/jobs/<id>/cancel`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CancelResp {
    pub ok: bool,
    pub job_id: String,
    pub status: String,
    pub cancelled: bool,
    pub reason: String,
}

/// `GET /v1/jobs/<id>/result`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResultResp {
    pub en_markdown: String,
    pub cn_markdown: String,
    pub validation_report: Vec<String>,
    pub timing_ms: i64,
    pub meta: ResultMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResultMeta {
    pub highlight_words_en: Vec<String>,
    pub highlight_words_cn: Vec<String>,
}

/// Open-map payload carried by every trace item. The stream is extensible;
/// unknown keys must survive decode.
pub type TracePayload = serde_json::Map<String, serde_json::Value>;

/// One record of `GET /v1/jobs/<id>/trace`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JobTraceItem {
    pub ts: String,
    pub source: String,
    pub event: String,
    pub level: String,
    pub tenant_id: String,
    pub job_id: String,
    pub elapsed_ms: i64,
    pub req_id: String,
    pub payload: TracePayload,
}

/// `GET /v1/jobs/<id>/trace` envelope.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JobTraceResp {
    pub ok: bool,
    pub job_id: String,
    pub job_status: String,
    pub tenant_id: String,
    pub trace_count: u64,
    pub limit: u64,
    pub offset: u64,
    pub next_offset: u64,
    pub has_more: bool,
    pub items: Vec<JobTraceItem>,
}
