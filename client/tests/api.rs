//! Wire-level tests for the service client: endpoint shapes, retry
//! behavior, trace hook observations, and cancellation.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use syl_client::types::GenerateReq;
use syl_client::{Api, ApiError, TraceEvent, TraceStage};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn collecting_api(base_url: &str) -> (Api, Arc<Mutex<Vec<TraceEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let mut api = Api::new(base_url).expect("client build");
    api.set_trace(Arc::new(move |ev| sink.lock().unwrap().push(ev)));
    (api, events)
}

#[tokio::test]
async fn exchange_sends_bearer_key_and_decodes_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/exchange"))
        .and(header("authorization", "Bearer syl-key-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"access_token":"at","expires_in":3600,"tenant_id":"demo"}"#,
        ))
        .mount(&server)
        .await;

    let (api, events) = collecting_api(&server.uri());
    let cancel = CancellationToken::new();
    let resp = api.exchange(&cancel, "syl-key-1").await.expect("exchange");

    assert_eq!(resp.access_token, "at");
    assert_eq!(resp.tenant_id, "demo");

    let stages: Vec<TraceStage> = events.lock().unwrap().iter().map(|e| e.stage).collect();
    assert_eq!(stages, vec![TraceStage::Request, TraceStage::Response]);
}

#[tokio::test]
async fn generate_posts_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/generate"))
        .and(body_json(serde_json::json!({
            "input_markdown": "body",
            "input_filename": "req.md",
            "candidate_count": 1,
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"job_id":"job_1","status":"queued"}"#),
        )
        .mount(&server)
        .await;

    let api = Api::new(server.uri()).expect("client build");
    let cancel = CancellationToken::new();
    let resp = api
        .generate(
            &cancel,
            "at",
            &GenerateReq {
                input_markdown: "body".to_string(),
                input_filename: "req.md".to_string(),
                candidate_count: 1,
            },
        )
        .await
        .expect("generate");
    assert_eq!(resp.job_id, "job_1");
}

#[tokio::test]
async fn job_trace_carries_offset_and_limit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/jobs/job_9/trace"))
        .and(query_param("offset", "7"))
        .and(query_param("limit", "300"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"ok":true,"next_offset":9,"has_more":false,"items":[{"source":"engine","event":"rules_loaded","payload":{"rules_version":"v2"}}]}"#,
        ))
        .mount(&server)
        .await;

    let api = Api::new(server.uri()).expect("client build");
    let cancel = CancellationToken::new();
    let resp = api
        .job_trace(&cancel, "at", "job_9", 7, 300)
        .await
        .expect("trace");
    assert_eq!(resp.next_offset, 9);
    assert_eq!(resp.items.len(), 1);
    assert_eq!(resp.items[0].event, "rules_loaded");
    assert_eq!(
        resp.items[0].payload.get("rules_version").and_then(|v| v.as_str()),
        Some("v2")
    );
}

#[tokio::test]
async fn transient_status_is_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/jobs/job_1"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/jobs/job_1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"job_id":"job_1","status":"succeeded"}"#),
        )
        .mount(&server)
        .await;

    let (api, events) = collecting_api(&server.uri());
    let cancel = CancellationToken::new();
    let resp = api.job(&cancel, "at", "job_1").await.expect("job");
    assert_eq!(resp.status, "succeeded");

    let retries = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.stage == TraceStage::Retry)
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn retry_trace_event_names_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/rules/resolve"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/rules/resolve"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"up_to_date":true,"rules_version":"v1"}"#,
        ))
        .mount(&server)
        .await;

    let (api, events) = collecting_api(&server.uri());
    let cancel = CancellationToken::new();
    api.resolve_rules(&cancel, "at", "v1").await.expect("resolve");

    let events = events.lock().unwrap();
    let retry = events
        .iter()
        .find(|e| e.stage == TraceStage::Retry)
        .expect("retry event");
    assert_eq!(retry.request, r#"{"attempt":1,"next_attempt":2}"#);
    assert!(retry.error.contains("502"));
}

#[tokio::test]
async fn client_error_status_fails_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/jobs/job_1"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad trace"))
        .expect(1)
        .mount(&server)
        .await;

    let api = Api::new(server.uri()).expect("client build");
    let cancel = CancellationToken::new();
    let err = api.job(&cancel, "at", "job_1").await.expect_err("must fail");
    match err {
        ApiError::HttpStatus { status, body } => {
            assert_eq!(status, 400);
            assert_eq!(body, "bad trace");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn malformed_json_surfaces_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/jobs/job_1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not-json"))
        .mount(&server)
        .await;

    let api = Api::new(server.uri()).expect("client build");
    let cancel = CancellationToken::new();
    let err = api.job(&cancel, "at", "job_1").await.expect_err("must fail");
    assert!(matches!(err, ApiError::Decode(_)), "got {err:?}");
}

#[tokio::test]
async fn download_returns_sha_and_redacts_binary_trace() {
    let server = MockServer::start().await;
    let payload: Vec<u8> = vec![0x1f, 0x8b, 0x00, 0xff, 0x01];
    Mock::given(method("GET"))
        .and(path("/archive/rules.tar.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .mount(&server)
        .await;

    let (api, events) = collecting_api(&server.uri());
    let cancel = CancellationToken::new();
    let (bytes, sha) = api
        .download(&cancel, "at", &format!("{}/archive/rules.tar.gz", server.uri()))
        .await
        .expect("download");
    assert_eq!(bytes, payload);
    assert_eq!(sha.len(), 64);

    let events = events.lock().unwrap();
    let response = events
        .iter()
        .find(|e| e.stage == TraceStage::Response)
        .expect("response event");
    assert!(
        response.response.starts_with("<binary bytes=5 sha256="),
        "unexpected trace body: {}",
        response.response
    );
}

#[tokio::test]
async fn cancellation_beats_the_backoff_timer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/exchange"))
        .respond_with(ResponseTemplate::new(503).set_body_string("down"))
        .mount(&server)
        .await;

    let api = Api::new(server.uri()).expect("client build");
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let start = Instant::now();
    let err = api.exchange(&cancel, "key").await.expect_err("must cancel");
    assert!(matches!(err, ApiError::Canceled), "got {err:?}");
    assert!(start.elapsed() < Duration::from_secs(2));
}
