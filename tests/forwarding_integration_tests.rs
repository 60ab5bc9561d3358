//! Integration Tests for Buffered Request Forwarding
//!
//! UNIT UNDER TEST: Relay end-to-end forwarding of non-streaming requests
//!
//! BUSINESS RESPONSIBILITY:
//!   - Forward client requests to the active group's endpoints
//!   - Rewrite authentication headers per resolved credentials
//!   - Retry transient failures with exponential backoff
//!   - Fail over to the next group after the attempt budget is spent
//!   - Propagate non-retryable upstream errors to the client verbatim
//!   - Persist exactly one lifecycle row per request
//!
//! TEST COVERAGE:
//!   - Happy path with a healthy endpoint
//!   - Header rewriting (Authorization stripped, bearer/api-key injected)
//!   - Retry after 500 and after 429, then success
//!   - Cross-group failover after exhausting a group
//!   - Verbatim propagation of 404 and 401 responses
//!   - Per-endpoint timeout surfacing as a 504

use std::time::{Duration, Instant};

use claude_relay::RequestStatus;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod common;
use common::{build_relay, endpoint, post_request, test_config, wait_for_record, SharedSink};

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn buffered_request_round_trips_and_persists_one_row() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(vec![endpoint("primary", &server.uri(), "main", 1)]);
    let (relay, store) = build_relay(config);

    let mut sink = SharedSink::new();
    let outcome = relay
        .handle_request(
            post_request("/v1/messages", r#"{"model":"m"}"#),
            &mut sink,
            CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome.status, RequestStatus::Completed);
    assert_eq!(sink.status(), Some(200));
    assert_eq!(sink.body_string(), "OK");

    let record = wait_for_record(&store, &outcome.request_id, |r| {
        r.status == RequestStatus::Completed
    })
    .await;
    assert_eq!(record.endpoint_name.as_deref(), Some("primary"));
    assert_eq!(record.group_name.as_deref(), Some("main"));
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.http_status, Some(200));
    assert_eq!(record.input_tokens, 0);
    assert_eq!(record.output_tokens, 0);
    assert_eq!(record.cache_creation_tokens, 0);
    assert_eq!(record.cache_read_tokens, 0);
    relay.shutdown().await;
}

#[tokio::test]
async fn usage_is_extracted_from_buffered_message_bodies() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "msg_1",
            "model": "claude-3-5-sonnet-20241022",
            "usage": {"input_tokens": 12, "output_tokens": 4}
        })))
        .mount(&server)
        .await;

    let config = test_config(vec![endpoint("primary", &server.uri(), "main", 1)]);
    let (relay, store) = build_relay(config);

    let mut sink = SharedSink::new();
    let outcome = relay
        .handle_request(
            post_request("/v1/messages", r#"{"model":"m"}"#),
            &mut sink,
            CancellationToken::new(),
        )
        .await;

    let record = wait_for_record(&store, &outcome.request_id, |r| {
        r.status == RequestStatus::Completed
    })
    .await;
    assert_eq!(record.model_name.as_deref(), Some("claude-3-5-sonnet-20241022"));
    assert_eq!(record.input_tokens, 12);
    assert_eq!(record.output_tokens, 4);
    relay.shutdown().await;
}

// ============================================================================
// Header rewriting
// ============================================================================

#[tokio::test]
async fn resolved_credentials_replace_client_authorization() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer group-token"))
        .and(header("x-api-key", "group-key"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .expect(1)
        .mount(&server)
        .await;

    let mut with_token = endpoint("primary", &server.uri(), "main", 1);
    with_token.token = Some("group-token".to_string());
    with_token.api_key = Some("group-key".to_string());
    let config = test_config(vec![with_token]);
    let (relay, _store) = build_relay(config);

    let mut request = post_request("/v1/messages", r#"{"model":"m"}"#);
    request.headers.insert(
        reqwest::header::AUTHORIZATION,
        reqwest::header::HeaderValue::from_static("Bearer client-should-not-pass"),
    );

    let mut sink = SharedSink::new();
    let outcome = relay
        .handle_request(request, &mut sink, CancellationToken::new())
        .await;
    assert_eq!(outcome.status, RequestStatus::Completed);
    relay.shutdown().await;
}

// ============================================================================
// Retry behaviour
// ============================================================================

#[tokio::test]
async fn transient_500_is_retried_on_the_same_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .mount(&server)
        .await;

    let config = test_config(vec![endpoint("primary", &server.uri(), "main", 1)]);
    let (relay, store) = build_relay(config);

    let started = Instant::now();
    let mut sink = SharedSink::new();
    let outcome = relay
        .handle_request(
            post_request("/v1/messages", r#"{"model":"m"}"#),
            &mut sink,
            CancellationToken::new(),
        )
        .await;
    let elapsed = started.elapsed();

    assert_eq!(outcome.status, RequestStatus::Completed);
    assert_eq!(sink.body_string(), "OK");
    // One backoff of ~10ms must have been observed.
    assert!(elapsed >= Duration::from_millis(10), "elapsed {elapsed:?}");

    let record = wait_for_record(&store, &outcome.request_id, |r| {
        r.status == RequestStatus::Completed
    })
    .await;
    assert_eq!(record.retry_count, 1);
    assert_eq!(record.endpoint_name.as_deref(), Some("primary"));
    relay.shutdown().await;
}

#[tokio::test]
async fn rate_limit_is_retried_with_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .mount(&server)
        .await;

    let config = test_config(vec![endpoint("primary", &server.uri(), "main", 1)]);
    let (relay, store) = build_relay(config);

    let mut sink = SharedSink::new();
    let outcome = relay
        .handle_request(
            post_request("/v1/messages", r#"{"model":"m"}"#),
            &mut sink,
            CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome.status, RequestStatus::Completed);
    let record = wait_for_record(&store, &outcome.request_id, |r| {
        r.status == RequestStatus::Completed
    })
    .await;
    assert_eq!(record.retry_count, 1);
    relay.shutdown().await;
}

// ============================================================================
// Group failover
// ============================================================================

#[tokio::test]
async fn exhausted_group_fails_over_to_the_backup_group() {
    let failing = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&failing)
        .await;
    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("from-backup"))
        .mount(&healthy)
        .await;

    let config = test_config(vec![
        endpoint("main-1", &failing.uri(), "main", 1),
        endpoint("backup-1", &healthy.uri(), "backup", 2),
    ]);
    let max_attempts = config.retry.max_attempts;
    let (relay, store) = build_relay(config);

    let mut sink = SharedSink::new();
    let outcome = relay
        .handle_request(
            post_request("/v1/messages", r#"{"model":"m"}"#),
            &mut sink,
            CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome.status, RequestStatus::Completed);
    assert_eq!(sink.body_string(), "from-backup");

    let record = wait_for_record(&store, &outcome.request_id, |r| {
        r.status == RequestStatus::Completed
    })
    .await;
    assert_eq!(record.group_name.as_deref(), Some("backup"));
    assert_eq!(record.endpoint_name.as_deref(), Some("backup-1"));
    assert_eq!(record.retry_count, max_attempts);

    // The failed group is cooling down.
    let main = relay
        .group_snapshots()
        .into_iter()
        .find(|s| s.name == "main")
        .unwrap();
    assert!(main.in_cooldown);
    assert!(!main.is_active);
    relay.shutdown().await;
}

// ============================================================================
// Non-retryable upstream failures
// ============================================================================

#[tokio::test]
async fn client_errors_propagate_verbatim_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(404).set_body_string(r#"{"error":"not_found_error"}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(vec![endpoint("primary", &server.uri(), "main", 1)]);
    let (relay, store) = build_relay(config);

    let mut sink = SharedSink::new();
    let outcome = relay
        .handle_request(
            post_request("/v1/unknown", r#"{"model":"m"}"#),
            &mut sink,
            CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome.status, RequestStatus::Error);
    assert_eq!(sink.status(), Some(404));
    assert_eq!(sink.body_string(), r#"{"error":"not_found_error"}"#);

    let record = wait_for_record(&store, &outcome.request_id, |r| r.status.is_terminal()).await;
    assert_eq!(record.status, RequestStatus::Error);
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.http_status, Some(404));
    relay.shutdown().await;
}

#[tokio::test]
async fn auth_failures_propagate_verbatim_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_string(r#"{"error":{"type":"authentication_error"}}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(vec![endpoint("primary", &server.uri(), "main", 1)]);
    let (relay, store) = build_relay(config);

    let mut sink = SharedSink::new();
    let outcome = relay
        .handle_request(
            post_request("/v1/messages", r#"{"model":"m"}"#),
            &mut sink,
            CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome.status, RequestStatus::Error);
    assert_eq!(sink.status(), Some(401));
    let record = wait_for_record(&store, &outcome.request_id, |r| r.status.is_terminal()).await;
    assert_eq!(record.retry_count, 0);
    relay.shutdown().await;
}

// ============================================================================
// Timeouts
// ============================================================================

#[tokio::test]
async fn slow_upstream_times_out_and_surfaces_as_504() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("too late")
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let mut slow = endpoint("primary", &server.uri(), "main", 1);
    slow.timeout = Some(Duration::from_millis(100));
    let mut config = test_config(vec![slow]);
    config.retry.max_attempts = 2;
    let (relay, store) = build_relay(config);

    let mut sink = SharedSink::new();
    let outcome = relay
        .handle_request(
            post_request("/v1/messages", r#"{"model":"m"}"#),
            &mut sink,
            CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome.status, RequestStatus::Timeout);
    assert_eq!(sink.status(), Some(504));
    let record = wait_for_record(&store, &outcome.request_id, |r| r.status.is_terminal()).await;
    assert_eq!(record.status, RequestStatus::Timeout);
    assert_eq!(record.retry_count, 2);
    relay.shutdown().await;
}
