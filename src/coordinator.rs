//! Per-request coordination.
//!
//! [`RequestCoordinator`] is the per-request driver: it generates the
//! request id, opens the lifecycle record, hands the request to the retry
//! controller under the global timeout, and afterwards guarantees exactly
//! one terminal outcome — the idempotent completion row on success, or a
//! terminal status plus any partially observed tokens on failure.
//!
//! Client-visible failure shaping follows one rule: upstream 4xx/auth
//! bodies are propagated verbatim; everything else gets a synthesized JSON
//! error, provided nothing has been written to the client yet. Bytes
//! already relayed on a stream are never retracted.

use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::forward::{ClientSink, ProxyRequest};
use crate::internals::sse::TokenUsage;
use crate::lifecycle::{generate_request_id, RequestRecord, RequestStatus};
use crate::logging::{log_info, log_warn};
use crate::retry::{ForwardResult, RetryController};
use crate::store::RequestUpdate;
use crate::tracker::LifecycleTracker;

/// Final summary handed back to the outer layer once a request is done.
#[derive(Debug, Clone)]
pub struct CompletedRequest {
    pub request_id: String,
    pub status: RequestStatus,
    pub http_status: Option<u16>,
    pub model: Option<String>,
    pub usage: TokenUsage,
    pub retry_count: u32,
    pub duration: Duration,
}

/// Drives individual requests end to end.
pub struct RequestCoordinator {
    controller: RetryController,
    tracker: Arc<LifecycleTracker>,
    global_timeout: Duration,
}

impl RequestCoordinator {
    pub fn new(
        controller: RetryController,
        tracker: Arc<LifecycleTracker>,
        global_timeout: Duration,
    ) -> Self {
        Self {
            controller,
            tracker,
            global_timeout,
        }
    }

    /// Handle one inbound request. The response (success or failure) is
    /// written through the sink; the returned summary reflects the durable
    /// record.
    pub async fn handle(
        &self,
        request: ProxyRequest,
        sink: &mut dyn ClientSink,
        cancel: CancellationToken,
    ) -> CompletedRequest {
        let request_id = generate_request_id();
        let started = std::time::Instant::now();
        let is_streaming = request.wants_stream();

        self.tracker.start(RequestRecord::new(
            request_id.clone(),
            request.client_ip.clone(),
            request.user_agent.clone(),
            request.method.to_string(),
            request.path.clone(),
            is_streaming,
            Utc::now(),
        ));
        log_info!(
            request_id = %request_id,
            method = %request.method,
            path = %request.path,
            client_ip = %request.client_ip,
            streaming = is_streaming,
            "Request accepted"
        );

        let run = self.controller.run(&request, sink, &request_id, &cancel);
        let result = match tokio::time::timeout(self.global_timeout, run).await {
            Ok(result) => result,
            Err(_) => ForwardResult {
                status: RequestStatus::Timeout,
                http_status: None,
                model: None,
                usage: None,
                endpoint: None,
                group: None,
                retry_count: 0,
                error: Some(RelayError::timeout(self.global_timeout.as_secs())),
                response_started: false,
                bytes_relayed: 0,
            },
        };
        let duration = started.elapsed();

        if result.status == RequestStatus::Completed {
            self.tracker.update(
                &request_id,
                RequestUpdate {
                    http_status: result.http_status,
                    retry_count: Some(result.retry_count),
                    ..Default::default()
                },
            );
            self.tracker.complete(
                &request_id,
                result.model.clone(),
                result.usage.unwrap_or_default(),
                duration,
            );
            log_info!(
                request_id = %request_id,
                endpoint = result.endpoint.as_deref().unwrap_or("unknown"),
                retry_count = result.retry_count,
                duration_ms = duration.as_millis(),
                "Request completed"
            );
        } else {
            self.tracker.update(
                &request_id,
                RequestUpdate {
                    status: Some(result.status),
                    retry_count: Some(result.retry_count),
                    http_status: result.http_status,
                    ..Default::default()
                },
            );
            if let Some(usage) = result.usage {
                if !usage.is_empty() {
                    let reason = result
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| result.status.to_string());
                    self.tracker.record_tokens_for_failed_request(
                        &request_id,
                        result.model.clone(),
                        usage,
                        reason,
                    );
                }
            }
            if !result.response_started {
                write_error_response(sink, result.error.as_ref()).await;
            }
            log_warn!(
                request_id = %request_id,
                status = %result.status,
                error = %result.error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                retry_count = result.retry_count,
                duration_ms = duration.as_millis(),
                "Request failed"
            );
        }

        CompletedRequest {
            request_id,
            status: result.status,
            http_status: result.http_status,
            model: result.model,
            usage: result.usage.unwrap_or_default(),
            retry_count: result.retry_count,
            duration,
        }
    }
}

/// Shape the client-visible failure when nothing has been written yet.
async fn write_error_response(sink: &mut dyn ClientSink, error: Option<&RelayError>) {
    let (status, body) = match error {
        // Upstream 4xx and auth failures pass through verbatim.
        Some(RelayError::Upstream { status, body }) | Some(RelayError::Auth { status, body }) => {
            (*status, Bytes::clone(body))
        }
        other => {
            let (status, kind, message) = match other {
                Some(RelayError::Timeout { seconds }) => (
                    504u16,
                    "timeout_error",
                    format!("upstream did not answer within {seconds}s"),
                ),
                Some(RelayError::RateLimited { .. }) => (
                    429,
                    "rate_limit_error",
                    "upstream rate limit exceeded".to_string(),
                ),
                Some(RelayError::Cancelled) => {
                    (499, "request_cancelled", "client closed the request".to_string())
                }
                Some(RelayError::Unavailable { message }) => {
                    (503, "upstream_unavailable", message.clone())
                }
                Some(RelayError::StreamFailed { status, .. }) => {
                    (502, "upstream_error", status.to_string())
                }
                Some(RelayError::Network { message, .. }) => {
                    (502, "upstream_error", message.clone())
                }
                Some(other) => (500, "internal_error", other.to_string()),
                None => (500, "internal_error", "request failed".to_string()),
            };
            let body = serde_json::json!({
                "type": "error",
                "error": { "type": kind, "message": message }
            });
            (status, Bytes::from(body.to_string()))
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    // The client may already be gone; these writes are best effort.
    if sink.start_response(status, &headers).await.is_ok() {
        let _ = sink.write_chunk(body).await;
        let _ = sink.flush().await;
    }
}
