//! Retry, failover, and suspension control.
//!
//! One controller drives a request from its first attempt to a definitive
//! outcome. Per attempt it classifies the failure, decides
//! retry-vs-fail-vs-suspend, enforces exponential backoff, and advances
//! through candidate endpoints; when a whole group exhausts its attempt
//! budget the group is reported failed and the loop re-enters with the
//! next active group. When no group is available at all and manual mode
//! plus suspension are configured, the request parks in the FIFO queue
//! until a group-change notification releases it.
//!
//! Backoff is `base-delay x multiplier^(n-1)` capped at `max-delay`, with
//! a tripled base for rate limits and up to 10% jitter to avoid thundering
//! herds.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::config::{RetrySettings, SuspendSettings};
use crate::error::{ErrorKind, RelayError};
use crate::forward::{ClientSink, ProxyRequest, UpstreamForwarder, UpstreamResponse};
use crate::group::GroupManager;
use crate::internals::sse::{parse_buffered_message, TokenUsage};
use crate::internals::suspend::{SuspensionQueue, WakeReason};
use crate::lifecycle::RequestStatus;
use crate::logging::{log_debug, log_info, log_warn};
use crate::store::RequestUpdate;
use crate::stream::StreamProcessor;
use crate::tracker::LifecycleTracker;

// ============================================================================
// Retry policy
// ============================================================================

/// Backoff parameters, taken from `retry.*` configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: settings.base_delay,
            max_delay: settings.max_delay,
            multiplier: settings.multiplier,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based count of failures so
    /// far). Rate limits triple the base before the cap is applied.
    pub fn delay_for(&self, attempt: u32, kind: ErrorKind) -> Duration {
        let base = if kind == ErrorKind::RateLimit {
            self.base_delay.as_secs_f64() * 3.0
        } else {
            self.base_delay.as_secs_f64()
        };
        let exponent = attempt.saturating_sub(1).min(24) as i32;
        let raw = base * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        // Up to 10% jitter.
        let jittered = capped * (1.0 + fastrand::f64() * 0.1);
        Duration::from_secs_f64(jittered)
    }

    /// Retry decision: `Some(delay)` to go again, `None` to stop.
    pub fn should_retry(&self, error: &RelayError, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        if !error.is_retryable() {
            return None;
        }
        Some(self.delay_for(attempt, error.kind()))
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Definitive outcome of driving one request through the attempt loop.
#[derive(Debug)]
pub struct ForwardResult {
    pub status: RequestStatus,
    pub http_status: Option<u16>,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
    pub endpoint: Option<String>,
    pub group: Option<String>,
    pub retry_count: u32,
    /// Set for every non-completed outcome; the coordinator shapes the
    /// client-visible failure from it.
    pub error: Option<RelayError>,
    /// Whether the response line/headers already reached the client.
    pub response_started: bool,
    pub bytes_relayed: u64,
}

/// What one processed upstream response amounted to.
struct AttemptOutcome {
    error: Option<RelayError>,
    http_status: u16,
    model: Option<String>,
    usage: Option<TokenUsage>,
    response_started: bool,
    bytes_relayed: u64,
}

/// The unified retry / failover / suspension controller.
pub struct RetryController {
    manager: Arc<GroupManager>,
    forwarder: Arc<UpstreamForwarder>,
    stream_processor: StreamProcessor,
    tracker: Arc<LifecycleTracker>,
    queue: Arc<SuspensionQueue>,
    policy: RetryPolicy,
    suspend: SuspendSettings,
}

impl RetryController {
    pub fn new(
        manager: Arc<GroupManager>,
        forwarder: Arc<UpstreamForwarder>,
        stream_processor: StreamProcessor,
        tracker: Arc<LifecycleTracker>,
        queue: Arc<SuspensionQueue>,
        retry: &RetrySettings,
        suspend: SuspendSettings,
    ) -> Self {
        Self {
            manager,
            forwarder,
            stream_processor,
            tracker,
            queue,
            policy: RetryPolicy::from(retry),
            suspend,
        }
    }

    /// Drive the request until success or definitive failure.
    pub async fn run(
        &self,
        request: &ProxyRequest,
        sink: &mut dyn ClientSink,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> ForwardResult {
        let mut result = ForwardResult {
            status: RequestStatus::Error,
            http_status: None,
            model: None,
            usage: None,
            endpoint: None,
            group: None,
            retry_count: 0,
            error: None,
            response_started: false,
            bytes_relayed: 0,
        };
        let mut last_error: Option<RelayError> = None;

        loop {
            if cancel.is_cancelled() {
                return self.finish(result, RelayError::Cancelled);
            }

            let candidates = self.manager.list_candidates().await;
            if candidates.is_empty() {
                match self.try_suspend(request_id, cancel).await {
                    SuspendOutcome::Resumed => continue,
                    SuspendOutcome::Abort(error) => return self.finish(result, error),
                    SuspendOutcome::NotEligible => {
                        let error = last_error.take().unwrap_or_else(|| {
                            RelayError::unavailable("no active group with healthy endpoints")
                        });
                        return self.finish(result, error);
                    }
                }
            }

            let current_group = candidates[0].group.clone();
            result.group = Some(current_group.clone());
            let mut cycle_attempts: u32 = 0;

            'cycle: loop {
                for candidate in &candidates {
                    result.endpoint = Some(candidate.name.clone());
                    self.tracker.update(
                        request_id,
                        RequestUpdate {
                            endpoint: Some(candidate.name.clone()),
                            group: Some(current_group.clone()),
                            status: Some(RequestStatus::Forwarding),
                            retry_count: Some(result.retry_count),
                            http_status: None,
                        },
                    );
                    cycle_attempts += 1;
                    log_debug!(
                        request_id = request_id,
                        endpoint = %candidate.name,
                        group = %current_group,
                        attempt = cycle_attempts,
                        "Forwarding attempt"
                    );

                    let (token, api_key) = self.manager.resolve_credentials(&candidate.name);
                    let attempt = self
                        .forwarder
                        .attempt(
                            request,
                            candidate,
                            token.as_deref(),
                            api_key.as_deref(),
                            cancel,
                        )
                        .await;

                    let error = match attempt {
                        Ok(upstream) => {
                            let outcome = self
                                .process_response(request_id, upstream, sink, cancel)
                                .await;
                            result.http_status = Some(outcome.http_status);
                            result.response_started = outcome.response_started;
                            result.bytes_relayed = outcome.bytes_relayed;
                            if outcome.model.is_some() {
                                result.model = outcome.model;
                            }
                            if outcome.usage.is_some() {
                                result.usage = outcome.usage;
                            }
                            match outcome.error {
                                None => {
                                    result.status = RequestStatus::Completed;
                                    return result;
                                }
                                Some(error) => {
                                    // Bytes already relayed cannot be
                                    // retracted; the failure is final.
                                    if outcome.bytes_relayed > 0 || outcome.response_started {
                                        return self.finish(result, error);
                                    }
                                    error
                                }
                            }
                        }
                        Err(error) => error,
                    };

                    if error.kind() == ErrorKind::ClientCancel {
                        return self.finish(result, error);
                    }
                    if !error.is_retryable() {
                        if let RelayError::Upstream { status, .. }
                        | RelayError::Auth { status, .. } = &error
                        {
                            result.http_status = Some(*status);
                        }
                        return self.finish(result, error);
                    }

                    result.retry_count += 1;
                    self.tracker.update(
                        request_id,
                        RequestUpdate {
                            status: Some(RequestStatus::Retry),
                            retry_count: Some(result.retry_count),
                            ..Default::default()
                        },
                    );

                    let Some(delay) = self.policy.should_retry(&error, cycle_attempts) else {
                        last_error = Some(error);
                        break 'cycle;
                    };
                    log_debug!(
                        request_id = request_id,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "Attempt failed, backing off before retry"
                    );
                    last_error = Some(error);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return self.finish(result, RelayError::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                // Candidate list exhausted with budget left: run it again.
            }

            log_warn!(
                request_id = request_id,
                group = %current_group,
                attempts = cycle_attempts,
                "Group exhausted its attempt budget"
            );
            self.manager.report_failure(&current_group);
        }
    }

    /// Relay one successful upstream exchange to the client, extracting
    /// model identity and token usage along the way.
    async fn process_response(
        &self,
        request_id: &str,
        upstream: UpstreamResponse,
        sink: &mut dyn ClientSink,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let http_status = upstream.response.status().as_u16();
        let headers = upstream.response.headers().clone();

        self.tracker.update(
            request_id,
            RequestUpdate {
                status: Some(RequestStatus::Processing),
                http_status: Some(http_status),
                ..Default::default()
            },
        );

        if upstream.is_streaming {
            if let Err(error) = sink.start_response(http_status, &headers).await {
                return AttemptOutcome {
                    error: Some(sink_failure(error)),
                    http_status,
                    model: None,
                    usage: None,
                    response_started: false,
                    bytes_relayed: 0,
                };
            }
            let outcome = self
                .stream_processor
                .process(upstream.response, sink, cancel)
                .await;
            AttemptOutcome {
                error: outcome.error,
                http_status,
                model: outcome.model,
                usage: outcome.usage,
                response_started: true,
                bytes_relayed: outcome.bytes_relayed,
            }
        } else {
            let body = match upstream.response.bytes().await {
                Ok(body) => body,
                Err(error) => {
                    // Nothing reached the client yet; this stays retryable.
                    return AttemptOutcome {
                        error: Some(RelayError::network(
                            format!("failed to read upstream body: {error}"),
                            Some(Box::new(error)),
                        )),
                        http_status,
                        model: None,
                        usage: None,
                        response_started: false,
                        bytes_relayed: 0,
                    };
                }
            };
            let (model, usage) = parse_buffered_message(&body);
            let relay = async {
                sink.start_response(http_status, &headers).await?;
                sink.write_chunk(Bytes::clone(&body)).await?;
                sink.flush().await
            };
            match relay.await {
                Ok(()) => AttemptOutcome {
                    error: None,
                    http_status,
                    model,
                    usage,
                    response_started: true,
                    bytes_relayed: body.len() as u64,
                },
                Err(error) => AttemptOutcome {
                    error: Some(sink_failure(error)),
                    http_status,
                    model,
                    usage,
                    response_started: true,
                    bytes_relayed: 0,
                },
            }
        }
    }

    /// Park the request in the suspension FIFO when eligible.
    async fn try_suspend(&self, request_id: &str, cancel: &CancellationToken) -> SuspendOutcome {
        let eligible = self.suspend.enabled && !self.manager.auto_switch();
        if !eligible {
            return SuspendOutcome::NotEligible;
        }
        let Some(ticket) = self.queue.try_enqueue(request_id) else {
            // At capacity the request fails immediately with its last error.
            return SuspendOutcome::NotEligible;
        };

        self.tracker.update(
            request_id,
            RequestUpdate {
                status: Some(RequestStatus::Suspended),
                ..Default::default()
            },
        );
        match ticket.wait(self.suspend.timeout, cancel).await {
            WakeReason::Resumed(group) => {
                log_info!(
                    request_id = request_id,
                    group = %group,
                    "Suspended request resumed"
                );
                SuspendOutcome::Resumed
            }
            WakeReason::TimedOut => SuspendOutcome::Abort(RelayError::timeout(
                self.suspend.timeout.as_secs(),
            )),
            WakeReason::Cancelled => SuspendOutcome::Abort(RelayError::Cancelled),
        }
    }

    fn finish(&self, mut result: ForwardResult, error: RelayError) -> ForwardResult {
        result.status = error.terminal_status();
        if result.usage.is_none() {
            result.usage = error.partial_usage().copied();
        }
        result.error = Some(error);
        result
    }
}

enum SuspendOutcome {
    Resumed,
    Abort(RelayError),
    NotEligible,
}

fn sink_failure(error: RelayError) -> RelayError {
    // A failed client write means the client went away.
    log_debug!(error = %error, "Client sink failed; treating as disconnect");
    RelayError::Cancelled
}
