//! Streaming response processing.
//!
//! [`StreamProcessor`] relays an upstream SSE byte stream to the client
//! while feeding the same bytes through the token parser. Bytes go to the
//! client verbatim, immediately after being read and before any parsing,
//! and the sink is flushed at every event boundary so clients see events
//! without extra buffering. Parsing happens on the same task; there is no
//! reordering window.
//!
//! Whatever token counts the parser has accumulated when a stream dies are
//! attached to the error and surface in the outcome, so a failed stream
//! still bills the partial usage. Failures are encoded as
//! `stream_status:<kind>:<details>` (see [`crate::error::StreamStatus`]).

use bytes::Bytes;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::StreamingSettings;
use crate::error::{RelayError, StreamStatus, StreamStatusKind};
use crate::forward::ClientSink;
use crate::internals::sse::{SseParser, TokenUsage};
use crate::logging::{log_debug, log_warn};

/// What a stream attempt produced. `usage` may be present even when
/// `error` is set: partial counts from a failed stream are preserved.
#[derive(Debug)]
pub struct StreamOutcome {
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
    pub error: Option<RelayError>,
    /// Bytes already written to the client. Non-zero means a retry would
    /// corrupt the client's view of the stream.
    pub bytes_relayed: u64,
}

impl StreamOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Relays one upstream SSE response to the client sink.
pub struct StreamProcessor {
    settings: StreamingSettings,
}

impl StreamProcessor {
    pub fn new(settings: StreamingSettings) -> Self {
        Self { settings }
    }

    /// Drive the upstream body to completion. The response line and
    /// headers must already have been written to the sink.
    pub async fn process(
        &self,
        response: reqwest::Response,
        sink: &mut dyn ClientSink,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        let mut parser = SseParser::new();
        let mut stream = response.bytes_stream();
        let mut bytes_relayed: u64 = 0;
        let mut failure: Option<StreamStatus> = None;
        let max_idle = self.settings.max_idle_time;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    failure = Some(StreamStatus::new(
                        StreamStatusKind::Cancelled,
                        "client disconnected",
                    ));
                    break;
                }
                next = tokio::time::timeout(max_idle, stream.next()) => next,
            };

            match next {
                Err(_) => {
                    failure = Some(StreamStatus::new(
                        StreamStatusKind::Timeout,
                        format!("no bytes from upstream for {}s", max_idle.as_secs()),
                    ));
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(error))) => {
                    failure = Some(StreamStatus::new(
                        StreamStatusKind::NetworkError,
                        format!("upstream read failed: {error}"),
                    ));
                    break;
                }
                Ok(Some(Ok(chunk))) => {
                    bytes_relayed += chunk.len() as u64;
                    // Relay first; parsing must never delay or reorder the
                    // client's bytes.
                    if let Err(error) = sink.write_chunk(Bytes::clone(&chunk)).await {
                        failure = Some(StreamStatus::new(
                            StreamStatusKind::Cancelled,
                            format!("client write failed: {error}"),
                        ));
                        break;
                    }
                    if parser.feed(&chunk) > 0 {
                        if let Err(error) = sink.flush().await {
                            failure = Some(StreamStatus::new(
                                StreamStatusKind::Cancelled,
                                format!("client flush failed: {error}"),
                            ));
                            break;
                        }
                    }
                }
            }
        }

        // Upstreams may close right after the last data line; parse the
        // buffered tail exactly once regardless of how the loop ended.
        let flushed_partial_event = parser.flush_pending_event();
        let _ = sink.flush().await;

        if failure.is_none() {
            if let Some(message) = parser.api_error() {
                failure = Some(StreamStatus::new(StreamStatusKind::ApiError, message));
            } else if flushed_partial_event {
                failure = Some(StreamStatus::new(
                    StreamStatusKind::StreamError,
                    "upstream closed mid-event",
                ));
            }
        }

        let usage = parser.final_usage();
        let model = parser.model().map(str::to_string);
        let error = match failure {
            Some(status) => {
                log_warn!(
                    status = %status,
                    bytes_relayed = bytes_relayed,
                    events_parsed = parser.events_parsed(),
                    has_partial_usage = usage.is_some(),
                    "Stream terminated abnormally"
                );
                Some(RelayError::stream_failed(status, usage, model.clone()))
            }
            None => {
                log_debug!(
                    bytes_relayed = bytes_relayed,
                    events_parsed = parser.events_parsed(),
                    model = model.as_deref().unwrap_or("unknown"),
                    "Stream relayed to completion"
                );
                None
            }
        };

        StreamOutcome {
            usage,
            model,
            error,
            bytes_relayed,
        }
    }
}
