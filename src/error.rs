//! Error types for relay operations.
//!
//! This module provides structured error handling for the forwarding core,
//! built around a single closed taxonomy that the retry controller pattern
//! matches on to decide retry-vs-fail-vs-suspend.
//!
//! # Error Kinds
//!
//! Every [`RelayError`] maps onto exactly one [`ErrorKind`]:
//!
//! | Kind | Examples | Retryable |
//! |------|----------|-----------|
//! | `Network` | connection refused, DNS failure, upstream 5xx | yes |
//! | `Timeout` | per-endpoint deadline, global request ceiling | yes |
//! | `Stream` | SSE parse failure, mid-stream EOF | yes |
//! | `RateLimit` | upstream HTTP 429 | yes (3x backoff) |
//! | `Http` | upstream 4xx other than 429/401/403 | no |
//! | `Auth` | upstream 401/403 | no |
//! | `ClientCancel` | client disconnected | no |
//! | `Unknown` | everything else | yes |
//!
//! # Stream status encoding
//!
//! The stream processor threads typed failure information through its
//! return value using the wire format `stream_status:<kind>:<details>`,
//! represented here as [`StreamStatus`]. The retry controller parses it to
//! pick both the retry classification and the terminal lifecycle status.
//!
//! # Result Type
//!
//! Use [`RelayResult<T>`] as a convenient alias for `Result<T, RelayError>`:
//!
//! ```rust
//! use claude_relay::RelayResult;
//!
//! fn my_function() -> RelayResult<String> {
//!     Ok("Success".to_string())
//! }
//! ```

use crate::internals::sse::TokenUsage;
use crate::lifecycle::RequestStatus;
use crate::logging::{log_error, log_warn};
use bytes::Bytes;
use thiserror::Error;

// ============================================================================
// Error classification types
// ============================================================================

/// The closed error taxonomy consumed by the retry controller.
///
/// Use [`RelayError::kind()`] to classify any error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport-level failure or upstream 5xx. Retryable.
    Network,

    /// A deadline elapsed (per-endpoint, idle, or global). Retryable.
    Timeout,

    /// The SSE stream failed mid-flight or could not be parsed. Retryable.
    Stream,

    /// Upstream returned HTTP 429. Retryable with a tripled backoff base.
    RateLimit,

    /// Upstream returned a non-429, non-auth 4xx. Not retryable; the
    /// client sees the upstream status and body verbatim.
    Http,

    /// Upstream returned 401 or 403. Not retryable.
    Auth,

    /// The client disconnected. Not retryable; nothing further is written.
    ClientCancel,

    /// Anything that defies classification. Retried with normal backoff.
    Unknown,
}

impl ErrorKind {
    /// Whether the retry controller may attempt the request again.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::Stream | Self::RateLimit | Self::Unknown
        )
    }
}

// ============================================================================
// Stream status wire format
// ============================================================================

/// Status kinds carried in the `stream_status:<kind>:<details>` encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatusKind {
    /// The upstream emitted an `event: error` frame.
    ApiError,
    /// Transport failure while reading the stream.
    NetworkError,
    /// `streaming.max-idle-time` elapsed between bytes.
    Timeout,
    /// The client went away mid-stream.
    Cancelled,
    /// The stream ended or broke in a way the parser could not recover from.
    StreamError,
    /// Upstream signalled rate limiting mid-stream.
    RateLimited,
}

impl StreamStatusKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApiError => "error",
            Self::NetworkError => "network_error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::StreamError => "stream_error",
            Self::RateLimited => "rate_limited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "error" => Some(Self::ApiError),
            "network_error" => Some(Self::NetworkError),
            "timeout" => Some(Self::Timeout),
            "cancelled" => Some(Self::Cancelled),
            "stream_error" => Some(Self::StreamError),
            "rate_limited" => Some(Self::RateLimited),
            _ => None,
        }
    }

    /// The lifecycle status a request terminates with when a stream fails
    /// with this kind.
    pub fn terminal_status(self) -> RequestStatus {
        match self {
            Self::ApiError => RequestStatus::Error,
            Self::NetworkError => RequestStatus::NetworkError,
            Self::Timeout => RequestStatus::Timeout,
            Self::Cancelled => RequestStatus::Cancelled,
            Self::StreamError => RequestStatus::StreamError,
            Self::RateLimited => RequestStatus::RateLimited,
        }
    }

    /// The taxonomy kind the retry controller classifies this failure as.
    pub fn error_kind(self) -> ErrorKind {
        match self {
            Self::ApiError => ErrorKind::Stream,
            Self::NetworkError => ErrorKind::Network,
            Self::Timeout => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::ClientCancel,
            Self::StreamError => ErrorKind::Stream,
            Self::RateLimited => ErrorKind::RateLimit,
        }
    }
}

/// Typed form of the `stream_status:<kind>:<details>` encoding returned by
/// the stream processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStatus {
    pub kind: StreamStatusKind,
    pub details: String,
}

impl StreamStatus {
    pub fn new(kind: StreamStatusKind, details: impl Into<String>) -> Self {
        Self {
            kind,
            details: details.into(),
        }
    }

    /// Parse the wire format. Returns `None` when the string is not a
    /// stream status encoding.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ':');
        if parts.next()? != "stream_status" {
            return None;
        }
        let kind = StreamStatusKind::parse(parts.next()?)?;
        let details = parts.next().unwrap_or_default().to_string();
        Some(Self { kind, details })
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream_status:{}:{}", self.kind.as_str(), self.details)
    }
}

// ============================================================================
// Relay error type
// ============================================================================

/// Convenient result type for relay operations.
pub type RelayResult<T> = std::result::Result<T, RelayError>;

/// Errors produced while forwarding a request upstream.
///
/// Each variant carries the context the coordinator needs to shape the
/// client-visible failure, and can be:
/// - Classified via [`kind()`](Self::kind)
/// - Checked for retryability via [`is_retryable()`](Self::is_retryable)
/// - Mapped to a terminal lifecycle status via
///   [`terminal_status()`](Self::terminal_status)
///
/// # Creating Errors
///
/// Use the constructor methods which automatically log the error:
///
/// ```rust
/// use claude_relay::RelayError;
///
/// let err = RelayError::rate_limited(60);
/// let err = RelayError::timeout(30);
/// ```
#[derive(Error, Debug)]
pub enum RelayError {
    /// Transport-level failure reaching the upstream, or an upstream 5xx.
    #[error("network error: {message}")]
    Network {
        /// Description of the failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A deadline elapsed before the upstream answered.
    #[error("request timed out after {seconds}s")]
    Timeout {
        /// The deadline that was exceeded, in seconds.
        seconds: u64,
    },

    /// Upstream rate limit (HTTP 429).
    #[error("rate limited, retry after {retry_after_seconds}s")]
    RateLimited {
        /// Recommended wait taken from the `retry-after` header, or 60.
        retry_after_seconds: u64,
    },

    /// Upstream returned a non-retryable 4xx. The status and body are
    /// propagated to the client verbatim.
    #[error("upstream returned HTTP {status}")]
    Upstream {
        status: u16,
        /// The upstream response body, relayed untouched.
        body: Bytes,
    },

    /// Upstream rejected the resolved credentials (401/403).
    #[error("upstream authentication rejected (HTTP {status})")]
    Auth { status: u16, body: Bytes },

    /// The SSE stream failed. Carries whatever usage the parser had
    /// accumulated before the failure so partial tokens are never lost.
    #[error("{status}")]
    StreamFailed {
        status: StreamStatus,
        /// Token counts observed before the failure, if any.
        partial_usage: Option<TokenUsage>,
        /// Model name observed before the failure, if any.
        model: Option<String>,
    },

    /// The client disconnected before the request finished.
    #[error("client cancelled the request")]
    Cancelled,

    /// No endpoint group is available to serve the request.
    #[error("no available endpoints: {message}")]
    Unavailable { message: String },

    /// Invalid configuration detected at construction or reload.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The durable store rejected a write.
    #[error("store error: {message}")]
    Store { message: String },

    /// Everything else.
    #[error("{message}")]
    Unknown { message: String },
}

impl RelayError {
    /// Classify this error into the retry controller's taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::Network,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::Upstream { .. } => ErrorKind::Http,
            Self::Auth { .. } => ErrorKind::Auth,
            Self::StreamFailed { status, .. } => status.kind.error_kind(),
            Self::Cancelled => ErrorKind::ClientCancel,
            Self::Unavailable { .. } | Self::Config { .. } | Self::Store { .. } => {
                ErrorKind::Unknown
            }
            Self::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    /// Whether the retry controller may attempt the request again.
    ///
    /// Configuration, store, and no-endpoint failures classify as
    /// `Unknown` but are never worth repeating, so they are excluded here.
    pub fn is_retryable(&self) -> bool {
        if matches!(
            self,
            Self::Config { .. } | Self::Store { .. } | Self::Unavailable { .. }
        ) {
            return false;
        }
        self.kind().is_retryable()
    }

    /// The terminal lifecycle status a request finishes with when this
    /// error is definitive.
    pub fn terminal_status(&self) -> RequestStatus {
        match self {
            Self::Network { .. } => RequestStatus::NetworkError,
            Self::Timeout { .. } => RequestStatus::Timeout,
            Self::RateLimited { .. } => RequestStatus::RateLimited,
            Self::Upstream { .. } | Self::Auth { .. } => RequestStatus::Error,
            Self::StreamFailed { status, .. } => status.kind.terminal_status(),
            Self::Cancelled => RequestStatus::Cancelled,
            Self::Unavailable { .. }
            | Self::Config { .. }
            | Self::Store { .. }
            | Self::Unknown { .. } => RequestStatus::Error,
        }
    }

    /// Partial token usage attached to the error, if any.
    pub fn partial_usage(&self) -> Option<&TokenUsage> {
        match self {
            Self::StreamFailed { partial_usage, .. } => partial_usage.as_ref(),
            _ => None,
        }
    }

    // =========================================================================
    // Constructor methods with automatic logging
    // =========================================================================
    //
    // These methods log at the appropriate level when the error is created.
    // Use them instead of constructing variants directly.

    pub fn network(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        let message = message.into();
        log_warn!(
            error_type = "network",
            message = %message,
            has_source = source.is_some(),
            "Upstream request failed at the transport level"
        );
        Self::Network { message, source }
    }

    pub fn timeout(seconds: u64) -> Self {
        log_warn!(
            error_type = "timeout",
            timeout_seconds = seconds,
            "Upstream request timed out"
        );
        Self::Timeout { seconds }
    }

    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        log_warn!(
            error_type = "rate_limited",
            retry_after_seconds = retry_after_seconds,
            "Upstream rate limit hit"
        );
        Self::RateLimited {
            retry_after_seconds,
        }
    }

    pub fn upstream(status: u16, body: Bytes) -> Self {
        log_warn!(
            error_type = "upstream_http",
            status = status,
            body_len = body.len(),
            "Upstream returned a client error"
        );
        Self::Upstream { status, body }
    }

    pub fn auth(status: u16, body: Bytes) -> Self {
        log_error!(
            error_type = "auth",
            status = status,
            "Upstream rejected the resolved credentials"
        );
        Self::Auth { status, body }
    }

    pub fn stream_failed(
        status: StreamStatus,
        partial_usage: Option<TokenUsage>,
        model: Option<String>,
    ) -> Self {
        log_warn!(
            error_type = "stream_failed",
            status = %status,
            has_partial_usage = partial_usage.is_some(),
            "SSE stream terminated abnormally"
        );
        Self::StreamFailed {
            status,
            partial_usage,
            model,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(
            error_type = "unavailable",
            message = %message,
            "No endpoint available to serve the request"
        );
        Self::Unavailable { message }
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        let message = message.into();
        log_error!(
            error_type = "configuration_error",
            message = %message,
            "Relay configuration validation failed"
        );
        Self::Config { message }
    }

    pub fn store_error(message: impl Into<String>) -> Self {
        let message = message.into();
        log_error!(
            error_type = "store_error",
            message = %message,
            "Durable store operation failed"
        );
        Self::Store { message }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        let message = message.into();
        log_warn!(
            error_type = "unknown",
            message = %message,
            "Unclassified forwarding failure"
        );
        Self::Unknown { message }
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(e: rusqlite::Error) -> Self {
        Self::store_error(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_status_round_trips_through_wire_format() {
        let status = StreamStatus::new(StreamStatusKind::Timeout, "idle for 60s");
        let encoded = status.to_string();
        assert_eq!(encoded, "stream_status:timeout:idle for 60s");
        assert_eq!(StreamStatus::parse(&encoded), Some(status));
    }

    #[test]
    fn stream_status_parse_tolerates_colons_in_details() {
        let parsed = StreamStatus::parse("stream_status:network_error:read: connection reset")
            .expect("should parse");
        assert_eq!(parsed.kind, StreamStatusKind::NetworkError);
        assert_eq!(parsed.details, "read: connection reset");
    }

    #[test]
    fn stream_status_parse_rejects_other_strings() {
        assert_eq!(StreamStatus::parse("not a status"), None);
        assert_eq!(StreamStatus::parse("stream_status:bogus:x"), None);
    }

    #[test]
    fn retryable_kinds_match_taxonomy() {
        assert!(RelayError::timeout(5).is_retryable());
        assert!(RelayError::rate_limited(60).is_retryable());
        assert!(RelayError::network("refused", None).is_retryable());
        assert!(!RelayError::auth(401, Bytes::new()).is_retryable());
        assert!(!RelayError::upstream(404, Bytes::new()).is_retryable());
        assert!(!RelayError::Cancelled.is_retryable());
        assert!(!RelayError::config_error("bad").is_retryable());
        assert!(!RelayError::unavailable("all groups cooling down").is_retryable());
    }

    #[test]
    fn terminal_status_follows_stream_status_kind() {
        let err = RelayError::stream_failed(
            StreamStatus::new(StreamStatusKind::Cancelled, "client gone"),
            None,
            None,
        );
        assert_eq!(err.terminal_status(), RequestStatus::Cancelled);
        assert_eq!(err.kind(), ErrorKind::ClientCancel);
    }
}
