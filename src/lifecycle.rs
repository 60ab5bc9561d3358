//! Request lifecycle model.
//!
//! Every inbound request is tracked as one logical state machine keyed by a
//! globally unique request id. The closed [`RequestStatus`] set, the durable
//! [`RequestRecord`] row shape, and id generation all live here; the
//! asynchronous persistence machinery is in [`crate::tracker`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::internals::sse::TokenUsage;

/// Generate a fresh request id: four random bytes, hex-encoded, prefixed
/// `req-`. Propagated through logs and storage.
pub fn generate_request_id() -> String {
    format!("req-{:08x}", fastrand::u32(..))
}

/// The closed set of lifecycle states.
///
/// Happy path: `pending -> forwarding -> processing -> completed`.
/// Retry loop: `forwarding -> retry -> forwarding`.
/// Group-switch wait: `forwarding -> suspended -> forwarding`.
///
/// A status never regresses out of a terminal state, and `completed` is
/// reached only through the tracker's `complete` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Forwarding,
    Processing,
    Retry,
    Suspended,
    Completed,
    Error,
    Timeout,
    Cancelled,
    NetworkError,
    StreamError,
    RateLimited,
}

impl RequestStatus {
    /// Whether this status ends the lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Error
                | Self::Timeout
                | Self::Cancelled
                | Self::NetworkError
                | Self::StreamError
                | Self::RateLimited
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Terminal states accept no successor; everything else may advance to
    /// any state except back to `pending`.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        next != Self::Pending || self == Self::Pending
    }

    /// Storage/wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Forwarding => "forwarding",
            Self::Processing => "processing",
            Self::Retry => "retry",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::NetworkError => "network_error",
            Self::StreamError => "stream_error",
            Self::RateLimited => "rate_limited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "forwarding" => Some(Self::Forwarding),
            "processing" => Some(Self::Processing),
            "retry" => Some(Self::Retry),
            "suspended" => Some(Self::Suspended),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "timeout" => Some(Self::Timeout),
            "cancelled" => Some(Self::Cancelled),
            "network_error" => Some(Self::NetworkError),
            "stream_error" => Some(Self::StreamError),
            "rate_limited" => Some(Self::RateLimited),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single durable row representing one request's end-to-end history.
///
/// The store keeps exactly one row per request id; intermediate updates are
/// idempotent upserts against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub client_ip: String,
    pub user_agent: String,
    pub method: String,
    pub path: String,
    pub is_streaming: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub endpoint_name: Option<String>,
    pub group_name: Option<String>,
    pub retry_count: u32,
    pub http_status: Option<u16>,
    pub status: RequestStatus,
    pub model_name: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub input_cost: Decimal,
    pub output_cost: Decimal,
    pub cache_creation_cost: Decimal,
    pub cache_read_cost: Decimal,
    pub total_cost: Decimal,
    /// Reason recorded when tokens were persisted for a failed request.
    pub failure_reason: Option<String>,
    pub duration_ms: Option<u64>,
}

impl RequestRecord {
    /// Fresh `pending` row for a newly accepted request.
    pub fn new(
        request_id: String,
        client_ip: String,
        user_agent: String,
        method: String,
        path: String,
        is_streaming: bool,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            client_ip,
            user_agent,
            method,
            path,
            is_streaming,
            start_time,
            end_time: None,
            endpoint_name: None,
            group_name: None,
            retry_count: 0,
            http_status: None,
            status: RequestStatus::Pending,
            model_name: None,
            input_tokens: 0,
            output_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            input_cost: Decimal::ZERO,
            output_cost: Decimal::ZERO,
            cache_creation_cost: Decimal::ZERO,
            cache_read_cost: Decimal::ZERO,
            total_cost: Decimal::ZERO,
            failure_reason: None,
            duration_ms: None,
        }
    }

    /// Copy token counts into the record.
    pub fn apply_usage(&mut self, usage: &TokenUsage) {
        self.input_tokens = usage.input_tokens;
        self.output_tokens = usage.output_tokens;
        self.cache_creation_tokens = usage.cache_creation_tokens;
        self.cache_read_tokens = usage.cache_read_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_prefixed_hex() {
        let id = generate_request_id();
        assert!(id.starts_with("req-"));
        assert_eq!(id.len(), 12);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn terminal_states_accept_no_successor() {
        for terminal in [
            RequestStatus::Completed,
            RequestStatus::Error,
            RequestStatus::Timeout,
            RequestStatus::Cancelled,
            RequestStatus::NetworkError,
            RequestStatus::StreamError,
            RequestStatus::RateLimited,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(RequestStatus::Forwarding));
            assert!(!terminal.can_transition_to(RequestStatus::Completed));
        }
    }

    #[test]
    fn forwarding_may_retry_suspend_or_finish() {
        let s = RequestStatus::Forwarding;
        assert!(s.can_transition_to(RequestStatus::Retry));
        assert!(s.can_transition_to(RequestStatus::Suspended));
        assert!(s.can_transition_to(RequestStatus::Completed));
        assert!(!s.can_transition_to(RequestStatus::Pending));
    }

    #[test]
    fn status_names_round_trip() {
        for s in [
            RequestStatus::Pending,
            RequestStatus::Forwarding,
            RequestStatus::Processing,
            RequestStatus::Retry,
            RequestStatus::Suspended,
            RequestStatus::Completed,
            RequestStatus::Error,
            RequestStatus::Timeout,
            RequestStatus::Cancelled,
            RequestStatus::NetworkError,
            RequestStatus::StreamError,
            RequestStatus::RateLimited,
        ] {
            assert_eq!(RequestStatus::parse(s.as_str()), Some(s));
        }
    }
}
