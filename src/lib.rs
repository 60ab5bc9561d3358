//! # claude-relay
//!
//! Reverse-proxy core for Claude-compatible LLM APIs: one logical endpoint
//! in front of many upstream providers, with health-checked endpoint
//! groups, retry and cross-group failover, optional request suspension,
//! SSE token extraction, and durable per-request usage records.
//!
//! ## Key Features
//!
//! - **Endpoint groups**: priority-ordered failover groups with cooldown,
//!   manual pause/resume/force-activate, and dynamic credential resolution
//! - **Retry & suspension**: exponential backoff, cross-group failover,
//!   and FIFO request suspension while no group is active
//! - **Streaming**: SSE relay that extracts model identity and token
//!   counts without buffering, preserving partial usage when streams fail
//! - **Usage tracking**: asynchronous, batched lifecycle persistence with
//!   exactly-once completion and fixed-precision cost accounting
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use claude_relay::{Relay, RelayConfig, SqliteStore};
//! use claude_relay::config::EndpointEntry;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut config = RelayConfig::default();
//! config.endpoints.push(EndpointEntry {
//!     name: "primary".to_string(),
//!     url: "https://api.anthropic.com".to_string(),
//!     token: Some("sk-ant-...".to_string()),
//!     ..Default::default()
//! });
//! config.apply_inheritance();
//!
//! let store = Arc::new(SqliteStore::open("requests.db", config.timezone)?);
//! let relay = Relay::new(config, store)?;
//! // Hand requests over with relay.handle_request(...)
//! # Ok(())
//! # }
//! ```

// Allow missing errors documentation - errors are self-documenting via type signatures
#![allow(clippy::missing_errors_doc)]

// =============================================================================
// Module declarations
// =============================================================================

// Public modules - one per component
pub mod config;
pub mod coordinator;
pub mod endpoint;
pub mod error;
pub mod forward;
pub mod group;
pub mod health;
pub mod lifecycle;
pub mod pricing;
pub mod relay;
pub mod retry;
pub mod store;
pub mod stream;
pub mod tracker;

// Internal modules
pub(crate) mod internals;
pub(crate) mod logging;

// =============================================================================
// Public API re-exports
// =============================================================================

// Assembly
pub use relay::Relay;

// Configuration
pub use config::{
    GroupSettings, HealthSettings, ProxySettings, RelayConfig, RetrySettings, SelectionStrategy,
    StrategySettings, StreamingSettings, SuspendSettings, TrackingSettings,
};

// Errors
pub use error::{ErrorKind, RelayError, RelayResult, StreamStatus, StreamStatusKind};

// Request handling
pub use coordinator::{CompletedRequest, RequestCoordinator};
pub use forward::{ClientSink, ProxyRequest, UpstreamForwarder};
pub use stream::{StreamOutcome, StreamProcessor};

// Endpoint management
pub use endpoint::{Endpoint, EndpointConfig, EndpointStatus, Group, GroupSnapshot};
pub use group::{GroupChangeSubscription, GroupManager};
pub use health::HealthChecker;

// Lifecycle and usage tracking
pub use lifecycle::{generate_request_id, RequestRecord, RequestStatus};
pub use pricing::{CostBreakdown, ModelPricing, PricingTable};
pub use store::{MemoryStore, RequestUpdate, SqliteStore, UsageStore};
pub use tracker::LifecycleTracker;

// Token parsing (from internals, re-exported for public use)
pub use internals::sse::{parse_buffered_message, SseParser, TokenUsage};

// Retry and failover control
pub use retry::{ForwardResult, RetryController, RetryPolicy};
