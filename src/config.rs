//! Configuration types for the relay core.
//!
//! The outer layer owns file loading and hot reload; the core receives a
//! fully typed [`RelayConfig`] snapshot. Every tunable consumed anywhere in
//! the crate is declared here, one sub-struct per concern, each with
//! defaults that work unmodified in a single-endpoint setup.
//!
//! # Quick Start
//!
//! ```rust
//! use claude_relay::config::{EndpointEntry, RelayConfig};
//!
//! let mut config = RelayConfig::default();
//! config.endpoints.push(EndpointEntry {
//!     name: "primary".to_string(),
//!     url: "https://api.anthropic.com".to_string(),
//!     token: Some("sk-ant-...".to_string()),
//!     ..Default::default()
//! });
//! config.apply_inheritance();
//! config.validate()?;
//! # Ok::<(), claude_relay::RelayError>(())
//! ```
//!
//! # Endpoint inheritance
//!
//! Endpoint list entries inherit `group` and `group-priority` from the
//! most recent preceding entry that set them, and `timeout`/`headers` from
//! the first entry. Credentials (`token`, `api-key`) are never statically
//! inherited — they are resolved dynamically per attempt so a group
//! failover picks up the new group's credentials.

use std::collections::HashMap;
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};
use crate::pricing::ModelPricing;

/// Timeout applied to buffered upstream attempts when an endpoint does not
/// configure its own.
pub const DEFAULT_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(300);

/// Group name used when no endpoint entry declares one.
pub const DEFAULT_GROUP: &str = "default";

// ============================================================================
// Top-level snapshot
// ============================================================================

/// Complete, validated configuration snapshot consumed by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RelayConfig {
    /// Upstream endpoint list, in declaration order. Order matters: it
    /// breaks priority ties and drives credential resolution.
    pub endpoints: Vec<EndpointEntry>,
    pub retry: RetrySettings,
    pub health: HealthSettings,
    pub strategy: StrategySettings,
    pub streaming: StreamingSettings,
    pub group: GroupSettings,
    pub request_suspend: SuspendSettings,
    pub usage_tracking: TrackingSettings,
    pub proxy: ProxySettings,
    /// Ceiling on the whole request, suspension included.
    pub global_timeout: Duration,
    /// Time zone used for every timestamp written to the durable store.
    pub timezone: Tz,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            retry: RetrySettings::default(),
            health: HealthSettings::default(),
            strategy: StrategySettings::default(),
            streaming: StreamingSettings::default(),
            group: GroupSettings::default(),
            request_suspend: SuspendSettings::default(),
            usage_tracking: TrackingSettings::default(),
            proxy: ProxySettings::default(),
            global_timeout: Duration::from_secs(600),
            timezone: chrono_tz::Asia::Shanghai,
        }
    }
}

impl RelayConfig {
    /// Apply the endpoint inheritance rules in place. Idempotent; call once
    /// after deserializing and before validation.
    pub fn apply_inheritance(&mut self) {
        let first_timeout = self.endpoints.first().and_then(|e| e.timeout);
        let first_headers = self.endpoints.first().and_then(|e| e.headers.clone());

        let mut current_group: Option<String> = None;
        let mut current_group_priority: Option<u32> = None;

        for entry in &mut self.endpoints {
            match &entry.group {
                Some(g) => current_group = Some(g.clone()),
                None => entry.group = current_group.clone(),
            }
            match entry.group_priority {
                Some(p) => current_group_priority = Some(p),
                None => entry.group_priority = current_group_priority,
            }
            if entry.timeout.is_none() {
                entry.timeout = first_timeout;
            }
            if entry.headers.is_none() {
                entry.headers = first_headers.clone();
            }
        }
    }

    /// Check the snapshot for contradictions before handing it to the core.
    pub fn validate(&self) -> RelayResult<()> {
        if self.endpoints.is_empty() {
            return Err(RelayError::config_error("at least one endpoint is required"));
        }
        let mut names = std::collections::HashSet::new();
        for entry in &self.endpoints {
            if entry.name.is_empty() {
                return Err(RelayError::config_error("endpoint name must not be empty"));
            }
            if !names.insert(entry.name.as_str()) {
                return Err(RelayError::config_error(format!(
                    "duplicate endpoint name: {}",
                    entry.name
                )));
            }
            if !entry.url.starts_with("http://") && !entry.url.starts_with("https://") {
                return Err(RelayError::config_error(format!(
                    "endpoint {} has a non-HTTP url: {}",
                    entry.name, entry.url
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(RelayError::config_error("retry.max-attempts must be at least 1"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(RelayError::config_error("retry.multiplier must be >= 1.0"));
        }
        if self.usage_tracking.buffer_size == 0 || self.usage_tracking.batch_size == 0 {
            return Err(RelayError::config_error(
                "usage-tracking buffer-size and batch-size must be positive",
            ));
        }
        if !self.health.health_path.starts_with('/') {
            return Err(RelayError::config_error(
                "health.health-path must start with '/'",
            ));
        }
        if self.strategy.fast_test_enabled && !self.strategy.fast_test_path.starts_with('/') {
            return Err(RelayError::config_error(
                "strategy.fast-test-path must start with '/'",
            ));
        }
        self.proxy.validate()?;
        Ok(())
    }
}

// ============================================================================
// Endpoint entries
// ============================================================================

/// One upstream endpoint as declared by the operator.
///
/// `group`, `group-priority`, `timeout`, and `headers` may be omitted and
/// filled in by [`RelayConfig::apply_inheritance`]. Credentials are left
/// exactly as declared.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EndpointEntry {
    pub name: String,
    /// Base URL the original path and query are appended to.
    pub url: String,
    /// Selection order within the group; lower wins.
    pub priority: u32,
    pub group: Option<String>,
    pub group_priority: Option<u32>,
    /// Bearer token injected as `Authorization: Bearer <token>`.
    pub token: Option<String>,
    /// Key injected as `x-api-key`.
    pub api_key: Option<String>,
    pub timeout: Option<Duration>,
    /// Extra headers merged into the upstream request; endpoint-specific
    /// values override group-inherited ones.
    pub headers: Option<HashMap<String, String>>,
}

// ============================================================================
// Concern-scoped settings
// ============================================================================

/// Retry and backoff tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetrySettings {
    /// Attempt ceiling per group cycle.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper cap on any single delay.
    pub max_delay: Duration,
    /// Exponential backoff base.
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Background health checking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HealthSettings {
    pub check_interval: Duration,
    pub timeout: Duration,
    /// Path probed on each endpoint, e.g. `/health`.
    pub health_path: String,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            health_path: "/health".to_string(),
        }
    }
}

/// Endpoint ordering strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionStrategy {
    /// Static `priority` ascending.
    Priority,
    /// Measured response time ascending.
    Fastest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StrategySettings {
    #[serde(rename = "type")]
    pub kind: SelectionStrategy,
    /// Probe candidates before ordering in `fastest` mode.
    pub fast_test_enabled: bool,
    /// How long probe measurements stay valid.
    pub fast_test_cache_ttl: Duration,
    pub fast_test_timeout: Duration,
    pub fast_test_path: String,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            kind: SelectionStrategy::Priority,
            fast_test_enabled: false,
            fast_test_cache_ttl: Duration::from_secs(60),
            fast_test_timeout: Duration::from_secs(2),
            fast_test_path: "/v1/models".to_string(),
        }
    }
}

/// Streaming relay behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StreamingSettings {
    pub heartbeat_interval: Duration,
    pub read_timeout: Duration,
    /// Longest tolerated gap between upstream bytes.
    pub max_idle_time: Duration,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(300),
            max_idle_time: Duration::from_secs(120),
        }
    }
}

/// Group failover behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GroupSettings {
    /// How long a failed group stays out of rotation.
    pub cooldown: Duration,
    /// When false, failover requires operator action (or suspension).
    pub auto_switch_between_groups: bool,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(600),
            auto_switch_between_groups: true,
        }
    }
}

/// Request suspension while no group is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SuspendSettings {
    pub enabled: bool,
    /// Per-request ceiling on time spent suspended.
    pub timeout: Duration,
    pub max_suspended_requests: usize,
}

impl Default for SuspendSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout: Duration::from_secs(300),
            max_suspended_requests: 100,
        }
    }
}

/// Usage tracking and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TrackingSettings {
    pub enabled: bool,
    /// Capacity of the in-flight event channel.
    pub buffer_size: usize,
    /// Events applied per store write.
    pub batch_size: usize,
    /// Partial batches are flushed this often.
    pub flush_interval: Duration,
    /// Store write attempts before an event is dropped.
    pub max_retry: u32,
    /// Rows older than this are swept; 0 keeps everything.
    pub retention_days: u32,
    pub cleanup_interval: Duration,
    pub model_pricing: HashMap<String, ModelPricing>,
    pub default_pricing: ModelPricing,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_size: 1000,
            batch_size: 100,
            flush_interval: Duration::from_secs(30),
            max_retry: 3,
            retention_days: 30,
            cleanup_interval: Duration::from_secs(24 * 3600),
            model_pricing: HashMap::new(),
            default_pricing: ModelPricing::default(),
        }
    }
}

/// Outbound proxy scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Https,
    Socks5,
}

/// Process-wide outbound proxy for upstream traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProxySettings {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: ProxyKind,
    /// Full proxy URL; wins over host/port when both are set.
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: ProxyKind::Http,
            url: None,
            host: None,
            port: None,
            username: None,
            password: None,
        }
    }
}

impl ProxySettings {
    fn validate(&self) -> RelayResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.url.is_none() && (self.host.is_none() || self.port.is_none()) {
            return Err(RelayError::config_error(
                "proxy.enabled requires either url or host+port",
            ));
        }
        Ok(())
    }

    /// The proxy URL the transport should use, scheme included.
    pub fn effective_url(&self) -> Option<String> {
        if !self.enabled {
            return None;
        }
        if let Some(url) = &self.url {
            return Some(url.clone());
        }
        let (host, port) = (self.host.as_ref()?, self.port?);
        let scheme = match self.kind {
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
            ProxyKind::Socks5 => "socks5",
        };
        Some(format!("{scheme}://{host}:{port}"))
    }
}
