//! Endpoint and group data model.
//!
//! An [`Endpoint`] pairs immutable configuration with mutable health
//! status. A [`Group`] is derived from endpoints sharing a `group` name and
//! is the unit of failover: at most one group is active at any instant.
//! The canonical collections live in [`crate::group::GroupManager`];
//! everything else refers to endpoints and groups by name.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::config::{EndpointEntry, DEFAULT_ENDPOINT_TIMEOUT, DEFAULT_GROUP};

/// Immutable endpoint configuration, resolved after inheritance.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub name: String,
    pub url: String,
    pub priority: u32,
    pub group: String,
    pub group_priority: u32,
    pub token: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub extra_headers: HashMap<String, String>,
    /// Declaration order; breaks priority ties and drives credential scans.
    pub config_index: usize,
}

impl EndpointConfig {
    /// Build from a post-inheritance config entry.
    pub fn from_entry(config_index: usize, entry: &EndpointEntry) -> Self {
        Self {
            name: entry.name.clone(),
            url: entry.url.trim_end_matches('/').to_string(),
            priority: entry.priority,
            group: entry
                .group
                .clone()
                .unwrap_or_else(|| DEFAULT_GROUP.to_string()),
            group_priority: entry.group_priority.unwrap_or(1),
            token: entry.token.clone(),
            api_key: entry.api_key.clone(),
            timeout: entry.timeout.unwrap_or(DEFAULT_ENDPOINT_TIMEOUT),
            extra_headers: entry.headers.clone().unwrap_or_default(),
            config_index,
        }
    }
}

/// Mutable endpoint health, owned by the health checker and manual check
/// commands.
#[derive(Debug, Clone)]
pub struct EndpointStatus {
    pub healthy: bool,
    /// True until the first health response arrives. Endpoints start
    /// optimistic so a fresh process can serve before the first sweep.
    pub never_checked: bool,
    pub last_check_time: Option<DateTime<Utc>>,
    pub last_response_time: Option<Duration>,
    pub consecutive_failures: u32,
}

impl Default for EndpointStatus {
    fn default() -> Self {
        Self {
            healthy: true,
            never_checked: true,
            last_check_time: None,
            last_response_time: None,
            consecutive_failures: 0,
        }
    }
}

/// One upstream endpoint: configuration plus runtime status.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub config: EndpointConfig,
    pub status: EndpointStatus,
}

impl Endpoint {
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            status: EndpointStatus::default(),
        }
    }
}

/// Runtime state of one failover group.
#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub priority: u32,
    /// Declaration order of the group's first member, for priority ties.
    pub declared_index: usize,
    pub is_active: bool,
    pub manually_paused: bool,
    /// Automatic resume deadline for a timed pause.
    pub paused_until: Option<Instant>,
    pub cooldown_until: Option<Instant>,
    pub forced_activation: bool,
    pub forced_activation_time: Option<DateTime<Utc>>,
    pub last_manual_activation: Option<DateTime<Utc>>,
    /// Member endpoint names in declaration order.
    pub endpoints: Vec<String>,
}

impl Group {
    pub fn new(name: String, priority: u32, declared_index: usize) -> Self {
        Self {
            name,
            priority,
            declared_index,
            is_active: false,
            manually_paused: false,
            paused_until: None,
            cooldown_until: None,
            forced_activation: false,
            forced_activation_time: None,
            last_manual_activation: None,
            endpoints: Vec::new(),
        }
    }

    /// Whether the cooldown window is still running.
    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// Whether a manual pause is in force, honouring a timed pause's
    /// automatic resume deadline.
    pub fn is_paused(&self, now: Instant) -> bool {
        if !self.manually_paused {
            return false;
        }
        match self.paused_until {
            Some(until) => now < until,
            None => true,
        }
    }

    /// Eligible for activation: neither cooling down nor paused.
    pub fn is_available(&self, now: Instant) -> bool {
        !self.in_cooldown(now) && !self.is_paused(now)
    }
}

/// Read-only view of a group for operators and dashboards.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GroupSnapshot {
    pub name: String,
    pub priority: u32,
    pub is_active: bool,
    pub manually_paused: bool,
    pub in_cooldown: bool,
    pub forced_activation: bool,
    pub healthy_endpoints: usize,
    pub total_endpoints: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_is_normalized() {
        let entry = EndpointEntry {
            name: "a".to_string(),
            url: "https://api.example.com/".to_string(),
            ..Default::default()
        };
        let config = EndpointConfig::from_entry(0, &entry);
        assert_eq!(config.url, "https://api.example.com");
        assert_eq!(config.group, DEFAULT_GROUP);
        assert_eq!(config.timeout, DEFAULT_ENDPOINT_TIMEOUT);
    }

    #[test]
    fn endpoints_start_optimistic_and_unchecked() {
        let status = EndpointStatus::default();
        assert!(status.healthy);
        assert!(status.never_checked);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[test]
    fn timed_pause_expires() {
        let mut group = Group::new("g".to_string(), 1, 0);
        let now = Instant::now();
        group.manually_paused = true;
        group.paused_until = Some(now + Duration::from_millis(100));
        assert!(group.is_paused(now));
        assert!(!group.is_paused(now + Duration::from_millis(200)));

        group.paused_until = None;
        assert!(group.is_paused(now + Duration::from_secs(3600)));
    }

    #[test]
    fn cooldown_window_expires() {
        let mut group = Group::new("g".to_string(), 1, 0);
        let now = Instant::now();
        group.cooldown_until = Some(now + Duration::from_millis(50));
        assert!(group.in_cooldown(now));
        assert!(!group.in_cooldown(now + Duration::from_millis(60)));
        assert!(!group.is_available(now));
        assert!(group.is_available(now + Duration::from_millis(60)));
    }
}
