//! Endpoint and group management.
//!
//! [`GroupManager`] holds the authoritative endpoint set, maintains group
//! activation state, filters candidates by the active group, and resolves
//! credentials dynamically per attempt. Writers are rare (health updates,
//! operator commands, cooldown expiry); readers are the per-request hot
//! path, so all state sits behind one reader-writer lock with short
//! critical sections.
//!
//! # Active-group selection
//!
//! Run on every mutation and on cooldown/pause expiry. With `G` the groups
//! that are neither cooling down nor paused:
//!
//! - Auto-switch mode: the active group is the lowest-priority-number
//!   member of `G`.
//! - Manual mode: a still-eligible active group is kept. With no active
//!   group, the best group in `G` is activated only if it has at least one
//!   healthy endpoint (startup bootstrap); otherwise no group is active and
//!   operator intervention (or request suspension) takes over.
//!
//! At most one group is ever active.
//!
//! # Group-change notifications
//!
//! [`GroupManager::subscribe_group_changes`] returns a buffered channel of
//! newly activated group names. Sends never block: a full subscriber
//! channel drops the notification for that subscriber and logs it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;

use crate::config::{RelayConfig, SelectionStrategy, StrategySettings};
use crate::endpoint::{Endpoint, EndpointConfig, Group, GroupSnapshot};
use crate::error::{RelayError, RelayResult};
use crate::logging::{log_debug, log_info, log_warn};

/// Buffered capacity of each group-change subscription.
const GROUP_CHANGE_CHANNEL_CAPACITY: usize = 16;

/// Receiving half of a group-change subscription. Dropping it closes the
/// channel; the manager prunes closed senders on the next notification.
pub struct GroupChangeSubscription {
    rx: mpsc::Receiver<String>,
}

impl GroupChangeSubscription {
    /// Wait for the next newly activated group name.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

struct ManagerInner {
    /// All endpoints in declaration order.
    endpoints: Vec<Endpoint>,
    groups: HashMap<String, Group>,
    active_group: Option<String>,
    auto_switch: bool,
    cooldown: Duration,
    strategy: StrategySettings,
}

struct ProbeCache {
    measured_at: Option<Instant>,
    durations: HashMap<String, Option<Duration>>,
}

/// Authoritative endpoint/group state. Constructed once at startup and
/// shared as an `Arc`; config reloads go through [`Self::update_config`].
pub struct GroupManager {
    inner: RwLock<ManagerInner>,
    subscribers: Mutex<Vec<mpsc::Sender<String>>>,
    probe_cache: Mutex<ProbeCache>,
    client: reqwest::Client,
    /// Self-reference for deadline timers spawned off operator commands.
    weak: Weak<GroupManager>,
}

impl GroupManager {
    /// Build the manager from a validated config snapshot and the shared
    /// outbound HTTP client (used for fast-test probes).
    pub fn new(config: &RelayConfig, client: reqwest::Client) -> Arc<Self> {
        let (endpoints, groups) = build_tables(config);
        let mut inner = ManagerInner {
            endpoints,
            groups,
            active_group: None,
            auto_switch: config.group.auto_switch_between_groups,
            cooldown: config.group.cooldown,
            strategy: config.strategy.clone(),
        };
        reevaluate(&mut inner, Instant::now());
        log_info!(
            endpoint_count = inner.endpoints.len(),
            group_count = inner.groups.len(),
            active_group = inner.active_group.as_deref().unwrap_or("none"),
            auto_switch = inner.auto_switch,
            "Group manager initialized"
        );
        Arc::new_cyclic(|weak| Self {
            inner: RwLock::new(inner),
            subscribers: Mutex::new(Vec::new()),
            probe_cache: Mutex::new(ProbeCache {
                measured_at: None,
                durations: HashMap::new(),
            }),
            client,
            weak: weak.clone(),
        })
    }

    /// Rebuild tables from a reloaded config, preserving endpoint health
    /// and group runtime state for names that survive the reload.
    pub fn update_config(&self, config: &RelayConfig) {
        let (mut endpoints, mut groups) = build_tables(config);
        let changed = {
            let mut inner = self.inner.write().expect("group lock poisoned");
            for endpoint in &mut endpoints {
                if let Some(old) = inner
                    .endpoints
                    .iter()
                    .find(|e| e.config.name == endpoint.config.name)
                {
                    endpoint.status = old.status.clone();
                }
            }
            for (name, group) in &mut groups {
                if let Some(old) = inner.groups.get(name) {
                    group.manually_paused = old.manually_paused;
                    group.paused_until = old.paused_until;
                    group.cooldown_until = old.cooldown_until;
                    group.forced_activation = old.forced_activation;
                    group.forced_activation_time = old.forced_activation_time;
                    group.last_manual_activation = old.last_manual_activation;
                }
            }
            inner.endpoints = endpoints;
            inner.groups = groups;
            inner.auto_switch = config.group.auto_switch_between_groups;
            inner.cooldown = config.group.cooldown;
            inner.strategy = config.strategy.clone();
            reevaluate(&mut inner, Instant::now())
        };
        self.probe_cache.lock().expect("probe cache poisoned").measured_at = None;
        log_info!("Group manager configuration reloaded");
        if let Some(name) = changed {
            self.notify_group_change(&name);
        }
    }

    // ========================================================================
    // Candidate listing and credential resolution
    // ========================================================================

    /// Ordered candidate endpoints from the currently active group:
    /// healthy members ordered by the configured strategy, ties broken by
    /// declaration order. Empty when no group is active or no member is
    /// healthy.
    pub async fn list_candidates(&self) -> Vec<EndpointConfig> {
        let (mut candidates, strategy) = {
            let inner = self.inner.read().expect("group lock poisoned");
            let Some(active) = inner.active_group.as_deref() else {
                return Vec::new();
            };
            let candidates: Vec<_> = inner
                .endpoints
                .iter()
                .filter(|e| e.config.group == active && e.status.healthy)
                .map(|e| (e.config.clone(), e.status.last_response_time))
                .collect();
            (candidates, inner.strategy.clone())
        };

        match strategy.kind {
            SelectionStrategy::Priority => {
                candidates.sort_by_key(|(c, _)| (c.priority, c.config_index));
            }
            SelectionStrategy::Fastest => {
                let measured = if strategy.fast_test_enabled {
                    let configs: Vec<_> = candidates.iter().map(|(c, _)| c.clone()).collect();
                    Some(self.probe_response_times(&configs, &strategy).await)
                } else {
                    None
                };
                candidates.sort_by_key(|(c, last)| {
                    let time = measured
                        .as_ref()
                        .and_then(|m| m.get(&c.name).copied().flatten())
                        .or(*last);
                    // Unmeasured endpoints sort last, then by declaration.
                    (time.unwrap_or(Duration::MAX), c.config_index)
                });
            }
        }
        candidates.into_iter().map(|(c, _)| c).collect()
    }

    /// Resolve credentials for an attempt against the named endpoint. Each
    /// field is resolved independently: the endpoint's own value wins,
    /// otherwise the first non-empty value among same-group endpoints in
    /// declaration order. Resolution happens per attempt so a group switch
    /// picks up the new group's credentials.
    pub fn resolve_credentials(&self, endpoint_name: &str) -> (Option<String>, Option<String>) {
        let inner = self.inner.read().expect("group lock poisoned");
        let Some(endpoint) = inner
            .endpoints
            .iter()
            .find(|e| e.config.name == endpoint_name)
        else {
            return (None, None);
        };
        let group = endpoint.config.group.clone();
        let scan = |own: &Option<String>, pick: fn(&EndpointConfig) -> &Option<String>| {
            if own.as_deref().is_some_and(|v| !v.is_empty()) {
                return own.clone();
            }
            inner
                .endpoints
                .iter()
                .filter(|e| e.config.group == group)
                .filter_map(|e| pick(&e.config).clone())
                .find(|v| !v.is_empty())
        };
        let token = scan(&endpoint.config.token, |c| &c.token);
        let api_key = scan(&endpoint.config.api_key, |c| &c.api_key);
        (token, api_key)
    }

    // ========================================================================
    // Operator commands
    // ========================================================================

    /// Activate a group by hand.
    ///
    /// Non-force activation requires at least one healthy endpoint in the
    /// group. Force activation is for controlled failure scenarios: it
    /// requires **zero** healthy endpoints and refuses otherwise, marking
    /// the group as force-activated until a normal activation clears the
    /// flag. Either way a group in cooldown is rejected.
    pub fn manual_activate(&self, group_name: &str, force: bool) -> RelayResult<()> {
        let activated = {
            let mut inner = self.inner.write().expect("group lock poisoned");
            let now = Instant::now();
            let healthy = healthy_count(&inner, group_name);
            let group = inner
                .groups
                .get(group_name)
                .ok_or_else(|| RelayError::config_error(format!("unknown group: {group_name}")))?;

            if group.in_cooldown(now) {
                return Err(RelayError::unavailable(format!(
                    "group {group_name} is in cooldown"
                )));
            }
            if force {
                if group.is_active {
                    return Err(RelayError::unavailable(format!(
                        "group {group_name} is already active"
                    )));
                }
                if healthy > 0 {
                    return Err(RelayError::unavailable(format!(
                        "force activation refused: group {group_name} has {healthy} healthy endpoint(s)"
                    )));
                }
            } else if healthy == 0 {
                return Err(RelayError::unavailable(format!(
                    "group {group_name} has no healthy endpoints"
                )));
            }

            for g in inner.groups.values_mut() {
                g.is_active = false;
            }
            let group = inner.groups.get_mut(group_name).expect("checked above");
            group.is_active = true;
            group.manually_paused = false;
            group.paused_until = None;
            group.last_manual_activation = Some(Utc::now());
            if force {
                group.forced_activation = true;
                group.forced_activation_time = Some(Utc::now());
            } else {
                group.forced_activation = false;
            }
            inner.active_group = Some(group_name.to_string());
            group_name.to_string()
        };
        log_info!(group = %activated, force = force, "Group manually activated");
        self.notify_group_change(&activated);
        Ok(())
    }

    /// Pause a group; an optional duration schedules automatic resume. If
    /// the paused group was active, another group is activated when one is
    /// eligible.
    pub fn manual_pause(&self, group_name: &str, duration: Option<Duration>) -> RelayResult<()> {
        let changed = {
            let mut inner = self.inner.write().expect("group lock poisoned");
            let now = Instant::now();
            let group = inner
                .groups
                .get_mut(group_name)
                .ok_or_else(|| RelayError::config_error(format!("unknown group: {group_name}")))?;
            group.manually_paused = true;
            group.paused_until = duration.map(|d| now + d);
            group.is_active = false;
            if inner.active_group.as_deref() == Some(group_name) {
                inner.active_group = None;
            }
            reevaluate(&mut inner, now)
        };
        log_info!(
            group = group_name,
            duration_secs = duration.map(|d| d.as_secs()),
            "Group manually paused"
        );
        if let Some(name) = changed {
            self.notify_group_change(&name);
        }
        if let Some(d) = duration {
            self.schedule_reevaluation(d);
        }
        Ok(())
    }

    /// Clear a manual pause and re-evaluate the active group.
    pub fn manual_resume(&self, group_name: &str) -> RelayResult<()> {
        let changed = {
            let mut inner = self.inner.write().expect("group lock poisoned");
            let group = inner
                .groups
                .get_mut(group_name)
                .ok_or_else(|| RelayError::config_error(format!("unknown group: {group_name}")))?;
            group.manually_paused = false;
            group.paused_until = None;
            reevaluate(&mut inner, Instant::now())
        };
        log_info!(group = group_name, "Group manually resumed");
        if let Some(name) = changed {
            self.notify_group_change(&name);
        }
        Ok(())
    }

    /// Record that the named group exhausted its attempts. In auto-switch
    /// mode the group enters cooldown; in manual mode it is paused instead
    /// and cooldown is never touched. Either way it is deactivated and the
    /// selection algorithm runs, notifying subscribers if another group
    /// takes over.
    pub fn report_failure(&self, group_name: &str) {
        let (changed, cooldown) = {
            let mut inner = self.inner.write().expect("group lock poisoned");
            let now = Instant::now();
            let auto = inner.auto_switch;
            let cooldown = inner.cooldown;
            let Some(group) = inner.groups.get_mut(group_name) else {
                return;
            };
            if auto {
                group.cooldown_until = Some(now + cooldown);
            } else {
                group.manually_paused = true;
                group.paused_until = None;
            }
            group.is_active = false;
            if inner.active_group.as_deref() == Some(group_name) {
                inner.active_group = None;
            }
            (reevaluate(&mut inner, now), auto.then_some(cooldown))
        };
        log_warn!(
            group = group_name,
            cooldown_secs = cooldown.map(|d| d.as_secs()),
            "Group taken out of rotation after repeated failures"
        );
        if let Some(name) = changed {
            self.notify_group_change(&name);
        }
        if let Some(d) = cooldown {
            self.schedule_reevaluation(d);
        }
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe to newly activated group names. The channel is buffered;
    /// notifications to a full subscriber are dropped, never blocked on.
    pub fn subscribe_group_changes(&self) -> GroupChangeSubscription {
        let (tx, rx) = mpsc::channel(GROUP_CHANGE_CHANNEL_CAPACITY);
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(tx);
        GroupChangeSubscription { rx }
    }

    fn notify_group_change(&self, group_name: &str) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        subscribers.retain(|tx| !tx.is_closed());
        for tx in subscribers.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(group_name.to_string()) {
                log_warn!(
                    group = group_name,
                    "Group-change notification dropped: subscriber channel full"
                );
            }
        }
        log_debug!(
            group = group_name,
            subscriber_count = subscribers.len(),
            "Group-change notification dispatched"
        );
    }

    // ========================================================================
    // Health support
    // ========================================================================

    /// Endpoints the health checker should probe this sweep: only the
    /// active group's in auto mode; everything in manual mode, so
    /// operators can see which backup group is worth activating.
    pub fn endpoints_to_check(&self) -> Vec<EndpointConfig> {
        let inner = self.inner.read().expect("group lock poisoned");
        if inner.auto_switch {
            let Some(active) = inner.active_group.as_deref() else {
                return Vec::new();
            };
            inner
                .endpoints
                .iter()
                .filter(|e| e.config.group == active)
                .map(|e| e.config.clone())
                .collect()
        } else {
            inner.endpoints.iter().map(|e| e.config.clone()).collect()
        }
    }

    /// Apply one health-check result and re-run group selection.
    pub fn record_health_result(
        &self,
        endpoint_name: &str,
        healthy: bool,
        response_time: Option<Duration>,
    ) {
        let changed = {
            let mut inner = self.inner.write().expect("group lock poisoned");
            let Some(endpoint) = inner
                .endpoints
                .iter_mut()
                .find(|e| e.config.name == endpoint_name)
            else {
                return;
            };
            endpoint.status.never_checked = false;
            endpoint.status.last_check_time = Some(Utc::now());
            if let Some(rt) = response_time {
                endpoint.status.last_response_time = Some(rt);
            }
            if healthy {
                endpoint.status.healthy = true;
                endpoint.status.consecutive_failures = 0;
            } else {
                endpoint.status.healthy = false;
                endpoint.status.consecutive_failures += 1;
            }
            reevaluate(&mut inner, Instant::now())
        };
        if let Some(name) = changed {
            self.notify_group_change(&name);
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Name of the currently active group, if any.
    pub fn active_group(&self) -> Option<String> {
        self.inner
            .read()
            .expect("group lock poisoned")
            .active_group
            .clone()
    }

    /// Whether the manager runs in auto-switch mode.
    pub fn auto_switch(&self) -> bool {
        self.inner.read().expect("group lock poisoned").auto_switch
    }

    /// Healthy-endpoint count of the named group.
    pub fn healthy_endpoints(&self, group_name: &str) -> usize {
        healthy_count(&self.inner.read().expect("group lock poisoned"), group_name)
    }

    /// Snapshot of every group for operators and dashboards.
    pub fn group_snapshots(&self) -> Vec<GroupSnapshot> {
        let inner = self.inner.read().expect("group lock poisoned");
        let now = Instant::now();
        let mut snapshots: Vec<_> = inner
            .groups
            .values()
            .map(|g| GroupSnapshot {
                name: g.name.clone(),
                priority: g.priority,
                is_active: g.is_active,
                manually_paused: g.is_paused(now),
                in_cooldown: g.in_cooldown(now),
                forced_activation: g.forced_activation,
                healthy_endpoints: healthy_count(&inner, &g.name),
                total_endpoints: g.endpoints.len(),
            })
            .collect();
        snapshots.sort_by_key(|s| s.priority);
        snapshots
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Re-run selection after a deadline (cooldown or timed pause) expires.
    fn schedule_reevaluation(&self, after: Duration) {
        let Some(manager) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let changed = {
                let mut inner = manager.inner.write().expect("group lock poisoned");
                reevaluate(&mut inner, Instant::now())
            };
            if let Some(name) = changed {
                log_info!(group = %name, "Group re-activated after deadline expiry");
                manager.notify_group_change(&name);
            }
        });
    }

    /// Probe each candidate concurrently against the fast-test path,
    /// caching measurements for the configured TTL.
    async fn probe_response_times(
        &self,
        candidates: &[EndpointConfig],
        strategy: &StrategySettings,
    ) -> HashMap<String, Option<Duration>> {
        {
            let cache = self.probe_cache.lock().expect("probe cache poisoned");
            if let Some(at) = cache.measured_at {
                if at.elapsed() < strategy.fast_test_cache_ttl
                    && candidates.iter().all(|c| cache.durations.contains_key(&c.name))
                {
                    return cache.durations.clone();
                }
            }
        }

        let probes = candidates.iter().map(|candidate| {
            let client = self.client.clone();
            let url = format!("{}{}", candidate.url, strategy.fast_test_path);
            let name = candidate.name.clone();
            let timeout = strategy.fast_test_timeout;
            async move {
                let started = Instant::now();
                let outcome = client.get(&url).timeout(timeout).send().await;
                let duration = match outcome {
                    Ok(response) if response.status().is_success() => Some(started.elapsed()),
                    _ => None,
                };
                (name, duration)
            }
        });
        let measured: HashMap<_, _> = futures_util::future::join_all(probes)
            .await
            .into_iter()
            .collect();

        let mut cache = self.probe_cache.lock().expect("probe cache poisoned");
        cache.measured_at = Some(Instant::now());
        cache.durations = measured.clone();
        log_debug!(probe_count = measured.len(), "Fast-test probe sweep finished");
        measured
    }
}

/// Build endpoint and group tables from a config snapshot.
fn build_tables(config: &RelayConfig) -> (Vec<Endpoint>, HashMap<String, Group>) {
    let mut endpoints = Vec::with_capacity(config.endpoints.len());
    let mut groups: HashMap<String, Group> = HashMap::new();
    for (index, entry) in config.endpoints.iter().enumerate() {
        let endpoint_config = EndpointConfig::from_entry(index, entry);
        let group = groups
            .entry(endpoint_config.group.clone())
            .or_insert_with(|| {
                Group::new(
                    endpoint_config.group.clone(),
                    endpoint_config.group_priority,
                    index,
                )
            });
        group.endpoints.push(endpoint_config.name.clone());
        endpoints.push(Endpoint::new(endpoint_config));
    }
    (endpoints, groups)
}

fn healthy_count(inner: &ManagerInner, group_name: &str) -> usize {
    inner
        .endpoints
        .iter()
        .filter(|e| e.config.group == group_name && e.status.healthy)
        .count()
}

/// The active-group selection algorithm. Returns the name of a group that
/// just became active, for notification.
fn reevaluate(inner: &mut ManagerInner, now: Instant) -> Option<String> {
    let previous = inner.active_group.clone();

    let mut available: Vec<_> = inner
        .groups
        .values()
        .filter(|g| g.is_available(now))
        .map(|g| (g.priority, g.declared_index, g.name.clone()))
        .collect();
    available.sort();

    let next = if inner.auto_switch {
        available.first().map(|(_, _, name)| name.clone())
    } else {
        let current_still_available = previous
            .as_deref()
            .is_some_and(|name| available.iter().any(|(_, _, n)| n == name));
        if current_still_available {
            previous.clone()
        } else {
            // Without auto-switch, only a group with a live endpoint is
            // worth activating unattended; otherwise no group stays active
            // and the operator (or request suspension) takes over.
            available
                .iter()
                .find(|(_, _, name)| healthy_count(inner, name) > 0)
                .map(|(_, _, name)| name.clone())
        }
    };

    for group in inner.groups.values_mut() {
        group.is_active = false;
    }
    if let Some(name) = &next {
        if let Some(group) = inner.groups.get_mut(name) {
            group.is_active = true;
            // A normal activation clears any earlier forced activation.
            if previous.as_deref() != Some(name.as_str()) {
                group.forced_activation = false;
            }
        }
    }
    inner.active_group = next.clone();

    match (&previous, &next) {
        (Some(p), Some(n)) if p == n => None,
        (_, Some(n)) => Some(n.clone()),
        _ => None,
    }
}
