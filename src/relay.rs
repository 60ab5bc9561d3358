//! Top-level assembly.
//!
//! [`Relay`] constructs the process-wide singletons in their required
//! order — transport, pricing table, group manager, lifecycle tracker,
//! suspension queue, health checker, retry controller, coordinator — and
//! exposes the handful of entry points the outer layer needs: request
//! handling, operator commands, config reload, and shutdown.
//!
//! Construction spawns background tasks and therefore must happen inside a
//! tokio runtime.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::coordinator::{CompletedRequest, RequestCoordinator};
use crate::endpoint::GroupSnapshot;
use crate::error::RelayResult;
use crate::forward::{ClientSink, ProxyRequest, UpstreamForwarder};
use crate::group::GroupManager;
use crate::health::HealthChecker;
use crate::internals::suspend::SuspensionQueue;
use crate::logging::log_info;
use crate::pricing::PricingTable;
use crate::retry::RetryController;
use crate::store::UsageStore;
use crate::stream::StreamProcessor;
use crate::tracker::LifecycleTracker;

/// The assembled forwarding core.
pub struct Relay {
    manager: Arc<GroupManager>,
    tracker: Arc<LifecycleTracker>,
    pricing: Arc<PricingTable>,
    coordinator: RequestCoordinator,
    queue: Arc<SuspensionQueue>,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Relay {
    /// Validate the config and bring the core up. The store is injected so
    /// deployments can choose SQLite, memory, or their own backend.
    pub fn new(config: RelayConfig, store: Arc<dyn UsageStore>) -> RelayResult<Self> {
        config.validate()?;

        let client = UpstreamForwarder::build_client(&config.proxy)?;
        let pricing = Arc::new(PricingTable::new(
            config.usage_tracking.model_pricing.clone(),
            config.usage_tracking.default_pricing,
        ));
        let manager = GroupManager::new(&config, client.clone());
        let tracker = LifecycleTracker::new(
            config.usage_tracking.clone(),
            store,
            Arc::clone(&pricing),
        );
        let queue = SuspensionQueue::new(config.request_suspend.max_suspended_requests);

        let cancel = CancellationToken::new();
        let dispatcher = queue.spawn_dispatcher(manager.subscribe_group_changes(), cancel.clone());
        let health = HealthChecker::new(
            Arc::clone(&manager),
            client.clone(),
            config.health.clone(),
            cancel.clone(),
        )
        .spawn();

        let forwarder = Arc::new(UpstreamForwarder::new(client));
        let controller = RetryController::new(
            Arc::clone(&manager),
            forwarder,
            StreamProcessor::new(config.streaming.clone()),
            Arc::clone(&tracker),
            Arc::clone(&queue),
            &config.retry,
            config.request_suspend.clone(),
        );
        let coordinator =
            RequestCoordinator::new(controller, Arc::clone(&tracker), config.global_timeout);

        log_info!(
            endpoint_count = config.endpoints.len(),
            auto_switch = config.group.auto_switch_between_groups,
            suspend_enabled = config.request_suspend.enabled,
            "Relay core started"
        );

        Ok(Self {
            manager,
            tracker,
            pricing,
            coordinator,
            queue,
            cancel,
            background: Mutex::new(vec![dispatcher, health]),
        })
    }

    /// Forward one request, writing the response through the sink. The
    /// cancellation token should fire when the client disconnects.
    pub async fn handle_request(
        &self,
        request: ProxyRequest,
        sink: &mut dyn ClientSink,
        cancel: CancellationToken,
    ) -> CompletedRequest {
        self.coordinator.handle(request, sink, cancel).await
    }

    /// Endpoint/group manager, for operator commands (activate, pause,
    /// resume, force-activate) and dashboards.
    pub fn manager(&self) -> &Arc<GroupManager> {
        &self.manager
    }

    /// Current group states for dashboards.
    pub fn group_snapshots(&self) -> Vec<GroupSnapshot> {
        self.manager.group_snapshots()
    }

    /// Requests currently parked in the suspension queue.
    pub fn suspended_count(&self) -> usize {
        self.queue.suspended_count()
    }

    /// Apply a reloaded configuration to the live tables. Endpoint health
    /// and group runtime state survive for names that persist.
    pub fn update_config(&self, config: &RelayConfig) -> RelayResult<()> {
        config.validate()?;
        self.manager.update_config(config);
        self.pricing.update_config(
            config.usage_tracking.model_pricing.clone(),
            config.usage_tracking.default_pricing,
        );
        Ok(())
    }

    /// Stop background tasks and flush pending lifecycle events.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.shutdown().await;
        let handles: Vec<_> = self
            .background
            .lock()
            .expect("relay lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
        log_info!("Relay core stopped");
    }
}
