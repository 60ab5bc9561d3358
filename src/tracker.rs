//! Asynchronous request lifecycle tracking.
//!
//! [`LifecycleTracker`] decouples the forwarding hot path from storage
//! latency: callers submit events into a bounded channel with a
//! non-blocking send (overflow drops the event and logs), and a single
//! writer task drains the channel in batches, applying them to the
//! [`UsageStore`]. A periodic timer flushes partial batches so records
//! never go stale.
//!
//! Exactly-once completion is enforced twice over: the writer keeps an
//! in-memory guard of completed request ids, and the store's completion
//! write refuses to touch an already-completed row. Retry loops that fail
//! and then succeed therefore never double-bill.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TrackingSettings;
use crate::internals::sse::TokenUsage;
use crate::lifecycle::RequestRecord;
use crate::logging::{log_debug, log_warn};
use crate::pricing::{CostBreakdown, PricingTable};
use crate::store::{RequestUpdate, UsageStore};

/// Cap on the in-memory completed-id guard; the store's own idempotence
/// takes over for ids evicted by a clear.
const COMPLETED_GUARD_LIMIT: usize = 65_536;

/// Delay between store write retries inside the writer task.
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One lifecycle event in flight towards the store.
#[derive(Debug)]
enum TrackerEvent {
    Start {
        record: RequestRecord,
    },
    Update {
        request_id: String,
        update: RequestUpdate,
    },
    FailureTokens {
        request_id: String,
        model: Option<String>,
        usage: TokenUsage,
        failure_reason: String,
    },
    Complete {
        request_id: String,
        model: Option<String>,
        usage: TokenUsage,
        end_time: chrono::DateTime<Utc>,
        duration_ms: u64,
    },
}

impl TrackerEvent {
    fn request_id(&self) -> &str {
        match self {
            Self::Start { record } => &record.request_id,
            Self::Update { request_id, .. }
            | Self::FailureTokens { request_id, .. }
            | Self::Complete { request_id, .. } => request_id,
        }
    }
}

/// Fire-and-forget lifecycle persistence.
pub struct LifecycleTracker {
    tx: Option<mpsc::Sender<TrackerEvent>>,
    cancel: CancellationToken,
    writer: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleTracker {
    /// Start the writer task (and the retention sweeper when retention is
    /// configured). With tracking disabled, every submit is a no-op.
    pub fn new(
        settings: TrackingSettings,
        store: Arc<dyn UsageStore>,
        pricing: Arc<PricingTable>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        if !settings.enabled {
            return Arc::new(Self {
                tx: None,
                cancel,
                writer: Mutex::new(None),
                sweeper: Mutex::new(None),
            });
        }

        let (tx, rx) = mpsc::channel(settings.buffer_size);
        let writer = tokio::spawn(writer_loop(
            rx,
            Arc::clone(&store),
            pricing,
            settings.batch_size,
            settings.flush_interval,
            settings.max_retry,
            cancel.clone(),
        ));
        let sweeper = (settings.retention_days > 0).then(|| {
            tokio::spawn(retention_loop(
                store,
                settings.retention_days,
                settings.cleanup_interval,
                cancel.clone(),
            ))
        });

        Arc::new(Self {
            tx: Some(tx),
            cancel,
            writer: Mutex::new(Some(writer)),
            sweeper: Mutex::new(sweeper),
        })
    }

    /// Insert the initial `pending` row for a freshly accepted request.
    pub fn start(&self, record: RequestRecord) {
        self.submit(TrackerEvent::Start { record });
    }

    /// Upsert changing fields on a status transition.
    pub fn update(&self, request_id: &str, update: RequestUpdate) {
        self.submit(TrackerEvent::Update {
            request_id: request_id.to_string(),
            update,
        });
    }

    /// Persist tokens and cost for a request that will not complete. The
    /// terminal status set elsewhere is left untouched.
    pub fn record_tokens_for_failed_request(
        &self,
        request_id: &str,
        model: Option<String>,
        usage: TokenUsage,
        failure_reason: impl Into<String>,
    ) {
        self.submit(TrackerEvent::FailureTokens {
            request_id: request_id.to_string(),
            model,
            usage,
            failure_reason: failure_reason.into(),
        });
    }

    /// Record final tokens, cost, and duration, transitioning to
    /// `completed`. Re-invocation for the same request id is a no-op.
    pub fn complete(
        &self,
        request_id: &str,
        model: Option<String>,
        usage: TokenUsage,
        duration: Duration,
    ) {
        self.submit(TrackerEvent::Complete {
            request_id: request_id.to_string(),
            model,
            usage,
            end_time: Utc::now(),
            duration_ms: duration.as_millis() as u64,
        });
    }

    /// Flush pending events and stop the background tasks.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let writer = self.writer.lock().expect("tracker lock poisoned").take();
        if let Some(handle) = writer {
            let _ = handle.await;
        }
        let sweeper = self.sweeper.lock().expect("tracker lock poisoned").take();
        if let Some(handle) = sweeper {
            handle.abort();
        }
    }

    fn submit(&self, event: TrackerEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(error) = tx.try_send(event) {
            let request_id = match &error {
                mpsc::error::TrySendError::Full(e)
                | mpsc::error::TrySendError::Closed(e) => e.request_id().to_string(),
            };
            log_warn!(
                request_id = %request_id,
                "Lifecycle event dropped: channel unavailable"
            );
        }
    }
}

async fn writer_loop(
    mut rx: mpsc::Receiver<TrackerEvent>,
    store: Arc<dyn UsageStore>,
    pricing: Arc<PricingTable>,
    batch_size: usize,
    flush_interval: Duration,
    max_retry: u32,
    cancel: CancellationToken,
) {
    let mut batch: Vec<TrackerEvent> = Vec::with_capacity(batch_size);
    let mut completed_guard: HashSet<String> = HashSet::new();
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                while let Ok(event) = rx.try_recv() {
                    batch.push(event);
                }
                apply_batch(&mut batch, &store, &pricing, &mut completed_guard, max_retry).await;
                break;
            }
            _ = ticker.tick() => {
                apply_batch(&mut batch, &store, &pricing, &mut completed_guard, max_retry).await;
            }
            event = rx.recv() => match event {
                Some(event) => {
                    batch.push(event);
                    if batch.len() >= batch_size {
                        apply_batch(&mut batch, &store, &pricing, &mut completed_guard, max_retry)
                            .await;
                    }
                }
                None => {
                    apply_batch(&mut batch, &store, &pricing, &mut completed_guard, max_retry)
                        .await;
                    break;
                }
            },
        }
    }
    log_debug!("Lifecycle writer stopped");
}

async fn apply_batch(
    batch: &mut Vec<TrackerEvent>,
    store: &Arc<dyn UsageStore>,
    pricing: &PricingTable,
    completed_guard: &mut HashSet<String>,
    max_retry: u32,
) {
    if batch.is_empty() {
        return;
    }
    let count = batch.len();
    for event in batch.drain(..) {
        let mut attempt = 0;
        loop {
            match apply_event(&event, store, pricing, completed_guard).await {
                Ok(()) => break,
                Err(error) => {
                    attempt += 1;
                    if attempt > max_retry {
                        log_warn!(
                            request_id = event.request_id(),
                            error = %error,
                            attempts = attempt,
                            "Lifecycle event dropped after repeated store failures"
                        );
                        break;
                    }
                    tokio::time::sleep(WRITE_RETRY_DELAY).await;
                }
            }
        }
    }
    log_debug!(batch_size = count, "Lifecycle batch applied");
}

async fn apply_event(
    event: &TrackerEvent,
    store: &Arc<dyn UsageStore>,
    pricing: &PricingTable,
    completed_guard: &mut HashSet<String>,
) -> crate::RelayResult<()> {
    match event {
        TrackerEvent::Start { record } => store.insert_request(record.clone()).await,
        TrackerEvent::Update { request_id, update } => {
            store.update_request(request_id, update.clone()).await
        }
        TrackerEvent::FailureTokens {
            request_id,
            model,
            usage,
            failure_reason,
        } => {
            let costs = if usage.is_empty() {
                CostBreakdown::default()
            } else {
                pricing.cost_for(model.as_deref(), usage)
            };
            store
                .record_failure_tokens(
                    request_id,
                    model.clone(),
                    *usage,
                    costs,
                    failure_reason.clone(),
                )
                .await
        }
        TrackerEvent::Complete {
            request_id,
            model,
            usage,
            end_time,
            duration_ms,
        } => {
            if completed_guard.contains(request_id) {
                return Ok(());
            }
            let costs = pricing.cost_for(model.as_deref(), usage);
            let applied = store
                .mark_completed(
                    request_id,
                    model.clone(),
                    *usage,
                    costs,
                    *end_time,
                    *duration_ms,
                )
                .await?;
            if completed_guard.len() >= COMPLETED_GUARD_LIMIT {
                completed_guard.clear();
            }
            completed_guard.insert(request_id.clone());
            if !applied {
                log_debug!(
                    request_id = %request_id,
                    "Completion ignored: request already completed"
                );
            }
            Ok(())
        }
    }
}

async fn retention_loop(
    store: Arc<dyn UsageStore>,
    retention_days: u32,
    cleanup_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(cleanup_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
                match store.cleanup_before(cutoff).await {
                    Ok(removed) if removed > 0 => {
                        log_debug!(removed = removed, "Old request records swept");
                    }
                    Ok(_) => {}
                    Err(error) => {
                        log_warn!(error = %error, "Retention sweep failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::RequestStatus;
    use crate::store::MemoryStore;
    use rust_decimal::Decimal;

    fn settings() -> TrackingSettings {
        TrackingSettings {
            flush_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn record(id: &str) -> RequestRecord {
        RequestRecord::new(
            id.to_string(),
            "10.0.0.1".to_string(),
            "agent".to_string(),
            "POST".to_string(),
            "/v1/messages".to_string(),
            false,
            Utc::now(),
        )
    }

    fn usage() -> TokenUsage {
        TokenUsage {
            input_tokens: 257,
            output_tokens: 25,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn events_flow_to_the_store_in_order() {
        let store = Arc::new(MemoryStore::new());
        let tracker = LifecycleTracker::new(
            settings(),
            store.clone() as Arc<dyn UsageStore>,
            Arc::new(PricingTable::default()),
        );

        tracker.start(record("req-00000001"));
        tracker.update(
            "req-00000001",
            RequestUpdate {
                endpoint: Some("primary".to_string()),
                group: Some("main".to_string()),
                status: Some(RequestStatus::Forwarding),
                retry_count: Some(0),
                http_status: None,
            },
        );
        tracker.complete(
            "req-00000001",
            Some("claude-3-5-haiku-20241022".to_string()),
            usage(),
            Duration::from_millis(900),
        );
        tracker.shutdown().await;

        let row = store.fetch("req-00000001").await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Completed);
        assert_eq!(row.endpoint_name.as_deref(), Some("primary"));
        assert_eq!(row.input_tokens, 257);
        assert!(row.total_cost > Decimal::ZERO);
        assert_eq!(row.duration_ms, Some(900));
    }

    #[tokio::test]
    async fn completion_is_idempotent_per_request_id() {
        let store = Arc::new(MemoryStore::new());
        let tracker = LifecycleTracker::new(
            settings(),
            store.clone() as Arc<dyn UsageStore>,
            Arc::new(PricingTable::default()),
        );

        tracker.start(record("req-00000002"));
        tracker.complete("req-00000002", Some("m".to_string()), usage(), Duration::ZERO);
        // Second completion with different numbers must not rebill.
        tracker.complete(
            "req-00000002",
            Some("m".to_string()),
            TokenUsage {
                input_tokens: 999_999,
                ..Default::default()
            },
            Duration::ZERO,
        );
        tracker.shutdown().await;

        let row = store.fetch("req-00000002").await.unwrap().unwrap();
        assert_eq!(row.input_tokens, 257);
    }

    #[tokio::test]
    async fn failed_request_tokens_are_billed_without_status_change() {
        let store = Arc::new(MemoryStore::new());
        let tracker = LifecycleTracker::new(
            settings(),
            store.clone() as Arc<dyn UsageStore>,
            Arc::new(PricingTable::default()),
        );

        tracker.start(record("req-00000003"));
        tracker.update(
            "req-00000003",
            RequestUpdate {
                status: Some(RequestStatus::StreamError),
                ..Default::default()
            },
        );
        tracker.record_tokens_for_failed_request(
            "req-00000003",
            Some("claude-3-5-haiku-20241022".to_string()),
            usage(),
            "stream_status:stream_error:upstream closed mid-event",
        );
        tracker.shutdown().await;

        let row = store.fetch("req-00000003").await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::StreamError);
        assert_eq!(row.input_tokens, 257);
        assert!(row.total_cost > Decimal::ZERO);
    }

    #[tokio::test]
    async fn overflow_drops_events_without_blocking() {
        let store = Arc::new(MemoryStore::new());
        let tracker = LifecycleTracker::new(
            TrackingSettings {
                buffer_size: 1,
                flush_interval: Duration::from_secs(3600),
                ..Default::default()
            },
            store.clone() as Arc<dyn UsageStore>,
            Arc::new(PricingTable::default()),
        );

        // Far more events than the channel holds; none of these may block.
        for i in 0..64 {
            tracker.start(record(&format!("req-{i:08x}")));
        }
        tracker.shutdown().await;
        assert!(store.len() <= 64);
    }

    #[tokio::test]
    async fn disabled_tracking_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let tracker = LifecycleTracker::new(
            TrackingSettings {
                enabled: false,
                ..Default::default()
            },
            store.clone() as Arc<dyn UsageStore>,
            Arc::new(PricingTable::default()),
        );
        tracker.start(record("req-00000004"));
        tracker.shutdown().await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn retention_sweeper_removes_old_rows() {
        let store = Arc::new(MemoryStore::new());
        let mut old = record("req-00000005");
        old.start_time = Utc::now() - chrono::Duration::days(40);
        store.insert_request(old).await.unwrap();
        store.insert_request(record("req-00000006")).await.unwrap();

        let tracker = LifecycleTracker::new(
            TrackingSettings {
                retention_days: 30,
                cleanup_interval: Duration::from_millis(20),
                ..Default::default()
            },
            store.clone() as Arc<dyn UsageStore>,
            Arc::new(PricingTable::default()),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        tracker.shutdown().await;

        assert!(store.fetch("req-00000005").await.unwrap().is_none());
        assert!(store.fetch("req-00000006").await.unwrap().is_some());
    }
}
