//! FIFO queue for suspended requests.
//!
//! When no endpoint group is available and suspension is enabled, requests
//! park here instead of failing. A dispatcher task subscribed to
//! group-change notifications releases exactly one waiter per notification,
//! in enqueue order. Each waiter also watches its own deadline and the
//! request's cancellation token and removes itself from the queue when
//! either fires.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::group::GroupChangeSubscription;
use crate::logging::{log_debug, log_info, log_warn};

/// Why a suspended request woke up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeReason {
    /// A group became active; the request should re-enter the attempt loop.
    Resumed(String),
    /// The suspension deadline elapsed.
    TimedOut,
    /// The client went away while suspended.
    Cancelled,
}

struct Waiter {
    request_id: String,
    tx: oneshot::Sender<String>,
}

/// Bounded FIFO of suspended requests.
pub struct SuspensionQueue {
    waiters: Mutex<VecDeque<Waiter>>,
    capacity: usize,
    weak: Weak<SuspensionQueue>,
}

impl SuspensionQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            waiters: Mutex::new(VecDeque::new()),
            capacity,
            weak: weak.clone(),
        })
    }

    /// Requests currently suspended.
    pub fn suspended_count(&self) -> usize {
        self.waiters.lock().expect("suspend lock poisoned").len()
    }

    /// Enqueue a request. Returns `None` when the queue is at capacity, in
    /// which case the caller fails the request instead of suspending it.
    pub fn try_enqueue(&self, request_id: &str) -> Option<SuspensionTicket> {
        let mut waiters = self.waiters.lock().expect("suspend lock poisoned");
        if waiters.len() >= self.capacity {
            log_warn!(
                request_id = request_id,
                capacity = self.capacity,
                "Suspension queue full; request will not be suspended"
            );
            return None;
        }
        let (tx, rx) = oneshot::channel();
        waiters.push_back(Waiter {
            request_id: request_id.to_string(),
            tx,
        });
        log_info!(
            request_id = request_id,
            queue_depth = waiters.len(),
            "Request suspended awaiting an active group"
        );
        Some(SuspensionTicket {
            queue: self.weak.upgrade().expect("queue is alive while borrowed"),
            request_id: request_id.to_string(),
            rx,
        })
    }

    /// Release the frontmost live waiter for a newly activated group. At
    /// most one waiter resumes per call, preserving enqueue order.
    pub fn release_next(&self, group: &str) {
        let mut waiters = self.waiters.lock().expect("suspend lock poisoned");
        while let Some(waiter) = waiters.pop_front() {
            if waiter.tx.send(group.to_string()).is_ok() {
                log_debug!(
                    request_id = %waiter.request_id,
                    group = group,
                    remaining = waiters.len(),
                    "Suspended request released"
                );
                return;
            }
            // The waiter timed out or was cancelled concurrently; skip it.
        }
    }

    /// Run the release loop against a group-change subscription.
    pub fn spawn_dispatcher(
        &self,
        mut subscription: GroupChangeSubscription,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = self.weak.upgrade().expect("queue is alive while borrowed");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = subscription.recv() => match changed {
                        Some(group) => queue.release_next(&group),
                        None => break,
                    },
                }
            }
            log_debug!("Suspension dispatcher stopped");
        })
    }

    fn remove(&self, request_id: &str) {
        self.waiters
            .lock()
            .expect("suspend lock poisoned")
            .retain(|w| w.request_id != request_id);
    }
}

/// A suspended request's place in the queue.
pub struct SuspensionTicket {
    queue: Arc<SuspensionQueue>,
    request_id: String,
    rx: oneshot::Receiver<String>,
}

impl SuspensionTicket {
    /// Park until a group change releases this waiter, the deadline
    /// elapses, or the request is cancelled. Deadline and cancellation
    /// dequeue the waiter before returning.
    pub async fn wait(mut self, deadline: Duration, cancel: &CancellationToken) -> WakeReason {
        tokio::select! {
            released = &mut self.rx => match released {
                Ok(group) => WakeReason::Resumed(group),
                // The queue itself went away; treat like a deadline.
                Err(_) => WakeReason::TimedOut,
            },
            _ = tokio::time::sleep(deadline) => {
                self.queue.remove(&self.request_id);
                log_info!(request_id = %self.request_id, "Suspension deadline elapsed");
                WakeReason::TimedOut
            }
            _ = cancel.cancelled() => {
                self.queue.remove(&self.request_id);
                log_info!(request_id = %self.request_id, "Request cancelled while suspended");
                WakeReason::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn waiters_resume_in_enqueue_order_one_per_release() {
        let queue = SuspensionQueue::new(10);
        let first = queue.try_enqueue("req-00000001").unwrap();
        let second = queue.try_enqueue("req-00000002").unwrap();
        assert_eq!(queue.suspended_count(), 2);

        queue.release_next("backup");
        let reason = first
            .wait(Duration::from_secs(1), &CancellationToken::new())
            .await;
        assert_eq!(reason, WakeReason::Resumed("backup".to_string()));

        // The second waiter is still parked until another release.
        assert_eq!(queue.suspended_count(), 1);
        queue.release_next("backup");
        let reason = second
            .wait(Duration::from_secs(1), &CancellationToken::new())
            .await;
        assert_eq!(reason, WakeReason::Resumed("backup".to_string()));
        assert_eq!(queue.suspended_count(), 0);
    }

    #[tokio::test]
    async fn capacity_refuses_further_suspensions() {
        let queue = SuspensionQueue::new(1);
        let _held = queue.try_enqueue("req-00000001").unwrap();
        assert!(queue.try_enqueue("req-00000002").is_none());
        assert_eq!(queue.suspended_count(), 1);
    }

    #[tokio::test]
    async fn deadline_dequeues_the_waiter() {
        let queue = SuspensionQueue::new(10);
        let ticket = queue.try_enqueue("req-00000001").unwrap();
        let reason = ticket
            .wait(Duration::from_millis(50), &CancellationToken::new())
            .await;
        assert_eq!(reason, WakeReason::TimedOut);
        assert_eq!(queue.suspended_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_dequeues_the_waiter() {
        let queue = SuspensionQueue::new(10);
        let ticket = queue.try_enqueue("req-00000001").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let reason = ticket.wait(Duration::from_secs(5), &cancel).await;
        assert_eq!(reason, WakeReason::Cancelled);
        assert_eq!(queue.suspended_count(), 0);
    }

    #[tokio::test]
    async fn release_skips_waiters_that_already_left() {
        let queue = SuspensionQueue::new(10);
        let first = queue.try_enqueue("req-00000001").unwrap();
        let second = queue.try_enqueue("req-00000002").unwrap();
        // First waiter gives up without dequeuing (receiver dropped).
        drop(first);

        queue.release_next("backup");
        let reason = second
            .wait(Duration::from_secs(1), &CancellationToken::new())
            .await;
        assert_eq!(reason, WakeReason::Resumed("backup".to_string()));
    }
}
