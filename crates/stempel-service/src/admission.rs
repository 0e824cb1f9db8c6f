// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Admission control — a shared counting semaphore bounding the number of
// concurrently running transform pipelines.
//
// The transform engine's per-document working set does not scale safely to
// unbounded parallelism, so the ceiling sits well below the runtime's own
// task concurrency. There is no fairness guarantee: under sustained load
// interactive waiters may starve, and the overflow queue absorbs the excess.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Permission to run one pipeline instance.
///
/// The ticket is move-only and releases its capacity unit exactly once, when
/// dropped — on success, error, and cancellation paths alike. Double release
/// is unrepresentable.
#[derive(Debug)]
pub struct AdmissionTicket {
    _permit: OwnedSemaphorePermit,
}

/// Result of a bounded admission attempt.
#[derive(Debug)]
pub enum Admission {
    /// A slot was acquired within the wait limit.
    Granted(AdmissionTicket),
    /// Capacity stayed exhausted for the whole wait; the caller must route
    /// the request to the overflow queue instead of processing it.
    Deferred,
}

/// Bounds concurrent pipeline executions to a fixed capacity.
///
/// Constructed once at process start and shared by handle into every
/// request path; there is no ambient global.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// The configured ceiling.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Currently free slots (diagnostic; racy by nature).
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Try to acquire a slot, waiting at most `wait_limit`.
    ///
    /// Returns [`Admission::Deferred`] with no ticket held if capacity stays
    /// exhausted. Dropping the acquire future on timeout either never held
    /// the permit or returns it immediately — there is no half-committed
    /// state to clean up.
    pub async fn try_admit_bounded(&self, wait_limit: Duration) -> Admission {
        match tokio::time::timeout(wait_limit, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => {
                debug!(available = self.available(), "admission granted");
                Admission::Granted(AdmissionTicket { _permit: permit })
            }
            Ok(Err(_closed)) => {
                // The semaphore is never closed while the controller lives;
                // treat a closed semaphore as exhausted capacity.
                Admission::Deferred
            }
            Err(_elapsed) => {
                debug!(wait_ms = wait_limit.as_millis() as u64, "admission wait elapsed");
                Admission::Deferred
            }
        }
    }

    /// Wait indefinitely for a slot, bounded only by cancellation.
    ///
    /// Used by the overflow worker: the queue already buffers excess work,
    /// so there is nothing useful to do on a timeout. Returns `None` when
    /// cancelled; a cancelled wait leaves the capacity count untouched.
    pub async fn admit_blocking(&self, cancel: &CancellationToken) -> Option<AdmissionTicket> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            acquired = Arc::clone(&self.permits).acquire_owned() => match acquired {
                Ok(permit) => Some(AdmissionTicket { _permit: permit }),
                Err(_closed) => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SHORT_WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn grants_up_to_capacity_then_defers() {
        let controller = AdmissionController::new(2);

        let first = controller.try_admit_bounded(SHORT_WAIT).await;
        let second = controller.try_admit_bounded(SHORT_WAIT).await;
        assert!(matches!(first, Admission::Granted(_)));
        assert!(matches!(second, Admission::Granted(_)));

        let third = controller.try_admit_bounded(SHORT_WAIT).await;
        assert!(matches!(third, Admission::Deferred));
    }

    #[tokio::test]
    async fn dropping_a_ticket_frees_the_slot() {
        let controller = AdmissionController::new(1);

        let ticket = match controller.try_admit_bounded(SHORT_WAIT).await {
            Admission::Granted(ticket) => ticket,
            Admission::Deferred => panic!("first admit should succeed"),
        };
        assert_eq!(controller.available(), 0);

        drop(ticket);
        assert_eq!(controller.available(), 1);

        assert!(matches!(
            controller.try_admit_bounded(SHORT_WAIT).await,
            Admission::Granted(_)
        ));
    }

    #[tokio::test]
    async fn deferred_wait_holds_no_ticket() {
        let controller = AdmissionController::new(1);
        let _held = controller.try_admit_bounded(SHORT_WAIT).await;

        let deferred = controller.try_admit_bounded(SHORT_WAIT).await;
        assert!(matches!(deferred, Admission::Deferred));

        // The timed-out waiter must not have consumed capacity.
        assert_eq!(controller.available(), 0);
        drop(_held);
        assert_eq!(controller.available(), 1);
    }

    #[tokio::test]
    async fn blocking_admit_waits_for_release() {
        let controller = AdmissionController::new(1);
        let ticket = match controller.try_admit_bounded(SHORT_WAIT).await {
            Admission::Granted(ticket) => ticket,
            Admission::Deferred => panic!("first admit should succeed"),
        };

        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                controller.admit_blocking(&cancel).await.is_some()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(ticket);

        assert!(waiter.await.expect("join"));
    }

    #[tokio::test]
    async fn cancelled_blocking_admit_leaves_capacity_intact() {
        let controller = AdmissionController::new(1);
        let _held = match controller.try_admit_bounded(SHORT_WAIT).await {
            Admission::Granted(ticket) => ticket,
            Admission::Deferred => panic!("first admit should succeed"),
        };

        let cancel = CancellationToken::new();
        let waiter = {
            let controller = controller.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.admit_blocking(&cancel).await.is_none() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(waiter.await.expect("join"), "cancelled wait returns None");

        drop(_held);
        assert_eq!(controller.available(), 1, "no permit leaked by the cancelled wait");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_load_never_exceeds_capacity() {
        const CAPACITY: usize = 3;
        const TASKS: usize = 24;

        let controller = AdmissionController::new(CAPACITY);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(TASKS);
        for _ in 0..TASKS {
            let controller = controller.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let ticket = controller.admit_blocking(&cancel).await.expect("admitted");

                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);

                drop(ticket);
            }));
        }

        for handle in handles {
            handle.await.expect("join");
        }

        assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
        assert_eq!(controller.available(), CAPACITY, "all tickets returned");
    }
}
