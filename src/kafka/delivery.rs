//! Correlation of publish attempts with their outcomes.
//!
//! Every record handed to the publisher gets a [`DeliveryReporter`] (kept by
//! the publisher) and a [`DeliveryHandle`] (returned to the caller). The pair
//! is a oneshot channel, so callers never wait on one another, and the
//! reporter resolves its handle exactly once, even when dropped.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};

/// Terminal result of one publish attempt, including its retries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Success {
        partition: i32,
        offset: i64,
        timestamp: DateTime<Utc>,
    },
    Failure {
        reason: String,
        /// Resubmitting the whole request may succeed.
        retriable: bool,
    },
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success { .. })
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, DeliveryOutcome::Failure { retriable: true, .. })
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    next_id: AtomicU64,
    pending: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    idle: Notify,
}

/// Snapshot of delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub pending: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryTracker {
    state: Arc<TrackerState>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new attempt.
    pub fn track(&self) -> (DeliveryReporter, DeliveryHandle) {
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        self.state.pending.fetch_add(1, Ordering::AcqRel);
        let (tx, rx) = oneshot::channel();

        (
            DeliveryReporter {
                id,
                tx: Some(tx),
                state: Arc::clone(&self.state),
            },
            DeliveryHandle { id, rx },
        )
    }

    /// Waits for the outcome behind `handle`.
    pub async fn await_outcome(&self, handle: DeliveryHandle) -> DeliveryOutcome {
        handle.outcome().await
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            pending: self.state.pending.load(Ordering::Acquire),
            succeeded: self.state.succeeded.load(Ordering::Relaxed),
            failed: self.state.failed.load(Ordering::Relaxed),
        }
    }

    /// Resolves once no attempt is awaiting an outcome.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            if self.state.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Publisher-side half of an attempt.
#[derive(Debug)]
pub struct DeliveryReporter {
    id: u64,
    tx: Option<oneshot::Sender<DeliveryOutcome>>,
    state: Arc<TrackerState>,
}

impl DeliveryReporter {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn success(mut self, partition: i32, offset: i64, timestamp: DateTime<Utc>) {
        self.complete(DeliveryOutcome::Success {
            partition,
            offset,
            timestamp,
        });
    }

    pub fn failure(mut self, reason: impl Into<String>, retriable: bool) {
        self.complete(DeliveryOutcome::Failure {
            reason: reason.into(),
            retriable,
        });
    }

    fn complete(&mut self, outcome: DeliveryOutcome) {
        let Some(tx) = self.tx.take() else {
            return;
        };

        let counter = if outcome.is_success() {
            &self.state.succeeded
        } else {
            &self.state.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);

        // The caller may have dropped its handle; the outcome still counts.
        let _ = tx.send(outcome);

        if self.state.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.idle.notify_waiters();
        }
    }
}

impl Drop for DeliveryReporter {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.complete(DeliveryOutcome::Failure {
                reason: "delivery abandoned before an outcome was recorded".to_string(),
                retriable: true,
            });
        }
    }
}

/// Caller-side half of an attempt. Await it directly or pass it to
/// [`DeliveryTracker::await_outcome`].
#[derive(Debug)]
pub struct DeliveryHandle {
    id: u64,
    rx: oneshot::Receiver<DeliveryOutcome>,
}

impl DeliveryHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn outcome(self) -> DeliveryOutcome {
        self.rx.await.unwrap_or_else(|_| DeliveryOutcome::Failure {
            reason: "delivery reporter vanished".to_string(),
            retriable: true,
        })
    }
}

impl IntoFuture for DeliveryHandle {
    type Output = DeliveryOutcome;
    type IntoFuture = BoxFuture<'static, DeliveryOutcome>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.outcome())
    }
}
