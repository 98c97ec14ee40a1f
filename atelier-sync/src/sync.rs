//! Sync engine: drains the durable queue against the remote service.
//!
//! ```text
//! connectivity false→true ──┐
//!                           ├──► drain_queue() ── per-op ──► MutationEndpoint
//! periodic tick (online) ───┘         │
//!                                     ▼
//!                     DrainSummary { succeeded, retriable, dead_lettered }
//! ```
//!
//! Drain is single-flight: a second call while one is in progress is a
//! no-op. Items are attempted independently in strict queue order;
//! failed items are not retried within the same pass, they wait for the
//! next trigger, which gives natural spacing without per-item timers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::queue::{DurableQueue, FailureDisposition, PendingOperation, QueueError};

/// Remote verdict for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Confirmed applied (2xx-equivalent). The operation is acked.
    Applied,
    /// Network-ish failure; worth retrying on a later drain.
    Transient(String),
    /// Semantic rejection; retrying cannot succeed, dead-letter now.
    Rejected(String),
    /// Credential no longer valid; abort the pass, surface upward.
    AuthExpired,
}

/// The remote mutation endpoint.
///
/// Implementations receive the whole [`PendingOperation`] so they can
/// forward `op.id` as an idempotency key alongside `kind`,
/// `target_endpoint` and `payload`.
#[async_trait]
pub trait MutationEndpoint: Send + Sync {
    async fn apply(&self, op: &PendingOperation) -> PushOutcome;
}

/// Result of one drain pass. Terminal failures are reported here,
/// never thrown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub succeeded: Vec<Uuid>,
    pub retriable: Vec<Uuid>,
    pub dead_lettered: Vec<Uuid>,
    /// The pass was aborted on a 401-equivalent; remaining operations
    /// stay pending until the credential is refreshed.
    pub auth_expired: bool,
}

impl DrainSummary {
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty()
            && self.retriable.is_empty()
            && self.dead_lettered.is_empty()
            && !self.auth_expired
    }
}

/// Drains the durable queue opportunistically.
pub struct SyncEngine {
    queue: Arc<DurableQueue>,
    endpoint: Arc<dyn MutationEndpoint>,
    drain_gate: Mutex<()>,
}

impl SyncEngine {
    pub fn new(queue: Arc<DurableQueue>, endpoint: Arc<dyn MutationEndpoint>) -> Self {
        Self {
            queue,
            endpoint,
            drain_gate: Mutex::new(()),
        }
    }

    /// The queue being drained.
    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }

    /// Attempt delivery of all currently pending operations.
    ///
    /// Idempotent and safe to call concurrently with itself: the loser
    /// of the gate returns an empty summary without touching the
    /// network. A failure on one operation never blocks later ones in
    /// the batch.
    pub async fn drain_queue(&self) -> Result<DrainSummary, QueueError> {
        let Ok(_guard) = self.drain_gate.try_lock() else {
            log::debug!("drain already in progress, skipping");
            return Ok(DrainSummary::default());
        };

        let batch = self.queue.drainable().await;
        if batch.is_empty() {
            return Ok(DrainSummary::default());
        }
        log::info!("draining {} pending operations", batch.len());

        let mut summary = DrainSummary::default();
        for op in batch {
            match self.endpoint.apply(&op).await {
                PushOutcome::Applied => {
                    self.queue.ack(op.id).await?;
                    summary.succeeded.push(op.id);
                }
                PushOutcome::Transient(reason) => {
                    match self.queue.fail(op.id, &reason).await? {
                        FailureDisposition::Retriable => summary.retriable.push(op.id),
                        FailureDisposition::DeadLettered => summary.dead_lettered.push(op.id),
                    }
                }
                PushOutcome::Rejected(reason) => {
                    self.queue.reject(op.id, &reason).await?;
                    summary.dead_lettered.push(op.id);
                }
                PushOutcome::AuthExpired => {
                    log::warn!("credential expired mid-drain, aborting pass");
                    summary.auth_expired = true;
                    break;
                }
            }
        }

        log::info!(
            "drain complete: {} succeeded, {} retriable, {} dead-lettered",
            summary.succeeded.len(),
            summary.retriable.len(),
            summary.dead_lettered.len()
        );
        Ok(summary)
    }

    /// Drive drains from connectivity transitions and a periodic tick.
    ///
    /// Runs until the connectivity monitor is dropped. `false→true`
    /// reachability is the immediate trigger; the tick only fires while
    /// reachable, since attempting delivery with no network is wasted
    /// work (though reachability is a hint — the attempt itself is the
    /// ground truth).
    pub async fn run(self: Arc<Self>, mut reachability: watch::Receiver<bool>, tick: Duration) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut was_reachable = *reachability.borrow();

        loop {
            tokio::select! {
                changed = reachability.changed() => {
                    if changed.is_err() {
                        log::debug!("connectivity monitor dropped, stopping drain driver");
                        return;
                    }
                    let now_reachable = *reachability.borrow_and_update();
                    if now_reachable && !was_reachable {
                        log::info!("connectivity restored, draining queue");
                        if let Err(e) = self.drain_queue().await {
                            log::error!("drain failed: {e}");
                        }
                    }
                    was_reachable = now_reachable;
                }
                _ = ticker.tick() => {
                    if was_reachable && !self.queue.is_empty().await {
                        if let Err(e) = self.drain_queue().await {
                            log::error!("periodic drain failed: {e}");
                        }
                    }
                }
            }
        }
    }
}
