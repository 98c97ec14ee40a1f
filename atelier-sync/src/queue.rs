//! Durable operation queue for offline-first mutations.
//!
//! Every mutating user action is enqueued here regardless of
//! connectivity. The full queue snapshot is persisted through the
//! [`KeyValueStore`] before any mutation returns, so a crash between
//! enqueue and drain never loses an operation and a crash after ack
//! never redelivers one locally. On the wire the semantics are
//! at-least-once: an ambiguous response keeps the operation pending and
//! the operation id doubles as an idempotency key for the remote side.
//!
//! ```text
//! UI mutation ──► enqueue ──► [ pending (FIFO) ] ──► SyncEngine drain
//!                                   │
//!                       max_retries │ exceeded, or rejected
//!                                   ▼
//!                           [ dead letters ]   (kept for inspection)
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::Clock;
use crate::store::{KeyValueStore, StoreError};

/// What a pending operation does to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// A write operation waiting for delivery to the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Minted once at enqueue time, stable across process restarts.
    /// Forwarded to the remote endpoint as an idempotency key.
    pub id: Uuid,
    pub kind: OperationKind,
    pub target_endpoint: String,
    pub payload: Vec<u8>,
    /// Milliseconds since the Unix epoch; drain order is FIFO by this.
    pub enqueued_at: u64,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

/// An operation that exhausted its retry budget or was semantically
/// rejected. Retained for inspection, never auto-retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub operation: PendingOperation,
    pub reason: String,
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Transient failures tolerated before dead-lettering. Default: 3.
    pub max_retries: u32,
    /// Key the snapshot is persisted under.
    pub storage_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            storage_key: "sync/queue".to_string(),
        }
    }
}

impl QueueConfig {
    /// Config for testing (tight retry budget).
    pub fn for_testing() -> Self {
        Self {
            max_retries: 2,
            storage_key: "test/queue".to_string(),
        }
    }
}

/// Queue errors.
#[derive(Debug, Clone)]
pub enum QueueError {
    /// The durable store refused the write. Enqueue fails loudly on
    /// this; the in-memory state is rolled back so nothing is half-kept.
    Storage(StoreError),
    /// Snapshot could not be encoded or decoded.
    Serialization(String),
    /// `ack`/`fail`/`reject` named an id that is not pending.
    UnknownOperation(Uuid),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "Queue storage error: {e}"),
            Self::Serialization(e) => write!(f, "Queue serialization error: {e}"),
            Self::UnknownOperation(id) => write!(f, "Unknown operation {id}"),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            _ => None,
        }
    }
}

/// What `fail` decided about an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Still pending; will be retried on the next drain trigger.
    Retriable,
    /// Moved to the dead-letter set on this failure.
    DeadLettered,
}

/// Persisted form of the whole queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueSnapshot {
    pending: Vec<PendingOperation>,
    dead: Vec<DeadLetter>,
}

/// The durable operation queue.
///
/// All entry points serialize through one internal lock; the snapshot
/// is the single source of truth and is written back before any
/// mutator returns.
pub struct DurableQueue {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    inner: Mutex<QueueSnapshot>,
}

impl DurableQueue {
    /// Open the queue, recovering any persisted snapshot.
    pub async fn open(
        store: Arc<dyn KeyValueStore>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QueueError> {
        let snapshot = match store
            .get(&config.storage_key)
            .await
            .map_err(QueueError::Storage)?
        {
            Some(bytes) => {
                let (snap, _): (QueueSnapshot, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| QueueError::Serialization(e.to_string()))?;
                snap
            }
            None => QueueSnapshot::default(),
        };

        log::info!(
            "queue opened: {} pending, {} dead-lettered",
            snapshot.pending.len(),
            snapshot.dead.len()
        );

        Ok(Self {
            store,
            clock,
            config,
            inner: Mutex::new(snapshot),
        })
    }

    /// Enqueue a mutation. Always succeeds unless the durable store
    /// refuses the write, which is reported, not swallowed.
    pub async fn enqueue(
        &self,
        kind: OperationKind,
        target_endpoint: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<Uuid, QueueError> {
        let op = PendingOperation {
            id: Uuid::new_v4(),
            kind,
            target_endpoint: target_endpoint.into(),
            payload,
            enqueued_at: self.clock.now_ms(),
            retry_count: 0,
            last_error: None,
        };
        let id = op.id;

        let mut inner = self.inner.lock().await;
        let mut next = inner.clone();
        next.pending.push(op);
        self.persist(&next).await?;
        *inner = next;

        log::debug!("enqueued operation {id}");
        Ok(id)
    }

    /// Current batch of pending operations, FIFO by `enqueued_at`.
    /// Side-effect free and restartable: callers may ask again at any
    /// time.
    pub async fn drainable(&self) -> Vec<PendingOperation> {
        let inner = self.inner.lock().await;
        let mut ops = inner.pending.clone();
        // Stable sort keeps submission order for same-millisecond enqueues
        ops.sort_by_key(|op| op.enqueued_at);
        ops
    }

    /// Remove an operation after a confirmed remote success.
    pub async fn ack(&self, id: Uuid) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let mut next = inner.clone();
        let pos = next
            .pending
            .iter()
            .position(|op| op.id == id)
            .ok_or(QueueError::UnknownOperation(id))?;
        next.pending.remove(pos);
        self.persist(&next).await?;
        *inner = next;

        log::debug!("acked operation {id}");
        Ok(())
    }

    /// Record a transient failure. Dead-letters the operation once
    /// `retry_count` reaches `max_retries`, not before.
    pub async fn fail(&self, id: Uuid, error: &str) -> Result<FailureDisposition, QueueError> {
        let mut inner = self.inner.lock().await;
        let mut next = inner.clone();
        let pos = next
            .pending
            .iter()
            .position(|op| op.id == id)
            .ok_or(QueueError::UnknownOperation(id))?;

        next.pending[pos].retry_count += 1;
        next.pending[pos].last_error = Some(error.to_string());

        let disposition = if next.pending[pos].retry_count >= self.config.max_retries {
            let op = next.pending.remove(pos);
            log::warn!(
                "operation {id} dead-lettered after {} transient failures: {error}",
                op.retry_count
            );
            next.dead.push(DeadLetter {
                operation: op,
                reason: error.to_string(),
            });
            FailureDisposition::DeadLettered
        } else {
            log::debug!(
                "operation {id} failed transiently ({}/{}): {error}",
                next.pending[pos].retry_count,
                self.config.max_retries
            );
            FailureDisposition::Retriable
        };

        self.persist(&next).await?;
        *inner = next;
        Ok(disposition)
    }

    /// Dead-letter a semantically rejected operation immediately.
    /// Retrying a rejected operation cannot succeed.
    pub async fn reject(&self, id: Uuid, reason: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let mut next = inner.clone();
        let pos = next
            .pending
            .iter()
            .position(|op| op.id == id)
            .ok_or(QueueError::UnknownOperation(id))?;

        let mut op = next.pending.remove(pos);
        op.retry_count += 1;
        op.last_error = Some(reason.to_string());
        log::warn!("operation {id} rejected by remote: {reason}");
        next.dead.push(DeadLetter {
            operation: op,
            reason: reason.to_string(),
        });

        self.persist(&next).await?;
        *inner = next;
        Ok(())
    }

    /// Dead-lettered operations, oldest first.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().await.dead.clone()
    }

    /// Number of pending operations.
    pub async fn pending_len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Whether anything is waiting for delivery.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.pending.is_empty()
    }

    async fn persist(&self, snapshot: &QueueSnapshot) -> Result<(), QueueError> {
        let bytes = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.store
            .set(&self.config.storage_key, &bytes)
            .await
            .map_err(QueueError::Storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    async fn open_queue(store: Arc<dyn KeyValueStore>, clock: Arc<ManualClock>) -> DurableQueue {
        DurableQueue::open(store, QueueConfig::default(), clock)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_and_drainable_fifo() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let queue = open_queue(store, clock.clone()).await;

        let a = queue
            .enqueue(OperationKind::Create, "/clients", b"a".to_vec())
            .await
            .unwrap();
        clock.advance(10);
        let b = queue
            .enqueue(OperationKind::Update, "/clients/7", b"b".to_vec())
            .await
            .unwrap();
        clock.advance(10);
        let c = queue
            .enqueue(OperationKind::Delete, "/projects/3", b"c".to_vec())
            .await
            .unwrap();

        let batch = queue.drainable().await;
        assert_eq!(
            batch.iter().map(|op| op.id).collect::<Vec<_>>(),
            vec![a, b, c]
        );

        // drainable is side-effect free
        assert_eq!(queue.drainable().await.len(), 3);
        assert_eq!(queue.pending_len().await, 3);
    }

    #[tokio::test]
    async fn test_durability_across_restart() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));

        let first = open_queue(store.clone(), clock.clone()).await;
        let a = first
            .enqueue(OperationKind::Create, "/clients", b"sarah".to_vec())
            .await
            .unwrap();
        let b = first
            .enqueue(OperationKind::Update, "/clients/7", b"amend".to_vec())
            .await
            .unwrap();
        drop(first);

        // "Restart": a fresh queue over the surviving store
        let second = open_queue(store, clock).await;
        let batch = second.drainable().await;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, a);
        assert_eq!(batch[1].id, b);
        assert_eq!(batch[0].payload, b"sarah");
    }

    #[tokio::test]
    async fn test_ack_removes_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));

        let queue = open_queue(store.clone(), clock.clone()).await;
        let a = queue
            .enqueue(OperationKind::Create, "/clients", vec![])
            .await
            .unwrap();
        let b = queue
            .enqueue(OperationKind::Create, "/projects", vec![])
            .await
            .unwrap();

        queue.ack(a).await.unwrap();
        assert_eq!(queue.pending_len().await, 1);
        drop(queue);

        // An acked operation is never redelivered after restart
        let reopened = open_queue(store, clock).await;
        let batch = reopened.drainable().await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, b);
    }

    #[tokio::test]
    async fn test_fail_dead_letters_at_max_retries_not_before() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let queue = DurableQueue::open(store, QueueConfig::default(), clock)
            .await
            .unwrap();

        let id = queue
            .enqueue(OperationKind::Update, "/clients/7", vec![])
            .await
            .unwrap();

        assert_eq!(
            queue.fail(id, "timeout").await.unwrap(),
            FailureDisposition::Retriable
        );
        assert_eq!(
            queue.fail(id, "timeout").await.unwrap(),
            FailureDisposition::Retriable
        );
        assert_eq!(queue.pending_len().await, 1);

        // Third failure hits max_retries = 3
        assert_eq!(
            queue.fail(id, "still down").await.unwrap(),
            FailureDisposition::DeadLettered
        );
        assert_eq!(queue.pending_len().await, 0);

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].operation.id, id);
        assert_eq!(dead[0].operation.retry_count, 3);
        assert_eq!(dead[0].reason, "still down");
    }

    #[tokio::test]
    async fn test_testing_config_tightens_budget_and_namespace() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let queue = DurableQueue::open(store.clone(), QueueConfig::for_testing(), clock)
            .await
            .unwrap();

        let id = queue
            .enqueue(OperationKind::Update, "/clients/7", vec![])
            .await
            .unwrap();

        // Snapshot lands under the testing key, not the production one
        assert!(store.get("test/queue").await.unwrap().is_some());
        assert!(store.get("sync/queue").await.unwrap().is_none());

        // max_retries = 2: dead-letters on the second failure
        assert_eq!(
            queue.fail(id, "timeout").await.unwrap(),
            FailureDisposition::Retriable
        );
        assert_eq!(
            queue.fail(id, "timeout").await.unwrap(),
            FailureDisposition::DeadLettered
        );
        assert_eq!(queue.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reject_dead_letters_immediately() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let queue = DurableQueue::open(store, QueueConfig::default(), clock)
            .await
            .unwrap();

        let id = queue
            .enqueue(OperationKind::Update, "/clients/7", vec![])
            .await
            .unwrap();
        queue.reject(id, "validation failed").await.unwrap();

        assert!(queue.is_empty().await);
        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].operation.retry_count, 1);
        assert_eq!(dead[0].reason, "validation failed");
    }

    #[tokio::test]
    async fn test_dead_letters_survive_restart() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));

        let queue = open_queue(store.clone(), clock.clone()).await;
        let id = queue
            .enqueue(OperationKind::Delete, "/invoices/9", vec![])
            .await
            .unwrap();
        queue.reject(id, "already voided").await.unwrap();
        drop(queue);

        let reopened = open_queue(store, clock).await;
        let dead = reopened.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].operation.id, id);
    }

    #[tokio::test]
    async fn test_enqueue_storage_exhausted_rolls_back() {
        // Budget fits the empty snapshot but not one with a fat payload
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::with_capacity_bytes(64));
        let clock = Arc::new(ManualClock::new(0));
        let queue = DurableQueue::open(store, QueueConfig::default(), clock)
            .await
            .unwrap();

        let err = queue
            .enqueue(OperationKind::Create, "/files", vec![0u8; 256])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::Storage(StoreError::StorageExhausted(_))
        ));

        // Nothing half-kept in memory either
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_operation_errors() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let queue = DurableQueue::open(store, QueueConfig::default(), clock)
            .await
            .unwrap();

        let ghost = Uuid::new_v4();
        assert!(matches!(
            queue.ack(ghost).await.unwrap_err(),
            QueueError::UnknownOperation(id) if id == ghost
        ));
        assert!(matches!(
            queue.fail(ghost, "x").await.unwrap_err(),
            QueueError::UnknownOperation(_)
        ));
        assert!(matches!(
            queue.reject(ghost, "x").await.unwrap_err(),
            QueueError::UnknownOperation(_)
        ));
    }
}
