use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::errors::ClientError;

/// How long the eviction sweep sleeps between passes.
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

pub type CorrelationKey = u64;

/// What kind of command a pending request belongs to. Replies that do not
/// carry the correlation key on the wire are matched FIFO within their kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Balance,
    Candles,
    Order,
    Raw,
}

struct PendingRequest {
    kind: RequestKind,
    deadline: Instant,
    /// Encoded outbound frame, kept so retryable requests can be replayed
    /// after a reconnect.
    frame: String,
    retryable: bool,
    slot: oneshot::Sender<Result<serde_json::Value, ClientError>>,
}

/// Maps outstanding requests to waiting callers and resolves each exactly
/// once: by reply, by failure, or by deadline eviction.
pub struct RequestCorrelator {
    next_key: AtomicU64,
    pending: Mutex<HashMap<CorrelationKey, PendingRequest>>,
    /// FIFO resolution order per kind, for replies the wire does not key.
    kind_queues: Mutex<HashMap<RequestKind, Vec<CorrelationKey>>>,
}

impl RequestCorrelator {
    pub fn new() -> Arc<Self> {
        let correlator = Arc::new(Self {
            next_key: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            kind_queues: Mutex::new(HashMap::new()),
        });

        let sweep = Arc::downgrade(&correlator);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let Some(correlator) = sweep.upgrade() else {
                    break;
                };
                correlator.sweep_expired().await;
            }
        });

        correlator
    }

    /// Allocate a process-unique correlation key.
    pub fn allocate_key(&self) -> CorrelationKey {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a pending request under a previously allocated key and return
    /// the receiver the caller awaits. The caller sends the frame itself (the
    /// key may need to be embedded in the payload before encoding).
    pub async fn register(
        &self,
        key: CorrelationKey,
        kind: RequestKind,
        frame: String,
        deadline: Duration,
        retryable: bool,
    ) -> oneshot::Receiver<Result<serde_json::Value, ClientError>> {
        let (tx, rx) = oneshot::channel();
        let request = PendingRequest {
            kind,
            deadline: Instant::now() + deadline,
            frame,
            retryable,
            slot: tx,
        };
        self.pending.lock().await.insert(key, request);
        self.kind_queues
            .lock()
            .await
            .entry(kind)
            .or_default()
            .push(key);
        rx
    }

    /// Resolve a request by key. Duplicate or late resolutions are ignored.
    pub async fn resolve(&self, key: CorrelationKey, result: Result<serde_json::Value, ClientError>) {
        let removed = self.pending.lock().await.remove(&key);
        match removed {
            Some(request) => {
                self.forget_in_queue(request.kind, key).await;
                // The caller may have abandoned its wait; nothing to do then.
                let _ = request.slot.send(result);
            }
            None => debug!(key, "resolution for unknown or already-resolved request"),
        }
    }

    /// Resolve the oldest outstanding request of a kind. Used for reply
    /// frames that carry no correlation key on the wire.
    pub async fn resolve_oldest(
        &self,
        kind: RequestKind,
        result: Result<serde_json::Value, ClientError>,
    ) -> bool {
        let key = {
            let mut queues = self.kind_queues.lock().await;
            match queues.get_mut(&kind) {
                Some(queue) if !queue.is_empty() => Some(queue.remove(0)),
                _ => None,
            }
        };
        match key {
            Some(key) => {
                if let Some(request) = self.pending.lock().await.remove(&key) {
                    let _ = request.slot.send(result);
                }
                true
            }
            None => false,
        }
    }

    /// Fail every pending request with a connection error, except those
    /// marked retryable when `keep_retryable` is set. Returns the frames of
    /// the retained requests so the session can replay them after reconnect.
    pub async fn fail_all(&self, reason: &str, keep_retryable: bool) -> Vec<String> {
        let mut pending = self.pending.lock().await;
        let mut queues = self.kind_queues.lock().await;

        let mut retained = Vec::new();
        let keys: Vec<CorrelationKey> = pending.keys().copied().collect();
        for key in keys {
            let keep = keep_retryable && pending.get(&key).is_some_and(|r| r.retryable);
            if keep {
                if let Some(request) = pending.get(&key) {
                    retained.push(request.frame.clone());
                }
                continue;
            }
            if let Some(request) = pending.remove(&key) {
                for queue in queues.values_mut() {
                    queue.retain(|k| *k != key);
                }
                let _ = request
                    .slot
                    .send(Err(ClientError::Connection(reason.to_string())));
            }
        }
        retained
    }

    /// Number of requests currently outstanding.
    pub async fn outstanding(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn sweep_expired(&self) {
        let now = Instant::now();
        let expired: Vec<CorrelationKey> = {
            let pending = self.pending.lock().await;
            pending
                .iter()
                .filter(|(_, r)| r.deadline <= now)
                .map(|(k, _)| *k)
                .collect()
        };
        for key in expired {
            warn!(key, "pending request timed out");
            self.resolve(
                key,
                Err(ClientError::Timeout("no reply within deadline".to_string())),
            )
            .await;
        }
    }

    async fn forget_in_queue(&self, kind: RequestKind, key: CorrelationKey) {
        if let Some(queue) = self.kind_queues.lock().await.get_mut(&kind) {
            queue.retain(|k| *k != key);
        }
    }
}
