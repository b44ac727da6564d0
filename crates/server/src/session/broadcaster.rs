//! Session output broadcaster.
//!
//! This module fans session output out to every attached transport. Slow
//! transports are handled by dropping messages when their queues fill,
//! backpressure is tracked per transport, and dead peers are discovered
//! lazily by send failure rather than heartbeats.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use protocol::Message;
use tokio::sync::{mpsc, RwLock};

/// Unique identifier for an attached transport.
pub type TransportId = String;

/// Default queue capacity per transport.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Statistics about a transport's delivery.
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Messages queued successfully.
    pub messages_sent: u64,
    /// Messages dropped because the transport was slow.
    pub messages_dropped: u64,
    /// Whether the transport is currently backpressured.
    pub is_backpressured: bool,
}

/// One attached transport with its bounded delivery queue.
///
/// When the queue is full, messages are dropped rather than blocking
/// delivery to the other transports.
pub struct TransportHandle {
    /// Unique transport identifier.
    id: TransportId,
    /// Sender feeding the transport's writer task.
    tx: mpsc::Sender<Message>,
    /// Messages queued successfully.
    sent: AtomicU64,
    /// Messages dropped on a full queue.
    dropped: AtomicU64,
    /// Whether the transport is currently backpressured.
    backpressured: AtomicBool,
}

impl TransportHandle {
    /// Creates a handle and the receiver its writer task drains.
    fn with_capacity(id: TransportId, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Arc::new(TransportHandle {
            id,
            tx,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            backpressured: AtomicBool::new(false),
        });
        (handle, rx)
    }

    /// Returns the transport ID.
    pub fn id(&self) -> &TransportId {
        &self.id
    }

    /// Returns a snapshot of the delivery statistics.
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            is_backpressured: self.backpressured.load(Ordering::Relaxed),
        }
    }

    /// Attempts to queue a message without blocking.
    ///
    /// A full queue drops the message and sets the backpressure flag;
    /// a closed queue reports the peer as dead.
    fn try_send(&self, message: Message) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                if self.backpressured.swap(false, Ordering::Relaxed) {
                    tracing::debug!(
                        transport_id = %self.id,
                        "transport recovered from backpressure"
                    );
                }
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if !self.backpressured.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        transport_id = %self.id,
                        dropped = dropped,
                        "transport is backpressured, dropping messages"
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(transport_id = %self.id, "transport queue closed");
                false
            }
        }
    }

    /// Checks whether the transport's queue is closed.
    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Fans one session's messages out to all attached transports.
///
/// Mutation of the attachment set and fan-out never interfere: every
/// broadcast iterates a point-in-time snapshot taken under a read lock,
/// so an attach or detach during delivery can never tear the set.
pub struct OutputBroadcaster {
    /// Attached transports by ID.
    transports: Arc<RwLock<HashMap<TransportId, Arc<TransportHandle>>>>,
    /// Last output broadcast timestamp (Unix epoch milliseconds).
    last_activity: AtomicU64,
    /// When the attachment set became empty (0 while attached).
    empty_since: AtomicU64,
}

impl OutputBroadcaster {
    /// Creates a broadcaster with no attachments.
    pub fn new() -> Self {
        Self {
            transports: Arc::new(RwLock::new(HashMap::new())),
            last_activity: AtomicU64::new(now_millis()),
            empty_since: AtomicU64::new(now_millis()),
        }
    }

    /// Registers a transport for output delivery.
    ///
    /// Returns the receiver the transport's writer task drains.
    pub async fn attach(&self, transport_id: TransportId) -> mpsc::Receiver<Message> {
        self.attach_with_capacity(transport_id, DEFAULT_QUEUE_CAPACITY)
            .await
    }

    /// Registers a transport with a specific queue capacity.
    pub async fn attach_with_capacity(
        &self,
        transport_id: TransportId,
        capacity: usize,
    ) -> mpsc::Receiver<Message> {
        let (handle, rx) = TransportHandle::with_capacity(transport_id.clone(), capacity);
        let mut transports = self.transports.write().await;
        transports.insert(transport_id.clone(), handle);
        self.empty_since.store(0, Ordering::Relaxed);
        tracing::debug!(transport_id = %transport_id, "attached transport");
        rx
    }

    /// Registers a transport after closing every prior attachment.
    ///
    /// Reconnecting clients attach with a fresh transport while the old one
    /// may still be half-open; closing the old ones first prevents duplicate
    /// delivery. Removal and insertion happen under one write lock, so no
    /// broadcast can observe both transports.
    pub async fn attach_exclusive(&self, transport_id: TransportId) -> mpsc::Receiver<Message> {
        let (handle, rx) =
            TransportHandle::with_capacity(transport_id.clone(), DEFAULT_QUEUE_CAPACITY);
        let mut transports = self.transports.write().await;
        let displaced: Vec<TransportId> = transports
            .keys()
            .filter(|id| **id != transport_id)
            .cloned()
            .collect();
        for id in &displaced {
            transports.remove(id);
            tracing::debug!(
                transport_id = %id,
                replaced_by = %transport_id,
                "closed displaced transport"
            );
        }
        transports.insert(transport_id.clone(), handle);
        self.empty_since.store(0, Ordering::Relaxed);
        tracing::debug!(transport_id = %transport_id, "attached transport exclusively");
        rx
    }

    /// Removes a transport, returning its statistics if it existed.
    pub async fn detach(&self, transport_id: &TransportId) -> Option<TransportStats> {
        let mut transports = self.transports.write().await;
        let stats = transports.remove(transport_id).map(|h| h.stats());
        if transports.is_empty() {
            self.empty_since.store(now_millis(), Ordering::Relaxed);
        }
        if stats.is_some() {
            tracing::debug!(transport_id = %transport_id, "detached transport");
        }
        stats
    }

    /// Removes every transport, closing their queues.
    pub async fn detach_all(&self) {
        let mut transports = self.transports.write().await;
        transports.clear();
        self.empty_since.store(now_millis(), Ordering::Relaxed);
    }

    /// Returns the number of attached transports.
    pub async fn client_count(&self) -> usize {
        self.transports.read().await.len()
    }

    /// Delivers a process output message to every attached transport.
    ///
    /// Delivery failure on one transport removes only that transport; the
    /// others are unaffected. Returns how many transports accepted the
    /// message.
    pub async fn broadcast(&self, message: Message) -> usize {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
        self.fan_out(message).await
    }

    /// Delivers a control message (error, artifact notice) to the attached
    /// transports without counting as process output activity.
    pub async fn send_direct(&self, message: Message) -> usize {
        self.fan_out(message).await
    }

    async fn fan_out(&self, message: Message) -> usize {
        // Snapshot under the read lock, deliver outside it.
        let snapshot: Vec<Arc<TransportHandle>> =
            self.transports.read().await.values().cloned().collect();

        let mut dead: Vec<TransportId> = Vec::new();
        let mut delivered = 0;
        for handle in &snapshot {
            if handle.is_closed() {
                dead.push(handle.id().clone());
                continue;
            }
            if handle.try_send(message.clone()) {
                delivered += 1;
            }
        }

        if !dead.is_empty() {
            let mut transports = self.transports.write().await;
            for id in dead {
                transports.remove(&id);
                tracing::debug!(transport_id = %id, "removed dead transport");
            }
            if transports.is_empty() {
                self.empty_since.store(now_millis(), Ordering::Relaxed);
            }
        }

        delivered
    }

    /// Returns the last output broadcast timestamp in Unix milliseconds.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Returns how long the attachment set has been empty, or `None` while
    /// at least one transport is attached.
    pub fn unattached_for_millis(&self) -> Option<u64> {
        match self.empty_since.load(Ordering::Relaxed) {
            0 => None,
            since => Some(now_millis().saturating_sub(since)),
        }
    }

    /// Returns statistics for one transport.
    pub async fn transport_stats(&self, transport_id: &TransportId) -> Option<TransportStats> {
        self.transports
            .read()
            .await
            .get(transport_id)
            .map(|h| h.stats())
    }

    /// Returns all attached transport IDs.
    pub async fn transport_ids(&self) -> Vec<TransportId> {
        self.transports.read().await.keys().cloned().collect()
    }
}

impl Default for OutputBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Current Unix timestamp in milliseconds.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
