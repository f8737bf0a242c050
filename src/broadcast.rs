//! Per-document topic fan-out with backpressure.
//!
//! Each document gets one [`DocChannel`] carrying three topics —
//! presence changes, activity entries, and operations — so consumers
//! subscribe only to what they render. Topics are tokio broadcast
//! channels of pre-encoded frames (`Arc<Vec<u8>>`): publish is O(1) to
//! all subscribers and lagging consumers drop oldest messages rather
//! than blocking the publisher.
//!
//! Delivery is at-least-once from the consumer's point of view;
//! consumers de-duplicate by entity id where that matters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Snapshot of publish counters for one document channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub presence_published: u64,
    pub activity_published: u64,
    pub operations_published: u64,
}

/// Lock-free publish counters.
struct AtomicChannelStats {
    presence: AtomicU64,
    activity: AtomicU64,
    operations: AtomicU64,
}

impl AtomicChannelStats {
    fn new() -> Self {
        Self {
            presence: AtomicU64::new(0),
            activity: AtomicU64::new(0),
            operations: AtomicU64::new(0),
        }
    }
}

/// Fan-out topics for a single document.
///
/// Publishing never blocks and never fails: with no subscribers the
/// frame is simply dropped, which is correct for notify-only topics.
pub struct DocChannel {
    presence_tx: broadcast::Sender<Arc<Vec<u8>>>,
    activity_tx: broadcast::Sender<Arc<Vec<u8>>>,
    operations_tx: broadcast::Sender<Arc<Vec<u8>>>,
    capacity: usize,
    stats: AtomicChannelStats,
}

impl DocChannel {
    /// `capacity` is the per-subscriber buffer before lagging consumers
    /// start losing the oldest frames.
    pub fn new(capacity: usize) -> Self {
        let (presence_tx, _) = broadcast::channel(capacity);
        let (activity_tx, _) = broadcast::channel(capacity);
        let (operations_tx, _) = broadcast::channel(capacity);
        Self {
            presence_tx,
            activity_tx,
            operations_tx,
            capacity,
            stats: AtomicChannelStats::new(),
        }
    }

    /// Number of frames the frame is delivered to.
    pub fn publish_presence(&self, frame: Arc<Vec<u8>>) -> usize {
        self.stats.presence.fetch_add(1, Ordering::Relaxed);
        self.presence_tx.send(frame).unwrap_or(0)
    }

    pub fn publish_activity(&self, frame: Arc<Vec<u8>>) -> usize {
        self.stats.activity.fetch_add(1, Ordering::Relaxed);
        self.activity_tx.send(frame).unwrap_or(0)
    }

    pub fn publish_operation(&self, frame: Arc<Vec<u8>>) -> usize {
        self.stats.operations.fetch_add(1, Ordering::Relaxed);
        self.operations_tx.send(frame).unwrap_or(0)
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.presence_tx.subscribe()
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.activity_tx.subscribe()
    }

    pub fn subscribe_operations(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.operations_tx.subscribe()
    }

    /// Subscribers across all three topics.
    pub fn subscriber_count(&self) -> usize {
        self.presence_tx.receiver_count()
            + self.activity_tx.receiver_count()
            + self.operations_tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            presence_published: self.stats.presence.load(Ordering::Relaxed),
            activity_published: self.stats.activity.load(Ordering::Relaxed),
            operations_published: self.stats.operations.load(Ordering::Relaxed),
        }
    }
}

/// Registry mapping document ids to their channels.
pub struct ChannelMap {
    channels: RwLock<HashMap<Uuid, Arc<DocChannel>>>,
    default_capacity: usize,
}

impl ChannelMap {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the channel for a document.
    pub async fn get_or_create(&self, doc_id: Uuid) -> Arc<DocChannel> {
        // Fast path: read lock.
        {
            let channels = self.channels.read().await;
            if let Some(channel) = channels.get(&doc_id) {
                return channel.clone();
            }
        }

        // Slow path: write lock, double-check after acquiring.
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(&doc_id) {
            return channel.clone();
        }
        let channel = Arc::new(DocChannel::new(self.default_capacity));
        channels.insert(doc_id, channel.clone());
        channel
    }

    /// Drop a channel nobody subscribes to anymore.
    pub async fn remove_if_idle(&self, doc_id: &Uuid) -> bool {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(doc_id) {
            if channel.subscriber_count() == 0 {
                channels.remove(doc_id);
                return true;
            }
        }
        false
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.channels.read().await.keys().cloned().collect()
    }
}
