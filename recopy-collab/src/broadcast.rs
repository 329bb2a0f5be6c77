//! Per-site publish/subscribe fan-out.
//!
//! Every connection on a site subscribes to the site's channel. A frame is
//! encoded once, wrapped in an [`Envelope`] naming the connection it came
//! from, and handed to all receivers in O(1). Receivers drop their own
//! envelopes, so the sender never sees its own edits or presence.
//!
//! Delivery is at-most-once: a receiver that falls more than `capacity`
//! frames behind loses the oldest ones. Frames from one sender reach each
//! receiver in send order; nothing orders frames across senders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerFrame};

/// One encoded frame in flight on a site channel.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Connection that produced the frame (`Uuid::nil()` for the server itself).
    pub origin: Uuid,
    /// JSON text of a [`ServerFrame`].
    pub frame: Arc<str>,
}

impl Envelope {
    /// Whether the receiving connection should forward this envelope.
    pub fn is_for(&self, connection_id: Uuid) -> bool {
        self.origin != connection_id
    }
}

/// Fan-out counters for one site channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub frames_lagged: u64,
    pub subscribers: usize,
}

struct AtomicChannelStats {
    frames_sent: AtomicU64,
    frames_lagged: AtomicU64,
}

/// Broadcast channel shared by every connection on one site.
pub struct SiteChannel {
    site_id: Uuid,
    sender: broadcast::Sender<Envelope>,
    capacity: usize,
    stats: AtomicChannelStats,
}

impl SiteChannel {
    /// `capacity` is how many frames a slow receiver may fall behind
    /// before it starts losing them.
    pub fn new(site_id: Uuid, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            site_id,
            sender,
            capacity,
            stats: AtomicChannelStats {
                frames_sent: AtomicU64::new(0),
                frames_lagged: AtomicU64::new(0),
            },
        }
    }

    pub fn site_id(&self) -> Uuid {
        self.site_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Encode and publish a frame on behalf of `origin`.
    ///
    /// Returns the number of receivers the frame was handed to (the
    /// sender's own receiver included; it filters on receive).
    pub fn publish(&self, origin: Uuid, frame: &ServerFrame) -> Result<usize, ProtocolError> {
        let encoded = frame.encode()?;
        Ok(self.publish_raw(Envelope {
            origin,
            frame: Arc::from(encoded),
        }))
    }

    /// Publish an already-encoded envelope. Never blocks.
    pub fn publish_raw(&self, envelope: Envelope) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a receiver lost to lag.
    pub fn record_lag(&self, skipped: u64) {
        self.stats.frames_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_lagged: self.stats.frames_lagged.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Maps site ids to their channels.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<Uuid, Arc<SiteChannel>>>,
    default_capacity: usize,
}

impl ChannelRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the channel for a site.
    pub async fn get_or_create(&self, site_id: Uuid) -> Arc<SiteChannel> {
        {
            let channels = self.channels.read().await;
            if let Some(channel) = channels.get(&site_id) {
                return channel.clone();
            }
        }

        let mut channels = self.channels.write().await;
        channels
            .entry(site_id)
            .or_insert_with(|| Arc::new(SiteChannel::new(site_id, self.default_capacity)))
            .clone()
    }

    pub async fn get(&self, site_id: &Uuid) -> Option<Arc<SiteChannel>> {
        self.channels.read().await.get(site_id).cloned()
    }

    /// Drop the site's channel once nobody is subscribed or holding it.
    pub async fn remove_if_empty(&self, site_id: &Uuid) -> bool {
        let mut channels = self.channels.write().await;
        match channels.get(site_id) {
            Some(channel) if channel.subscriber_count() == 0 && Arc::strong_count(channel) == 1 => {
                channels.remove(site_id);
                true
            }
            _ => false,
        }
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn active_sites(&self) -> Vec<Uuid> {
        self.channels.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CollaborativeEdit;

    fn edit_frame(content: &str) -> ServerFrame {
        ServerFrame::Edit {
            edit: CollaborativeEdit::new("hero-title", content, Uuid::new_v4(), ""),
        }
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_subscriber() {
        let channel = SiteChannel::new(Uuid::new_v4(), 16);
        let mut rx1 = channel.subscribe();
        let mut rx2 = channel.subscribe();
        let mut rx3 = channel.subscribe();

        let sender = Uuid::new_v4();
        let count = channel.publish(sender, &edit_frame("Hi")).unwrap();
        assert_eq!(count, 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let envelope = rx.recv().await.unwrap();
            assert_eq!(envelope.origin, sender);
        }
    }

    #[tokio::test]
    async fn test_envelope_self_filter() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let envelope = Envelope {
            origin: me,
            frame: Arc::from("{}"),
        };
        assert!(!envelope.is_for(me));
        assert!(envelope.is_for(other));
    }

    #[tokio::test]
    async fn test_per_sender_order_preserved() {
        let channel = SiteChannel::new(Uuid::new_v4(), 64);
        let mut rx = channel.subscribe();
        let sender = Uuid::new_v4();

        for i in 0..20 {
            channel.publish(sender, &edit_frame(&format!("v{i}"))).unwrap();
        }

        for i in 0..20 {
            let envelope = rx.recv().await.unwrap();
            match ServerFrame::decode(&envelope.frame).unwrap() {
                ServerFrame::Edit { edit } => assert_eq!(edit.content, format!("v{i}")),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_not_an_error() {
        let channel = SiteChannel::new(Uuid::new_v4(), 4);
        let count = channel.publish(Uuid::new_v4(), &ServerFrame::Pong).unwrap();
        assert_eq!(count, 0);
        assert_eq!(channel.stats().frames_sent, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver_loses_oldest_frames() {
        let channel = SiteChannel::new(Uuid::new_v4(), 2);
        let mut rx = channel.subscribe();
        let sender = Uuid::new_v4();
        for i in 0..5 {
            channel.publish(sender, &edit_frame(&format!("v{i}"))).unwrap();
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => {
                channel.record_lag(n);
                assert_eq!(n, 3);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(channel.stats().frames_lagged, 3);
    }

    #[tokio::test]
    async fn test_registry_get_or_create_returns_same_channel() {
        let registry = ChannelRegistry::new(16);
        let site = Uuid::new_v4();
        let a = registry.get_or_create(site).await;
        let b = registry.get_or_create(site).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.channel_count().await, 1);
        assert_eq!(a.capacity(), 16);
    }

    #[tokio::test]
    async fn test_registry_isolates_sites() {
        let registry = ChannelRegistry::new(16);
        let site_a = registry.get_or_create(Uuid::new_v4()).await;
        let site_b = registry.get_or_create(Uuid::new_v4()).await;
        let mut rx_b = site_b.subscribe();

        site_a.publish(Uuid::new_v4(), &ServerFrame::Pong).unwrap();
        assert!(rx_b.try_recv().is_err());
        assert_eq!(registry.active_sites().await.len(), 2);
    }

    #[tokio::test]
    async fn test_registry_removes_only_empty_channels() {
        let registry = ChannelRegistry::new(16);
        let site = Uuid::new_v4();
        let channel = registry.get_or_create(site).await;
        let rx = channel.subscribe();

        assert!(!registry.remove_if_empty(&site).await);
        drop(rx);
        // Still held by a joiner that has not subscribed yet
        assert!(!registry.remove_if_empty(&site).await);
        drop(channel);
        assert!(registry.remove_if_empty(&site).await);
        assert!(registry.get(&site).await.is_none());
    }
}
