//! Ephemeral broadcast channel.
//!
//! Fire-and-forget fan-out between the peers of one document plus a
//! membership view. Nothing sent here is stored; late joiners catch up from
//! the durable stream instead.
//!
//! [`EphemeralChannel`] is the seam to the real transport. [`LocalChannel`]
//! is the in-process implementation backed by tokio broadcast and watch
//! channels, and [`ChannelHub`] hands out one channel per name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, watch, RwLock};

use crate::protocol::{ChannelFrame, Peer, ProtocolError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("Channel closed: {0}")]
    Closed(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Transport used for broadcast and presence.
///
/// Every subscriber receives every published frame, the publisher's own
/// included; filtering by presence key is the receiver's job.
pub trait EphemeralChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Encodes and sends a frame. Returns the number of receivers.
    fn publish(&self, frame: &ChannelFrame) -> Result<usize, ChannelError>;

    fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>>;

    /// Announces a peer. Re-tracking the same key replaces its entry.
    fn track(&self, peer: Peer);
    fn untrack(&self, presence_key: &str);

    /// Current membership, updated on every join and leave.
    fn membership(&self) -> watch::Receiver<Vec<Peer>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub members: usize,
}

struct AtomicChannelStats {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

/// In-process channel. Stats are lock-free on the publish path.
pub struct LocalChannel {
    name: String,
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    members: watch::Sender<Vec<Peer>>,
    capacity: usize,
    closed: AtomicBool,
    stats: AtomicChannelStats,
}

impl LocalChannel {
    /// `capacity` is the number of frames buffered per receiver before a
    /// slow receiver starts lagging.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let (members, _) = watch::channel(Vec::new());
        Self {
            name: name.into(),
            sender,
            members,
            capacity,
            closed: AtomicBool::new(false),
            stats: AtomicChannelStats {
                frames_sent: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
            },
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn member_count(&self) -> usize {
        self.members.borrow().len()
    }

    /// Rejects further publishes. Subscribers already attached drain normally.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            members: self.member_count(),
        }
    }
}

impl EphemeralChannel for LocalChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, frame: &ChannelFrame) -> Result<usize, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed(self.name.clone()));
        }
        let encoded = frame.encode()?;
        let len = encoded.len() as u64;

        // No receivers is not an error on a broadcast medium
        let receivers = self.sender.send(Arc::new(encoded)).unwrap_or(0);

        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(receivers)
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    fn track(&self, peer: Peer) {
        log::debug!("[{}] track {}", self.name, peer.presence_key);
        self.members.send_modify(|members| {
            match members.iter_mut().find(|p| p.presence_key == peer.presence_key) {
                Some(existing) => *existing = peer,
                None => members.push(peer),
            }
        });
    }

    fn untrack(&self, presence_key: &str) {
        log::debug!("[{}] untrack {presence_key}", self.name);
        self.members.send_if_modified(|members| {
            let before = members.len();
            members.retain(|p| p.presence_key != presence_key);
            members.len() != before
        });
    }

    fn membership(&self) -> watch::Receiver<Vec<Peer>> {
        self.members.subscribe()
    }
}

/// Maps channel names to shared [`LocalChannel`]s.
pub struct ChannelHub {
    channels: Arc<RwLock<HashMap<String, Arc<LocalChannel>>>>,
    default_capacity: usize,
}

impl ChannelHub {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, name: &str) -> Arc<LocalChannel> {
        {
            let channels = self.channels.read().await;
            if let Some(channel) = channels.get(name) {
                return channel.clone();
            }
        }

        let mut channels = self.channels.write().await;
        // Double-check after acquiring write lock
        if let Some(channel) = channels.get(name) {
            return channel.clone();
        }

        let channel = Arc::new(LocalChannel::new(name, self.default_capacity));
        channels.insert(name.to_string(), channel.clone());
        channel
    }

    /// Drops a channel nobody is tracked on.
    pub async fn remove_if_empty(&self, name: &str) -> bool {
        let mut channels = self.channels.write().await;
        match channels.get(name) {
            Some(channel) if channel.member_count() == 0 => {
                channel.close();
                channels.remove(name);
                true
            }
            _ => false,
        }
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}
