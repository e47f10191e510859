//! Events surfaced to the host application.

use marginalia_core::{Annotation, User};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::presence::PresentUser;

/// Everything a session reports upward. Recoverable failures arrive here
/// instead of as errors.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Initial load finished; carries every loaded annotation, including
    /// those filtered out of the local store by document source.
    InitialLoad(Vec<Annotation>),
    InitialLoadError(String),
    /// A durable write failed for good
    SaveError(String),
    /// Structural violation in inbound data; processing continues
    IntegrityError(String),
    /// A peer is active on another document source
    OffPageActivity { source: Option<String>, user: User },
    Presence(Vec<PresentUser>),
    SelectionChange { from: PresentUser, ids: Option<Vec<Uuid>> },
    /// A peer touched these annotations
    Activity { from: PresentUser, annotations: Vec<Uuid> },
}

/// Fan-out of [`SyncEvent`]s. Dropping a receiver unsubscribes it.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
