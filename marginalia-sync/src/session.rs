//! One editor's sync session: wires the local store to both channels.
//!
//! ```text
//!                      ┌──────────── local store ◄──────────────┐
//!                      │ observe(Local)                         │ apply(.., Remote)
//!              ┌───────┴────────┐                      ┌────────┴────────┐
//!              ▼                ▼                      │                 │
//!        ChangeBatcher    DurableSender          frame task        DurableReceiver
//!              │                │                      ▲                 ▲
//!           marshal             │                      │                 │
//!              ▼                ▼                      │                 │
//!       EphemeralChannel   DurableStore ──────── change feed ────────────┘
//!              └────────────────────────────────────────┘
//! ```
//!
//! Remote-origin writes never reach the local observer, so nothing applied
//! from either channel is sent back out.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use marginalia_core::{AnnotationStore, ChangeSet, ObserverId, Origin, StoreChangeEvent, User};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::batcher::{Admission, ChangeBatcher};
use crate::channel::{ChannelError, EphemeralChannel};
use crate::codec::{affected_annotations, apply, marshal, ApplyOutcome, MarshalContext};
use crate::config::SyncConfig;
use crate::durable::{ChangeEvent, DurableContext, DurableReceiver, DurableSender, DurableStore};
use crate::events::{EventBus, SyncEvent};
use crate::ledger::SharedLedger;
use crate::presence::{PresenceTracker, PresentUser};
use crate::privacy::{PrivacyMediator, PrivacyMirror};
use crate::protocol::{BroadcastEvent, BroadcastMessage, ChannelFrame, Peer, ProtocolError, Topic};

/// Session-level failures. These are programming errors, not runtime
/// conditions; everything recoverable is reported as a [`SyncEvent`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Session already connected")]
    AlreadyConnected,
    #[error("Session not connected")]
    NotConnected,
    #[error("Privacy mode diverged: broadcast={broadcast}, durable={durable}")]
    PrivacyDiverged { broadcast: bool, durable: bool },
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

type SharedPresence = Arc<Mutex<PresenceTracker>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Live resources of a connected session.
struct Connection {
    observer: ObserverId,
    /// Aborted on teardown
    tasks: Vec<JoinHandle<()>>,
    /// Pending delayed selection publish
    selection: Mutex<Option<JoinHandle<()>>>,
}

/// State shared by the broadcast-side tasks.
#[derive(Clone)]
struct BroadcastSide {
    local: Peer,
    config: Arc<SyncConfig>,
    store: Arc<dyn AnnotationStore>,
    channel: Arc<dyn EphemeralChannel>,
    events: EventBus,
    presence: SharedPresence,
    privacy: PrivacyMirror,
}

impl BroadcastSide {
    fn publish(&self, events: Vec<BroadcastEvent>) {
        let message = BroadcastMessage {
            from: self.local.clone(),
            events,
            source: self.config.source.clone(),
        };
        let sent = ChannelFrame::change(&message)
            .map_err(ChannelError::from)
            .and_then(|frame| self.channel.publish(&frame));
        match sent {
            Ok(receivers) => log::trace!("broadcast {} event(s) to {receivers} receiver(s)", message.events.len()),
            Err(e) => log::warn!("broadcast on {} failed: {e}", self.channel.name()),
        }
    }

    fn flush(&self, changes: ChangeSet) {
        let ctx = MarshalContext {
            layer_id: self.config.default_layer_id(),
            privacy_mode: self.privacy.get(),
            source: self.config.source.clone(),
        };
        let events = marshal(&changes, self.store.as_ref(), &ctx);
        if events.is_empty() {
            return;
        }
        self.publish(events);
    }

    fn handle_frame(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let frame = ChannelFrame::decode(bytes)?;
        if frame.presence_key == self.local.presence_key {
            return Ok(());
        }
        match frame.topic {
            Topic::Change => self.handle_change(frame.change_message()?),
            Topic::Select => {
                let event = frame.select_event()?;
                if let Some(e) = lock(&self.presence).handle_select(&event) {
                    self.events.emit(e);
                }
            }
        }
        Ok(())
    }

    fn handle_change(&self, message: BroadcastMessage) {
        let source = message.activity_source();
        if !self.config.accepts_source(source.as_deref()) {
            // Changes made on another page are reported, never applied
            log::debug!("off-page change from {} ({source:?})", message.from.presence_key);
            if let Some(e) = lock(&self.presence).notify_activity(&message.from, Vec::new(), source.as_deref()) {
                self.events.emit(e);
            }
            return;
        }

        let mut touched = affected_annotations(&message.events);
        for event in message.events {
            if let ApplyOutcome::OffPage { source } = apply(self.store.as_ref(), event, &self.config) {
                self.events.emit(SyncEvent::OffPageActivity { source, user: message.from.user.clone() });
            }
        }

        touched.retain(|id| self.store.get_annotation(*id).is_some());
        if let Some(e) = lock(&self.presence).notify_activity(&message.from, touched, source.as_deref()) {
            self.events.emit(e);
        }
    }
}

/// A sync session for one user on one document.
pub struct SyncSession {
    config: Arc<SyncConfig>,
    user: User,
    presence_key: String,
    store: Arc<dyn AnnotationStore>,
    channel: Arc<dyn EphemeralChannel>,
    durable: Arc<dyn DurableStore>,
    privacy: PrivacyMediator,
    ledger: SharedLedger,
    events: EventBus,
    presence: SharedPresence,
    connection: Option<Connection>,
}

impl SyncSession {
    pub fn new(
        config: SyncConfig,
        user: User,
        store: Arc<dyn AnnotationStore>,
        channel: Arc<dyn EphemeralChannel>,
        durable: Arc<dyn DurableStore>,
    ) -> Self {
        let config = Arc::new(config);
        let presence_key = Uuid::new_v4().to_string();
        Self {
            events: EventBus::new(config.event_capacity),
            presence: Arc::new(Mutex::new(PresenceTracker::new(presence_key.clone(), config.clone()))),
            config,
            user,
            presence_key,
            store,
            channel,
            durable,
            privacy: PrivacyMediator::new(),
            ledger: SharedLedger::new(),
            connection: None,
        }
    }

    pub fn presence_key(&self) -> &str {
        &self.presence_key
    }

    pub fn local_peer(&self) -> Peer {
        Peer::new(self.presence_key.clone(), self.user.clone())
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        match self.connection {
            Some(_) => ConnectionState::Connected,
            None => ConnectionState::Disconnected,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn present_users(&self) -> Vec<PresentUser> {
        lock(&self.presence).present_users()
    }

    pub fn privacy_mode(&self) -> Result<bool, SyncError> {
        self.privacy.get()
    }

    /// Applies to changes flushed from now on.
    pub fn set_privacy_mode(&self, private: bool) {
        self.privacy.set(private);
    }

    /// Starts syncing: subscribes to both channels, loads the durable
    /// baseline and announces this peer.
    pub async fn connect(&mut self) -> Result<(), SyncError> {
        if self.connection.is_some() {
            return Err(SyncError::AlreadyConnected);
        }

        let side = BroadcastSide {
            local: self.local_peer(),
            config: self.config.clone(),
            store: self.store.clone(),
            channel: self.channel.clone(),
            events: self.events.clone(),
            presence: self.presence.clone(),
            privacy: self.privacy.broadcast_mirror(),
        };
        let ctx = DurableContext {
            durable: self.durable.clone(),
            store: self.store.clone(),
            ledger: self.ledger.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            user: self.user.clone(),
        };

        let frames = self.channel.subscribe();
        let membership = self.channel.membership();
        let feed = self.durable.subscribe_changes(self.config.layers.clone());

        let (batch_tx, batch_rx) = mpsc::unbounded_channel::<ChangeSet>();
        let (write_tx, write_rx) = mpsc::unbounded_channel::<ChangeSet>();

        let tasks = vec![
            tokio::spawn(run_frames(side.clone(), frames)),
            tokio::spawn(run_membership(side.clone(), membership)),
            tokio::spawn(run_batcher(side.clone(), batch_rx)),
            tokio::spawn(run_receiver(
                DurableSender::new(ctx.clone(), self.privacy.durable_mirror()),
                DurableReceiver::new(ctx.clone()),
                self.presence.clone(),
                feed,
            )),
        ];
        // Not tracked: drains on its own once the observer is gone
        tokio::spawn(run_writer(DurableSender::new(ctx, self.privacy.durable_mirror()), write_rx));

        let observer = self.store.observe(
            Some(Origin::Local),
            Arc::new(move |event: &StoreChangeEvent| {
                let _ = batch_tx.send(event.changes.clone());
                let _ = write_tx.send(event.changes.clone());
            }),
        );

        self.channel.track(self.local_peer());
        if self.config.source.is_some() {
            // Lets peers on other pages see us as off-page activity
            side.publish(vec![BroadcastEvent::ChangeSource]);
        }

        self.connection = Some(Connection {
            observer,
            tasks,
            selection: Mutex::new(None),
        });
        log::info!("session {} connected to {}", self.presence_key, self.channel.name());
        self.events.emit(SyncEvent::Connected);
        Ok(())
    }

    /// Stops syncing. Durable writes already queued still complete.
    pub async fn disconnect(&mut self) -> Result<(), SyncError> {
        let connection = self.connection.take().ok_or(SyncError::NotConnected)?;
        self.teardown(connection);
        Ok(())
    }

    fn teardown(&self, connection: Connection) {
        self.store.unobserve(connection.observer);
        self.channel.untrack(&self.presence_key);
        if let Some(pending) = lock(&connection.selection).take() {
            pending.abort();
        }
        for task in connection.tasks {
            task.abort();
        }
        lock(&self.presence).clear();
        log::info!("session {} disconnected", self.presence_key);
        self.events.emit(SyncEvent::Disconnected);
    }

    /// Publishes the local selection after the configured delay. A newer
    /// selection replaces one still waiting.
    pub fn set_local_selection(&self, ids: Vec<Uuid>) -> Result<(), SyncError> {
        let connection = self.connection.as_ref().ok_or(SyncError::NotConnected)?;
        let event = lock(&self.presence).local_select_event(self.local_peer(), ids);
        let frame = ChannelFrame::select(&event)?;

        let channel = self.channel.clone();
        let delay = self.config.selection_delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = channel.publish(&frame) {
                log::warn!("selection publish failed: {e}");
            }
        });

        if let Some(previous) = lock(&connection.selection).replace(task) {
            previous.abort();
        }
        Ok(())
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.teardown(connection);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
// Session tasks
// ─────────────────────────────────────────────────────────────────────

async fn run_frames(side: BroadcastSide, mut frames: broadcast::Receiver<Arc<Vec<u8>>>) {
    loop {
        match frames.recv().await {
            Ok(bytes) => {
                if let Err(e) = side.handle_frame(&bytes) {
                    log::warn!("dropping malformed frame: {e}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("frame receiver lagged, {n} frame(s) lost");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_membership(side: BroadcastSide, mut membership: watch::Receiver<Vec<Peer>>) {
    loop {
        let snapshot = membership.borrow_and_update().clone();
        if let Some(e) = lock(&side.presence).sync_users(&snapshot) {
            side.events.emit(e);
        }
        if membership.changed().await.is_err() {
            break;
        }
    }
}

async fn run_batcher(side: BroadcastSide, mut local: mpsc::UnboundedReceiver<ChangeSet>) {
    let mut batcher = ChangeBatcher::new(side.config.debounce);
    loop {
        let deadline = batcher.deadline();
        tokio::select! {
            next = local.recv() => match next {
                Some(changes) => match batcher.push(changes, Instant::now()) {
                    Admission::Flush(changes) => side.flush(changes),
                    Admission::Deferred { .. } | Admission::Dropped => {}
                },
                None => break,
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some(changes) = batcher.fire(Instant::now()) {
                    side.flush(changes);
                }
            }
        }
    }
    if let Some(discarded) = batcher.cancel() {
        log::debug!("discarding {} unflushed change(s)", discarded.len());
    }
}

async fn run_writer(sender: DurableSender, mut local: mpsc::UnboundedReceiver<ChangeSet>) {
    while let Some(changes) = local.recv().await {
        sender.handle_changes(changes).await;
    }
    log::debug!("durable writer drained");
}

/// Loads the baseline, then follows the feed. Rows arriving during the load
/// queue up and are gated by version afterwards.
async fn run_receiver(
    sender: DurableSender,
    receiver: DurableReceiver,
    presence: SharedPresence,
    mut feed: mpsc::UnboundedReceiver<ChangeEvent>,
) {
    sender.run_initial_load().await;
    while let Some(event) = feed.recv().await {
        let present = lock(&presence).present_users();
        receiver.handle(event, &present);
    }
    log::warn!("durable change feed closed");
}
