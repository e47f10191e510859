//! # marginalia-sync: Dual-channel annotation sync
//!
//! Keeps a local annotation store consistent across concurrent editors over
//! two independent channels: a low-latency ephemeral broadcast and the
//! change feed of a durable store of record.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  debounce   ┌─────────────┐  CRTANN/UPTTGT..  ┌──────────────────┐
//! │ local store  │────────────►│ ChangeBatch │──── marshal ─────►│ EphemeralChannel │
//! │ (Local obs.) │             └─────────────┘                   └────────┬─────────┘
//! │              │                                                        │ apply
//! │              │◄───────────────────────────────────────────────────────┘ (Remote)
//! │              │  insert / upsert / archive  ┌──────────────┐
//! │              │────────────────────────────►│ DurableStore │
//! │              │◄──── version-gated ─────────│ (CDC feed)   │
//! └──────────────┘        reconcile            └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Wire shapes for broadcast and selection messages
//! - [`ledger`]: Per-entity version marks, the cross-channel ordering rule
//! - [`batcher`]: Debounced change coalescing
//! - [`codec`]: Marshal change sets into broadcast events and apply them
//! - [`durable`]: Durable writes with retry, and the change-feed reconciler
//! - [`presence`]: Peers, selections and off-page activity
//! - [`privacy`]: Privacy mode mirrored into both channels
//! - [`channel`]: Ephemeral channel seam and in-process implementation
//! - [`session`]: Connect, run and tear down one editor's session

pub mod batcher;
pub mod channel;
pub mod codec;
pub mod config;
pub mod durable;
pub mod events;
pub mod ledger;
pub mod presence;
pub mod privacy;
pub mod protocol;
pub mod session;

// Re-exports for convenience
pub use batcher::{Admission, BatchState, ChangeBatcher, DEFAULT_DEBOUNCE};
pub use channel::{ChannelError, ChannelHub, ChannelStats, EphemeralChannel, LocalChannel};
pub use codec::{affected_annotations, apply, marshal, ApplyOutcome, MarshalContext};
pub use config::{LayerFilter, RetryPolicy, SyncConfig, DEFAULT_SELECTION_DELAY};
pub use durable::{
    ChangeEvent, DurableContext, DurableError, DurableOp, DurableReceiver, DurableSender, DurableStore,
    MemoryDurableStore, Reconciled, RowChange, RowEvent, Table,
};
pub use events::{EventBus, SyncEvent};
pub use ledger::{EntityKey, SharedLedger, VersionLedger};
pub use presence::{Appearance, Color, PresenceTracker, PresentUser};
pub use privacy::{PrivacyMediator, PrivacyMirror};
pub use protocol::{
    BroadcastEvent, BroadcastMessage, ChannelFrame, Peer, ProtocolError, SelectEvent, Topic, WireAnnotation,
    WireBody, WireTarget,
};
pub use session::{ConnectionState, SyncError, SyncSession};
