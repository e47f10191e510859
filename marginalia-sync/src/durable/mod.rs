//! Durable channel: the relational store of record and its change feed.
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!  local change ─►│ DurableSender                │── insert / upsert / archive ──┐
//!                 │  (writer task, retry policy) │                               ▼
//!                 └──────────────────────────────┘                      ┌────────────────┐
//!                                                                        │ DurableStore   │
//!                 ┌──────────────────────────────┐   ChangeEvent feed    │ (annotations,  │
//!  local store ◄──│ DurableReceiver              │◄──────────────────────│  targets,      │
//!                 │  (version-gated reconcile)   │                       │  bodies)       │
//!                 └──────────────────────────────┘                       └────────────────┘
//! ```
//!
//! [`DurableStore`] is the seam to the real database client. Rows cross it as
//! the serde records in [`rows`]; the crosswalk between rows and the
//! annotation model lives there too.

pub mod memory;
pub mod receiver;
pub mod rows;
pub mod sender;

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use marginalia_core::{AnnotationStore, User};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{LayerFilter, SyncConfig};
use crate::events::{EventBus, SyncEvent};
use crate::ledger::SharedLedger;

pub use memory::{DurableOp, MemoryDurableStore};
pub use receiver::{DurableReceiver, Reconciled};
pub use rows::{
    parse_annotation_record, AnnotationRecord, AnnotationRow, BodyRecord, BodyRow, ChangeEvent, OldRow,
    ProfileRecord, RowChange, RowEvent, TargetRecord, TargetRow,
};
pub use sender::DurableSender;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DurableError {
    #[error("Request failed: {0}")]
    Request(String),
    #[error("No rows affected in {table}")]
    NoRowsAffected { table: Table },
    #[error("Giving up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<DurableError> },
    #[error("Change feed closed")]
    FeedClosed,
    #[error("Integrity error: {0}")]
    Integrity(String),
}

/// Tables of the store of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Annotations,
    Targets,
    Bodies,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Table::Annotations => write!(f, "annotations"),
            Table::Targets => write!(f, "targets"),
            Table::Bodies => write!(f, "bodies"),
        }
    }
}

pub type DurableFuture<'a, T> = BoxFuture<'a, Result<T, DurableError>>;

/// Client for the relational store of record.
///
/// Implementations are expected to deliver the change feed at least once.
/// Duplicates and reordering are absorbed by the receiver's version gate.
pub trait DurableStore: Send + Sync {
    /// All live annotations of `layers`, with nested targets, bodies and
    /// resolved profiles.
    fn load_annotations(&self, layers: LayerFilter) -> DurableFuture<'_, Vec<AnnotationRecord>>;

    fn insert_annotation(&self, row: AnnotationRow) -> DurableFuture<'_, ()>;
    fn insert_target(&self, row: TargetRow) -> DurableFuture<'_, ()>;
    fn update_visibility(&self, annotation: Uuid, is_private: bool) -> DurableFuture<'_, ()>;
    fn upsert_bodies(&self, rows: Vec<BodyRow>) -> DurableFuture<'_, ()>;

    /// Updates the target of `row.annotation_id`. Returns the number of
    /// rows affected.
    fn update_target(&self, row: TargetRow) -> DurableFuture<'_, u64>;

    /// Soft-deletes a record.
    fn archive(&self, table: Table, id: Uuid) -> DurableFuture<'_, ()>;

    /// Row-level change feed, filtered to `layers` at the source.
    fn subscribe_changes(&self, layers: LayerFilter) -> mpsc::UnboundedReceiver<ChangeEvent>;
}

/// What the sender and receiver of one session share.
#[derive(Clone)]
pub struct DurableContext {
    pub durable: Arc<dyn DurableStore>,
    pub store: Arc<dyn AnnotationStore>,
    pub ledger: SharedLedger,
    pub config: Arc<SyncConfig>,
    pub events: EventBus,
    /// The local user, author of every outbound write
    pub user: User,
}

impl DurableContext {
    pub(crate) fn save_error(&self, what: &str, err: &DurableError) {
        log::error!("{what} failed: {err}");
        self.events.emit(SyncEvent::SaveError(format!("{what}: {err}")));
    }

    pub(crate) fn integrity_error(&self, message: String) {
        log::warn!("{message}");
        self.events.emit(SyncEvent::IntegrityError(message));
    }
}
