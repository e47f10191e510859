//! Inbound half of the durable channel: applies change-feed rows to the
//! local store.
//!
//! Every update passes the ledger's strict version gate, so redelivered
//! rows and rows already seen over the broadcast channel are no-ops.

use marginalia_core::{Annotation, Origin, User, Visibility};
use uuid::Uuid;

use super::rows::{BodyRow, ChangeEvent, RowChange, RowEvent, TargetRow};
use super::DurableContext;
use crate::events::SyncEvent;
use crate::ledger::EntityKey;
use crate::presence::PresentUser;

/// What became of one change-feed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    Applied,
    /// Nothing to do: already known, racing a delete, or not ours to apply
    Ignored,
    /// Version not newer than the one held
    Stale,
    /// Belongs to another document source
    OffPage { source: Option<String> },
    /// Reported as an integrity error
    Integrity,
}

#[derive(Clone)]
pub struct DurableReceiver {
    ctx: DurableContext,
}

impl DurableReceiver {
    pub fn new(ctx: DurableContext) -> Self {
        Self { ctx }
    }

    /// Applies one feed event. `present` is the current peer list, used to
    /// resolve user ids the annotation itself does not know.
    pub fn handle(&self, event: ChangeEvent, present: &[PresentUser]) -> Reconciled {
        let outcome = match event {
            ChangeEvent::Annotation(e) => match e.event_type {
                RowChange::Delete => self.annotation_deleted(e.old.id),
                // Creation travels with the target row
                RowChange::Insert | RowChange::Update => Reconciled::Ignored,
            },
            ChangeEvent::Target(e) => match e.event_type {
                RowChange::Insert => self.target_inserted(e, present),
                RowChange::Update => self.target_updated(e, present),
                RowChange::Delete => Reconciled::Ignored,
            },
            ChangeEvent::Body(e) => match e.event_type {
                RowChange::Insert | RowChange::Update => self.body_upserted(e, present),
                RowChange::Delete => self.body_deleted(e.old.id),
            },
        };
        log::trace!("feed event reconciled: {outcome:?}");
        outcome
    }

    /// Known contributors of `annotation` first, then present peers.
    fn resolve_user(id: Uuid, annotation: Option<&Annotation>, present: &[PresentUser]) -> User {
        annotation
            .and_then(|a| a.contributors().into_iter().find(|u| u.id == id))
            .or_else(|| present.iter().find(|p| p.user.id == id).map(|p| p.user.clone()))
            .unwrap_or_else(|| User::new(id))
    }

    fn annotation_deleted(&self, id: Option<Uuid>) -> Reconciled {
        let Some(existing) = id.and_then(|id| self.ctx.store.get_annotation(id)) else {
            return Reconciled::Ignored;
        };
        self.ctx.store.delete_annotation(existing.id, Origin::Remote);
        self.ctx.ledger.lock().forget_annotation(&existing);
        Reconciled::Applied
    }

    fn target_inserted(&self, event: RowEvent<TargetRow>, present: &[PresentUser]) -> Reconciled {
        let Some(row) = event.new else {
            return Reconciled::Ignored;
        };
        if !row.has_selector() || self.ctx.store.get_annotation(row.annotation_id).is_some() {
            return Reconciled::Ignored;
        }
        // Our own insert arriving after a local delete must not resurrect it
        if row.created_by == Some(self.ctx.user.id) {
            log::debug!("skipping own target insert for {}", row.annotation_id);
            return Reconciled::Ignored;
        }

        let target = match row.to_target(|id| Self::resolve_user(id, None, present)) {
            Ok(target) => target,
            Err(e) => {
                log::debug!("discarding target insert: {e}");
                return Reconciled::Ignored;
            }
        };

        let source = target.selector.source().map(str::to_string);
        if !self.ctx.config.accepts_source(source.as_deref()) {
            let user = target
                .creator
                .clone()
                .unwrap_or_else(|| User::new(row.created_by.unwrap_or_else(Uuid::nil)));
            self.ctx.events.emit(SyncEvent::OffPageActivity { source: source.clone(), user });
            return Reconciled::OffPage { source };
        }

        let annotation = Annotation {
            id: row.annotation_id,
            target,
            bodies: Vec::new(),
            layer_id: row.layer_id,
            visibility: Visibility::Default,
        };
        self.ctx.ledger.lock().observe_annotation(&annotation);
        self.ctx.store.add_annotation(annotation, Origin::Remote);
        Reconciled::Applied
    }

    fn target_updated(&self, event: RowEvent<TargetRow>, present: &[PresentUser]) -> Reconciled {
        let Some(row) = event.new else {
            return Reconciled::Ignored;
        };
        // Presumed to race a delete
        let Some(annotation) = self.ctx.store.get_annotation(row.annotation_id) else {
            return Reconciled::Ignored;
        };

        let key = EntityKey::Target(annotation.id);
        if !self.ctx.ledger.lock().is_newer(key, annotation.target.version, row.version) {
            return Reconciled::Stale;
        }

        let target = match row.to_target(|id| Self::resolve_user(id, Some(&annotation), present)) {
            Ok(target) => target,
            Err(e) => {
                log::debug!("discarding target update: {e}");
                return Reconciled::Ignored;
            }
        };
        if let Some(version) = target.version {
            self.ctx.ledger.lock().observe(key, version);
        }
        self.ctx.store.update_target(target, Origin::Remote);
        Reconciled::Applied
    }

    fn body_upserted(&self, event: RowEvent<BodyRow>, present: &[PresentUser]) -> Reconciled {
        let Some(row) = event.new else {
            return Reconciled::Ignored;
        };
        let Some(annotation) = self.ctx.store.get_annotation(row.annotation_id) else {
            self.ctx.integrity_error(format!(
                "body {} references missing annotation {}",
                row.id, row.annotation_id
            ));
            return Reconciled::Integrity;
        };

        let key = EntityKey::Body(row.id);
        let body = row.to_body(|id| Self::resolve_user(id, Some(&annotation), present));
        match annotation.body(row.id) {
            Some(existing) => {
                if !self.ctx.ledger.lock().is_newer(key, existing.version, row.version) {
                    return Reconciled::Stale;
                }
                self.ctx.store.update_body(body, Origin::Remote);
            }
            None => self.ctx.store.add_body(body, Origin::Remote),
        }
        if let Some(version) = row.version {
            self.ctx.ledger.lock().observe(key, version);
        }
        Reconciled::Applied
    }

    fn body_deleted(&self, id: Option<Uuid>) -> Reconciled {
        let Some(body) = id.and_then(|id| self.ctx.store.get_body(id)) else {
            return Reconciled::Ignored;
        };
        self.ctx.store.delete_body(body.annotation, body.id, Origin::Remote);
        self.ctx.ledger.lock().forget(EntityKey::Body(body.id));
        Reconciled::Applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use marginalia_core::{AnnotationStore, Body, MemoryStore, Selector};
    use serde_json::json;
    use tokio::sync::broadcast;

    use crate::config::SyncConfig;
    use crate::durable::MemoryDurableStore;
    use crate::events::EventBus;
    use crate::ledger::SharedLedger;
    use crate::protocol::Peer;

    struct Fixture {
        receiver: DurableReceiver,
        store: Arc<MemoryStore>,
        events: broadcast::Receiver<SyncEvent>,
        ledger: SharedLedger,
        me: Uuid,
        layer: Uuid,
    }

    fn fixture(config: impl FnOnce(SyncConfig) -> SyncConfig) -> Fixture {
        let layer = Uuid::new_v4();
        let me = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(64);
        let events = bus.subscribe();
        let ledger = SharedLedger::new();
        let ctx = DurableContext {
            durable: Arc::new(MemoryDurableStore::new()),
            store: store.clone(),
            ledger: ledger.clone(),
            config: Arc::new(config(SyncConfig::for_testing(layer))),
            events: bus,
            user: User::named(me, "me"),
        };
        Fixture {
            receiver: DurableReceiver::new(ctx),
            store,
            events,
            ledger,
            me,
            layer,
        }
    }

    fn target_row(annotation: Uuid, creator: Uuid, selector: serde_json::Value, version: u64) -> TargetRow {
        TargetRow {
            annotation_id: annotation,
            created_at: Some(Utc::now()),
            created_by: Some(creator),
            updated_at: None,
            updated_by: Some(creator),
            value: Some(selector.to_string()),
            layer_id: None,
            version: Some(version),
        }
    }

    fn body_row(annotation: Uuid, value: &str, version: u64) -> BodyRow {
        BodyRow {
            id: Uuid::new_v4(),
            annotation_id: annotation,
            created_at: Some(Utc::now()),
            created_by: None,
            updated_at: None,
            updated_by: None,
            purpose: Some("commenting".into()),
            format: None,
            value: Some(value.into()),
            layer_id: None,
            version: Some(version),
        }
    }

    fn target_event(change: RowChange, row: TargetRow) -> ChangeEvent {
        ChangeEvent::Target(RowEvent::new(change, Some(row)))
    }

    fn body_event(change: RowChange, row: BodyRow) -> ChangeEvent {
        ChangeEvent::Body(RowEvent::new(change, Some(row)))
    }

    fn existing(f: &Fixture, version: u64) -> Annotation {
        let mut annotation = Annotation::new(Uuid::new_v4(), Selector::new(json!({ "x": 1 })));
        annotation.target.version = Some(version);
        annotation.layer_id = Some(f.layer);
        f.store.add_annotation(annotation.clone(), Origin::Remote);
        f.ledger.lock().observe_annotation(&annotation);
        annotation
    }

    #[test]
    fn test_target_insert_creates_annotation() {
        let f = fixture(|c| c);
        let id = Uuid::new_v4();
        let row = target_row(id, Uuid::new_v4(), json!({ "x": 5 }), 1);

        assert_eq!(f.receiver.handle(target_event(RowChange::Insert, row), &[]), Reconciled::Applied);
        let annotation = f.store.get_annotation(id).unwrap();
        assert_eq!(annotation.target.version, Some(1));
        assert!(annotation.bodies.is_empty());
        assert_eq!(f.ledger.lock().current(EntityKey::Target(id)), Some(1));
    }

    #[test]
    fn test_target_insert_resolves_present_peer() {
        let f = fixture(|c| c);
        let alice = User::named(Uuid::new_v4(), "Alice");
        let present = vec![PresentUser::from_peer(&Peer::new("k1", alice.clone()))];
        let id = Uuid::new_v4();

        f.receiver.handle(target_event(RowChange::Insert, target_row(id, alice.id, json!({ "x": 1 }), 1)), &present);
        let creator = f.store.get_annotation(id).unwrap().target.creator.unwrap();
        assert_eq!(creator.name.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_target_insert_unknown_user_is_bare() {
        let f = fixture(|c| c);
        let (id, who) = (Uuid::new_v4(), Uuid::new_v4());

        f.receiver.handle(target_event(RowChange::Insert, target_row(id, who, json!({ "x": 1 }), 1)), &[]);
        assert_eq!(f.store.get_annotation(id).unwrap().target.creator, Some(User::new(who)));
    }

    #[test]
    fn test_target_insert_without_selector_ignored() {
        let f = fixture(|c| c);
        let mut row = target_row(Uuid::new_v4(), Uuid::new_v4(), json!({}), 1);
        row.value = None;

        assert_eq!(f.receiver.handle(target_event(RowChange::Insert, row), &[]), Reconciled::Ignored);
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_own_target_insert_not_resurrected() {
        // Local delete landed before our own insert came back on the feed
        let f = fixture(|c| c);
        let id = Uuid::new_v4();
        let row = target_row(id, f.me, json!({ "x": 1 }), 1);

        assert_eq!(f.receiver.handle(target_event(RowChange::Insert, row), &[]), Reconciled::Ignored);
        assert!(f.store.get_annotation(id).is_none());
    }

    #[tokio::test]
    async fn test_foreign_source_target_insert_is_off_page() {
        let mut f = fixture(|c| c.with_source("docA"));
        let row = target_row(Uuid::new_v4(), Uuid::new_v4(), json!({ "x": 1, "source": "docB" }), 1);

        let outcome = f.receiver.handle(target_event(RowChange::Insert, row), &[]);
        assert_eq!(outcome, Reconciled::OffPage { source: Some("docB".into()) });
        assert!(f.store.is_empty());
        match f.events.recv().await.unwrap() {
            SyncEvent::OffPageActivity { source, .. } => assert_eq!(source.as_deref(), Some("docB")),
            other => panic!("expected off-page activity, got {other:?}"),
        }
    }

    #[test]
    fn test_target_update_version_gate() {
        let f = fixture(|c| c);
        let annotation = existing(&f, 3);

        let same = target_row(annotation.id, Uuid::new_v4(), json!({ "x": 9 }), 3);
        assert_eq!(f.receiver.handle(target_event(RowChange::Update, same), &[]), Reconciled::Stale);
        assert_eq!(f.store.get_annotation(annotation.id).unwrap(), annotation);

        let newer = target_row(annotation.id, Uuid::new_v4(), json!({ "x": 9 }), 4);
        assert_eq!(f.receiver.handle(target_event(RowChange::Update, newer.clone()), &[]), Reconciled::Applied);
        let target = f.store.get_annotation(annotation.id).unwrap().target;
        assert_eq!(target.version, Some(4));
        assert_eq!(target.selector, Selector::new(json!({ "x": 9 })));

        // Redelivery is a no-op
        assert_eq!(f.receiver.handle(target_event(RowChange::Update, newer), &[]), Reconciled::Stale);
        assert_eq!(f.ledger.lock().current(EntityKey::Target(annotation.id)), Some(4));
    }

    #[test]
    fn test_target_update_for_missing_annotation_ignored() {
        let f = fixture(|c| c);
        let row = target_row(Uuid::new_v4(), Uuid::new_v4(), json!({ "x": 1 }), 2);
        assert_eq!(f.receiver.handle(target_event(RowChange::Update, row), &[]), Reconciled::Ignored);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_body_for_missing_annotation_is_integrity_error() {
        let mut f = fixture(|c| c);
        let missing = Uuid::new_v4();

        let outcome = f.receiver.handle(body_event(RowChange::Insert, body_row(missing, "hi", 1)), &[]);
        assert_eq!(outcome, Reconciled::Integrity);
        match f.events.recv().await.unwrap() {
            SyncEvent::IntegrityError(msg) => assert!(msg.contains(&missing.to_string())),
            other => panic!("expected integrity error, got {other:?}"),
        }
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_body_insert_then_update() {
        let f = fixture(|c| c);
        let annotation = existing(&f, 1);
        let row = body_row(annotation.id, "first", 1);

        assert_eq!(f.receiver.handle(body_event(RowChange::Insert, row.clone()), &[]), Reconciled::Applied);
        assert_eq!(f.store.get_body(row.id).unwrap().value.as_deref(), Some("first"));

        // Insert redelivered as an update with the same version
        assert_eq!(f.receiver.handle(body_event(RowChange::Update, row.clone()), &[]), Reconciled::Stale);

        let edited = BodyRow {
            value: Some("second".into()),
            version: Some(2),
            ..row.clone()
        };
        assert_eq!(f.receiver.handle(body_event(RowChange::Update, edited), &[]), Reconciled::Applied);
        let body = f.store.get_body(row.id).unwrap();
        assert_eq!(body.value.as_deref(), Some("second"));
        assert_eq!(body.version, Some(2));
    }

    #[test]
    fn test_body_delete() {
        let f = fixture(|c| c);
        let annotation = existing(&f, 1);
        let body = Body::new(annotation.id, "bye");
        f.store.add_body(body.clone(), Origin::Remote);

        let event = ChangeEvent::Body(RowEvent::deleted(body.id));
        assert_eq!(f.receiver.handle(event.clone(), &[]), Reconciled::Applied);
        assert!(f.store.get_body(body.id).is_none());
        assert_eq!(f.receiver.handle(event, &[]), Reconciled::Ignored);
    }

    #[test]
    fn test_annotation_delete_is_idempotent() {
        let f = fixture(|c| c);
        let annotation = existing(&f, 2);

        let event = ChangeEvent::Annotation(RowEvent::deleted(annotation.id));
        assert_eq!(f.receiver.handle(event.clone(), &[]), Reconciled::Applied);
        assert!(f.store.is_empty());
        assert!(f.ledger.lock().is_empty());
        assert_eq!(f.receiver.handle(event, &[]), Reconciled::Ignored);
    }

    #[test]
    fn test_remote_apply_does_not_notify_local_observers() {
        let f = fixture(|c| c);
        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = seen.clone();
        f.store.observe(
            Some(Origin::Local),
            Arc::new(move |_: &marginalia_core::StoreChangeEvent| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
        );

        let row = target_row(Uuid::new_v4(), Uuid::new_v4(), json!({ "x": 1 }), 1);
        f.receiver.handle(target_event(RowChange::Insert, row), &[]);
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
