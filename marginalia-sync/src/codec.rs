//! Broadcast codec.
//!
//! Outbound, [`marshal`] turns a flushed [`ChangeSet`] into the ordered event
//! list for one [`BroadcastMessage`](crate::protocol::BroadcastMessage).
//! Inbound, [`apply`] replays one received event onto the local store with
//! [`Origin::Remote`] so it is never marshaled again.
//!
//! ```text
//! ChangeSet ──► marshal ──► [CRTANN.., CRTANN(public).., DELANN.., DELBDY.., UPTTGT..]
//!                  │
//!                  └──► store.bulk_update_targets(stamped, Remote)
//!
//! BroadcastEvent ──► revive ──► apply ──► store.*(.., Remote)
//! ```

use std::collections::HashSet;

use marginalia_core::{Annotation, AnnotationStore, ChangeSet, Origin, Target};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::protocol::{BroadcastEvent, WireAnnotation, WireTarget};

/// Per-flush parameters for [`marshal`].
#[derive(Debug, Clone, Default)]
pub struct MarshalContext {
    /// Layer stamped onto announced annotations
    pub layer_id: Option<Uuid>,
    pub privacy_mode: bool,
    /// Document source injected into announced selectors
    pub source: Option<String>,
}

/// Stamps an announced annotation: layer, source tag and a version that
/// never goes below what the store already holds.
fn stamp(annotation: &Annotation, current: Option<&Annotation>, ctx: &MarshalContext) -> Annotation {
    let mut stamped = annotation.clone();
    stamped.layer_id = ctx.layer_id.or(annotation.layer_id);
    stamped.target.version = Some(current.and_then(|a| a.target.version).unwrap_or(1));
    if let Some(source) = &ctx.source {
        stamped.target.selector = stamped.target.selector.with_source(source);
    }
    stamped
}

/// Target to write back into the store so the local copy matches the wire.
fn write_back(stamped: &Annotation, current: Option<Annotation>) -> Option<Target> {
    let current = current?;
    let mut target = current.target.clone();
    target.version = stamped.target.version;
    target.selector = stamped.target.selector.clone();
    (target != current.target).then_some(target)
}

/// Builds the broadcast events for a flushed change set.
///
/// While privacy mode is on new annotations are not announced. Clearing the
/// private flag always announces the annotation, whatever the mode. Deletes
/// and updates of private annotations never leave this peer.
pub fn marshal(changes: &ChangeSet, store: &dyn AnnotationStore, ctx: &MarshalContext) -> Vec<BroadcastEvent> {
    let mut announced: Vec<Annotation> = Vec::new();
    let mut made_public: Vec<Annotation> = Vec::new();

    if !ctx.privacy_mode {
        for created in &changes.created {
            let current = store.get_annotation(created.id);
            announced.push(stamp(created, current.as_ref(), ctx));
        }
    }

    let updated: Vec<_> = changes.updated.iter().filter(|u| !u.new_value.is_private()).collect();

    for update in updated.iter().filter(|u| u.old_value.is_private()) {
        let current = store.get_annotation(update.id());
        made_public.push(stamp(&update.new_value, current.as_ref(), ctx));
    }

    let mut events = Vec::with_capacity(announced.len() + made_public.len() + changes.len());

    for annotation in announced.iter().chain(&made_public) {
        events.push(BroadcastEvent::CreateAnnotation { annotation: WireAnnotation::from(annotation) });
    }

    for deleted in changes.deleted.iter().filter(|a| !a.is_private()) {
        events.push(BroadcastEvent::DeleteAnnotation { id: deleted.id });
    }

    for update in &updated {
        for body in &update.bodies_deleted {
            events.push(BroadcastEvent::DeleteBody { id: body.id, annotation: body.annotation });
        }
    }

    for update in &updated {
        if let Some(target) = &update.target_updated {
            events.push(BroadcastEvent::UpdateTarget { target: WireTarget::from(&target.new_target) });
        }
    }

    let stamped: Vec<Target> = announced
        .iter()
        .chain(&made_public)
        .filter_map(|a| write_back(a, store.get_annotation(a.id)))
        .collect();
    if !stamped.is_empty() {
        log::trace!("writing back {} stamped target(s)", stamped.len());
        store.bulk_update_targets(stamped, Origin::Remote);
    }

    events
}

/// What [`apply`] did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Handed to the store
    Dispatched,
    /// Malformed, stale or not applicable
    Discarded,
    /// Belongs to another document source
    OffPage { source: Option<String> },
}

/// Replays one inbound event onto the store.
///
/// Target and body updates carrying a version below the one held locally
/// are stale and discarded. Everything that is dispatched is tagged
/// [`Origin::Remote`].
pub fn apply(store: &dyn AnnotationStore, event: BroadcastEvent, config: &SyncConfig) -> ApplyOutcome {
    match event {
        BroadcastEvent::CreateAnnotation { annotation } => {
            let annotation = annotation.revive();
            if annotation.target.selector.is_empty() {
                log::debug!("discarding create of {}: empty selector", annotation.id);
                return ApplyOutcome::Discarded;
            }
            let source = annotation.target.selector.source();
            if !config.accepts_source(source) {
                log::debug!("create of {} belongs to {:?}", annotation.id, source);
                return ApplyOutcome::OffPage { source: source.map(String::from) };
            }
            store.add_annotation(annotation, Origin::Remote);
        }
        BroadcastEvent::DeleteAnnotation { id } => store.delete_annotation(id, Origin::Remote),
        BroadcastEvent::CreateBody { body } => store.add_body(body.revive(), Origin::Remote),
        BroadcastEvent::DeleteBody { id, annotation } => store.delete_body(annotation, id, Origin::Remote),
        BroadcastEvent::UpdateBody { body } => {
            let body = body.revive();
            let held = store.get_body(body.id).and_then(|b| b.version);
            if is_stale(held, body.version) {
                log::debug!("discarding stale body {} v{:?} < v{:?}", body.id, body.version, held);
                return ApplyOutcome::Discarded;
            }
            store.update_body(body, Origin::Remote);
        }
        BroadcastEvent::UpdateTarget { target } => {
            let target = target.revive();
            if target.selector.is_empty() {
                return ApplyOutcome::Discarded;
            }
            let held = store.get_annotation(target.annotation).and_then(|a| a.target.version);
            if is_stale(held, target.version) {
                log::debug!("discarding stale target {} v{:?} < v{:?}", target.annotation, target.version, held);
                return ApplyOutcome::Discarded;
            }
            store.update_target(target, Origin::Remote);
        }
        BroadcastEvent::ChangeSource => return ApplyOutcome::Discarded,
    }
    ApplyOutcome::Dispatched
}

/// Equal versions are allowed through: a peer's drag steps share one version.
fn is_stale(held: Option<u64>, incoming: Option<u64>) -> bool {
    matches!((held, incoming), (Some(held), Some(incoming)) if incoming < held)
}

/// Distinct annotations touched by `events`, in first-seen order.
pub fn affected_annotations(events: &[BroadcastEvent]) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    events
        .iter()
        .filter_map(BroadcastEvent::touched_annotation)
        .filter(|id| seen.insert(*id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use marginalia_core::{diff_annotations, Body, MemoryStore, Selector, StoreChangeEvent, Visibility};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn rect(x: i64) -> Selector {
        Selector::new(json!({ "type": "RECTANGLE", "geometry": { "x": x, "y": 0, "w": 10, "h": 10 } }))
    }

    fn open_config() -> SyncConfig {
        SyncConfig::new("doc", Uuid::new_v4())
    }

    fn ctx() -> MarshalContext {
        MarshalContext { layer_id: Some(Uuid::new_v4()), privacy_mode: false, source: None }
    }

    fn creates(events: &[BroadcastEvent]) -> Vec<&WireAnnotation> {
        events
            .iter()
            .filter_map(|e| match e {
                BroadcastEvent::CreateAnnotation { annotation } => Some(annotation),
                _ => None,
            })
            .collect()
    }

    // ── Marshal tests ────────────────────────────────────────────

    #[test]
    fn test_create_stamped_with_version_one() {
        let store = MemoryStore::new();
        let annotation = Annotation::new(Uuid::new_v4(), rect(1));
        store.add_annotation(annotation.clone(), Origin::Local);

        let ctx = ctx();
        let events = marshal(&ChangeSet::created(annotation.clone()), &store, &ctx);

        assert_eq!(events.len(), 1);
        let wire = creates(&events)[0];
        assert_eq!(wire.target.version, Some(1));
        assert_eq!(wire.layer_id, ctx.layer_id);

        // Local copy agrees with the wire
        assert_eq!(store.get_annotation(annotation.id).unwrap().target.version, Some(1));
    }

    #[test]
    fn test_create_gets_source_tag() {
        let store = MemoryStore::new();
        let annotation = Annotation::new(Uuid::new_v4(), rect(1));
        store.add_annotation(annotation.clone(), Origin::Local);

        let ctx = MarshalContext { source: Some("page-1.jpg".into()), ..ctx() };
        let events = marshal(&ChangeSet::created(annotation.clone()), &store, &ctx);

        assert_eq!(creates(&events)[0].target.selector["source"], "page-1.jpg");
        let local = store.get_annotation(annotation.id).unwrap();
        assert_eq!(local.target.selector.source(), Some("page-1.jpg"));
    }

    #[test]
    fn test_version_never_lowered_by_stamp() {
        let store = MemoryStore::new();
        let mut annotation = Annotation::new(Uuid::new_v4(), rect(1));
        annotation.target.version = Some(4);
        store.add_annotation(annotation.clone(), Origin::Local);

        let events = marshal(&ChangeSet::created(annotation.clone()), &store, &ctx());
        assert_eq!(creates(&events)[0].target.version, Some(4));
        assert_eq!(store.get_annotation(annotation.id).unwrap().target.version, Some(4));
    }

    #[test]
    fn test_write_back_is_remote() {
        let store = MemoryStore::new();
        let annotation = Annotation::new(Uuid::new_v4(), rect(1));
        store.add_annotation(annotation.clone(), Origin::Local);

        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        store.observe(
            Some(Origin::Local),
            Arc::new(move |_: &StoreChangeEvent| *counter.lock().unwrap() += 1),
        );

        marshal(&ChangeSet::created(annotation), &store, &ctx());
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[test]
    fn test_privacy_mode_suppresses_creates() {
        let store = MemoryStore::new();
        let mut private = Annotation::new(Uuid::new_v4(), rect(1));
        private.visibility = Visibility::Private;
        store.add_annotation(private.clone(), Origin::Local);

        let mut changes = ChangeSet::created(private.clone());
        changes.created.push(Annotation::new(Uuid::new_v4(), rect(2)));

        let ctx = MarshalContext { privacy_mode: true, ..ctx() };
        let events = marshal(&changes, &store, &ctx);
        assert!(creates(&events).is_empty());
        assert!(events.is_empty());
        // Nothing announced, nothing stamped
        assert_eq!(store.get_annotation(private.id).unwrap().target.version, None);
    }

    #[test]
    fn test_private_delete_and_update_suppressed() {
        let store = MemoryStore::new();
        let mut deleted = Annotation::new(Uuid::new_v4(), rect(1));
        deleted.visibility = Visibility::Private;

        let mut edited = Annotation::new(Uuid::new_v4(), rect(2));
        edited.visibility = Visibility::Private;
        let mut moved = edited.clone();
        moved.target.selector = rect(5);

        let mut changes = ChangeSet::deleted(deleted);
        changes.updated.push(diff_annotations(&edited, &moved));

        assert!(marshal(&changes, &store, &ctx()).is_empty());
    }

    #[test]
    fn test_make_public_synthesizes_create() {
        let store = MemoryStore::new();
        let mut private = Annotation::new(Uuid::new_v4(), rect(1));
        private.visibility = Visibility::Private;
        private.target.version = Some(1);
        let mut public = private.clone();
        public.visibility = Visibility::Default;
        store.add_annotation(public.clone(), Origin::Local);

        let events = marshal(&ChangeSet::updated(diff_annotations(&private, &public)), &store, &ctx());

        assert_eq!(events.len(), 1);
        let wire = creates(&events)[0];
        assert_eq!(wire.id, public.id);
        assert_eq!(wire.visibility, Visibility::Default);
        assert_eq!(wire.target.version, Some(1));
    }

    #[test]
    fn test_make_public_announced_while_privacy_mode_on() {
        let store = MemoryStore::new();
        let mut private = Annotation::new(Uuid::new_v4(), rect(1));
        private.visibility = Visibility::Private;
        let mut public = private.clone();
        public.visibility = Visibility::Default;
        store.add_annotation(public.clone(), Origin::Local);

        let ctx = MarshalContext { privacy_mode: true, ..ctx() };
        let events = marshal(&ChangeSet::updated(diff_annotations(&private, &public)), &store, &ctx);

        assert_eq!(events.len(), 1);
        let wire = creates(&events)[0];
        assert_eq!(wire.id, public.id);
        assert_eq!(wire.target.version, Some(1));
        assert_eq!(store.get_annotation(public.id).unwrap().target.version, Some(1));
    }

    #[test]
    fn test_event_order() {
        let store = MemoryStore::new();

        let created = Annotation::new(Uuid::new_v4(), rect(1));
        store.add_annotation(created.clone(), Origin::Local);

        let mut private = Annotation::new(Uuid::new_v4(), rect(2));
        private.visibility = Visibility::Private;
        let mut public = private.clone();
        public.visibility = Visibility::Default;
        store.add_annotation(public.clone(), Origin::Local);

        let deleted = Annotation::new(Uuid::new_v4(), rect(3));

        let mut edited = Annotation::new(Uuid::new_v4(), rect(4));
        let body = Body::new(edited.id, "note");
        edited.bodies.push(body.clone());
        let mut after = edited.clone();
        after.bodies.clear();
        after.target.selector = rect(40);

        let changes = ChangeSet {
            created: vec![created.clone()],
            deleted: vec![deleted.clone()],
            updated: vec![diff_annotations(&private, &public), diff_annotations(&edited, &after)],
        };

        let tags: Vec<String> = marshal(&changes, &store, &ctx())
            .iter()
            .map(|e| serde_json::to_value(e).unwrap()["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(tags, vec!["CRTANN", "CRTANN", "DELANN", "DELBDY", "UPTTGT"]);
    }

    #[test]
    fn test_body_changes_not_broadcast() {
        let store = MemoryStore::new();
        let annotation = Annotation::new(Uuid::new_v4(), rect(1));
        let mut commented = annotation.clone();
        commented.bodies.push(Body::new(annotation.id, "hello"));

        let events = marshal(&ChangeSet::updated(diff_annotations(&annotation, &commented)), &store, &ctx());
        assert!(events.is_empty());
    }

    // ── Apply tests ──────────────────────────────────────────────

    #[test]
    fn test_apply_create() {
        let store = MemoryStore::new();
        let mut annotation = Annotation::new(Uuid::new_v4(), rect(1));
        annotation.target.version = Some(1);

        let event = BroadcastEvent::CreateAnnotation { annotation: WireAnnotation::from(&annotation) };
        assert_eq!(apply(&store, event, &open_config()), ApplyOutcome::Dispatched);
        assert_eq!(store.get_annotation(annotation.id), Some(annotation));
    }

    #[test]
    fn test_apply_create_without_selector_discarded() {
        let store = MemoryStore::new();
        let annotation = Annotation::new(Uuid::new_v4(), Selector::default());

        let event = BroadcastEvent::CreateAnnotation { annotation: WireAnnotation::from(&annotation) };
        assert_eq!(apply(&store, event, &open_config()), ApplyOutcome::Discarded);
        assert!(store.is_empty());
    }

    #[test]
    fn test_apply_foreign_source_is_off_page() {
        let store = MemoryStore::new();
        let config = open_config().with_source("docA");
        let annotation = Annotation::new(Uuid::new_v4(), rect(1).with_source("docB"));

        let event = BroadcastEvent::CreateAnnotation { annotation: WireAnnotation::from(&annotation) };
        assert_eq!(apply(&store, event, &config), ApplyOutcome::OffPage { source: Some("docB".into()) });
        assert!(store.is_empty());
    }

    #[test]
    fn test_apply_matching_source() {
        let store = MemoryStore::new();
        let config = open_config().with_source("docA");
        let annotation = Annotation::new(Uuid::new_v4(), rect(1).with_source("docA"));

        let event = BroadcastEvent::CreateAnnotation { annotation: WireAnnotation::from(&annotation) };
        assert_eq!(apply(&store, event, &config), ApplyOutcome::Dispatched);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let store = MemoryStore::new();
        let annotation = Annotation::new(Uuid::new_v4(), rect(1));
        store.add_annotation(annotation.clone(), Origin::Remote);

        let mut moved = annotation.target.clone();
        moved.selector = rect(9);
        moved.version = Some(2);
        let update = BroadcastEvent::UpdateTarget { target: WireTarget::from(&moved) };

        apply(&store, update.clone(), &open_config());
        let once = store.all();
        apply(&store, update, &open_config());
        assert_eq!(store.all(), once);

        let delete = BroadcastEvent::DeleteAnnotation { id: annotation.id };
        apply(&store, delete.clone(), &open_config());
        apply(&store, delete, &open_config());
        assert!(store.is_empty());
    }

    #[test]
    fn test_apply_stale_target_discarded() {
        let store = MemoryStore::new();
        let mut annotation = Annotation::new(Uuid::new_v4(), rect(1));
        annotation.target.version = Some(3);
        store.add_annotation(annotation.clone(), Origin::Remote);

        let mut old = annotation.target.clone();
        old.selector = rect(0);
        old.version = Some(2);

        let event = BroadcastEvent::UpdateTarget { target: WireTarget::from(&old) };
        assert_eq!(apply(&store, event, &open_config()), ApplyOutcome::Discarded);
        assert_eq!(store.get_annotation(annotation.id).unwrap().target, annotation.target);
    }

    #[test]
    fn test_apply_body_events() {
        let store = MemoryStore::new();
        let annotation = Annotation::new(Uuid::new_v4(), rect(1));
        store.add_annotation(annotation.clone(), Origin::Remote);

        let mut body = Body::new(annotation.id, "first");
        body.version = Some(1);
        apply(&store, BroadcastEvent::CreateBody { body: (&body).into() }, &open_config());
        assert_eq!(store.get_body(body.id).unwrap().value.as_deref(), Some("first"));

        let mut edited = body.clone();
        edited.value = Some("second".into());
        edited.version = Some(2);
        apply(&store, BroadcastEvent::UpdateBody { body: (&edited).into() }, &open_config());
        assert_eq!(store.get_body(body.id).unwrap().value.as_deref(), Some("second"));

        let event = BroadcastEvent::DeleteBody { id: body.id, annotation: annotation.id };
        apply(&store, event, &open_config());
        assert!(store.get_body(body.id).is_none());
    }

    #[test]
    fn test_apply_change_source_is_noop() {
        let store = MemoryStore::new();
        assert_eq!(apply(&store, BroadcastEvent::ChangeSource, &open_config()), ApplyOutcome::Discarded);
    }

    #[test]
    fn test_affected_annotations_unique() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let events = vec![
            BroadcastEvent::DeleteBody { id: Uuid::new_v4(), annotation: a },
            BroadcastEvent::DeleteAnnotation { id: b },
            BroadcastEvent::DeleteBody { id: Uuid::new_v4(), annotation: a },
            BroadcastEvent::UpdateTarget { target: WireTarget::from(&Target::new(b, rect(1))) },
        ];
        assert_eq!(affected_annotations(&events), vec![a, b]);
    }
}
