//! Origin-tagged annotation store.
//!
//! Every mutation carries an [`Origin`]. Observers subscribe with an optional
//! origin filter, so the sync engine can listen to `Local` changes only and
//! never see its own remote-applied writes come back around.
//!
//! ```text
//! host UI ──(Local)──►┐
//!                     ├──► MemoryStore ──► ChangeSet ──► observers(Local)
//! sync engine ─(Remote)┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::change::{diff_annotations, merge_changes, ChangeSet};
use crate::{Annotation, Body, Target};

/// Who requested a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// The local user. Needs to be broadcast and persisted.
    Local,
    /// A sync channel. Already known to peers.
    Remote,
}

#[derive(Debug, Clone)]
pub struct StoreChangeEvent {
    pub origin: Origin,
    pub changes: ChangeSet,
}

pub type StoreObserver = Arc<dyn Fn(&StoreChangeEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Mutation and query API of the local annotation store.
///
/// Implementations must be idempotent: a mutation that leaves the state
/// unchanged (deleting a missing id, re-adding an existing annotation, an
/// identical update) reports no change.
pub trait AnnotationStore: Send + Sync {
    fn get_annotation(&self, id: Uuid) -> Option<Annotation>;
    fn get_body(&self, id: Uuid) -> Option<Body>;
    fn all(&self) -> Vec<Annotation>;

    fn add_annotation(&self, annotation: Annotation, origin: Origin);
    fn update_annotation(&self, annotation: Annotation, origin: Origin);
    fn delete_annotation(&self, id: Uuid, origin: Origin);
    /// Inserts many annotations at once. With `replace`, the existing
    /// contents are discarded first.
    fn bulk_add_annotations(&self, annotations: Vec<Annotation>, replace: bool, origin: Origin);

    fn add_body(&self, body: Body, origin: Origin);
    fn update_body(&self, body: Body, origin: Origin);
    fn delete_body(&self, annotation: Uuid, id: Uuid, origin: Origin);
    fn bulk_update_bodies(&self, bodies: Vec<Body>, origin: Origin);

    fn update_target(&self, target: Target, origin: Origin);
    fn bulk_update_targets(&self, targets: Vec<Target>, origin: Origin);

    /// Registers an observer. `None` observes every origin.
    fn observe(&self, origin: Option<Origin>, observer: StoreObserver) -> ObserverId;
    fn unobserve(&self, id: ObserverId);
}

#[derive(Default)]
struct StoreState {
    annotations: HashMap<Uuid, Annotation>,
    /// body id → annotation id
    body_index: HashMap<Uuid, Uuid>,
}

impl StoreState {
    fn insert(&mut self, annotation: Annotation) {
        for body in &annotation.bodies {
            self.body_index.insert(body.id, annotation.id);
        }
        self.annotations.insert(annotation.id, annotation);
    }

    fn remove(&mut self, id: Uuid) -> Option<Annotation> {
        let removed = self.annotations.remove(&id)?;
        for body in &removed.bodies {
            self.body_index.remove(&body.id);
        }
        Some(removed)
    }

    /// Replaces an annotation in place and returns the diff, if anything changed.
    fn replace(&mut self, next: Annotation) -> Option<ChangeSet> {
        let prev = self.annotations.get(&next.id)?;
        if *prev == next {
            return None;
        }
        let update = diff_annotations(prev, &next);
        for body in &update.bodies_deleted {
            self.body_index.remove(&body.id);
        }
        self.insert(next);
        Some(ChangeSet::updated(update))
    }

    fn modify(&mut self, id: Uuid, f: impl FnOnce(&mut Annotation)) -> Option<ChangeSet> {
        let mut next = self.annotations.get(&id)?.clone();
        f(&mut next);
        self.replace(next)
    }
}

struct ObserverEntry {
    id: ObserverId,
    origin: Option<Origin>,
    observer: StoreObserver,
}

/// In-memory [`AnnotationStore`].
pub struct MemoryStore {
    state: RwLock<StoreState>,
    observers: Mutex<Vec<ObserverEntry>>,
    next_observer: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.read(|s| s.annotations.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Runs a mutation under the write lock, then notifies observers with
    /// the lock released so they may call back into the store.
    fn mutate(&self, origin: Origin, f: impl FnOnce(&mut StoreState) -> Option<ChangeSet>) {
        let changes = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut state)
        };
        match changes {
            Some(changes) if !changes.is_empty() => self.notify(StoreChangeEvent { origin, changes }),
            _ => {}
        }
    }

    fn notify(&self, event: StoreChangeEvent) {
        let targets: Vec<StoreObserver> = {
            let observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
            observers
                .iter()
                .filter(|entry| entry.origin.map_or(true, |o| o == event.origin))
                .map(|entry| entry.observer.clone())
                .collect()
        };
        log::trace!("store change ({:?}): {} annotation(s), {} observer(s)", event.origin, event.changes.len(), targets.len());
        for observer in targets {
            observer(&event);
        }
    }
}

impl AnnotationStore for MemoryStore {
    fn get_annotation(&self, id: Uuid) -> Option<Annotation> {
        self.read(|s| s.annotations.get(&id).cloned())
    }

    fn get_body(&self, id: Uuid) -> Option<Body> {
        self.read(|s| {
            let annotation = s.body_index.get(&id)?;
            s.annotations.get(annotation)?.body(id).cloned()
        })
    }

    fn all(&self) -> Vec<Annotation> {
        self.read(|s| s.annotations.values().cloned().collect())
    }

    fn add_annotation(&self, annotation: Annotation, origin: Origin) {
        self.mutate(origin, |s| {
            if s.annotations.contains_key(&annotation.id) {
                log::debug!("annotation {} already present, add ignored", annotation.id);
                return None;
            }
            s.insert(annotation.clone());
            Some(ChangeSet::created(annotation))
        });
    }

    fn update_annotation(&self, annotation: Annotation, origin: Origin) {
        self.mutate(origin, |s| s.replace(annotation));
    }

    fn delete_annotation(&self, id: Uuid, origin: Origin) {
        self.mutate(origin, |s| s.remove(id).map(ChangeSet::deleted));
    }

    fn bulk_add_annotations(&self, annotations: Vec<Annotation>, replace: bool, origin: Origin) {
        self.mutate(origin, |s| {
            let mut removed: HashMap<Uuid, Annotation> = HashMap::new();
            if replace {
                let previous: Vec<Uuid> = s.annotations.keys().copied().collect();
                for id in previous {
                    if let Some(annotation) = s.remove(id) {
                        removed.insert(id, annotation);
                    }
                }
            }

            let mut changes = ChangeSet::default();
            for annotation in annotations {
                if s.annotations.contains_key(&annotation.id) {
                    continue;
                }
                s.insert(annotation.clone());
                match removed.remove(&annotation.id) {
                    Some(prev) if prev == annotation => {}
                    Some(prev) => changes.updated.push(diff_annotations(&prev, &annotation)),
                    None => changes.created.push(annotation),
                }
            }
            changes.deleted.extend(removed.into_values());
            Some(changes)
        });
    }

    fn add_body(&self, body: Body, origin: Origin) {
        self.mutate(origin, |s| {
            if s.body_index.contains_key(&body.id) {
                return None;
            }
            s.modify(body.annotation, |a| a.bodies.push(body))
        });
    }

    fn update_body(&self, body: Body, origin: Origin) {
        self.mutate(origin, |s| {
            let id = body.id;
            s.modify(body.annotation, |a| {
                if let Some(existing) = a.bodies.iter_mut().find(|b| b.id == id) {
                    *existing = body;
                }
            })
        });
    }

    fn delete_body(&self, annotation: Uuid, id: Uuid, origin: Origin) {
        self.mutate(origin, |s| s.modify(annotation, |a| a.bodies.retain(|b| b.id != id)));
    }

    fn bulk_update_bodies(&self, bodies: Vec<Body>, origin: Origin) {
        self.mutate(origin, |s| {
            let mut changes = ChangeSet::default();
            for body in bodies {
                let id = body.id;
                let updated = s.modify(body.annotation, |a| {
                    match a.bodies.iter_mut().find(|b| b.id == id) {
                        Some(existing) => *existing = body,
                        None => a.bodies.push(body),
                    }
                });
                if let Some(updated) = updated {
                    changes = merge_changes(changes, updated);
                }
            }
            Some(changes)
        });
    }

    fn update_target(&self, target: Target, origin: Origin) {
        self.mutate(origin, |s| s.modify(target.annotation, |a| a.target = target));
    }

    fn bulk_update_targets(&self, targets: Vec<Target>, origin: Origin) {
        self.mutate(origin, |s| {
            let mut changes = ChangeSet::default();
            for target in targets {
                if let Some(updated) = s.modify(target.annotation, |a| a.target = target) {
                    changes = merge_changes(changes, updated);
                }
            }
            Some(changes)
        });
    }

    fn observe(&self, origin: Option<Origin>, observer: StoreObserver) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ObserverEntry { id, origin, observer });
        id
    }

    fn unobserve(&self, id: ObserverId) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|entry| entry.id != id);
    }
}
