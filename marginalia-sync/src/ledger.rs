//! Per-entity version high-water marks.
//!
//! Both channels may deliver the same logical change, in either order, and
//! the durable feed may redeliver on reconnect. A strict `incoming > held`
//! comparison is the single ordering and deduplication rule across both.
//!
//! Versions are unbounded `u64` counters owned by whichever peer writes the
//! entity. A recorded mark never decreases.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use marginalia_core::Annotation;
use uuid::Uuid;

/// A versioned entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKey {
    /// The target of the annotation with this id
    Target(Uuid),
    /// The body with this id
    Body(Uuid),
}

/// Version for the next write on top of `version`; entities start at 1.
pub fn bump(version: Option<u64>) -> u64 {
    version.map_or(1, |v| v + 1)
}

#[derive(Debug, Default)]
pub struct VersionLedger {
    versions: HashMap<EntityKey, u64>,
}

impl VersionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, key: EntityKey) -> Option<u64> {
        self.versions.get(&key).copied()
    }

    /// Highest version known for `key`, counting the store's `local` copy.
    pub fn held(&self, key: EntityKey, local: Option<u64>) -> Option<u64> {
        match (self.current(key), local) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// True if `incoming` is strictly newer than everything held for `key`.
    /// An unversioned event can never be ordered and is never newer.
    pub fn is_newer(&self, key: EntityKey, local: Option<u64>, incoming: Option<u64>) -> bool {
        match (incoming, self.held(key, local)) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(incoming), Some(held)) => incoming > held,
        }
    }

    /// Records an observed version and returns the resulting mark.
    pub fn observe(&mut self, key: EntityKey, version: u64) -> u64 {
        let mark = self.versions.entry(key).or_insert(version);
        if version > *mark {
            *mark = version;
        }
        *mark
    }

    /// Records all target and body versions of a loaded annotation.
    pub fn observe_annotation(&mut self, annotation: &Annotation) {
        if let Some(v) = annotation.target.version {
            self.observe(EntityKey::Target(annotation.id), v);
        }
        for body in &annotation.bodies {
            if let Some(v) = body.version {
                self.observe(EntityKey::Body(body.id), v);
            }
        }
    }

    /// Allocates the version for an outbound write and records it.
    pub fn next_version(&mut self, key: EntityKey, local: Option<u64>) -> u64 {
        let next = bump(self.held(key, local));
        self.observe(key, next)
    }

    pub fn forget(&mut self, key: EntityKey) {
        self.versions.remove(&key);
    }

    pub fn forget_annotation(&mut self, annotation: &Annotation) {
        self.forget(EntityKey::Target(annotation.id));
        for body in &annotation.bodies {
            self.forget(EntityKey::Body(body.id));
        }
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// Ledger shared by the durable sender and receiver of one session.
#[derive(Debug, Clone, Default)]
pub struct SharedLedger(Arc<Mutex<VersionLedger>>);

impl SharedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, VersionLedger> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
