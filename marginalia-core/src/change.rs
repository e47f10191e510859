//! Structural change records produced by the store and merged by the batcher.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Annotation, Body, Target};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyUpdate {
    pub old_body: Body,
    pub new_body: Body,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetUpdate {
    pub old_target: Target,
    pub new_target: Target,
}

/// Diff between two snapshots of the same annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationUpdate {
    pub old_value: Annotation,
    pub new_value: Annotation,
    pub bodies_created: Vec<Body>,
    pub bodies_deleted: Vec<Body>,
    pub bodies_updated: Vec<BodyUpdate>,
    pub target_updated: Option<TargetUpdate>,
}

impl AnnotationUpdate {
    pub fn id(&self) -> Uuid {
        self.new_value.id
    }

    pub fn visibility_changed(&self) -> bool {
        self.old_value.visibility != self.new_value.visibility
    }

    pub fn is_noop(&self) -> bool {
        self.old_value == self.new_value
    }
}

/// Mergeable record of local mutations since the last flush.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub created: Vec<Annotation>,
    pub deleted: Vec<Annotation>,
    pub updated: Vec<AnnotationUpdate>,
}

impl ChangeSet {
    pub fn created(annotation: Annotation) -> Self {
        Self { created: vec![annotation], ..Default::default() }
    }

    pub fn deleted(annotation: Annotation) -> Self {
        Self { deleted: vec![annotation], ..Default::default() }
    }

    pub fn updated(update: AnnotationUpdate) -> Self {
        Self { updated: vec![update], ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.deleted.is_empty() && self.updated.is_empty()
    }

    /// Number of annotations touched.
    pub fn len(&self) -> usize {
        self.created.len() + self.deleted.len() + self.updated.len()
    }
}

pub fn diff_annotations(old: &Annotation, new: &Annotation) -> AnnotationUpdate {
    let bodies_created = new
        .bodies
        .iter()
        .filter(|b| old.body(b.id).is_none())
        .cloned()
        .collect();

    let bodies_deleted = old
        .bodies
        .iter()
        .filter(|b| new.body(b.id).is_none())
        .cloned()
        .collect();

    let bodies_updated = new
        .bodies
        .iter()
        .filter_map(|b| {
            old.body(b.id)
                .filter(|o| *o != b)
                .map(|o| BodyUpdate { old_body: o.clone(), new_body: b.clone() })
        })
        .collect();

    let target_updated = (old.target != new.target).then(|| TargetUpdate {
        old_target: old.target.clone(),
        new_target: new.target.clone(),
    });

    AnnotationUpdate {
        old_value: old.clone(),
        new_value: new.clone(),
        bodies_created,
        bodies_deleted,
        bodies_updated,
        target_updated,
    }
}

/// Folds `next` into `prev` as if both had been applied in sequence.
pub fn merge_changes(prev: ChangeSet, next: ChangeSet) -> ChangeSet {
    let ChangeSet { mut created, mut deleted, mut updated } = prev;

    for annotation in next.created {
        deleted.retain(|a| a.id != annotation.id);
        created.retain(|a| a.id != annotation.id);
        created.push(annotation);
    }

    for update in next.updated {
        let id = update.id();
        if let Some(existing) = created.iter_mut().find(|a| a.id == id) {
            *existing = update.new_value;
        } else if let Some(existing) = updated.iter_mut().find(|u| u.id() == id) {
            *existing = diff_annotations(&existing.old_value, &update.new_value);
        } else {
            updated.push(update);
        }
    }

    for annotation in next.deleted {
        let id = annotation.id;
        if created.iter().any(|a| a.id == id) {
            // Never left this peer: created and deleted within one batch
            created.retain(|a| a.id != id);
            continue;
        }
        updated.retain(|u| u.id() != id);
        if !deleted.iter().any(|a| a.id == id) {
            deleted.push(annotation);
        }
    }

    updated.retain(|u| !u.is_noop());

    ChangeSet { created, deleted, updated }
}
