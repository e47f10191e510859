//! In-process [`DurableStore`] for tests, benchmarks and demos.
//!
//! Keeps the three tables in memory, soft-deletes through [`archive`], and
//! feeds every write back to change-feed subscribers the way the real store
//! would: filtered by layer, with rows of private annotations withheld.
//!
//! [`archive`]: DurableStore::archive

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures_util::future;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::rows::{
    AnnotationRecord, AnnotationRow, BodyRecord, BodyRow, ChangeEvent, ProfileRecord, RowChange, RowEvent,
    TargetRecord, TargetRow,
};
use super::{DurableError, DurableFuture, DurableStore, Table};
use crate::config::LayerFilter;

/// Operations that can be counted and made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DurableOp {
    Load,
    InsertAnnotation,
    InsertTarget,
    UpdateVisibility,
    UpsertBodies,
    UpdateTarget,
    Archive,
}

#[derive(Debug, Clone)]
struct Stored<T> {
    row: T,
    archived: bool,
}

impl<T> Stored<T> {
    fn live(row: T) -> Self {
        Self { row, archived: false }
    }
}

#[derive(Default)]
struct Tables {
    annotations: HashMap<Uuid, Stored<AnnotationRow>>,
    /// Duplicates allowed, to reproduce integrity problems
    targets: Vec<Stored<TargetRow>>,
    bodies: HashMap<Uuid, Stored<BodyRow>>,
    profiles: HashMap<Uuid, ProfileRecord>,
    subscribers: Vec<(LayerFilter, mpsc::UnboundedSender<ChangeEvent>)>,
    faults: HashMap<DurableOp, u32>,
    calls: HashMap<DurableOp, u32>,
}

impl Tables {
    fn check(&mut self, op: DurableOp) -> Result<(), DurableError> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.faults.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(DurableError::Request(format!("injected failure: {op:?}")))
            }
            _ => Ok(()),
        }
    }

    fn is_private(&self, annotation: Uuid) -> bool {
        self.annotations.get(&annotation).is_some_and(|a| a.row.is_private)
    }

    fn live_target_mut(&mut self, annotation: Uuid) -> Option<&mut TargetRow> {
        self.targets
            .iter_mut()
            .find(|t| !t.archived && t.row.annotation_id == annotation)
            .map(|t| &mut t.row)
    }

    fn profile(&self, id: Option<Uuid>) -> Option<ProfileRecord> {
        let id = id?;
        Some(self.profiles.get(&id).cloned().unwrap_or_else(|| ProfileRecord::new(id)))
    }

    /// Delivers `event` to subscribers of `layer` unless it concerns a
    /// private annotation.
    fn publish(&mut self, event: ChangeEvent, layer: Option<Uuid>, annotation: Uuid) {
        if self.is_private(annotation) {
            log::trace!("withholding {:?} on private annotation {annotation}", event.event_type());
            return;
        }
        self.subscribers.retain(|(_, tx)| !tx.is_closed());
        for (filter, tx) in &self.subscribers {
            if layer.is_some_and(|l| filter.contains(l)) {
                let _ = tx.send(event.clone());
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryDurableStore {
    tables: Mutex<Tables>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_profile(&self, profile: ProfileRecord) {
        self.tables().profiles.insert(profile.id, profile);
    }

    /// Inserts rows directly, without notifying the feed.
    pub fn seed(&self, annotation: AnnotationRow, targets: Vec<TargetRow>, bodies: Vec<BodyRow>) {
        let mut tables = self.tables();
        tables.annotations.insert(annotation.id, Stored::live(annotation));
        tables.targets.extend(targets.into_iter().map(Stored::live));
        for body in bodies {
            tables.bodies.insert(body.id, Stored::live(body));
        }
    }

    /// Makes the next `times` calls of `op` fail with a request error.
    pub fn fail_next(&self, op: DurableOp, times: u32) {
        self.tables().faults.insert(op, times);
    }

    /// Calls of `op` so far, failed ones included.
    pub fn calls(&self, op: DurableOp) -> u32 {
        self.tables().calls.get(&op).copied().unwrap_or(0)
    }

    /// Delivers a hand-built event to matching subscribers.
    pub fn push_change(&self, event: ChangeEvent) {
        let mut tables = self.tables();
        tables.subscribers.retain(|(_, tx)| !tx.is_closed());
        let layer = event.layer_id();
        for (filter, tx) in &tables.subscribers {
            if layer.map_or(true, |l| filter.contains(l)) {
                let _ = tx.send(event.clone());
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut tables = self.tables();
        tables.subscribers.retain(|(_, tx)| !tx.is_closed());
        tables.subscribers.len()
    }

    pub fn annotation(&self, id: Uuid) -> Option<AnnotationRow> {
        self.tables().annotations.get(&id).filter(|a| !a.archived).map(|a| a.row.clone())
    }

    pub fn target(&self, annotation: Uuid) -> Option<TargetRow> {
        self.tables().live_target_mut(annotation).map(|t| t.clone())
    }

    pub fn body(&self, id: Uuid) -> Option<BodyRow> {
        self.tables().bodies.get(&id).filter(|b| !b.archived).map(|b| b.row.clone())
    }

    pub fn is_archived(&self, table: Table, id: Uuid) -> bool {
        let tables = self.tables();
        match table {
            Table::Annotations => tables.annotations.get(&id).is_some_and(|a| a.archived),
            Table::Targets => tables.targets.iter().any(|t| t.row.annotation_id == id && t.archived),
            Table::Bodies => tables.bodies.get(&id).is_some_and(|b| b.archived),
        }
    }

    fn load(&self, layers: &LayerFilter) -> Result<Vec<AnnotationRecord>, DurableError> {
        let mut tables = self.tables();
        tables.check(DurableOp::Load)?;

        let tables = &*tables;
        let records = tables
            .annotations
            .values()
            .filter(|a| !a.archived && a.row.layer_id.is_some_and(|l| layers.contains(l)))
            .map(|a| {
                let id = a.row.id;
                let targets = tables
                    .targets
                    .iter()
                    .filter(|t| !t.archived && t.row.annotation_id == id)
                    .map(|t| TargetRecord {
                        annotation_id: id,
                        created_at: t.row.created_at,
                        created_by: tables.profile(t.row.created_by),
                        updated_at: t.row.updated_at,
                        updated_by: tables.profile(t.row.updated_by),
                        value: t.row.value.clone().unwrap_or_default(),
                        version: t.row.version,
                    })
                    .collect();
                let bodies = tables
                    .bodies
                    .values()
                    .filter(|b| !b.archived && b.row.annotation_id == id)
                    .map(|b| BodyRecord {
                        id: b.row.id,
                        annotation_id: id,
                        created_at: b.row.created_at,
                        created_by: tables.profile(b.row.created_by),
                        updated_at: b.row.updated_at,
                        updated_by: tables.profile(b.row.updated_by),
                        purpose: b.row.purpose.clone(),
                        format: b.row.format.clone(),
                        value: b.row.value.clone(),
                        version: b.row.version,
                    })
                    .collect();
                AnnotationRecord {
                    id,
                    targets,
                    bodies,
                    is_private: a.row.is_private,
                    layer_id: a.row.layer_id,
                }
            })
            .collect();
        Ok(records)
    }

    fn write_annotation(&self, row: AnnotationRow) -> Result<(), DurableError> {
        let mut tables = self.tables();
        tables.check(DurableOp::InsertAnnotation)?;
        if tables.annotations.contains_key(&row.id) {
            return Err(DurableError::Request(format!("duplicate key annotations.id={}", row.id)));
        }
        let (id, layer) = (row.id, row.layer_id);
        tables.annotations.insert(id, Stored::live(row.clone()));
        tables.publish(ChangeEvent::Annotation(RowEvent::new(RowChange::Insert, Some(row))), layer, id);
        Ok(())
    }

    fn write_target(&self, mut row: TargetRow) -> Result<(), DurableError> {
        let mut tables = self.tables();
        tables.check(DurableOp::InsertTarget)?;
        let annotation = row.annotation_id;
        if !tables.annotations.contains_key(&annotation) {
            return Err(DurableError::Request(format!("foreign key targets.annotation_id={annotation}")));
        }
        row.version = Some(row.version.unwrap_or(1));
        let layer = row.layer_id;
        tables.targets.push(Stored::live(row.clone()));
        tables.publish(ChangeEvent::Target(RowEvent::new(RowChange::Insert, Some(row))), layer, annotation);
        Ok(())
    }

    fn write_visibility(&self, id: Uuid, is_private: bool) -> Result<(), DurableError> {
        let mut tables = self.tables();
        tables.check(DurableOp::UpdateVisibility)?;
        let row = match tables.annotations.get_mut(&id).filter(|a| !a.archived) {
            Some(stored) => {
                stored.row.is_private = is_private;
                stored.row.clone()
            }
            None => return Err(DurableError::NoRowsAffected { table: Table::Annotations }),
        };
        let layer = row.layer_id;
        tables.publish(ChangeEvent::Annotation(RowEvent::new(RowChange::Update, Some(row))), layer, id);
        Ok(())
    }

    fn write_bodies(&self, rows: Vec<BodyRow>) -> Result<(), DurableError> {
        let mut tables = self.tables();
        tables.check(DurableOp::UpsertBodies)?;
        for row in rows {
            let change = match tables.bodies.get(&row.id) {
                Some(existing) if !existing.archived => RowChange::Update,
                _ => RowChange::Insert,
            };
            let (annotation, layer) = (row.annotation_id, row.layer_id);
            tables.bodies.insert(row.id, Stored::live(row.clone()));
            tables.publish(ChangeEvent::Body(RowEvent::new(change, Some(row))), layer, annotation);
        }
        Ok(())
    }

    fn write_target_update(&self, row: TargetRow) -> Result<u64, DurableError> {
        let mut tables = self.tables();
        tables.check(DurableOp::UpdateTarget)?;
        let annotation = row.annotation_id;
        let updated = match tables.live_target_mut(annotation) {
            Some(existing) => {
                existing.value = row.value;
                existing.updated_at = row.updated_at.or(Some(Utc::now()));
                existing.updated_by = row.updated_by;
                existing.version = row.version.or(existing.version.map(|v| v + 1));
                existing.clone()
            }
            None => return Ok(0),
        };
        let layer = updated.layer_id;
        tables.publish(ChangeEvent::Target(RowEvent::new(RowChange::Update, Some(updated))), layer, annotation);
        Ok(1)
    }

    fn write_archive(&self, table: Table, id: Uuid) -> Result<(), DurableError> {
        let mut tables = self.tables();
        tables.check(DurableOp::Archive)?;
        let located = match table {
            Table::Annotations => tables.annotations.get_mut(&id).map(|a| {
                a.archived = true;
                (a.row.layer_id, id)
            }),
            Table::Targets => {
                let mut located = None;
                for t in tables.targets.iter_mut().filter(|t| t.row.annotation_id == id) {
                    t.archived = true;
                    located = Some((t.row.layer_id, id));
                }
                located
            }
            Table::Bodies => tables.bodies.get_mut(&id).map(|b| {
                b.archived = true;
                (b.row.layer_id, b.row.annotation_id)
            }),
        };
        let Some((layer, annotation)) = located else {
            log::debug!("archive of unknown {table} record {id}");
            return Ok(());
        };
        let event = match table {
            Table::Annotations => ChangeEvent::Annotation(RowEvent::deleted(id)),
            Table::Targets => ChangeEvent::Target(RowEvent::deleted(id)),
            Table::Bodies => ChangeEvent::Body(RowEvent::deleted(id)),
        };
        // Archiving a private annotation is as invisible as the annotation
        tables.publish(event, layer, annotation);
        Ok(())
    }
}

impl DurableStore for MemoryDurableStore {
    fn load_annotations(&self, layers: LayerFilter) -> DurableFuture<'_, Vec<AnnotationRecord>> {
        Box::pin(future::ready(self.load(&layers)))
    }

    fn insert_annotation(&self, row: AnnotationRow) -> DurableFuture<'_, ()> {
        Box::pin(future::ready(self.write_annotation(row)))
    }

    fn insert_target(&self, row: TargetRow) -> DurableFuture<'_, ()> {
        Box::pin(future::ready(self.write_target(row)))
    }

    fn update_visibility(&self, annotation: Uuid, is_private: bool) -> DurableFuture<'_, ()> {
        Box::pin(future::ready(self.write_visibility(annotation, is_private)))
    }

    fn upsert_bodies(&self, rows: Vec<BodyRow>) -> DurableFuture<'_, ()> {
        Box::pin(future::ready(self.write_bodies(rows)))
    }

    fn update_target(&self, row: TargetRow) -> DurableFuture<'_, u64> {
        Box::pin(future::ready(self.write_target_update(row)))
    }

    fn archive(&self, table: Table, id: Uuid) -> DurableFuture<'_, ()> {
        Box::pin(future::ready(self.write_archive(table, id)))
    }

    fn subscribe_changes(&self, layers: LayerFilter) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tables().subscribers.push((layers, tx));
        rx
    }
}
