//! Outbound half of the durable channel.
//!
//! Every write first stamps the local store (as [`Origin::Remote`], so the
//! stamp is not seen as a new local change) and then issues the durable
//! request. Failures never propagate; they are reported as
//! [`SyncEvent::SaveError`].

use marginalia_core::{Annotation, AnnotationUpdate, Body, ChangeSet, Origin, Visibility};

use super::rows::{parse_annotation_record, AnnotationRow, BodyRow, TargetRow};
use super::{DurableContext, DurableError, Table};
use crate::events::SyncEvent;
use crate::ledger::EntityKey;
use crate::privacy::PrivacyMirror;

#[derive(Clone)]
pub struct DurableSender {
    ctx: DurableContext,
    privacy: PrivacyMirror,
}

impl DurableSender {
    pub fn new(ctx: DurableContext, privacy: PrivacyMirror) -> Self {
        Self { ctx, privacy }
    }

    /// Loads every annotation of the configured layers into the store as a
    /// clean baseline.
    ///
    /// Only annotations on the configured document source reach the store;
    /// the returned list is unfiltered.
    pub async fn initial_load(&self) -> Result<Vec<Annotation>, DurableError> {
        let records = self.ctx.durable.load_annotations(self.ctx.config.layers.clone()).await?;

        for record in records.iter().filter(|r| r.targets.len() > 1) {
            self.ctx.integrity_error(format!("annotation {}: {} targets", record.id, record.targets.len()));
        }

        let annotations = records.iter().map(parse_annotation_record).collect::<Result<Vec<_>, _>>()?;

        {
            let mut ledger = self.ctx.ledger.lock();
            for annotation in &annotations {
                ledger.observe_annotation(annotation);
            }
        }

        let on_page: Vec<Annotation> = annotations
            .iter()
            .filter(|a| self.ctx.config.accepts_source(a.target.selector.source()))
            .cloned()
            .collect();

        log::info!("initial load: {} annotation(s), {} on this page", annotations.len(), on_page.len());
        self.ctx.store.bulk_add_annotations(on_page, true, Origin::Remote);

        Ok(annotations)
    }

    /// Writes one local change set, in order.
    pub async fn handle_changes(&self, changes: ChangeSet) {
        for annotation in changes.created {
            self.create(annotation).await;
        }
        for annotation in changes.deleted {
            self.delete(annotation).await;
        }
        for update in changes.updated {
            self.update(update).await;
        }
    }

    async fn create(&self, annotation: Annotation) {
        let current = self.ctx.store.get_annotation(annotation.id);
        let mut stamped = current.clone().unwrap_or(annotation);

        stamped.target.version = Some(stamped.target.version.unwrap_or(1));
        stamped.layer_id = self.ctx.config.default_layer_id();
        if self.privacy.get() {
            stamped.visibility = Visibility::Private;
        }
        if let Some(source) = &self.ctx.config.source {
            stamped.target.selector = stamped.target.selector.with_source(source);
        }

        if current.as_ref().is_some_and(|c| *c != stamped) {
            self.ctx.store.update_annotation(stamped.clone(), Origin::Remote);
        }
        if let Some(version) = stamped.target.version {
            self.ctx.ledger.lock().observe(EntityKey::Target(stamped.id), version);
        }

        let user = self.ctx.user.id;
        if let Err(e) = self.ctx.durable.insert_annotation(AnnotationRow::from_annotation(&stamped, user)).await {
            self.ctx.save_error("insert annotation", &e);
            return;
        }

        let target = TargetRow::from_target(&stamped.target, stamped.layer_id, user);
        if let Err(e) = self.ctx.durable.insert_target(target).await {
            self.ctx.save_error("insert target", &e);
        }
    }

    async fn delete(&self, annotation: Annotation) {
        self.ctx.ledger.lock().forget_annotation(&annotation);
        if let Err(e) = self.ctx.durable.archive(Table::Annotations, annotation.id).await {
            self.ctx.save_error("archive annotation", &e);
        }
    }

    async fn update(&self, update: AnnotationUpdate) {
        let id = update.id();
        let layer_id = update.new_value.layer_id.or_else(|| self.ctx.config.default_layer_id());

        if update.visibility_changed() {
            let private = update.new_value.is_private();
            if let Err(e) = self.ctx.durable.update_visibility(id, private).await {
                self.ctx.save_error("update visibility", &e);
            }
        }

        let upserts: Vec<Body> = update
            .bodies_created
            .iter()
            .cloned()
            .chain(update.bodies_updated.iter().map(|u| u.new_body.clone()))
            .collect();
        if !upserts.is_empty() {
            self.upsert_bodies(upserts, layer_id).await;
        }

        // Sequential: the store archives one record per call
        for body in &update.bodies_deleted {
            self.ctx.ledger.lock().forget(EntityKey::Body(body.id));
            if let Err(e) = self.ctx.durable.archive(Table::Bodies, body.id).await {
                self.ctx.save_error("archive body", &e);
                break;
            }
        }

        if update.target_updated.is_some() {
            self.update_target(id).await;
        }
    }

    async fn upsert_bodies(&self, bodies: Vec<Body>, layer_id: Option<uuid::Uuid>) {
        let versioned: Vec<Body> = {
            let mut ledger = self.ctx.ledger.lock();
            bodies
                .into_iter()
                .map(|body| {
                    let mut body = self.ctx.store.get_body(body.id).unwrap_or(body);
                    body.version = Some(ledger.next_version(EntityKey::Body(body.id), body.version));
                    body
                })
                .collect()
        };

        self.ctx.store.bulk_update_bodies(versioned.clone(), Origin::Remote);

        let user = self.ctx.user.id;
        let rows = versioned.iter().map(|b| BodyRow::from_body(b, layer_id, user)).collect();
        if let Err(e) = self.ctx.durable.upsert_bodies(rows).await {
            self.ctx.save_error("upsert bodies", &e);
        }
    }

    async fn update_target(&self, id: uuid::Uuid) {
        // An update racing a delete is dropped
        let Some(current) = self.ctx.store.get_annotation(id) else {
            log::debug!("target update for {id} dropped: annotation gone");
            return;
        };

        let mut target = current.target.clone();
        target.version = Some(self.ctx.ledger.lock().next_version(EntityKey::Target(id), target.version));
        self.ctx.store.update_target(target.clone(), Origin::Remote);

        let row = TargetRow::from_target(&target, current.layer_id, self.ctx.user.id);
        let durable = self.ctx.durable.clone();
        let result = self
            .ctx
            .config
            .retry
            .run("update target", || {
                let durable = durable.clone();
                let row = row.clone();
                async move {
                    match durable.update_target(row).await? {
                        0 => Err(DurableError::NoRowsAffected { table: Table::Targets }),
                        _ => Ok(()),
                    }
                }
            })
            .await;

        if let Err(e) = result {
            self.ctx.save_error("update target", &e);
        }
    }

    /// Reports the outcome of [`initial_load`](Self::initial_load) upward.
    pub async fn run_initial_load(&self) {
        match self.initial_load().await {
            Ok(annotations) => self.ctx.events.emit(SyncEvent::InitialLoad(annotations)),
            Err(e) => {
                log::error!("initial load failed: {e}");
                self.ctx.events.emit(SyncEvent::InitialLoadError(e.to_string()));
            }
        }
    }
}
