//! Shared harness: editors on one in-process channel and one in-memory
//! durable store.

#![allow(dead_code)]

use std::sync::Arc;

use marginalia_core::{Annotation, AnnotationStore, MemoryStore, Origin, Selector, User};
use marginalia_sync::{LocalChannel, MemoryDurableStore, SyncConfig, SyncEvent, SyncSession};
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(2);

pub struct World {
    pub layer: Uuid,
    pub channel: Arc<LocalChannel>,
    pub durable: Arc<MemoryDurableStore>,
}

pub struct Editor {
    pub session: SyncSession,
    pub store: Arc<MemoryStore>,
    pub events: broadcast::Receiver<SyncEvent>,
    pub user: User,
    /// Everything the initial load reported
    pub loaded: Vec<Annotation>,
}

impl World {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            layer: Uuid::new_v4(),
            channel: Arc::new(LocalChannel::new("doc", 256)),
            durable: Arc::new(MemoryDurableStore::new()),
        }
    }

    pub fn config(&self) -> SyncConfig {
        SyncConfig::for_testing(self.layer)
    }

    /// Connects an editor and waits for its initial load.
    pub async fn join(&self, name: &str) -> Editor {
        self.join_with(name, self.config()).await
    }

    pub async fn join_on(&self, name: &str, source: &str) -> Editor {
        self.join_with(name, self.config().with_source(source)).await
    }

    pub async fn join_with(&self, name: &str, config: SyncConfig) -> Editor {
        let user = User::named(Uuid::new_v4(), name);
        let store = Arc::new(MemoryStore::new());
        let mut session = SyncSession::new(
            config,
            user.clone(),
            store.clone(),
            self.channel.clone(),
            self.durable.clone(),
        );
        let mut events = session.subscribe();
        session.connect().await.unwrap();
        let loaded = match expect_event(&mut events, |e| matches!(e, SyncEvent::InitialLoad(_))).await {
            SyncEvent::InitialLoad(loaded) => loaded,
            _ => unreachable!(),
        };
        Editor { session, store, events, user, loaded }
    }
}

impl Editor {
    /// Creates an annotation as a local edit.
    pub fn create(&self, x: i64) -> Annotation {
        let annotation = Annotation::new(Uuid::new_v4(), Selector::new(json!({ "type": "RECTANGLE", "x": x })));
        self.store.add_annotation(annotation.clone(), Origin::Local);
        annotation
    }

    /// Applies `edit` to the current copy of `id` as a local edit.
    pub fn edit(&self, id: Uuid, edit: impl FnOnce(&mut Annotation)) -> Annotation {
        let mut annotation = self.store.get_annotation(id).expect("annotation present");
        edit(&mut annotation);
        self.store.update_annotation(annotation.clone(), Origin::Local);
        annotation
    }
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !cond() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Lets the background tasks run for a while.
pub async fn settle() {
    sleep(Duration::from_millis(100)).await;
}

pub async fn expect_event(
    events: &mut broadcast::Receiver<SyncEvent>,
    mut pred: impl FnMut(&SyncEvent) -> bool,
) -> SyncEvent {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("expected event not received")
}
