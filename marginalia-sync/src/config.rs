//! Session configuration.

use std::future::Future;
use std::time::Duration;

use uuid::Uuid;

use crate::batcher::DEFAULT_DEBOUNCE;
use crate::durable::DurableError;

/// Default delay before a local selection change is published.
pub const DEFAULT_SELECTION_DELAY: Duration = Duration::from_millis(10);

/// Which layer(s) of the shared document this session syncs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerFilter {
    One(Uuid),
    Many(Vec<Uuid>),
}

impl LayerFilter {
    pub fn ids(&self) -> Vec<Uuid> {
        match self {
            Self::One(id) => vec![*id],
            Self::Many(ids) => ids.clone(),
        }
    }

    pub fn contains(&self, id: Uuid) -> bool {
        match self {
            Self::One(layer) => *layer == id,
            Self::Many(layers) => layers.contains(&id),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Many(ids) if ids.is_empty())
    }

    pub fn first(&self) -> Option<Uuid> {
        match self {
            Self::One(id) => Some(*id),
            Self::Many(ids) => ids.first().copied(),
        }
    }

    /// Server-side row filter for the change feed.
    pub fn to_filter_expr(&self) -> String {
        match self {
            Self::One(id) => format!("layer_id=eq.{id}"),
            Self::Many(ids) => {
                let joined = ids.iter().map(Uuid::to_string).collect::<Vec<_>>().join(", ");
                format!("layer_id=in.({joined})")
            }
        }
    }
}

impl From<Uuid> for LayerFilter {
    fn from(id: Uuid) -> Self {
        Self::One(id)
    }
}

impl From<Vec<Uuid>> for LayerFilter {
    fn from(ids: Vec<Uuid>) -> Self {
        if ids.len() == 1 {
            Self::One(ids[0])
        } else {
            Self::Many(ids)
        }
    }
}

/// Bounded retry for durable writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds or the attempts are used up.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, DurableError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DurableError>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => {
                    return Err(DurableError::RetriesExhausted {
                        attempts,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    log::warn!("{what} failed (attempt {attempt}/{attempts}): {e}");
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Ephemeral channel name shared by all peers of a document
    pub channel: String,
    pub layers: LayerFilter,
    /// Layer new annotations are written to; first of `layers` if unset
    pub default_layer: Option<Uuid>,
    /// Document source this session is viewing
    pub source: Option<String>,
    /// Older names of `source` still accepted on read
    pub source_aliases: Vec<String>,
    pub debounce: Duration,
    pub selection_delay: Duration,
    pub retry: RetryPolicy,
    /// Buffered events per subscriber
    pub event_capacity: usize,
}

impl SyncConfig {
    pub fn new(channel: impl Into<String>, layers: impl Into<LayerFilter>) -> Self {
        let layers = layers.into();
        if layers.is_empty() {
            log::warn!("no layers configured: nothing will load and the change feed matches no rows");
        }
        Self {
            channel: channel.into(),
            layers,
            default_layer: None,
            source: None,
            source_aliases: Vec::new(),
            debounce: DEFAULT_DEBOUNCE,
            selection_delay: DEFAULT_SELECTION_DELAY,
            retry: RetryPolicy::default(),
            event_capacity: 256,
        }
    }

    /// Short timers for tests.
    pub fn for_testing(layers: impl Into<LayerFilter>) -> Self {
        let mut config = Self::new(format!("test-{}", Uuid::new_v4()), layers);
        config.debounce = Duration::from_millis(20);
        config.selection_delay = Duration::from_millis(1);
        config.retry = RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(5),
        };
        config
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_source_alias(mut self, alias: impl Into<String>) -> Self {
        self.source_aliases.push(alias.into());
        self
    }

    pub fn with_default_layer(mut self, layer: Uuid) -> Self {
        self.default_layer = Some(layer);
        self
    }

    pub fn default_layer_id(&self) -> Option<Uuid> {
        self.default_layer.or_else(|| self.layers.first())
    }

    /// Whether content tagged with `tag` belongs on this session's page.
    /// Everything is accepted when no source is configured.
    pub fn accepts_source(&self, tag: Option<&str>) -> bool {
        match &self.source {
            None => true,
            Some(source) => match tag {
                Some(tag) => tag == source || self.source_aliases.iter().any(|a| a == tag),
                None => false,
            },
        }
    }
}
