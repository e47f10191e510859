//! # marginalia-core: annotation model and local store
//!
//! The canonical in-memory shape of annotations shared by every sync channel:
//!
//! ```text
//! Annotation ──► Target (exactly one, versioned selector)
//!      │
//!      └──► Body* (independently versioned content)
//! ```
//!
//! Mutations go through [`AnnotationStore`], tagged with an [`Origin`] so that
//! remote-applied changes never re-trigger outbound marshaling. Local mutations
//! are reported to observers as [`ChangeSet`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod change;
pub mod store;

pub use change::{diff_annotations, merge_changes, AnnotationUpdate, BodyUpdate, ChangeSet, TargetUpdate};
pub use store::{AnnotationStore, MemoryStore, ObserverId, Origin, StoreChangeEvent, StoreObserver};

/// Display identity of a contributor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl User {
    pub fn new(id: Uuid) -> Self {
        Self { id, name: None, avatar: None }
    }

    pub fn named(id: Uuid, name: impl Into<String>) -> Self {
        Self { id, name: Some(name.into()), avatar: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Visibility {
    #[default]
    #[serde(rename = "DEFAULT")]
    Default,
    #[serde(rename = "PRIVATE")]
    Private,
}

impl Visibility {
    pub fn is_private(&self) -> bool {
        matches!(self, Visibility::Private)
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Visibility::Default)
    }
}

/// Opaque anchor payload of a [`Target`].
///
/// Selectors are JSON values owned by the annotation frontend. The engine only
/// ever looks at the optional `source` tag that identifies the document or page
/// the anchor belongs to.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Selector(pub Value);

impl Selector {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// True when the selector carries no anchor at all.
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::String(s) => s.is_empty(),
            _ => false,
        }
    }

    /// The document-source tag embedded in this selector, if any.
    pub fn source(&self) -> Option<&str> {
        match &self.0 {
            Value::Object(map) => map.get("source").and_then(Value::as_str),
            Value::Array(items) => items
                .iter()
                .find_map(|item| item.get("source").and_then(Value::as_str)),
            _ => None,
        }
    }

    /// Returns this selector with `source` injected.
    ///
    /// Array selectors get the tag on every element so any element can be
    /// read back on its own.
    pub fn with_source(mut self, source: &str) -> Self {
        match &mut self.0 {
            Value::Object(map) => {
                map.insert("source".to_string(), Value::String(source.to_string()));
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    if let Value::Object(map) = item {
                        map.insert("source".to_string(), Value::String(source.to_string()));
                    }
                }
            }
            _ => {}
        }
        self
    }

    /// Wraps a legacy single text-quote selector into a one-element array.
    pub fn normalize_legacy(self) -> Self {
        match self.0 {
            Value::Object(map) if map.contains_key("quote") => {
                Self(Value::Array(vec![Value::Object(map)]))
            }
            other => Self(other),
        }
    }

    pub fn to_json_string(&self) -> String {
        self.0.to_string()
    }

    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw).map(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub annotation: Uuid,
    pub selector: Selector,
    pub creator: Option<User>,
    pub created: Option<DateTime<Utc>>,
    pub updated_by: Option<User>,
    pub updated: Option<DateTime<Utc>>,
    pub version: Option<u64>,
}

impl Target {
    pub fn new(annotation: Uuid, selector: Selector) -> Self {
        Self {
            annotation,
            selector,
            creator: None,
            created: None,
            updated_by: None,
            updated: None,
            version: None,
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    pub id: Uuid,
    pub annotation: Uuid,
    pub purpose: Option<String>,
    pub format: Option<String>,
    pub value: Option<String>,
    pub creator: Option<User>,
    pub created: Option<DateTime<Utc>>,
    pub updated_by: Option<User>,
    pub updated: Option<DateTime<Utc>>,
    pub version: Option<u64>,
}

impl Body {
    pub fn new(annotation: Uuid, value: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            annotation,
            purpose: None,
            format: None,
            value: Some(value.into()),
            creator: None,
            created: None,
            updated_by: None,
            updated: None,
            version: None,
        }
    }

    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = Some(purpose.into());
        self
    }
}

/// A markup record: one [`Target`], any number of [`Body`] records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: Uuid,
    pub target: Target,
    pub bodies: Vec<Body>,
    pub layer_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Visibility::is_default")]
    pub visibility: Visibility,
}

impl Annotation {
    pub fn new(id: Uuid, selector: Selector) -> Self {
        Self {
            id,
            target: Target::new(id, selector),
            bodies: Vec::new(),
            layer_id: None,
            visibility: Visibility::Default,
        }
    }

    pub fn is_private(&self) -> bool {
        self.visibility.is_private()
    }

    pub fn body(&self, id: Uuid) -> Option<&Body> {
        self.bodies.iter().find(|b| b.id == id)
    }

    /// Distinct users who created or updated the target or any body.
    pub fn contributors(&self) -> Vec<User> {
        let candidates = [&self.target.creator, &self.target.updated_by]
            .into_iter()
            .chain(self.bodies.iter().flat_map(|b| [&b.creator, &b.updated_by]))
            .flatten();

        let mut users: Vec<User> = Vec::new();
        for user in candidates {
            if !users.iter().any(|u| u.id == user.id) {
                users.push(user.clone());
            }
        }
        users
    }
}
