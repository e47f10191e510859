//! Row shapes of the store of record and their crosswalk to the model.
//!
//! Two families of records:
//!
//! - nested *records* returned by the initial load, with profiles joined in;
//! - flat *rows* written by the sender and carried by the change feed, with
//!   user references as bare ids.

use chrono::{DateTime, Utc};
use marginalia_core::{Annotation, Body, Selector, Target, User, Visibility};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::DurableError;

// ───────────────────────────────────────────────────────────────────
// Load records
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl ProfileRecord {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            email: None,
            nickname: None,
            first_name: None,
            last_name: None,
            avatar_url: None,
        }
    }

    /// Nickname, else full name, else whichever name part is known.
    pub fn display_name(&self) -> Option<String> {
        if let Some(nickname) = self.nickname.as_ref().filter(|n| !n.is_empty()) {
            return Some(nickname.clone());
        }
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (Some(name), None) | (None, Some(name)) => Some(name.clone()),
            (None, None) => None,
        }
    }

    pub fn to_user(&self) -> User {
        User {
            id: self.id,
            name: self.display_name(),
            avatar: self.avatar_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub annotation_id: Uuid,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<ProfileRecord>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_by: Option<ProfileRecord>,
    /// Selector as a JSON string
    pub value: String,
    #[serde(default)]
    pub version: Option<u64>,
}

impl TargetRecord {
    pub fn to_target(&self) -> Result<Target, DurableError> {
        Ok(Target {
            annotation: self.annotation_id,
            selector: parse_selector(self.annotation_id, &self.value)?,
            creator: self.created_by.as_ref().map(ProfileRecord::to_user),
            created: self.created_at,
            updated_by: self.updated_by.as_ref().map(ProfileRecord::to_user),
            updated: self.updated_at,
            version: self.version,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyRecord {
    pub id: Uuid,
    pub annotation_id: Uuid,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<ProfileRecord>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_by: Option<ProfileRecord>,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub version: Option<u64>,
}

impl BodyRecord {
    pub fn to_body(&self) -> Body {
        Body {
            id: self.id,
            annotation: self.annotation_id,
            purpose: self.purpose.clone(),
            format: self.format.clone(),
            value: self.value.clone(),
            creator: self.created_by.as_ref().map(ProfileRecord::to_user),
            created: self.created_at,
            updated_by: self.updated_by.as_ref().map(ProfileRecord::to_user),
            updated: self.updated_at,
            version: self.version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub id: Uuid,
    #[serde(default)]
    pub targets: Vec<TargetRecord>,
    #[serde(default)]
    pub bodies: Vec<BodyRecord>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub layer_id: Option<Uuid>,
}

fn parse_selector(annotation: Uuid, raw: &str) -> Result<Selector, DurableError> {
    Selector::from_json_str(raw)
        .map(Selector::normalize_legacy)
        .map_err(|e| DurableError::Integrity(format!("annotation {annotation}: unparsable selector: {e}")))
}

/// Converts a loaded record into an [`Annotation`].
///
/// A record without a target cannot be represented and fails; extra targets
/// are ignored after the first.
pub fn parse_annotation_record(record: &AnnotationRecord) -> Result<Annotation, DurableError> {
    let target = match record.targets.as_slice() {
        [] => {
            return Err(DurableError::Integrity(format!("annotation {}: target missing", record.id)));
        }
        [first, rest @ ..] => {
            if !rest.is_empty() {
                log::warn!("annotation {}: {} targets, using the first", record.id, record.targets.len());
            }
            first.to_target()?
        }
    };

    Ok(Annotation {
        id: record.id,
        target,
        bodies: record.bodies.iter().map(BodyRecord::to_body).collect(),
        layer_id: record.layer_id,
        visibility: if record.is_private { Visibility::Private } else { Visibility::Default },
    })
}

// ───────────────────────────────────────────────────────────────────
// Write and feed rows
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRow {
    pub id: Uuid,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<Uuid>,
    #[serde(default)]
    pub layer_id: Option<Uuid>,
    #[serde(default)]
    pub is_private: bool,
}

impl AnnotationRow {
    pub fn from_annotation(annotation: &Annotation, user: Uuid) -> Self {
        Self {
            id: annotation.id,
            created_at: Some(Utc::now()),
            created_by: Some(user),
            layer_id: annotation.layer_id,
            is_private: annotation.is_private(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRow {
    pub annotation_id: Uuid,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<Uuid>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_by: Option<Uuid>,
    /// Selector as a JSON string
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub layer_id: Option<Uuid>,
    #[serde(default)]
    pub version: Option<u64>,
}

impl TargetRow {
    /// Row written for `target` by `user`.
    pub fn from_target(target: &Target, layer_id: Option<Uuid>, user: Uuid) -> Self {
        Self {
            annotation_id: target.annotation,
            created_at: target.created,
            created_by: Some(target.creator.as_ref().map_or(user, |u| u.id)),
            updated_at: target.updated.or(target.created),
            updated_by: Some(user),
            value: Some(target.selector.to_json_string()),
            layer_id,
            version: target.version,
        }
    }

    /// Whether the row carries a usable selector.
    pub fn has_selector(&self) -> bool {
        self.value.as_deref().is_some_and(|v| !v.trim().is_empty() && v != "null")
    }

    /// Converts a feed row into a [`Target`], resolving user ids with `resolve`.
    pub fn to_target(&self, resolve: impl Fn(Uuid) -> User) -> Result<Target, DurableError> {
        let selector = match &self.value {
            Some(raw) => parse_selector(self.annotation_id, raw)?,
            None => Selector::default(),
        };
        Ok(Target {
            annotation: self.annotation_id,
            selector,
            creator: self.created_by.map(&resolve),
            created: self.created_at,
            updated_by: self.updated_by.map(&resolve),
            updated: self.updated_at,
            version: self.version,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyRow {
    pub id: Uuid,
    pub annotation_id: Uuid,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<Uuid>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_by: Option<Uuid>,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub layer_id: Option<Uuid>,
    #[serde(default)]
    pub version: Option<u64>,
}

impl BodyRow {
    pub fn from_body(body: &Body, layer_id: Option<Uuid>, user: Uuid) -> Self {
        Self {
            id: body.id,
            annotation_id: body.annotation,
            created_at: body.created,
            created_by: Some(body.creator.as_ref().map_or(user, |u| u.id)),
            updated_at: body.updated.or(body.created),
            updated_by: Some(user),
            purpose: body.purpose.clone(),
            format: body.format.clone(),
            value: body.value.clone(),
            layer_id,
            version: body.version,
        }
    }

    pub fn to_body(&self, resolve: impl Fn(Uuid) -> User) -> Body {
        Body {
            id: self.id,
            annotation: self.annotation_id,
            purpose: self.purpose.clone(),
            format: self.format.clone(),
            value: self.value.clone(),
            creator: self.created_by.map(&resolve),
            created: self.created_at,
            updated_by: self.updated_by.map(&resolve),
            updated: self.updated_at,
            version: self.version,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Change feed
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowChange {
    Insert,
    Update,
    Delete,
}

/// Primary key image of a changed row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OldRow {
    #[serde(default)]
    pub id: Option<Uuid>,
}

/// One row change on one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
pub struct RowEvent<T> {
    #[serde(rename = "eventType")]
    pub event_type: RowChange,
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub old: OldRow,
    /// Empty on deletes
    #[serde(default, deserialize_with = "non_empty")]
    pub new: Option<T>,
}

impl<T> RowEvent<T> {
    pub fn new(event_type: RowChange, new: Option<T>) -> Self {
        Self {
            event_type,
            commit_timestamp: Some(Utc::now()),
            old: OldRow::default(),
            new,
        }
    }

    pub fn deleted(id: Uuid) -> Self {
        Self {
            event_type: RowChange::Delete,
            commit_timestamp: Some(Utc::now()),
            old: OldRow { id: Some(id) },
            new: None,
        }
    }
}

/// The feed sends `{}` for a missing row image.
fn non_empty<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) if map.is_empty() => Ok(None),
        Some(value) => serde_json::from_value(value).map(Some).map_err(D::Error::custom),
    }
}

/// A change-feed message, tagged by table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table")]
pub enum ChangeEvent {
    #[serde(rename = "annotations")]
    Annotation(RowEvent<AnnotationRow>),
    #[serde(rename = "targets")]
    Target(RowEvent<TargetRow>),
    #[serde(rename = "bodies")]
    Body(RowEvent<BodyRow>),
}

impl ChangeEvent {
    pub fn event_type(&self) -> RowChange {
        match self {
            Self::Annotation(e) => e.event_type,
            Self::Target(e) => e.event_type,
            Self::Body(e) => e.event_type,
        }
    }

    /// Layer of the new row image, if any.
    pub fn layer_id(&self) -> Option<Uuid> {
        match self {
            Self::Annotation(e) => e.new.as_ref().and_then(|r| r.layer_id),
            Self::Target(e) => e.new.as_ref().and_then(|r| r.layer_id),
            Self::Body(e) => e.new.as_ref().and_then(|r| r.layer_id),
        }
    }

    /// Annotation the changed row belongs to, when the row image says so.
    pub fn annotation_id(&self) -> Option<Uuid> {
        match self {
            Self::Annotation(e) => e.new.as_ref().map(|r| r.id).or(e.old.id),
            Self::Target(e) => e.new.as_ref().map(|r| r.annotation_id),
            Self::Body(e) => e.new.as_ref().map(|r| r.annotation_id),
        }
    }
}
