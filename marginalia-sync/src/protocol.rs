//! Wire protocol for the ephemeral broadcast channel.
//!
//! Two layers:
//! ```text
//! ┌──────────┬──────────────┬──────────────────────────────────┐
//! │ topic    │ presence_key │ payload                          │
//! │ 1 byte   │ string       │ JSON BroadcastMessage/SelectEvent│
//! └──────────┴──────────────┴──────────────────────────────────┘
//!   ChannelFrame (bincode)
//! ```
//!
//! The frame is a compact binary envelope; payloads stay JSON so that peers
//! running different versions can still read each other's events, including
//! string timestamps and opaque selectors.
//!
//! Event tags are stable and must never be reused:
//!
//! | Tag | Event |
//! |-----|-------|
//! | `CRTANN` | create annotation |
//! | `DELANN` | delete annotation |
//! | `CRTBDY` | create body |
//! | `DELBDY` | delete body |
//! | `UPTBDY` | update body |
//! | `UPTTGT` | update target |
//! | `CHGSRC` | peer changed document source |

use chrono::{DateTime, Utc};
use marginalia_core::{Annotation, Body, Selector, Target, User, Visibility};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Frame topics on the ephemeral channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Topic {
    /// Batched annotation changes
    Change = 1,
    /// Selection updates
    Select = 2,
}

/// A connected peer as seen on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    #[serde(rename = "presenceKey")]
    pub presence_key: String,
    #[serde(flatten)]
    pub user: User,
}

impl Peer {
    pub fn new(presence_key: impl Into<String>, user: User) -> Self {
        Self { presence_key: presence_key.into(), user }
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire records
// ───────────────────────────────────────────────────────────────────

fn format_timestamp(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339())
}

/// Parses an RFC 3339 wire timestamp. Garbage becomes `None`.
pub fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            log::debug!("dropping unparsable timestamp {raw:?}: {e}");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTarget {
    pub annotation: Uuid,
    #[serde(default)]
    pub selector: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, rename = "updatedBy", skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl From<&Target> for WireTarget {
    fn from(target: &Target) -> Self {
        Self {
            annotation: target.annotation,
            selector: target.selector.0.clone(),
            creator: target.creator.clone(),
            created: format_timestamp(&target.created),
            updated_by: target.updated_by.clone(),
            updated: format_timestamp(&target.updated),
            version: target.version,
        }
    }
}

impl WireTarget {
    pub fn revive(self) -> Target {
        Target {
            annotation: self.annotation,
            selector: Selector(self.selector),
            creator: self.creator,
            created: parse_timestamp(self.created.as_deref()),
            updated_by: self.updated_by,
            updated: parse_timestamp(self.updated.as_deref()),
            version: self.version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireBody {
    pub id: Uuid,
    pub annotation: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, rename = "updatedBy", skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl From<&Body> for WireBody {
    fn from(body: &Body) -> Self {
        Self {
            id: body.id,
            annotation: body.annotation,
            purpose: body.purpose.clone(),
            format: body.format.clone(),
            value: body.value.clone(),
            creator: body.creator.clone(),
            created: format_timestamp(&body.created),
            updated_by: body.updated_by.clone(),
            updated: format_timestamp(&body.updated),
            version: body.version,
        }
    }
}

impl WireBody {
    pub fn revive(self) -> Body {
        Body {
            id: self.id,
            annotation: self.annotation,
            purpose: self.purpose,
            format: self.format,
            value: self.value,
            creator: self.creator,
            created: parse_timestamp(self.created.as_deref()),
            updated_by: self.updated_by,
            updated: parse_timestamp(self.updated.as_deref()),
            version: self.version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireAnnotation {
    pub id: Uuid,
    pub target: WireTarget,
    #[serde(default)]
    pub bodies: Vec<WireBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Visibility::is_default")]
    pub visibility: Visibility,
}

impl From<&Annotation> for WireAnnotation {
    fn from(annotation: &Annotation) -> Self {
        Self {
            id: annotation.id,
            target: WireTarget::from(&annotation.target),
            bodies: annotation.bodies.iter().map(WireBody::from).collect(),
            layer_id: annotation.layer_id,
            visibility: annotation.visibility,
        }
    }
}

impl WireAnnotation {
    pub fn revive(self) -> Annotation {
        Annotation {
            id: self.id,
            target: self.target.revive(),
            bodies: self.bodies.into_iter().map(WireBody::revive).collect(),
            layer_id: self.layer_id,
            visibility: self.visibility,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Events
// ───────────────────────────────────────────────────────────────────

/// One remotely reproducible mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BroadcastEvent {
    #[serde(rename = "CRTANN")]
    CreateAnnotation { annotation: WireAnnotation },
    #[serde(rename = "DELANN")]
    DeleteAnnotation { id: Uuid },
    #[serde(rename = "CRTBDY")]
    CreateBody { body: WireBody },
    #[serde(rename = "DELBDY")]
    DeleteBody { id: Uuid, annotation: Uuid },
    #[serde(rename = "UPTBDY")]
    UpdateBody { body: WireBody },
    #[serde(rename = "UPTTGT")]
    UpdateTarget { target: WireTarget },
    #[serde(rename = "CHGSRC")]
    ChangeSource,
}

impl BroadcastEvent {
    /// The annotation whose state this event touches, if it survives the event.
    pub fn touched_annotation(&self) -> Option<Uuid> {
        match self {
            Self::CreateAnnotation { annotation } => Some(annotation.id),
            Self::CreateBody { body } | Self::UpdateBody { body } => Some(body.annotation),
            Self::DeleteBody { annotation, .. } => Some(*annotation),
            Self::UpdateTarget { target } => Some(target.annotation),
            Self::DeleteAnnotation { .. } | Self::ChangeSource => None,
        }
    }
}

/// A batch of events from one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub from: Peer,
    pub events: Vec<BroadcastEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl BroadcastMessage {
    /// Document source the sending peer is working on.
    ///
    /// Older peers do not set `source` on the message; for those the tag
    /// embedded in the first created annotation's selector is used.
    pub fn activity_source(&self) -> Option<String> {
        self.source.clone().or_else(|| {
            self.events.iter().find_map(|event| match event {
                BroadcastEvent::CreateAnnotation { annotation } => {
                    Selector(annotation.target.selector.clone()).source().map(String::from)
                }
                _ => None,
            })
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Selection update. `ids: None` clears the selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectEvent {
    pub from: Peer,
    pub ids: Option<Vec<Uuid>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl SelectEvent {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

// ───────────────────────────────────────────────────────────────────
// Envelope
// ───────────────────────────────────────────────────────────────────

/// Binary envelope carried by the ephemeral channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFrame {
    pub topic: Topic,
    pub presence_key: String,
    pub payload: Vec<u8>,
}

impl ChannelFrame {
    pub fn change(message: &BroadcastMessage) -> Result<Self, ProtocolError> {
        Ok(Self {
            topic: Topic::Change,
            presence_key: message.from.presence_key.clone(),
            payload: message.encode()?,
        })
    }

    pub fn select(event: &SelectEvent) -> Result<Self, ProtocolError> {
        Ok(Self {
            topic: Topic::Select,
            presence_key: event.from.presence_key.clone(),
            payload: event.encode()?,
        })
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }

    pub fn change_message(&self) -> Result<BroadcastMessage, ProtocolError> {
        if self.topic != Topic::Change {
            return Err(ProtocolError::UnexpectedTopic(self.topic));
        }
        BroadcastMessage::decode(&self.payload)
    }

    pub fn select_event(&self) -> Result<SelectEvent, ProtocolError> {
        if self.topic != Topic::Select {
            return Err(ProtocolError::UnexpectedTopic(self.topic));
        }
        SelectEvent::decode(&self.payload)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unexpected topic: {0:?}")]
    UnexpectedTopic(Topic),
}
