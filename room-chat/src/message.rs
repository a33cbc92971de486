use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Inbound event after a frame has been decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Join { user_id: String, room_id: String },
    Leave { room_id: String, user_id: String },
    Chat { text: String, destination: String },
}

/// Envelope every client frame is wrapped in. `content` stays untyped until
/// `kind` tells us which payload to expect.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MembershipContent {
    pub user_id: String,
    pub room_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatContent {
    pub text: String,
    pub destination: String,
}

/// Which notification or event family a frame belongs to. Serializes to the
/// `type` strings used on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Join,
    Leave,
    Message,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Join => "join",
            EventKind::Leave => "leave",
            EventKind::Message => "message",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not a valid envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} payload has an empty {field}")]
    EmptyField {
        kind: EventKind,
        field: &'static str,
    },
    #[error("unknown frame type {0:?}")]
    UnknownType(String),
}

impl DecodeError {
    /// Unknown types are expected from newer clients and only worth a debug line.
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, DecodeError::UnknownType(_))
    }
}

/// Decodes one inbound frame.
///
/// The envelope is parsed first and the payload second, so a frame with a
/// valid `type` but a broken `content` is reported as a payload error for
/// that kind.
pub fn decode(frame: &[u8]) -> Result<Event, DecodeError> {
    let envelope: Envelope = serde_json::from_slice(frame).map_err(DecodeError::Envelope)?;

    match envelope.kind.as_str() {
        "join" => {
            let MembershipContent { user_id, room_id } =
                payload(EventKind::Join, envelope.content)?;
            require(EventKind::Join, "userId", &user_id)?;
            require(EventKind::Join, "roomId", &room_id)?;
            Ok(Event::Join { user_id, room_id })
        }
        "leave" => {
            let MembershipContent { user_id, room_id } =
                payload(EventKind::Leave, envelope.content)?;
            require(EventKind::Leave, "userId", &user_id)?;
            require(EventKind::Leave, "roomId", &room_id)?;
            Ok(Event::Leave { room_id, user_id })
        }
        "message" => {
            let ChatContent { text, destination } =
                payload(EventKind::Message, envelope.content)?;
            require(EventKind::Message, "destination", &destination)?;
            Ok(Event::Chat { text, destination })
        }
        _ => Err(DecodeError::UnknownType(envelope.kind)),
    }
}

fn payload<T: DeserializeOwned>(
    kind: EventKind,
    content: serde_json::Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(content).map_err(|source| DecodeError::Payload { kind, source })
}

fn require(kind: EventKind, field: &'static str, value: &str) -> Result<(), DecodeError> {
    if value.is_empty() {
        return Err(DecodeError::EmptyField { kind, field });
    }
    Ok(())
}

/// Outbound frame. `content` is a human-readable string, never structured.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub content: String,
}

impl Notification {
    pub fn joined(user_id: &str, room_id: &str) -> Self {
        Self {
            kind: EventKind::Join,
            content: format!("{user_id} joined room {room_id}"),
        }
    }

    pub fn left(user_id: &str, room_id: &str) -> Self {
        Self {
            kind: EventKind::Leave,
            content: format!("{user_id} left room {room_id}"),
        }
    }

    pub fn chat(text: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Message,
            content: text.into(),
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Client-side helpers for building the envelopes `decode` accepts.
pub mod outgoing {
    use serde_json::json;

    pub fn join(user_id: &str, room_id: &str) -> String {
        json!({ "type": "join", "content": { "userId": user_id, "roomId": room_id } }).to_string()
    }

    pub fn leave(user_id: &str, room_id: &str) -> String {
        json!({ "type": "leave", "content": { "userId": user_id, "roomId": room_id } }).to_string()
    }

    pub fn chat(text: &str, destination: &str) -> String {
        json!({ "type": "message", "content": { "text": text, "destination": destination } })
            .to_string()
    }
}
