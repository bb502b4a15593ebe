//! Wire-format events exchanged with clients and between server processes.
//!
//! Every socket frame carries exactly one JSON-encoded [`Event`]. Events that
//! cross the broker are wrapped in a [`RelayMessage`] so receivers can tell
//! which process published them.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sender name stamped on server-generated error events.
pub const SERVER_SENDER: &str = "SERVER";

/// Sender name stamped on membership notices.
pub const SYSTEM_SENDER: &str = "System";

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// The closed set of event kinds understood on the wire.
///
/// Unrecognized names are preserved in [`EventType::Unknown`] instead of
/// failing the whole frame, so the hub can answer with a dispatch error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    CreateRoom,
    JoinRoom,
    LeaveRoom,
    SendMessage,
    MessageReceived,
    UserJoined,
    UserLeft,
    Error,
    Unknown(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::CreateRoom => "create_room",
            Self::JoinRoom => "join_room",
            Self::LeaveRoom => "leave_room",
            Self::SendMessage => "send_message",
            Self::MessageReceived => "message_received",
            Self::UserJoined => "user_joined",
            Self::UserLeft => "user_left",
            Self::Error => "error",
            Self::Unknown(name) => name,
        }
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "create_room" => Self::CreateRoom,
            "join_room" => Self::JoinRoom,
            "leave_room" => Self::LeaveRoom,
            "send_message" => Self::SendMessage,
            "message_received" => Self::MessageReceived,
            "user_joined" => Self::UserJoined,
            "user_left" => Self::UserLeft,
            "error" => Self::Error,
            _ => Self::Unknown(name),
        }
    }
}

impl From<EventType> for String {
    fn from(kind: EventType) -> Self {
        match kind {
            EventType::Unknown(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Message payload
// ---------------------------------------------------------------------------

/// Chat payload carried by every event.
///
/// Fields default to empty so that partial client payloads such as
/// `{"room_id": "X", "content": "hi"}` decode cleanly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub content: String,
    pub room_id: String,
    /// RFC3339 timestamp.
    pub time: String,
}

impl Message {
    /// Build a server-side message with a fresh id and the current time.
    pub fn new(
        sender: impl Into<String>,
        content: impl Into<String>,
        room_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            content: content.into(),
            room_id: room_id.into(),
            time: chrono::Utc::now().to_rfc3339(),
        }
    }
}

// ---------------------------------------------------------------------------
// Event envelope
// ---------------------------------------------------------------------------

/// A single frame on the client socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default)]
    pub payload: Message,
}

impl Event {
    pub fn new(kind: EventType, payload: Message) -> Self {
        Self { kind, payload }
    }

    /// Build an `error` event addressed to a single connection.
    pub fn error(content: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self::new(EventType::Error, Message::new(SERVER_SENDER, content, room_id))
    }

    pub fn room_id(&self) -> &str {
        &self.payload.room_id
    }
}

// ---------------------------------------------------------------------------
// Broker envelope
// ---------------------------------------------------------------------------

/// An event as published on the broker, tagged with its origin process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub event: Event,
    pub room_id: String,
    pub server_id: String,
}

impl RelayMessage {
    pub fn new(event: Event, server_id: impl Into<String>) -> Self {
        Self {
            room_id: event.payload.room_id.clone(),
            event,
            server_id: server_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_new_stamps_id_and_time() {
        let a = Message::new("alice", "hi", "R1");
        let b = Message::new("alice", "hi", "R1");

        assert_ne!(a.id, b.id);
        assert!(Uuid::parse_str(&a.id).is_ok());
        assert!(chrono::DateTime::parse_from_rfc3339(&a.time).is_ok());
        assert_eq!(a.room_id, "R1");
    }

    #[test]
    fn decodes_partial_client_payload() {
        let raw = r#"{"type":"send_message","payload":{"room_id":"ABCDE","content":"hi"}}"#;
        let event: Event = serde_json::from_str(raw).unwrap();

        assert_eq!(event.kind, EventType::SendMessage);
        assert_eq!(event.room_id(), "ABCDE");
        assert_eq!(event.payload.content, "hi");
        assert!(event.payload.id.is_empty());
    }

    #[test]
    fn unknown_type_is_preserved_not_rejected() {
        let raw = r#"{"type":"typing","payload":{"room_id":"R"}}"#;
        let event: Event = serde_json::from_str(raw).unwrap();

        assert_eq!(event.kind, EventType::Unknown("typing".to_string()));
        assert_eq!(event.kind.as_str(), "typing");
    }

    #[test]
    fn event_type_serializes_snake_case() {
        let event = Event::new(EventType::MessageReceived, Message::new("a", "b", "c"));
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "message_received");
        assert_eq!(value["payload"]["sender"], "a");
    }

    #[test]
    fn error_event_is_sent_by_server() {
        let event = Event::error("boom", "R1");
        assert_eq!(event.kind, EventType::Error);
        assert_eq!(event.payload.sender, SERVER_SENDER);
        assert_eq!(event.payload.content, "boom");
    }

    #[test]
    fn relay_message_copies_room_id() {
        let event = Event::new(EventType::UserJoined, Message::new("bob", "joined", "X"));
        let relay = RelayMessage::new(event, "srv_a");

        assert_eq!(relay.room_id, "X");
        let json = serde_json::to_string(&relay).unwrap();
        let back: RelayMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.server_id, "srv_a");
        assert_eq!(back.event.kind, EventType::UserJoined);
    }
}
