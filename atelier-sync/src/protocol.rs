//! Binary protocol for the collaboration channel.
//!
//! Wire format (bincode-encoded):
//! ```text
//! inbound   ┌───────┬────────┬───────┬───────────┬─────────┐
//!           │ event │ room?  │ actor │ timestamp │ payload │
//!           └───────┴────────┴───────┴───────────┴─────────┘
//! outbound  ┌──────────────┬────────┬─────────┐
//!           │ frame kind   │ room   │ payload │
//!           └──────────────┴────────┴─────────┘
//! ```
//!
//! Inbound frames carry one [`CollaborationEvent`] each; outbound frames
//! mirror the typed senders on the session plus room join/leave.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Registration key for the event router, one per [`CollaborationEvent`]
/// variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    ClientUpdate,
    ProjectUpdate,
    TimelineEvent,
    InvoiceCreated,
    UserTyping,
    UserPresence,
    CommentAdded,
    FileShared,
}

/// Coarse presence status attached to [`CollaborationEvent::UserPresence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// Who performed an action, with display metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Uuid,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl Actor {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }

    /// Create with explicit id (for testing)
    pub fn with_id(id: Uuid, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }
}

/// Server-pushed collaboration event.
///
/// Tagged union so the router gets compile-time exhaustiveness when
/// mapping variants to listener topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CollaborationEvent {
    /// A client record changed remotely.
    ClientUpdate { client_id: Uuid, payload: Vec<u8> },
    /// A project record changed remotely.
    ProjectUpdate { project_id: Uuid, payload: Vec<u8> },
    /// A timeline entry was appended to an entity.
    TimelineEvent { entity_id: Uuid, description: String },
    /// An invoice was created for a project.
    InvoiceCreated {
        invoice_id: Uuid,
        project_id: Uuid,
        payload: Vec<u8>,
    },
    /// Another user started or stopped typing in a context.
    UserTyping { context: String, active: bool },
    /// Another user's presence changed.
    UserPresence { status: PresenceStatus },
    /// A comment was added to an entity.
    CommentAdded { entity_id: Uuid, body: String },
    /// A file was shared into the room.
    FileShared {
        name: String,
        size_bytes: u64,
        file_ref: String,
    },
}

impl CollaborationEvent {
    /// Router registration key for this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ClientUpdate { .. } => EventKind::ClientUpdate,
            Self::ProjectUpdate { .. } => EventKind::ProjectUpdate,
            Self::TimelineEvent { .. } => EventKind::TimelineEvent,
            Self::InvoiceCreated { .. } => EventKind::InvoiceCreated,
            Self::UserTyping { .. } => EventKind::UserTyping,
            Self::UserPresence { .. } => EventKind::UserPresence,
            Self::CommentAdded { .. } => EventKind::CommentAdded,
            Self::FileShared { .. } => EventKind::FileShared,
        }
    }
}

/// Inbound frame from the collaboration service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub event: CollaborationEvent,
    /// Room the event is scoped to. `None` for session-wide events.
    pub room: Option<String>,
    pub actor: Actor,
    /// Server timestamp, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl ServerFrame {
    pub fn new(
        event: CollaborationEvent,
        room: Option<String>,
        actor: Actor,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            event,
            room,
            actor,
            timestamp_ms,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

/// Outbound frame to the collaboration service.
///
/// Mirrors the session's typed senders. These are transient signals and
/// are never queued durably; the session drops them with an explicit
/// "not connected" result when offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    JoinRoom {
        room: String,
    },
    LeaveRoom {
        room: String,
    },
    Typing {
        room: String,
        context: String,
        active: bool,
    },
    Presence {
        room: String,
        status: PresenceStatus,
    },
    Comment {
        room: String,
        entity_id: Uuid,
        body: String,
    },
    FileShare {
        room: String,
        name: String,
        size_bytes: u64,
        file_ref: String,
    },
}

impl ClientFrame {
    /// Room this frame targets.
    pub fn room(&self) -> &str {
        match self {
            Self::JoinRoom { room }
            | Self::LeaveRoom { room }
            | Self::Typing { room, .. }
            | Self::Presence { room, .. }
            | Self::Comment { room, .. }
            | Self::FileShare { room, .. } => room,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_frame_roundtrip() {
        let actor = Actor::new("Sarah");
        let frame = ServerFrame::new(
            CollaborationEvent::CommentAdded {
                entity_id: Uuid::new_v4(),
                body: "Looks good to me".to_string(),
            },
            Some("project:42".to_string()),
            actor.clone(),
            1_700_000_000_000,
        );

        let encoded = frame.encode().unwrap();
        let decoded = ServerFrame::decode(&encoded).unwrap();

        assert_eq!(decoded, frame);
        assert_eq!(decoded.actor.display_name, "Sarah");
        assert_eq!(decoded.event.kind(), EventKind::CommentAdded);
    }

    #[test]
    fn test_client_frame_roundtrip() {
        let frame = ClientFrame::Typing {
            room: "client:7".to_string(),
            context: "notes".to_string(),
            active: true,
        };

        let encoded = frame.encode().unwrap();
        let decoded = ClientFrame::decode(&encoded).unwrap();

        assert_eq!(decoded, frame);
        assert_eq!(decoded.room(), "client:7");
    }

    #[test]
    fn test_event_kind_mapping_exhaustive() {
        let id = Uuid::new_v4();
        let cases = [
            (
                CollaborationEvent::ClientUpdate {
                    client_id: id,
                    payload: vec![],
                },
                EventKind::ClientUpdate,
            ),
            (
                CollaborationEvent::ProjectUpdate {
                    project_id: id,
                    payload: vec![],
                },
                EventKind::ProjectUpdate,
            ),
            (
                CollaborationEvent::TimelineEvent {
                    entity_id: id,
                    description: String::new(),
                },
                EventKind::TimelineEvent,
            ),
            (
                CollaborationEvent::InvoiceCreated {
                    invoice_id: id,
                    project_id: id,
                    payload: vec![],
                },
                EventKind::InvoiceCreated,
            ),
            (
                CollaborationEvent::UserTyping {
                    context: String::new(),
                    active: false,
                },
                EventKind::UserTyping,
            ),
            (
                CollaborationEvent::UserPresence {
                    status: PresenceStatus::Away,
                },
                EventKind::UserPresence,
            ),
            (
                CollaborationEvent::CommentAdded {
                    entity_id: id,
                    body: String::new(),
                },
                EventKind::CommentAdded,
            ),
            (
                CollaborationEvent::FileShared {
                    name: String::new(),
                    size_bytes: 0,
                    file_ref: String::new(),
                },
                EventKind::FileShared,
            ),
        ];

        for (event, kind) in cases {
            assert_eq!(event.kind(), kind);
        }
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(ServerFrame::decode(&garbage).is_err());
        assert!(ClientFrame::decode(&garbage).is_err());
    }

    #[test]
    fn test_actor_with_id_stable() {
        let id = Uuid::new_v4();
        let actor = Actor::with_id(id, "Test");
        assert_eq!(actor.id, id);
        assert!(actor.avatar_ref.is_none());
    }

    #[test]
    fn test_client_frame_room_accessor() {
        let frames = [
            ClientFrame::JoinRoom {
                room: "r".to_string(),
            },
            ClientFrame::LeaveRoom {
                room: "r".to_string(),
            },
            ClientFrame::Presence {
                room: "r".to_string(),
                status: PresenceStatus::Online,
            },
            ClientFrame::FileShare {
                room: "r".to_string(),
                name: "brief.pdf".to_string(),
                size_bytes: 2048,
                file_ref: "files/abc".to_string(),
            },
        ];
        for frame in frames {
            assert_eq!(frame.room(), "r");
        }
    }
}
