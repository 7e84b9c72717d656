//! Events published by a [`Session`](crate::Session).

use std::fmt;
use std::time::Duration;

use serde_json::Value;

use crate::protocol::{Message, RoomId, RoomKind};

/// Lifecycle and diagnostic events for the host application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Transport reached `Open`. `endpoint` excludes pre-connect query params.
    SocketOpened { endpoint: String },
    SocketClosed,
    /// Transport or connect failure. Does not by itself trigger a reconnect.
    SocketError { error: String },
    MessageEmitted(Message),
    MessageReceived(Message),
    DeserializationError { frame: String, error: String },
    DuplicateMessageReceived(Message),
    /// An outbound message waited too long for the connection and was discarded.
    MessageDropped { message: Message, waited: Duration },
    RoomCollisionPrevented { room_id: RoomId, kind: RoomKind },
    RoomSubscribed { room_id: RoomId, kind: RoomKind },
    RoomUnsubscribed { room_id: RoomId, kind: RoomKind },
    RoommateSubscribed { room_id: RoomId, client_id: String },
    RoommateUnsubscribed { room_id: RoomId, client_id: String },
}

/// Discriminant of [`SessionEvent`], used as the public bus topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SocketOpened,
    SocketClosed,
    SocketError,
    MessageEmitted,
    MessageReceived,
    DeserializationError,
    DuplicateMessageReceived,
    MessageDropped,
    RoomCollisionPrevented,
    RoomSubscribed,
    RoomUnsubscribed,
    RoommateSubscribed,
    RoommateUnsubscribed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::SocketOpened => "SocketOpened",
            EventKind::SocketClosed => "SocketClosed",
            EventKind::SocketError => "SocketError",
            EventKind::MessageEmitted => "MessageEmitted",
            EventKind::MessageReceived => "MessageReceived",
            EventKind::DeserializationError => "DeserializationError",
            EventKind::DuplicateMessageReceived => "DuplicateMessageReceived",
            EventKind::MessageDropped => "MessageDropped",
            EventKind::RoomCollisionPrevented => "RoomCollisionPrevented",
            EventKind::RoomSubscribed => "RoomSubscribed",
            EventKind::RoomUnsubscribed => "RoomUnsubscribed",
            EventKind::RoommateSubscribed => "RoommateSubscribed",
            EventKind::RoommateUnsubscribed => "RoommateUnsubscribed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::SocketOpened { .. } => EventKind::SocketOpened,
            SessionEvent::SocketClosed => EventKind::SocketClosed,
            SessionEvent::SocketError { .. } => EventKind::SocketError,
            SessionEvent::MessageEmitted(_) => EventKind::MessageEmitted,
            SessionEvent::MessageReceived(_) => EventKind::MessageReceived,
            SessionEvent::DeserializationError { .. } => EventKind::DeserializationError,
            SessionEvent::DuplicateMessageReceived(_) => EventKind::DuplicateMessageReceived,
            SessionEvent::MessageDropped { .. } => EventKind::MessageDropped,
            SessionEvent::RoomCollisionPrevented { .. } => EventKind::RoomCollisionPrevented,
            SessionEvent::RoomSubscribed { .. } => EventKind::RoomSubscribed,
            SessionEvent::RoomUnsubscribed { .. } => EventKind::RoomUnsubscribed,
            SessionEvent::RoommateSubscribed { .. } => EventKind::RoommateSubscribed,
            SessionEvent::RoommateUnsubscribed { .. } => EventKind::RoommateUnsubscribed,
        }
    }

    /// Room the event concerns, if any.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            SessionEvent::MessageEmitted(m)
            | SessionEvent::MessageReceived(m)
            | SessionEvent::DuplicateMessageReceived(m)
            | SessionEvent::MessageDropped { message: m, .. } => Some(&m.room_id),
            SessionEvent::RoomCollisionPrevented { room_id, .. }
            | SessionEvent::RoomSubscribed { room_id, .. }
            | SessionEvent::RoomUnsubscribed { room_id, .. }
            | SessionEvent::RoommateSubscribed { room_id, .. }
            | SessionEvent::RoommateUnsubscribed { room_id, .. } => Some(room_id),
            _ => None,
        }
    }

    /// True for events that report something going wrong.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            SessionEvent::SocketError { .. }
                | SessionEvent::DeserializationError { .. }
                | SessionEvent::MessageDropped { .. }
        )
    }
}

/// Payload routed over the internal bus to a room's binding.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomDelivery {
    State(Value),
    Call(Vec<Value>),
}

/// Internal bus topic for state traffic in `room_id`.
pub fn state_topic(room_id: &str) -> String {
    format!("state:{room_id}")
}

/// Internal bus topic for function calls in `room_id`.
pub fn function_topic(room_id: &str) -> String {
    format!("function:{room_id}")
}
