//! JSON wire protocol spoken with the room relay.
//!
//! One message per text frame, PascalCase keys:
//! ```text
//! {
//!   "MessageID":   "6f1c…",        client-assigned, used for dedup
//!   "MessageType": "StateUpdate",  selects which payload key is meaningful
//!   "MessageMS":   1718000000000,  server-assigned
//!   "ClientID":    "c-42",         server-assigned, absent on server broadcasts
//!   "RoomID":      "cursor",
//!   "Value":       {"x": 5, "y": 7}       StateUpdate / SubscribeState
//!   "Args":        [1, "two"]             CallFunction
//! }
//! ```
//!
//! Unknown `MessageType` strings decode to [`MessageType::Unknown`] so newer
//! relays can add message kinds without breaking older clients.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Room identifier. Rooms are plain names chosen by the application.
pub type RoomId = String;

/// Client-generated message identifier (a v4 UUID in string form).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Mint a fresh random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Message kinds understood by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    SubscribeState,
    SubscribeFunction,
    UnsubscribeState,
    UnsubscribeFunction,
    StateUpdate,
    CallFunction,
    RoommateSubscribed,
    RoommateUnsubscribed,
    /// Anything this client does not recognise.
    #[serde(other)]
    Unknown,
}

/// What a room subscription carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomKind {
    /// Shared value; traffic is `StateUpdate`.
    State,
    /// Shared callable; traffic is `CallFunction`.
    Function,
}

impl fmt::Display for RoomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomKind::State => f.write_str("state"),
            RoomKind::Function => f.write_str("function"),
        }
    }
}

/// Message payload, discriminated by [`MessageType`].
///
/// Holding the payload in the variant keeps "exactly one of Value/Args"
/// true by construction.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Join as a state consumer, optionally seeding the room.
    SubscribeState { seed: Option<Value> },
    SubscribeFunction,
    UnsubscribeState,
    UnsubscribeFunction,
    StateUpdate { value: Value },
    CallFunction { args: Vec<Value> },
    RoommateSubscribed,
    RoommateUnsubscribed,
    Unknown,
}

impl Body {
    pub fn message_type(&self) -> MessageType {
        match self {
            Body::SubscribeState { .. } => MessageType::SubscribeState,
            Body::SubscribeFunction => MessageType::SubscribeFunction,
            Body::UnsubscribeState => MessageType::UnsubscribeState,
            Body::UnsubscribeFunction => MessageType::UnsubscribeFunction,
            Body::StateUpdate { .. } => MessageType::StateUpdate,
            Body::CallFunction { .. } => MessageType::CallFunction,
            Body::RoommateSubscribed => MessageType::RoommateSubscribed,
            Body::RoommateUnsubscribed => MessageType::RoommateUnsubscribed,
            Body::Unknown => MessageType::Unknown,
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub struct Message {
    /// `None` until the session stamps it on emit.
    pub id: Option<MessageId>,
    /// Server timestamp in milliseconds. Never filled in locally.
    pub server_ms: Option<u64>,
    /// Sending client as assigned by the server; `None` for server broadcasts.
    pub client_id: Option<String>,
    pub room_id: RoomId,
    pub body: Body,
}

impl Message {
    fn new(room_id: impl Into<RoomId>, body: Body) -> Self {
        Self {
            id: None,
            server_ms: None,
            client_id: None,
            room_id: room_id.into(),
            body,
        }
    }

    /// Subscribe control message. The seed only travels on state rooms.
    pub fn subscribe(room_id: impl Into<RoomId>, kind: RoomKind, seed: Option<Value>) -> Self {
        let body = match kind {
            RoomKind::State => Body::SubscribeState { seed },
            RoomKind::Function => Body::SubscribeFunction,
        };
        Self::new(room_id, body)
    }

    pub fn unsubscribe(room_id: impl Into<RoomId>, kind: RoomKind) -> Self {
        let body = match kind {
            RoomKind::State => Body::UnsubscribeState,
            RoomKind::Function => Body::UnsubscribeFunction,
        };
        Self::new(room_id, body)
    }

    pub fn state_update(room_id: impl Into<RoomId>, value: Value) -> Self {
        Self::new(room_id, Body::StateUpdate { value })
    }

    pub fn call_function(room_id: impl Into<RoomId>, args: Vec<Value>) -> Self {
        Self::new(room_id, Body::CallFunction { args })
    }

    /// Builder used by relays and tests to mark the originating client.
    pub fn from_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// True when the relay itself (not a roommate) originated the message.
    pub fn is_from_server(&self) -> bool {
        self.client_id.is_none()
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse an inbound text frame.
    ///
    /// Inbound messages must carry a `MessageID`; without one they cannot be
    /// deduplicated.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let message: Message = serde_json::from_str(frame)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if message.id.is_none() {
            return Err(ProtocolError::MissingField("MessageID"));
        }
        Ok(message)
    }
}

/// Flat JSON shape of [`Message`].
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireMessage {
    #[serde(rename = "MessageID", default, skip_serializing_if = "Option::is_none")]
    message_id: Option<MessageId>,
    message_type: MessageType,
    #[serde(rename = "MessageMS", default, skip_serializing_if = "Option::is_none")]
    message_ms: Option<u64>,
    #[serde(rename = "ClientID", default, skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
    #[serde(rename = "RoomID")]
    room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Vec<Value>>,
}

impl TryFrom<WireMessage> for Message {
    type Error = ProtocolError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        if wire.room_id.is_empty() {
            return Err(ProtocolError::MissingField("RoomID"));
        }
        // An empty ClientID means the server sent it.
        let client_id = wire.client_id.filter(|id| !id.is_empty());

        let body = match wire.message_type {
            MessageType::SubscribeState => Body::SubscribeState { seed: wire.value },
            MessageType::SubscribeFunction => Body::SubscribeFunction,
            MessageType::UnsubscribeState => Body::UnsubscribeState,
            MessageType::UnsubscribeFunction => Body::UnsubscribeFunction,
            // JSON null and an absent Value are indistinguishable after decode.
            MessageType::StateUpdate => Body::StateUpdate {
                value: wire.value.unwrap_or(Value::Null),
            },
            MessageType::CallFunction => Body::CallFunction {
                args: wire.args.unwrap_or_default(),
            },
            MessageType::RoommateSubscribed | MessageType::RoommateUnsubscribed => {
                if client_id.is_none() {
                    return Err(ProtocolError::MissingField("ClientID"));
                }
                if wire.message_type == MessageType::RoommateSubscribed {
                    Body::RoommateSubscribed
                } else {
                    Body::RoommateUnsubscribed
                }
            }
            MessageType::Unknown => Body::Unknown,
        };

        Ok(Message {
            id: wire.message_id,
            server_ms: wire.message_ms,
            client_id,
            room_id: wire.room_id,
            body,
        })
    }
}

impl From<Message> for WireMessage {
    fn from(message: Message) -> Self {
        let message_type = message.message_type();
        let (value, args) = match message.body {
            Body::SubscribeState { seed } => (seed, None),
            Body::StateUpdate { value } => (Some(value), None),
            Body::CallFunction { args } => (None, Some(args)),
            _ => (None, None),
        };
        WireMessage {
            message_id: message.id,
            message_type,
            message_ms: message.server_ms,
            client_id: message.client_id,
            room_id: message.room_id,
            value,
            args,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_update_roundtrip() {
        let msg = Message::state_update("cursor", json!({"x": 1})).with_id("m-1");
        let encoded = msg.encode().unwrap();
        let decoded = Message::decode(&encoded).unwrap();

        assert_eq!(decoded, msg);
        assert_eq!(decoded.message_type(), MessageType::StateUpdate);
        assert_eq!(decoded.body, Body::StateUpdate { value: json!({"x": 1}) });
    }

    #[test]
    fn test_wire_keys_are_pascal_case() {
        let msg = Message::call_function("fx", vec![json!(1), json!("two")]).with_id("m-2");
        let wire: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();

        assert_eq!(wire["MessageID"], "m-2");
        assert_eq!(wire["MessageType"], "CallFunction");
        assert_eq!(wire["RoomID"], "fx");
        assert_eq!(wire["Args"], json!([1, "two"]));
        // Client never stamps server fields
        assert!(wire.get("MessageMS").is_none());
        assert!(wire.get("ClientID").is_none());
        assert!(wire.get("Value").is_none());
    }

    #[test]
    fn test_subscribe_carries_seed_only_for_state() {
        let state = Message::subscribe("cursor", RoomKind::State, Some(json!({"x": 0, "y": 0})));
        let wire: Value = serde_json::from_str(&state.encode().unwrap()).unwrap();
        assert_eq!(wire["MessageType"], "SubscribeState");
        assert_eq!(wire["Value"], json!({"x": 0, "y": 0}));

        let func = Message::subscribe("fx", RoomKind::Function, Some(json!(1)));
        assert_eq!(func.body, Body::SubscribeFunction);

        let bare = Message::subscribe("cursor", RoomKind::State, None);
        let wire: Value = serde_json::from_str(&bare.encode().unwrap()).unwrap();
        assert!(wire.get("Value").is_none());
    }

    #[test]
    fn test_unknown_type_decodes() {
        let frame = r#"{"MessageID":"m-3","MessageType":"Teleport","RoomID":"r","Value":7}"#;
        let decoded = Message::decode(frame).unwrap();
        assert_eq!(decoded.message_type(), MessageType::Unknown);
        assert_eq!(decoded.body, Body::Unknown);
    }

    #[test]
    fn test_server_fields_decode() {
        let frame = r#"{"MessageID":"m-4","MessageType":"StateUpdate","MessageMS":1700000000123,
                        "ClientID":"c-9","RoomID":"r","Value":[1,2]}"#;
        let decoded = Message::decode(frame).unwrap();
        assert_eq!(decoded.server_ms, Some(1_700_000_000_123));
        assert_eq!(decoded.client_id.as_deref(), Some("c-9"));
        assert!(!decoded.is_from_server());
    }

    #[test]
    fn test_empty_client_id_means_server() {
        let frame = r#"{"MessageID":"m-5","MessageType":"StateUpdate","ClientID":"","RoomID":"r","Value":1}"#;
        let decoded = Message::decode(frame).unwrap();
        assert!(decoded.client_id.is_none());
        assert!(decoded.is_from_server());
    }

    #[test]
    fn test_roommate_requires_client_id() {
        let ok = r#"{"MessageID":"m-6","MessageType":"RoommateSubscribed","ClientID":"c-1","RoomID":"r"}"#;
        assert_eq!(Message::decode(ok).unwrap().body, Body::RoommateSubscribed);

        let missing = r#"{"MessageID":"m-7","MessageType":"RoommateUnsubscribed","RoomID":"r"}"#;
        assert!(Message::decode(missing).is_err());
    }

    #[test]
    fn test_missing_payloads_are_lenient() {
        let update = r#"{"MessageID":"m-8","MessageType":"StateUpdate","RoomID":"r"}"#;
        assert_eq!(Message::decode(update).unwrap().body, Body::StateUpdate { value: Value::Null });

        let call = r#"{"MessageID":"m-9","MessageType":"CallFunction","RoomID":"r"}"#;
        assert_eq!(Message::decode(call).unwrap().body, Body::CallFunction { args: vec![] });
    }

    #[test]
    fn test_decode_requires_message_id() {
        let frame = r#"{"MessageType":"StateUpdate","RoomID":"r","Value":1}"#;
        assert_eq!(Message::decode(frame), Err(ProtocolError::MissingField("MessageID")));
    }

    #[test]
    fn test_decode_rejects_empty_room() {
        let frame = r#"{"MessageID":"m","MessageType":"StateUpdate","RoomID":"","Value":1}"#;
        assert!(Message::decode(frame).is_err());
    }

    #[test]
    fn test_decode_invalid_frames() {
        assert!(Message::decode("not json").is_err());
        assert!(Message::decode("[1,2,3]").is_err());
        assert!(Message::decode(r#"{"MessageID":"m"}"#).is_err());
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = MessageId::random();
        let b = MessageId::random();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_room_kind_control_types() {
        assert_eq!(
            Message::subscribe("r", RoomKind::Function, None).message_type(),
            MessageType::SubscribeFunction
        );
        assert_eq!(
            Message::unsubscribe("r", RoomKind::Function).message_type(),
            MessageType::UnsubscribeFunction
        );
    }
}
