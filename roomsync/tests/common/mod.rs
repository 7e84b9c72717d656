//! Minimal in-process relay for integration tests.
//!
//! Assigns each connection a client ID, tracks room membership, relays
//! `StateUpdate` / `CallFunction` to the other members of a room and
//! announces roommates joining and leaving. The last state value of a room
//! is replayed to clients that join later.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use roomsync::protocol::{Body, Message, MessageId};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;

enum RelayOut {
    Frame(String),
    Kick,
}

#[derive(Default)]
struct RelayState {
    next_client: AtomicU64,
    clients: Mutex<HashMap<String, mpsc::UnboundedSender<RelayOut>>>,
    members: Mutex<HashMap<String, HashSet<String>>>,
    values: Mutex<HashMap<String, Value>>,
    queries: Mutex<Vec<Option<String>>>,
}

pub struct TestRelay {
    pub url: String,
    state: Arc<RelayState>,
}

/// Find a free port for testing.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl TestRelay {
    /// Start a relay on a free port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(RelayState::default());

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _addr)) = listener.accept().await {
                tokio::spawn(handle_connection(stream, Arc::clone(&accept_state)));
            }
        });

        Self {
            url: format!("ws://127.0.0.1:{port}/rooms"),
            state,
        }
    }

    /// Drop every connection from the server side.
    pub fn kick_all(&self) {
        for tx in self.state.clients.lock().unwrap().values() {
            let _ = tx.send(RelayOut::Kick);
        }
    }

    pub fn client_count(&self) -> usize {
        self.state.clients.lock().unwrap().len()
    }

    pub fn member_count(&self, room_id: &str) -> usize {
        self.state
            .members
            .lock()
            .unwrap()
            .get(room_id)
            .map_or(0, HashSet::len)
    }

    /// Query strings of every accepted handshake, in order.
    pub fn queries(&self) -> Vec<Option<String>> {
        self.state.queries.lock().unwrap().clone()
    }

    /// Poll until `check` holds or two seconds pass.
    pub async fn wait_until(&self, check: impl Fn(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if check(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check(self)
    }
}

impl RelayState {
    fn send_to(&self, client_id: &str, message: &Message) {
        let Ok(frame) = message.encode() else { return };
        if let Some(tx) = self.clients.lock().unwrap().get(client_id) {
            let _ = tx.send(RelayOut::Frame(frame));
        }
    }

    /// Send to every member of `room_id` except `sender`.
    fn fan_out(&self, room_id: &str, sender: &str, message: &Message) {
        let targets: Vec<String> = self
            .members
            .lock()
            .unwrap()
            .get(room_id)
            .map(|m| m.iter().filter(|c| *c != sender).cloned().collect())
            .unwrap_or_default();
        for target in targets {
            self.send_to(&target, message);
        }
    }

    fn presence(&self, room_id: &str, client_id: &str, joined: bool) -> Message {
        let message_type = if joined {
            "RoommateSubscribed"
        } else {
            "RoommateUnsubscribed"
        };
        let raw = serde_json::json!({
            "MessageID": MessageId::random(),
            "MessageType": message_type,
            "MessageMS": now_ms(),
            "ClientID": client_id,
            "RoomID": room_id,
        });
        serde_json::from_value(raw).unwrap()
    }

    fn join(&self, room_id: &str, client_id: &str, seed: Option<Value>) {
        let fresh = self
            .members
            .lock()
            .unwrap()
            .entry(room_id.to_string())
            .or_default()
            .insert(client_id.to_string());
        if !fresh {
            return;
        }
        self.fan_out(room_id, client_id, &self.presence(room_id, client_id, true));

        let current = {
            let mut values = self.values.lock().unwrap();
            if let Some(current) = values.get(room_id) {
                Some(current.clone())
            } else {
                if let Some(seed) = seed {
                    values.insert(room_id.to_string(), seed);
                }
                None
            }
        };
        if let Some(current) = current {
            let mut replay = Message::state_update(room_id, current).with_id(MessageId::random());
            replay.server_ms = Some(now_ms());
            self.send_to(client_id, &replay);
        }
    }

    fn leave(&self, room_id: &str, client_id: &str) {
        let removed = self
            .members
            .lock()
            .unwrap()
            .get_mut(room_id)
            .is_some_and(|m| m.remove(client_id));
        if removed {
            self.fan_out(room_id, client_id, &self.presence(room_id, client_id, false));
        }
    }

    fn handle(&self, client_id: &str, mut message: Message) {
        let room_id = message.room_id.clone();
        match &message.body {
            Body::SubscribeState { seed } => self.join(&room_id, client_id, seed.clone()),
            Body::SubscribeFunction => self.join(&room_id, client_id, None),
            Body::UnsubscribeState | Body::UnsubscribeFunction => self.leave(&room_id, client_id),
            Body::StateUpdate { value } => {
                self.values
                    .lock()
                    .unwrap()
                    .insert(room_id.clone(), value.clone());
                message.client_id = Some(client_id.to_string());
                message.server_ms = Some(now_ms());
                self.fan_out(&room_id, client_id, &message);
            }
            Body::CallFunction { .. } => {
                message.client_id = Some(client_id.to_string());
                message.server_ms = Some(now_ms());
                self.fan_out(&room_id, client_id, &message);
            }
            _ => {}
        }
    }

    fn disconnect(&self, client_id: &str) {
        self.clients.lock().unwrap().remove(client_id);
        let rooms: Vec<String> = self
            .members
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m)| m.contains(client_id))
            .map(|(room, _)| room.clone())
            .collect();
        for room in rooms {
            self.leave(&room, client_id);
        }
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<RelayState>) {
    let record = Arc::clone(&state);
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let query = request.uri().query().map(str::to_string);
        record.queries.lock().unwrap().push(query);
        Ok(response)
    };
    let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let client_id = format!("client-{}", state.next_client.fetch_add(1, Ordering::SeqCst));
    let (tx, mut rx) = mpsc::unbounded_channel();
    state.clients.lock().unwrap().insert(client_id.clone(), tx);

    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(RelayOut::Frame(frame)) => {
                    if ws_sender.send(WsMessage::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Some(RelayOut::Kick) | None => {
                    let _ = ws_sender.close().await;
                    break;
                }
            },
            msg = ws_receiver.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Ok(message) = Message::decode(text.as_str()) {
                        state.handle(&client_id, message);
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.disconnect(&client_id);
}
