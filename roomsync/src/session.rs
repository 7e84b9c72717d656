//! The session: one relay connection shared by every room binding.
//!
//! Provides:
//! - Connection lifecycle (connect, fixed-delay reconnect, close)
//! - The single outbound path ([`Session::emit`]) with bounded buffering
//!   while the connection is down
//! - Inbound decode, dedup and routing to room listeners
//! - Room subscriptions with collision prevention, replayed after every
//!   reconnect because the relay forgets membership when a socket drops
//!
//! ```text
//!  SharedState / SharedFunction
//!        │ subscribe_to_room / emit            ▲ on_state / on_call
//!        ▼                                     │
//!  ┌──────────────┐   frames    ┌──────────┐   │ internal bus
//!  │   Session    │ ──────────► │ Transport│   │
//!  │ registry     │ ◄────────── │ (ws)     │ ──┘ decode → dedup → route
//!  │ dedup, state │             └──────────┘
//!  └──────┬───────┘
//!         ▼ public bus + broadcast channel
//!   host application (SessionEvent)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use crate::bus::{EventBus, ListenerId, ANY_TOPIC};
use crate::config::{ConfigError, SessionConfig};
use crate::dedup::DedupSet;
use crate::events::{function_topic, state_topic, EventKind, RoomDelivery, SessionEvent};
use crate::protocol::{Body, Message, MessageId, ProtocolError, RoomId, RoomKind};
use crate::registry::{RegistryError, RoomRegistry};
use crate::transport::{ConnectionState, Connector, Transport, TransportError, WsConnector};

/// How long `close()` waits for the closing handshake before aborting.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("message {message_id} dropped after waiting {waited:?} for the connection to open")]
    BufferTimeout { message_id: MessageId, waited: Duration },
    #[error("room value does not serialize: {0}")]
    Value(#[from] serde_json::Error),
}

enum Outbound {
    Frame(String),
    Close,
}

/// Writer handle of the live connection.
struct Outgoing {
    generation: u64,
    tx: mpsc::UnboundedSender<Outbound>,
}

#[derive(Default)]
struct Tasks {
    supervisor: Option<JoinHandle<()>>,
    truncator: Option<JoinHandle<()>>,
}

struct Shared {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    state_tx: watch::Sender<ConnectionState>,
    /// Bumped by every `connect()`/`close()`; tasks from older generations
    /// go quiet instead of touching state.
    generation: AtomicU64,
    outgoing: Mutex<Option<Outgoing>>,
    /// Held while the connection turns `Open` and replays the registry, and
    /// while a room operation decides whether to send its control message.
    /// One room never gets two subscribes on the same connection.
    sweep: Mutex<()>,
    dedup: Mutex<DedupSet>,
    registry: RoomRegistry,
    public: EventBus<SessionEvent>,
    internal: EventBus<RoomDelivery>,
    events_tx: broadcast::Sender<SessionEvent>,
    tasks: Mutex<Tasks>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a relay session. Cheap to clone; clones share the connection.
///
/// Dropping the last handle aborts the connection and reconnect tasks
/// without a closing handshake; call [`close`](Session::close) first for a
/// clean shutdown.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    _last: Arc<LastHandle>,
}

/// Dropped with the last `Session` clone. Background tasks only hold
/// `Arc<Shared>`, so they never keep this alive.
struct LastHandle(Weak<Shared>);

impl Drop for LastHandle {
    fn drop(&mut self) {
        if let Some(shared) = self.0.upgrade() {
            shared.abort_tasks();
        }
    }
}

impl Session {
    /// Create a WebSocket session. Nothing is opened until [`connect`](Self::connect).
    pub fn new(config: SessionConfig) -> Result<Self, ConfigError> {
        Self::with_connector(config, WsConnector)
    }

    /// Create a session over a custom transport.
    pub fn with_connector(
        config: SessionConfig,
        connector: impl Connector,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        let (events_tx, _) = broadcast::channel(config.event_capacity);
        let shared = Arc::new(Shared {
            config,
            connector: Arc::new(connector),
            state_tx,
            generation: AtomicU64::new(0),
            outgoing: Mutex::new(None),
            sweep: Mutex::new(()),
            dedup: Mutex::new(DedupSet::new()),
            registry: RoomRegistry::new(),
            public: EventBus::new(),
            internal: EventBus::new(),
            events_tx,
            tasks: Mutex::new(Tasks::default()),
        });
        Ok(Self {
            _last: Arc::new(LastHandle(Arc::downgrade(&shared))),
            shared,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    // ─── Connection lifecycle ────────────────────────────────────────

    /// Start (or restart) the connection.
    ///
    /// Any live connection is detached first, so it cannot publish a close
    /// or schedule a reconnect of its own, and its socket is dropped without
    /// a closing handshake. Returns immediately; watch
    /// [`state`](Self::state) or the `SocketOpened` event. Must be called
    /// from within a tokio runtime.
    pub fn connect(&self) {
        let shared = &self.shared;
        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(previous) = lock(&shared.outgoing).take() {
            log::debug!("dropping connection generation {}", previous.generation);
        }

        let mut tasks = lock(&shared.tasks);
        if let Some(old) = tasks.supervisor.take() {
            old.abort();
        }
        tasks.supervisor = Some(tokio::spawn(supervise(Arc::clone(shared), generation)));
        if tasks.truncator.is_none() {
            tasks.truncator = Some(tokio::spawn(truncate_dedup(
                Arc::downgrade(shared),
                shared.config.dedup_truncate_interval(),
            )));
        }
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Room subscriptions are kept; a later [`connect`](Self::connect)
    /// resubscribes them.
    pub async fn close(&self) {
        let shared = &self.shared;
        shared.generation.fetch_add(1, Ordering::SeqCst);
        let (supervisor, truncator) = {
            let mut tasks = lock(&shared.tasks);
            (tasks.supervisor.take(), tasks.truncator.take())
        };
        if let Some(truncator) = truncator {
            truncator.abort();
        }

        let was_open = shared.state().is_open();
        let outgoing = lock(&shared.outgoing).take();
        if let Some(mut supervisor) = supervisor {
            match outgoing {
                Some(outgoing) if was_open => {
                    shared.set_state(ConnectionState::Closing);
                    let _ = outgoing.tx.send(Outbound::Close);
                    if tokio::time::timeout(CLOSE_GRACE, &mut supervisor).await.is_err() {
                        log::warn!("closing handshake timed out, aborting connection task");
                        supervisor.abort();
                    }
                }
                _ => supervisor.abort(),
            }
        }

        shared.set_state(ConnectionState::Closed);
        if was_open {
            shared.publish(SessionEvent::SocketClosed);
        }
        log::info!("session closed");
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Watch connection state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Wait until the connection is `Open`. Returns `false` on timeout.
    pub async fn wait_until_open(&self, timeout: Duration) -> bool {
        let mut state = self.shared.state_tx.subscribe();
        tokio::time::timeout(timeout, state.wait_for(ConnectionState::is_open))
            .await
            .is_ok_and(|opened| opened.is_ok())
    }

    // ─── Outbound ────────────────────────────────────────────────────

    /// Send a message to the relay.
    ///
    /// A missing ID is filled in and remembered so an echo of it is ignored.
    /// While the connection is not `Open` the call waits for it, up to
    /// `max_buffer_ms`; after that the message is dropped, `MessageDropped`
    /// is published and [`SessionError::BufferTimeout`] returned. Messages
    /// waiting concurrently are not ordered relative to each other.
    pub async fn emit(&self, message: Message) -> Result<MessageId, SessionError> {
        let shared = &self.shared;
        let (message, id) = shared.stamp(message);
        let frame = message.encode()?;
        if shared.try_send(&message, &frame) {
            return Ok(id);
        }

        let max_wait = shared.config.max_buffer();
        log::debug!(
            "buffering {:?} for room {} until the connection opens",
            message.message_type(),
            message.room_id
        );
        let started = Instant::now();
        let deadline = started + max_wait;
        let mut state = shared.state_tx.subscribe();
        loop {
            let opened = tokio::time::timeout_at(deadline, state.wait_for(ConnectionState::is_open))
                .await
                .is_ok_and(|opened| opened.is_ok());
            if !opened {
                break;
            }
            if shared.try_send(&message, &frame) {
                return Ok(id);
            }
            // Open but the writer is already gone; wait for the next transition
            if tokio::time::timeout_at(deadline, state.changed()).await.is_err() {
                break;
            }
        }

        let waited = started.elapsed();
        log::error!(
            "dropping {:?} for room {} after {:?}: connection did not open",
            message.message_type(),
            message.room_id,
            waited
        );
        shared.publish(SessionEvent::MessageDropped { message, waited });
        Err(SessionError::BufferTimeout {
            message_id: id,
            waited,
        })
    }

    /// Emit on a background task; failures are already reported as events.
    pub fn spawn_emit(&self, message: Message) -> JoinHandle<Result<MessageId, SessionError>> {
        let session = self.clone();
        tokio::spawn(async move { session.emit(message).await })
    }

    /// Broadcast a new state value to `room_id`'s roommates.
    pub async fn send_state(
        &self,
        room_id: impl Into<RoomId>,
        value: Value,
    ) -> Result<MessageId, SessionError> {
        self.emit(Message::state_update(room_id, value)).await
    }

    /// Invoke `room_id`'s function on every roommate.
    pub async fn call(
        &self,
        room_id: impl Into<RoomId>,
        args: Vec<Value>,
    ) -> Result<MessageId, SessionError> {
        self.emit(Message::call_function(room_id, args)).await
    }

    // ─── Rooms ───────────────────────────────────────────────────────

    /// Register a room subscription.
    ///
    /// Refused with `RoomCollisionPrevented` if the name is already taken.
    /// When the connection is open the subscribe message goes out now;
    /// otherwise the next open sends it with all other rooms.
    pub fn subscribe_to_room(
        &self,
        room_id: impl Into<RoomId>,
        kind: RoomKind,
        initial_value: Option<Value>,
    ) -> Result<(), RegistryError> {
        let shared = &self.shared;
        let room_id = room_id.into();
        let inserted = {
            let _sweep = lock(&shared.sweep);
            shared
                .registry
                .insert(room_id.clone(), kind, initial_value.clone())
                .map(|()| {
                    shared.queue_control(Message::subscribe(room_id.clone(), kind, initial_value))
                })
        };

        match inserted {
            Ok(sent) => {
                if let Some(message) = sent {
                    shared.publish(SessionEvent::MessageEmitted(message));
                }
            }
            Err(e) => {
                log::warn!("{e}; refusing second {kind} subscription");
                shared.publish(SessionEvent::RoomCollisionPrevented { room_id, kind });
                return Err(e);
            }
        }
        shared.publish(SessionEvent::RoomSubscribed { room_id, kind });
        Ok(())
    }

    /// Drop a room subscription.
    ///
    /// Unsubscribing a room that is not subscribed (or under another kind)
    /// is a binding bug: it is logged at `error` and returned, never panics.
    pub fn unsub_from_room(&self, room_id: &str, kind: RoomKind) -> Result<(), RegistryError> {
        let shared = &self.shared;
        let removed = {
            let _sweep = lock(&shared.sweep);
            shared
                .registry
                .remove(room_id, kind)
                .map(|_| shared.queue_control(Message::unsubscribe(room_id, kind)))
        };

        match removed {
            Ok(sent) => {
                if let Some(message) = sent {
                    shared.publish(SessionEvent::MessageEmitted(message));
                }
            }
            Err(e) => {
                log::error!("unsubscribe without a matching subscription: {e}");
                return Err(e);
            }
        }
        shared.publish(SessionEvent::RoomUnsubscribed {
            room_id: room_id.to_owned(),
            kind,
        });
        Ok(())
    }

    /// Remember the latest local value of a state room so a resubscribe
    /// seeds the relay with it.
    pub fn update_room_seed(&self, room_id: &str, value: Value) -> bool {
        self.shared.registry.update_seed(room_id, value)
    }

    /// Current subscriptions, ordered by room name.
    pub fn rooms(&self) -> Vec<(RoomId, RoomKind)> {
        self.shared
            .registry
            .snapshot()
            .into_iter()
            .map(|(room_id, entry)| (room_id, entry.kind))
            .collect()
    }

    pub fn room_kind(&self, room_id: &str) -> Option<RoomKind> {
        self.shared.registry.kind_of(room_id)
    }

    // ─── Listeners ───────────────────────────────────────────────────

    /// Listen for one kind of public event.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.shared.public.on(kind.as_str(), listener)
    }

    /// Listen for every public event.
    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.shared.public.on(ANY_TOPIC, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.shared.public.off(id)
    }

    /// Async stream of public events. Slow receivers lose the oldest events.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Receive `StateUpdate` values for `room_id`.
    pub fn on_state<F>(&self, room_id: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared.internal.on(state_topic(room_id), move |delivery: &RoomDelivery| {
            if let RoomDelivery::State(value) = delivery {
                listener(value);
            }
        })
    }

    /// Receive `CallFunction` arguments for `room_id`.
    pub fn on_call<F>(&self, room_id: &str, listener: F) -> ListenerId
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.shared.internal.on(function_topic(room_id), move |delivery: &RoomDelivery| {
            if let RoomDelivery::Call(args) = delivery {
                listener(args);
            }
        })
    }

    /// Remove a listener registered with `on_state` / `on_call`.
    pub fn off_room(&self, id: ListenerId) -> bool {
        self.shared.internal.off(id)
    }

    /// Number of IDs currently held for duplicate suppression.
    pub fn dedup_len(&self) -> usize {
        lock(&self.shared.dedup).len()
    }
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            log::debug!("connection {current} -> {next}");
            *current = next;
            true
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn publish(&self, event: SessionEvent) {
        if self.config.debug {
            log::info!("{}: {event:?}", event.kind());
        } else {
            log::trace!("{}: {event:?}", event.kind());
        }
        self.public.publish(event.kind().as_str(), &event);
        // No receivers is fine
        let _ = self.events_tx.send(event);
    }

    /// Assign an ID if missing and remember it so an echo is dropped.
    fn stamp(&self, mut message: Message) -> (Message, MessageId) {
        let id = message.id.get_or_insert_with(MessageId::random).clone();
        lock(&self.dedup).insert(id.clone());
        (message, id)
    }

    /// Queue a frame on the live connection. `false` if there is none.
    fn enqueue(&self, frame: String) -> bool {
        if !self.state().is_open() {
            return false;
        }
        lock(&self.outgoing)
            .as_ref()
            .is_some_and(|outgoing| outgoing.tx.send(Outbound::Frame(frame)).is_ok())
    }

    fn try_send(&self, message: &Message, frame: &str) -> bool {
        if !self.enqueue(frame.to_owned()) {
            return false;
        }
        self.publish(SessionEvent::MessageEmitted(message.clone()));
        true
    }

    /// Queue a subscribe/unsubscribe if the connection is open, without
    /// buffering. Returns the queued message; the caller publishes
    /// `MessageEmitted` once the sweep lock is released.
    fn queue_control(&self, message: Message) -> Option<Message> {
        let (message, _) = self.stamp(message);
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("failed to encode control message: {e}");
                return None;
            }
        };
        if self.enqueue(frame) {
            Some(message)
        } else {
            log::debug!(
                "{:?} for room {} not sent; the next open resubscribes",
                message.message_type(),
                message.room_id
            );
            None
        }
    }

    /// Replay every subscription after the relay forgot us. Caller holds
    /// the sweep lock.
    fn resubscribe(&self) -> Vec<Message> {
        let rooms = self.registry.snapshot();
        if !rooms.is_empty() {
            log::info!("resubscribing to {} room(s)", rooms.len());
        }
        rooms
            .into_iter()
            .filter_map(|(room_id, entry)| {
                self.queue_control(Message::subscribe(room_id, entry.kind, entry.seed))
            })
            .collect()
    }

    /// Stop every background task without a closing handshake.
    fn abort_tasks(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in [tasks.supervisor, tasks.truncator].into_iter().flatten() {
            task.abort();
        }
        lock(&self.outgoing).take();
        self.set_state(ConnectionState::Closed);
    }

    async fn open_transport(&self) -> Result<(Transport, Url), TransportError> {
        let mut url = self
            .config
            .endpoint()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if let Some(hook) = &self.config.pre_connect {
            let params = hook()
                .await
                .map_err(|e| TransportError::PreConnect(e.to_string()))?;
            if !params.is_empty() {
                let mut query = url.query_pairs_mut();
                for (key, value) in &params {
                    query.append_pair(key, value);
                }
            }
        }
        let transport = self.connector.connect(url.clone()).await?;
        Ok((transport, url))
    }

    /// Drive one open connection until it closes.
    async fn run_connection(&self, transport: Transport, generation: u64) {
        let Transport {
            mut sink,
            mut stream,
        } = transport;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let resubscribed = {
            let _sweep = lock(&self.sweep);
            {
                let mut outgoing = lock(&self.outgoing);
                if !self.is_current(generation) {
                    return;
                }
                *outgoing = Some(Outgoing { generation, tx });
            }
            self.set_state(ConnectionState::Open);
            self.resubscribe()
        };

        log::info!("connected to {}", self.config.url);
        self.publish(SessionEvent::SocketOpened {
            endpoint: self.config.url.clone(),
        });
        for message in resubscribed {
            self.publish(SessionEvent::MessageEmitted(message));
        }

        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(Outbound::Frame(frame)) => {
                        if let Err(e) = sink.send(frame).await {
                            log::warn!("send failed: {e}");
                            if self.is_current(generation) {
                                self.publish(SessionEvent::SocketError { error: e.to_string() });
                            }
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = sink.close().await;
                        break;
                    }
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(frame)) => self.handle_frame(&frame),
                    Some(Err(e)) => {
                        log::warn!("transport error: {e}");
                        self.publish(SessionEvent::SocketError { error: e.to_string() });
                    }
                    None => break,
                },
            }
        }

        let mut outgoing = lock(&self.outgoing);
        if outgoing.as_ref().is_some_and(|o| o.generation == generation) {
            *outgoing = None;
        }
        drop(outgoing);
        if self.is_current(generation) {
            self.set_state(ConnectionState::Closed);
        }
    }

    /// Decode, dedup and route one inbound frame.
    fn handle_frame(&self, frame: &str) {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("dropping undecodable frame: {e}");
                self.publish(SessionEvent::DeserializationError {
                    frame: frame.to_owned(),
                    error: e.to_string(),
                });
                return;
            }
        };
        let Some(id) = message.id.clone() else {
            return;
        };

        let fresh = lock(&self.dedup).insert(id);
        if !fresh {
            log::debug!("duplicate {:?} in room {}", message.message_type(), message.room_id);
            self.publish(SessionEvent::DuplicateMessageReceived(message));
            return;
        }
        self.publish(SessionEvent::MessageReceived(message.clone()));

        let Message {
            room_id,
            client_id,
            body,
            ..
        } = message;
        match body {
            Body::StateUpdate { value } => {
                self.internal
                    .publish(&state_topic(&room_id), &RoomDelivery::State(value));
            }
            Body::CallFunction { args } => {
                self.internal
                    .publish(&function_topic(&room_id), &RoomDelivery::Call(args));
            }
            Body::RoommateSubscribed => {
                if let Some(client_id) = client_id {
                    self.publish(SessionEvent::RoommateSubscribed { room_id, client_id });
                }
            }
            Body::RoommateUnsubscribed => {
                if let Some(client_id) = client_id {
                    self.publish(SessionEvent::RoommateUnsubscribed { room_id, client_id });
                }
            }
            other => {
                log::debug!("ignoring {:?} for room {room_id}", other.message_type());
            }
        }
    }
}

/// Connect, run, and reconnect after a fixed delay, forever.
async fn supervise(shared: Arc<Shared>, generation: u64) {
    let delay = shared.config.reconnect_delay();
    loop {
        if !shared.is_current(generation) {
            return;
        }
        shared.set_state(ConnectionState::Connecting);

        match shared.open_transport().await {
            Ok((transport, url)) => {
                log::debug!("transport open to {url}");
                shared.run_connection(transport, generation).await;
            }
            Err(e) => {
                if !shared.is_current(generation) {
                    return;
                }
                log::warn!("connection attempt failed: {e}");
                shared.publish(SessionEvent::SocketError {
                    error: e.to_string(),
                });
            }
        }

        if !shared.is_current(generation) {
            return;
        }
        shared.set_state(ConnectionState::Closed);
        shared.publish(SessionEvent::SocketClosed);
        log::info!("reconnecting in {delay:?}");
        tokio::time::sleep(delay).await;
    }
}

/// Clear the dedup set on a fixed interval while the session lives.
async fn truncate_dedup(shared: Weak<Shared>, every: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let dropped = lock(&shared.dedup).clear();
        log::trace!("dedup set truncated ({dropped} ids)");
    }
}
