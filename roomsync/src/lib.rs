//! # roomsync - Real-time room client
//!
//! Shares state values and function calls between clients through a relay
//! server, over one WebSocket per session.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐                     ┌───────────────┐
//! │ SharedState   │                     │ SharedFunction│
//! │ (typed value) │                     │ (callback)    │
//! └──────┬────────┘                     └──────┬────────┘
//!        │ mount / set / drop                  │ mount / call / drop
//!        ▼                                     ▼
//! ┌─────────────────────────────────────────────────────┐
//! │ Session                                             │
//! │  RoomRegistry ─ resubscribe on reconnect            │
//! │  DedupSet ───── drop echoes and repeats             │
//! │  EventBus ───── internal (rooms) + public (events)  │
//! └──────────────────────┬──────────────────────────────┘
//!                        │ JSON text frames
//!                        ▼
//!                 ┌─────────────┐
//!                 │ Relay       │
//!                 │ (server)    │
//!                 └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - JSON wire envelope (`Message`, `Body`)
//! - [`session`] - Connection manager and room operations
//! - [`binding`] - `SharedState` / `SharedFunction`
//! - [`registry`] - Local room subscriptions
//! - [`bus`] - Topic-keyed listener registry
//! - [`events`] - Public session events
//! - [`dedup`] - Seen-message set
//! - [`transport`] - Connector seam, WebSocket implementation
//! - [`config`] - `SessionConfig`

pub mod binding;
pub mod bus;
pub mod config;
pub mod dedup;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use binding::{SharedFunction, SharedState};
pub use bus::{EventBus, ListenerId};
pub use config::{ConfigError, SessionConfig};
pub use events::{EventKind, SessionEvent};
pub use protocol::{Body, Message, MessageId, MessageType, ProtocolError, RoomId, RoomKind};
pub use registry::RegistryError;
pub use session::{Session, SessionError};
pub use transport::{ConnectionState, Connector, Transport, TransportError, WsConnector};
