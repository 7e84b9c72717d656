//! Typed room bindings.
//!
//! [`SharedState`] mirrors one value across every client in a state room;
//! [`SharedFunction`] runs a callback on every client in a function room.
//! Both subscribe on mount and unsubscribe when dropped, so a binding's
//! lifetime is its room membership.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::bus::ListenerId;
use crate::protocol::{Message, RoomId, RoomKind};
use crate::session::{Session, SessionError};

/// A value shared by everyone in a state room.
///
/// Local writes apply immediately and are broadcast in the background;
/// roommates' writes arrive through [`watch`](Self::watch). The last write
/// to reach a client wins.
pub struct SharedState<T> {
    session: Session,
    room_id: RoomId,
    value: Arc<watch::Sender<T>>,
    listener: ListenerId,
}

impl<T> SharedState<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Join `room_id`, offering `initial` as the room's seed value.
    pub fn mount(
        session: &Session,
        room_id: impl Into<RoomId>,
        initial: T,
    ) -> Result<Self, SessionError> {
        let room_id = room_id.into();
        let seed = serde_json::to_value(&initial)?;

        // Listen before subscribing: the relay may replay the room's value
        // as soon as the subscribe goes out.
        let value = Arc::new(watch::Sender::new(initial));
        let listener = {
            let value = Arc::clone(&value);
            let session_handle = session.clone();
            let room = room_id.clone();
            session.on_state(&room_id, move |incoming| {
                match serde_json::from_value::<T>(incoming.clone()) {
                    Ok(next) => {
                        value.send_replace(next);
                        session_handle.update_room_seed(&room, incoming.clone());
                    }
                    Err(e) => log::warn!("ignoring state for room {room} of the wrong shape: {e}"),
                }
            })
        };
        if let Err(e) = session.subscribe_to_room(room_id.clone(), RoomKind::State, Some(seed)) {
            session.off_room(listener);
            return Err(e.into());
        }

        Ok(Self {
            session: session.clone(),
            room_id,
            value,
            listener,
        })
    }

    pub fn get(&self) -> T {
        self.value.borrow().clone()
    }

    /// Receiver that sees every local and remote change.
    pub fn watch(&self) -> watch::Receiver<T> {
        self.value.subscribe()
    }

    /// Replace the value locally and broadcast it to the room.
    ///
    /// Must be called from within a tokio runtime. A broadcast that times
    /// out is reported as a `MessageDropped` event.
    pub fn set(&self, next: T) -> Result<(), SessionError> {
        let json = serde_json::to_value(&next)?;
        self.value.send_replace(next);
        self.session.update_room_seed(&self.room_id, json.clone());
        self.session
            .spawn_emit(Message::state_update(self.room_id.clone(), json));
        Ok(())
    }

    /// Modify the value in place and broadcast the result.
    pub fn update<F>(&self, f: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut T),
    {
        let mut next = self.get();
        f(&mut next);
        self.set(next)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }
}

impl<T> Drop for SharedState<T> {
    fn drop(&mut self) {
        self.session.off_room(self.listener);
        // Already reported by the session if it fails
        let _ = self.session.unsub_from_room(&self.room_id, RoomKind::State);
    }
}

impl<T: fmt::Debug> fmt::Debug for SharedState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedState")
            .field("room_id", &self.room_id)
            .field("value", &*self.value.borrow())
            .finish()
    }
}

/// A callback invoked on every client in a function room.
pub struct SharedFunction {
    session: Session,
    room_id: RoomId,
    handler: Arc<dyn Fn(&[Value]) + Send + Sync>,
    listener: ListenerId,
}

impl SharedFunction {
    /// Join `room_id` and run `handler` for every call made by a roommate.
    pub fn mount<F>(
        session: &Session,
        room_id: impl Into<RoomId>,
        handler: F,
    ) -> Result<Self, SessionError>
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let room_id = room_id.into();
        let handler: Arc<dyn Fn(&[Value]) + Send + Sync> = Arc::new(handler);
        let listener = {
            let handler = Arc::clone(&handler);
            session.on_call(&room_id, move |args| handler(args))
        };
        if let Err(e) = session.subscribe_to_room(room_id.clone(), RoomKind::Function, None) {
            session.off_room(listener);
            return Err(e.into());
        }

        Ok(Self {
            session: session.clone(),
            room_id,
            handler,
            listener,
        })
    }

    /// Run the handler here, then on every roommate.
    ///
    /// Must be called from within a tokio runtime.
    pub fn call(&self, args: Vec<Value>) {
        (self.handler)(&args);
        self.session
            .spawn_emit(Message::call_function(self.room_id.clone(), args));
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }
}

impl Drop for SharedFunction {
    fn drop(&mut self) {
        self.session.off_room(self.listener);
        let _ = self.session.unsub_from_room(&self.room_id, RoomKind::Function);
    }
}

impl fmt::Debug for SharedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedFunction")
            .field("room_id", &self.room_id)
            .finish_non_exhaustive()
    }
}
