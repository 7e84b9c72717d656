//! Local room subscriptions.
//!
//! The registry is the single answer to "which rooms does this client think
//! it is in". One entry per room name: a second subscribe under the same name
//! is refused rather than merged, so two bindings accidentally sharing a name
//! surface as an error instead of silent cross-talk.
//!
//! The session reads a [`snapshot`](RoomRegistry::snapshot) after every
//! reconnect to rebuild server-side membership.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use thiserror::Error;

use crate::protocol::{RoomId, RoomKind};

/// One local subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomEntry {
    pub kind: RoomKind,
    /// Value sent with `SubscribeState`; tracks the latest local state.
    pub seed: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("room `{room_id}` is already subscribed as {existing}")]
    Collision { room_id: RoomId, existing: RoomKind },
    #[error("room `{room_id}` has no {kind} subscription")]
    NotSubscribed { room_id: RoomId, kind: RoomKind },
}

/// Room name → subscription kind.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: Mutex<BTreeMap<RoomId, RoomEntry>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn rooms(&self) -> MutexGuard<'_, BTreeMap<RoomId, RoomEntry>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a subscription. Fails without touching the map if the name is taken.
    pub fn insert(
        &self,
        room_id: RoomId,
        kind: RoomKind,
        seed: Option<Value>,
    ) -> Result<(), RegistryError> {
        let mut rooms = self.rooms();
        if let Some(existing) = rooms.get(&room_id) {
            return Err(RegistryError::Collision {
                room_id,
                existing: existing.kind,
            });
        }
        // Function rooms have nothing to seed
        let seed = match kind {
            RoomKind::State => seed,
            RoomKind::Function => None,
        };
        rooms.insert(room_id, RoomEntry { kind, seed });
        Ok(())
    }

    /// Remove a subscription of the given kind.
    pub fn remove(&self, room_id: &str, kind: RoomKind) -> Result<RoomEntry, RegistryError> {
        let mut rooms = self.rooms();
        match rooms.get(room_id) {
            Some(entry) if entry.kind == kind => {}
            _ => {
                return Err(RegistryError::NotSubscribed {
                    room_id: room_id.to_owned(),
                    kind,
                })
            }
        }
        rooms.remove(room_id).ok_or_else(|| RegistryError::NotSubscribed {
            room_id: room_id.to_owned(),
            kind,
        })
    }

    /// Replace the seed of a state room. Returns `false` if there is none.
    pub fn update_seed(&self, room_id: &str, value: Value) -> bool {
        match self.rooms().get_mut(room_id) {
            Some(entry) if entry.kind == RoomKind::State => {
                entry.seed = Some(value);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, room_id: &str) -> Option<RoomEntry> {
        self.rooms().get(room_id).cloned()
    }

    pub fn kind_of(&self, room_id: &str) -> Option<RoomKind> {
        self.rooms().get(room_id).map(|entry| entry.kind)
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms().contains_key(room_id)
    }

    /// Copy of every entry, ordered by room name.
    pub fn snapshot(&self) -> Vec<(RoomId, RoomEntry)> {
        self.rooms()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rooms().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms().is_empty()
    }
}
