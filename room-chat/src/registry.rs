//! Shared connection registry and room index.
//!
//! Both maps live behind one async mutex inside [`Registry`] and are only
//! reachable through its methods, so every read and mutation takes the same
//! lock. The lock is held for the map operation alone; callers do their I/O
//! after the guard is gone.
//!
//! Room member sets are the source of truth for membership. Each user record
//! also keeps the rooms it joined, in join order and without duplicates, and
//! that list is updated in the same critical section as the member set.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::connection::{ConnectionHandle, ConnectionId};

pub type UserId = String;
pub type RoomId = String;

#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, UserRecord>,
    rooms: HashMap<RoomId, HashSet<UserId>>,
}

#[derive(Default)]
struct UserRecord {
    connection: Option<ConnectionHandle>,
    rooms: Vec<RoomId>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct RegistryStats {
    pub users: usize,
    pub rooms: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handle` as the user's connection, keeping existing room
    /// memberships. Returns the handle it replaced so the caller can close it.
    pub async fn register(
        &self,
        user_id: &str,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let mut inner = self.inner.lock().await;
        inner
            .users
            .entry(user_id.to_string())
            .or_default()
            .connection
            .replace(handle)
    }

    pub async fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        let inner = self.inner.lock().await;
        inner
            .users
            .get(user_id)
            .and_then(|user| user.connection.clone())
    }

    /// Removes the user record and returns the rooms it belonged to. Room
    /// member sets are left alone; see [`disconnect`](Self::disconnect) for the
    /// cascading variant.
    pub async fn unregister(&self, user_id: &str) -> Vec<RoomId> {
        let mut inner = self.inner.lock().await;
        inner
            .users
            .remove(user_id)
            .map(|user| user.rooms)
            .unwrap_or_default()
    }

    /// Session teardown: drops the user and removes it from every room, all in
    /// one critical section. Does nothing when the user has been re-registered
    /// on a different connection since `connection_id` was handed out.
    pub async fn disconnect(&self, user_id: &str, connection_id: ConnectionId) -> Vec<RoomId> {
        let mut inner = self.inner.lock().await;

        let owns_record = inner
            .users
            .get(user_id)
            .and_then(|user| user.connection.as_ref())
            .is_some_and(|handle| handle.id() == connection_id);
        if !owns_record {
            return Vec::new();
        }

        let rooms = inner
            .users
            .remove(user_id)
            .map(|user| user.rooms)
            .unwrap_or_default();
        for room_id in &rooms {
            inner.remove_member(room_id, user_id);
        }
        rooms
    }

    /// Creates an empty room if it does not exist yet.
    pub async fn ensure_room(&self, room_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.rooms.entry(room_id.to_string()).or_default();
    }

    /// Adds the user to the room, creating either record if needed. Returns
    /// `true` when the user was already a member.
    pub async fn join(&self, room_id: &str, user_id: &str) -> bool {
        let mut inner = self.inner.lock().await;

        let newly_added = inner
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(user_id.to_string());

        let user = inner.users.entry(user_id.to_string()).or_default();
        if !user.rooms.iter().any(|room| room == room_id) {
            user.rooms.push(room_id.to_string());
        }

        !newly_added
    }

    /// Removes the user from the room. Returns `true` when it was a member.
    pub async fn leave(&self, room_id: &str, user_id: &str) -> bool {
        let mut inner = self.inner.lock().await;

        let was_member = inner.remove_member(room_id, user_id);
        if was_member {
            let detached_and_idle = match inner.users.get_mut(user_id) {
                Some(user) => {
                    user.rooms.retain(|room| room != room_id);
                    user.connection.is_none() && user.rooms.is_empty()
                }
                None => false,
            };
            if detached_and_idle {
                inner.users.remove(user_id);
            }
        }
        was_member
    }

    /// Copy of the room's member set. Empty for unknown rooms.
    pub async fn members(&self, room_id: &str) -> BTreeSet<UserId> {
        let inner = self.inner.lock().await;
        inner
            .rooms
            .get(room_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Members of the room that currently have a live connection, paired
    /// with their handles, read in a single critical section.
    pub async fn recipients(&self, room_id: &str) -> Vec<(UserId, ConnectionHandle)> {
        let inner = self.inner.lock().await;
        let Some(members) = inner.rooms.get(room_id) else {
            return Vec::new();
        };

        members
            .iter()
            .filter_map(|user_id| {
                let handle = inner.users.get(user_id)?.connection.clone()?;
                Some((user_id.clone(), handle))
            })
            .collect()
    }

    pub async fn rooms_of(&self, user_id: &str) -> Vec<RoomId> {
        let inner = self.inner.lock().await;
        inner
            .users
            .get(user_id)
            .map(|user| user.rooms.clone())
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.lock().await.rooms.len()
    }

    pub async fn user_count(&self) -> usize {
        self.inner.lock().await.users.len()
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock().await;
        RegistryStats {
            users: inner.users.len(),
            rooms: inner.rooms.len(),
        }
    }
}

impl Inner {
    /// Drops `user_id` from the room's member set and evicts the room once it
    /// is empty.
    fn remove_member(&mut self, room_id: &str, user_id: &str) -> bool {
        let Some(members) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let removed = members.remove(user_id);
        if removed && members.is_empty() {
            self.rooms.remove(room_id);
        }
        removed
    }
}
