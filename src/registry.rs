// =============================================================================
// Matrixon Bridge - Registry Module
// =============================================================================
//
// Project: Matrixon Bridge - Matrix Federation Room Engine
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2025-03-10
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   The only cross-actor state: the room-id -> actor handle map and the
//   (local user, remote user) -> room-id index for direct chats. Entries
//   are written on actor init and removed on terminate; lookups are cheap
//   and per-key atomic.
//
// =============================================================================

use dashmap::DashMap;

use rand::Rng;
use ruma::{OwnedRoomId, OwnedUserId, RoomId, ServerName};
use tracing::debug;

use crate::room::RoomHandle;

/// Direct-chat key: the local user's bare jid plus the remote Matrix user.
pub type DirectKey = (String, OwnedUserId);

/// Process-global actor and direct-chat indices.
#[derive(Debug, Default)]
pub struct Registry {
    rooms: DashMap<OwnedRoomId, RoomHandle>,
    directs: DashMap<DirectKey, OwnedRoomId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the actor handle for a room.
    pub fn get_room(&self, room_id: &RoomId) -> Option<RoomHandle> {
        self.rooms.get(room_id).map(|handle| handle.clone())
    }

    /// Register a freshly spawned actor. Keys are unique: a live entry is
    /// never silently replaced.
    pub fn register_room(&self, room_id: OwnedRoomId, handle: RoomHandle) -> bool {
        match self.rooms.entry(room_id) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().is_closed() {
                    occupied.insert(handle);
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(handle);
                true
            }
        }
    }

    pub fn unregister_room(&self, room_id: &RoomId) {
        debug!(%room_id, "removing room from registry");
        self.rooms.remove(room_id);
    }

    pub fn get_direct(&self, local_user: &str, remote_user: &OwnedUserId) -> Option<OwnedRoomId> {
        self.directs
            .get(&(local_user.to_owned(), remote_user.clone()))
            .map(|room_id| room_id.clone())
    }

    pub fn register_direct(&self, local_user: String, remote_user: OwnedUserId, room_id: OwnedRoomId) {
        self.directs.insert((local_user, remote_user), room_id);
    }

    pub fn unregister_direct(&self, local_user: &str, remote_user: &OwnedUserId) {
        self.directs
            .remove(&(local_user.to_owned(), remote_user.clone()));
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

/// Alphabet of generated room ids.
const ROOM_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Fresh room id: `!` + 18 letters of cryptographic entropy + our domain.
pub fn generate_room_id(server_name: &ServerName) -> OwnedRoomId {
    let mut rng = rand::thread_rng();
    let localpart: String = (0..18)
        .map(|_| {
            let byte: u8 = rng.gen();
            ROOM_ID_ALPHABET[byte as usize % ROOM_ID_ALPHABET.len()] as char
        })
        .collect();
    RoomId::parse(format!("!{localpart}:{server_name}"))
        .expect("generated room id is well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruma::{server_name, user_id};

    #[test]
    fn test_generate_room_id_format() {
        let room_id = generate_room_id(server_name!("matrix.example.com"));
        let s = room_id.as_str();
        assert!(s.starts_with('!'));
        assert!(s.ends_with(":matrix.example.com"));
        let localpart = &s[1..19];
        assert_eq!(localpart.len(), 18);
        assert!(localpart.chars().all(|c| c.is_ascii_alphabetic()));
    }

    #[test]
    fn test_generate_room_id_unique() {
        let a = generate_room_id(server_name!("matrix.example.com"));
        let b = generate_room_id(server_name!("matrix.example.com"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_direct_index() {
        let registry = Registry::new();
        let remote = user_id!("@bob:remote.example").to_owned();
        let room_id = generate_room_id(server_name!("matrix.example.com"));

        assert!(registry.get_direct("alice@example.com", &remote).is_none());
        registry.register_direct("alice@example.com".to_owned(), remote.clone(), room_id.clone());
        assert_eq!(
            registry.get_direct("alice@example.com", &remote),
            Some(room_id)
        );
        registry.unregister_direct("alice@example.com", &remote);
        assert!(registry.get_direct("alice@example.com", &remote).is_none());
    }
}
