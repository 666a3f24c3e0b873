// =============================================================================
// Matrixon Bridge - Engine Module
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
//   Wiring of the engine: configuration, signing keys, the federation
//   transport, the gateway and the registry, plus the supervisor role of
//   looking up or starting room actors on demand.
//
// =============================================================================

use std::sync::Arc;

use ruma::{OwnedRoomId, OwnedServerName, OwnedUserId, RoomId, UserId};
use tracing::info;

use crate::{
    config::Config,
    federation::FederationClient,
    gateway::{Gateway, Jid},
    registry::{self, Registry},
    room::{RoomActor, RoomHandle},
    signing::SigningService,
    Error, Result,
};

/// Shared engine state handed to every room actor.
pub struct Engine {
    pub config: Arc<Config>,
    pub signing: Arc<SigningService>,
    pub federation: Arc<dyn FederationClient>,
    pub gateway: Arc<dyn Gateway>,
    pub registry: Registry,
}

impl Engine {
    pub fn new(
        config: Config,
        signing: Arc<SigningService>,
        federation: Arc<dyn FederationClient>,
        gateway: Arc<dyn Gateway>,
    ) -> Arc<Self> {
        info!(server_name = %config.server_name, "🔧 bridge engine initialized");
        Arc::new(Self {
            config: Arc::new(config),
            signing,
            federation,
            gateway,
            registry: Registry::new(),
        })
    }

    /// Look up the actor for a room, starting one when none is running.
    pub fn get_room_pid(self: &Arc<Self>, room_id: &RoomId) -> Result<RoomHandle> {
        if let Some(handle) = self.registry.get_room(room_id) {
            if !handle.is_closed() {
                return Ok(handle);
            }
        }
        let handle = RoomActor::spawn(self.clone(), room_id.to_owned())?;
        if self.registry.register_room(room_id.to_owned(), handle.clone()) {
            Ok(handle)
        } else {
            // Lost a start race; use whatever is registered now.
            self.registry
                .get_room(room_id)
                .ok_or_else(|| Error::RoomNotFound(room_id.to_owned()))
        }
    }

    /// Join a local user into a remote room via the given server.
    pub fn join_remote_room(
        self: &Arc<Self>,
        matrix_server: OwnedServerName,
        room_id: OwnedRoomId,
        local_user: Jid,
    ) -> Result<RoomHandle> {
        let user_id = self.local_user_id(&local_user)?;
        let handle = self.get_room_pid(&room_id)?;
        handle.join(matrix_server, local_user, user_id)?;
        Ok(handle)
    }

    /// Find or create the direct chat between a local user and a remote
    /// Matrix user.
    pub fn create_direct_room(
        self: &Arc<Self>,
        local_user: Jid,
        remote_user: OwnedUserId,
    ) -> Result<(OwnedRoomId, RoomHandle)> {
        if let Some(room_id) = self
            .registry
            .get_direct(&local_user.to_string(), &remote_user)
        {
            if let Some(handle) = self.registry.get_room(&room_id) {
                if !handle.is_closed() {
                    return Ok((room_id, handle));
                }
            }
        }

        let room_id = registry::generate_room_id(&self.config.server_name);
        let local_user_id = self.local_user_id(&local_user)?;
        let handle = self.get_room_pid(&room_id)?;
        self.registry.register_direct(
            local_user.to_string(),
            remote_user.clone(),
            room_id.clone(),
        );
        handle.create(local_user, local_user_id, remote_user)?;
        Ok((room_id, handle))
    }

    /// Matrix identity of a local gateway user. A jid that does not map
    /// onto a well-formed user id is a fatal startup error for the room.
    pub fn local_user_id(&self, local_user: &Jid) -> Result<OwnedUserId> {
        UserId::parse(format!("@{}:{}", local_user.user, self.config.server_name))
            .map_err(|e| Error::Config(format!("local user does not map to a user id: {e}")))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("server_name", &self.config.server_name)
            .field("rooms", &self.registry.room_count())
            .finish_non_exhaustive()
    }
}
