// =============================================================================
// Matrixon Bridge - Library Crate
// =============================================================================
//
// Project: Matrixon Bridge - Matrix Federation Room Engine
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2025-03-10
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Per-room Matrix federation engine: event DAG with per-event state
//   snapshots, the auth-rules engine, state resolution v2, and the room
//   actor orchestrating make_join/send_join, get_missing_events and
//   transactional sends. Bridges one or more local (gateway-owned) users
//   into federated Matrix rooms; the gateway, federation transport and
//   key discovery are collaborators behind traits.
//
// =============================================================================

pub mod auth;
pub mod config;
pub mod dag;
pub mod engine;
pub mod error;
pub mod federation;
pub mod gateway;
pub mod pdu;
pub mod registry;
pub mod room;
pub mod room_version;
pub mod signing;
pub mod state_res;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use pdu::{Event, StateKey, StateMap};
pub use room::RoomHandle;
pub use room_version::{RoomVersion, SUPPORTED_ROOM_VERSIONS};

// Re-export the protocol types crate; embedders need its identifiers.
pub use ruma;
