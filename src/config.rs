// =============================================================================
// Matrixon Bridge - Configuration Module
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
//   Static configuration for the bridge engine: our Matrix server name, the
//   local and gateway jid domains, key material naming, and the federation
//   timing knobs (request timeouts, transaction retry, make_join warm-up).
//
// =============================================================================

use std::time::Duration;

use ruma::OwnedServerName;
use serde::Deserialize;

/// Bridge engine configuration.
///
/// Deserializable so embedders can load it from their own config file; every
/// timing knob has a sensible default matching the federation defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Our Matrix domain; the server part of every local user id and of
    /// generated room ids.
    pub server_name: OwnedServerName,

    /// Domain of local (gateway-owned) user jids.
    pub host: String,

    /// Domain under which remote Matrix users are exposed as gateway jids.
    pub service_host: String,

    /// Version label of the server Ed25519 signing key.
    #[serde(default = "default_key_version")]
    pub key_version: String,

    /// Room version used for rooms this bridge creates.
    #[serde(default = "default_room_version")]
    pub default_room_version: String,

    /// Default federation request timeout, seconds.
    #[serde(default = "default_federation_timeout")]
    pub federation_timeout_secs: u64,

    /// get_missing_events request timeout, seconds.
    #[serde(default = "default_missing_events_timeout")]
    pub missing_events_timeout_secs: u64,

    /// Delay before retrying a failed outbound transaction, seconds.
    #[serde(default = "default_txn_retry")]
    pub txn_retry_secs: u64,

    /// Warm-up delay before make_join, seconds. Gives the remote directory
    /// time to propagate before the handshake starts.
    #[serde(default = "default_join_delay")]
    pub join_delay_secs: u64,

    /// Reject events on the auth branches that are recognised but not fully
    /// enforced (third-party invites, restricted joins via an authorising
    /// server) instead of accepting them.
    #[serde(default)]
    pub strict_auth: bool,
}

fn default_key_version() -> String {
    "a_1".to_owned()
}

fn default_room_version() -> String {
    "11".to_owned()
}

fn default_federation_timeout() -> u64 {
    5
}

fn default_missing_events_timeout() -> u64 {
    60
}

fn default_txn_retry() -> u64 {
    30
}

fn default_join_delay() -> u64 {
    1
}

impl Config {
    /// Minimal configuration for the given domains, all knobs at defaults.
    pub fn new(server_name: OwnedServerName, host: &str, service_host: &str) -> Self {
        Self {
            server_name,
            host: host.to_owned(),
            service_host: service_host.to_owned(),
            key_version: default_key_version(),
            default_room_version: default_room_version(),
            federation_timeout_secs: default_federation_timeout(),
            missing_events_timeout_secs: default_missing_events_timeout(),
            txn_retry_secs: default_txn_retry(),
            join_delay_secs: default_join_delay(),
            strict_auth: false,
        }
    }

    pub fn federation_timeout(&self) -> Duration {
        Duration::from_secs(self.federation_timeout_secs)
    }

    pub fn missing_events_timeout(&self) -> Duration {
        Duration::from_secs(self.missing_events_timeout_secs)
    }

    pub fn txn_retry_delay(&self) -> Duration {
        Duration::from_secs(self.txn_retry_secs)
    }

    pub fn join_delay(&self) -> Duration {
        Duration::from_secs(self.join_delay_secs)
    }
}
