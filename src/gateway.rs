// =============================================================================
// Matrixon Bridge - Gateway Module
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
//   The seam to the local world: jid <-> Matrix user mapping with the
//   reversible escape coding, and the trait through which room actors
//   deliver chat traffic to the gateway. The escape table and the `%`
//   separator are wire-pinned; changing either breaks every mapped jid.
//
// =============================================================================

use std::fmt;

use async_trait::async_trait;
use ruma::{RoomId, UserId};

use crate::config::Config;

/// Bytes escaped in mapped jid parts.
const RESERVED: &[u8] = b" \"%&'/:<>@\\";

/// A gateway-side address: `user@host`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    pub user: String,
    pub host: String,
}

impl Jid {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
        }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// Escape the reserved byte set as `\hh` (lowercase hex).
pub fn escape(input: &str) -> String {
    let mut out = Vec::with_capacity(input.len());
    for byte in input.bytes() {
        if RESERVED.contains(&byte) {
            out.extend_from_slice(format!("\\{byte:02x}").as_bytes());
        } else {
            // Reserved bytes are all ASCII; multi-byte sequences pass
            // through untouched.
            out.push(byte);
        }
    }
    String::from_utf8(out).expect("escaping replaces ASCII bytes with ASCII sequences")
}

/// Inverse of [`escape`]. Escape sequences that do not decode to a
/// reserved byte are kept literally.
pub fn unescape(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let (Some(hi), Some(lo)) = (bytes.get(i + 1), bytes.get(i + 2)) {
                if let (Some(hi), Some(lo)) = (hex_value(*hi), hex_value(*lo)) {
                    let byte = hi * 16 + lo;
                    if RESERVED.contains(&byte) {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        _ => None,
    }
}

/// Map a Matrix user id onto a gateway jid.
///
/// Users of our own Matrix domain map back onto plain local jids; remote
/// users become `escape(local)%escape(server)` on the service host.
pub fn user_id_to_jid(user_id: &UserId, config: &Config) -> Jid {
    if user_id.server_name() == config.server_name {
        Jid::new(user_id.localpart(), config.host.clone())
    } else {
        Jid::new(
            format!(
                "{}%{}",
                escape(user_id.localpart()),
                escape(user_id.server_name().as_str())
            ),
            config.service_host.clone(),
        )
    }
}

/// The gateway collaborator: owns local user identities and renders room
/// traffic to them. Implementations attach their own metadata (for chat
/// messages, the `p1:matrix` room-id extension) when rendering.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Deliver a chat message from a Matrix sender to the local user.
    async fn deliver_message(&self, to: &Jid, from: &Jid, room_id: &RoomId, body: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruma::{server_name, user_id};

    fn config() -> Config {
        Config::new(
            server_name!("matrix.example.com").to_owned(),
            "example.com",
            "matrix.example.com",
        )
    }

    #[test]
    fn test_escape_pinned_table() {
        assert_eq!(escape("a b"), "a\\20b");
        assert_eq!(escape("a@b"), "a\\40b");
        assert_eq!(escape("a:b"), "a\\3ab");
        assert_eq!(escape("a/b"), "a\\2fb");
        assert_eq!(escape("a\\b"), "a\\5cb");
        assert_eq!(escape("a%b"), "a\\25b");
        assert_eq!(escape("a\"b'c"), "a\\22b\\27c");
        assert_eq!(escape("a&b<c>d"), "a\\26b\\3cc\\3ed");
        assert_eq!(escape("plain-user_1.x"), "plain-user_1.x");
    }

    // Property 1: unescape(escape(s)) == s for arbitrary strings.
    #[test]
    fn test_escape_roundtrip() {
        let samples = [
            "",
            "alice",
            "a b c",
            "user@host:8448",
            "100% \\legit\\ <name> & 'quotes' \"too\"/",
            "\\20 already escaped",
            "unicode: ☃ßé",
            "\\",
            "\\5",
            "\\zz",
        ];
        for sample in samples {
            assert_eq!(unescape(&escape(sample)), sample, "roundtrip failed for {sample:?}");
        }
    }

    #[test]
    fn test_unescape_ignores_invalid_sequences() {
        assert_eq!(unescape("a\\zzb"), "a\\zzb");
        assert_eq!(unescape("trailing\\"), "trailing\\");
        assert_eq!(unescape("\\5"), "\\5");
        // \41 is 'A', which is not in the reserved set; kept literally.
        assert_eq!(unescape("\\41"), "\\41");
    }

    #[test]
    fn test_local_user_maps_to_local_jid() {
        let jid = user_id_to_jid(user_id!("@alice:matrix.example.com"), &config());
        assert_eq!(jid, Jid::new("alice", "example.com"));
    }

    #[test]
    fn test_remote_user_maps_to_service_jid() {
        let jid = user_id_to_jid(user_id!("@bob:remote.example"), &config());
        assert_eq!(jid, Jid::new("bob%remote.example", "matrix.example.com"));
        assert_eq!(jid.to_string(), "bob%remote.example@matrix.example.com");
    }

    #[test]
    fn test_remote_user_with_reserved_chars() {
        // Localpart with reserved characters is escaped before the `%`
        // separator is added, keeping the mapping reversible.
        let jid = user_id_to_jid(user_id!("@it/me:remote.example"), &config());
        assert_eq!(jid.user, "it\\2fme%remote.example");
    }
}
