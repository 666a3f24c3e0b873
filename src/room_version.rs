// =============================================================================
// Matrixon Bridge - Room Version Module
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
//   Room-version profiles. A profile is pure data: a handful of boolean
//   flags selecting the auth-rule variants that differ between the room
//   versions this bridge federates with (9, 10, 11). Everything outside
//   that set is rejected at the room boundary.
//
// =============================================================================

use ruma::RoomVersionId;

use crate::{Error, Result};

/// Room versions this bridge accepts, newest last.
pub const SUPPORTED_ROOM_VERSIONS: &[&str] = &["9", "10", "11"];

/// Auth-rule profile of a supported room version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomVersion {
    /// Version string as it appears on the wire ("9", "10", "11").
    pub version: &'static str,
    /// `knock_restricted` is a valid join rule.
    pub knock_restricted_join_rule: bool,
    /// Power-level values must be integers; numeric strings are rejected.
    pub enforce_int_power_levels: bool,
    /// The room creator is the sender of m.room.create; `content.creator`
    /// is no longer required.
    pub implicit_room_creator: bool,
    /// Redactions keep the updated field set.
    pub updated_redaction_rules: bool,
}

pub const V9: RoomVersion = RoomVersion {
    version: "9",
    knock_restricted_join_rule: false,
    enforce_int_power_levels: false,
    implicit_room_creator: false,
    updated_redaction_rules: false,
};

pub const V10: RoomVersion = RoomVersion {
    version: "10",
    knock_restricted_join_rule: true,
    enforce_int_power_levels: true,
    implicit_room_creator: false,
    updated_redaction_rules: false,
};

pub const V11: RoomVersion = RoomVersion {
    version: "11",
    knock_restricted_join_rule: true,
    enforce_int_power_levels: true,
    implicit_room_creator: true,
    updated_redaction_rules: true,
};

impl RoomVersion {
    /// Profile for a wire version string. Unknown ids reject the room.
    pub fn from_version_str(version: &str) -> Result<Self> {
        match version {
            "9" => Ok(V9),
            "10" => Ok(V10),
            "11" => Ok(V11),
            other => Err(Error::IncompatibleVersion(other.to_owned())),
        }
    }

    /// The matching ruma version id, used by the signing layer.
    pub fn id(&self) -> RoomVersionId {
        match self.version {
            "9" => RoomVersionId::V9,
            "10" => RoomVersionId::V10,
            _ => RoomVersionId::V11,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_versions_parse() {
        for version in SUPPORTED_ROOM_VERSIONS {
            let profile = RoomVersion::from_version_str(version).unwrap();
            assert_eq!(profile.version, *version);
        }
    }

    #[test]
    fn test_unknown_version_rejected() {
        for version in ["1", "6", "8", "12", "org.example.custom", ""] {
            assert!(matches!(
                RoomVersion::from_version_str(version),
                Err(Error::IncompatibleVersion(_))
            ));
        }
    }

    #[test]
    fn test_profile_flags() {
        assert!(!V9.implicit_room_creator);
        assert!(!V9.enforce_int_power_levels);
        assert!(!V9.knock_restricted_join_rule);
        assert!(V10.enforce_int_power_levels);
        assert!(V10.knock_restricted_join_rule);
        assert!(!V10.implicit_room_creator);
        assert!(V11.implicit_room_creator);
        assert!(V11.updated_redaction_rules);
    }
}
