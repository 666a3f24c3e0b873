// =============================================================================
// Matrixon Bridge - Pdu Module
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
//   The event codec: parses a PDU object into a typed Event, carrying the
//   original canonical JSON alongside the fields the engine dispatches on.
//   An event enters the system with `state_map = None` ("known but not
//   materialised") and is upgraded exactly once after authorisation.
//
// =============================================================================

use std::collections::HashMap;

use ruma::{
    events::{room::member::MembershipState, StateEventType, TimelineEventType},
    CanonicalJsonObject, CanonicalJsonValue, MilliSecondsSinceUnixEpoch, OwnedEventId,
    OwnedRoomId, OwnedUserId, RoomId, UInt, UserId,
};
use tracing::warn;

use crate::{room_version::RoomVersion, signing::{SigningService, Verified}, Error, Result};

/// Depth values are capped here; deeper parents saturate instead of growing.
pub const MAX_DEPTH: u64 = i64::MAX as u64;

/// Key of one state entry: event type plus state key.
pub type StateKey = (StateEventType, String);

/// Resolved room state at a DAG vertex: `(type, state_key) -> event_id`.
pub type StateMap = HashMap<StateKey, OwnedEventId>;

/// A room event, immutable once fully populated.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_id: OwnedEventId,
    pub room_id: OwnedRoomId,
    pub kind: TimelineEventType,
    pub state_key: Option<String>,
    pub sender: OwnedUserId,
    pub depth: u64,
    pub auth_events: Vec<OwnedEventId>,
    pub prev_events: Vec<OwnedEventId>,
    pub origin_server_ts: MilliSecondsSinceUnixEpoch,
    pub room_version: RoomVersion,
    /// The original PDU, canonical form preserved.
    pub json: CanonicalJsonObject,
    /// Room state after this event; `None` until the event has been
    /// authorised with known parents. Never goes back to `None`.
    pub state_map: Option<StateMap>,
}

impl Event {
    /// Decode a PDU, deriving the event id from its reference hash.
    pub fn from_canonical_object(
        pdu: CanonicalJsonObject,
        room_version: RoomVersion,
        signing: &SigningService,
    ) -> Result<Self> {
        let event_id = signing.event_id(&pdu, &room_version)?;
        Self::with_event_id(event_id, pdu, room_version)
    }

    /// Decode a PDU whose event id is already known.
    pub fn with_event_id(
        event_id: OwnedEventId,
        pdu: CanonicalJsonObject,
        room_version: RoomVersion,
    ) -> Result<Self> {
        let kind = TimelineEventType::from(required_str(&pdu, "type")?);

        let room_id = RoomId::parse(required_str(&pdu, "room_id")?)
            .map_err(|e| Error::MalformedPdu(format!("bad room_id: {e}")))?;

        let sender = UserId::parse(required_str(&pdu, "sender")?)
            .map_err(|e| Error::MalformedPdu(format!("bad sender: {e}")))?;

        let depth = required_int(&pdu, "depth")?;
        let depth = u64::try_from(depth)
            .map_err(|_| Error::MalformedPdu("negative depth".to_owned()))?;

        let origin_server_ts = required_int(&pdu, "origin_server_ts")?;
        let origin_server_ts = UInt::try_from(origin_server_ts)
            .map_err(|_| Error::MalformedPdu("negative origin_server_ts".to_owned()))?;

        let auth_events = required_id_list(&pdu, "auth_events")?;
        let prev_events = required_id_list(&pdu, "prev_events")?;

        let state_key = match pdu.get("state_key") {
            None => None,
            Some(CanonicalJsonValue::String(s)) => Some(s.clone()),
            Some(_) => {
                return Err(Error::MalformedPdu("state_key is not a string".to_owned()));
            }
        };

        Ok(Self {
            event_id,
            room_id,
            kind,
            state_key,
            sender,
            depth,
            auth_events,
            prev_events,
            origin_server_ts: MilliSecondsSinceUnixEpoch(origin_server_ts),
            room_version,
            json: pdu,
            state_map: None,
        })
    }

    /// Event content as an object, when present and well-shaped.
    pub fn content(&self) -> Option<&CanonicalJsonObject> {
        match self.json.get("content") {
            Some(CanonicalJsonValue::Object(object)) => Some(object),
            _ => None,
        }
    }

    pub fn content_field(&self, key: &str) -> Option<&CanonicalJsonValue> {
        self.content()?.get(key)
    }

    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content_field(key)?.as_str()
    }

    /// Membership of an m.room.member event.
    pub fn membership(&self) -> Option<MembershipState> {
        self.content_str("membership").map(MembershipState::from)
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// State entry key of this event, when it is a state event.
    pub fn state_pair(&self) -> Option<StateKey> {
        let state_key = self.state_key.clone()?;
        Some((self.state_event_type(), state_key))
    }

    pub fn state_event_type(&self) -> StateEventType {
        StateEventType::from(self.kind.to_string().as_str())
    }
}

/// Verify signatures and content hash of an inbound PDU, then decode it.
///
/// A valid signature with a mismatched content hash keeps the event but
/// replaces its JSON with the pruned form; the event stays usable for
/// state. A bad signature drops the event.
pub fn check_event_sig_and_hash(
    signing: &SigningService,
    pdu: CanonicalJsonObject,
    room_version: RoomVersion,
) -> Result<Event> {
    let event_id = signing.event_id(&pdu, &room_version)?;
    match signing.verify_event(&pdu, &room_version) {
        Ok(Verified::All) => Event::with_event_id(event_id, pdu, room_version),
        Ok(Verified::Signatures) => {
            warn!(event_id = %event_id, "content hash mismatch, keeping pruned event");
            let pruned = signing.prune_event(pdu, &room_version)?;
            Event::with_event_id(event_id, pruned, room_version)
        }
        Err(e) => {
            warn!(event_id = %event_id, error = %e, "dropping event with bad signature");
            Err(Error::InvalidSignature(event_id))
        }
    }
}

/// Serialize any value into a canonical-JSON object.
pub fn to_canonical_object<T: serde::Serialize>(value: &T) -> Result<CanonicalJsonObject> {
    let json = serde_json::to_value(value)?;
    match CanonicalJsonValue::try_from(json) {
        Ok(CanonicalJsonValue::Object(object)) => Ok(object),
        Ok(_) => Err(Error::Internal("value is not a JSON object".to_owned())),
        Err(e) => Err(Error::MalformedPdu(format!("not canonical JSON: {e}"))),
    }
}

fn required_str<'a>(pdu: &'a CanonicalJsonObject, field: &str) -> Result<&'a str> {
    pdu.get(field)
        .and_then(CanonicalJsonValue::as_str)
        .ok_or_else(|| Error::MalformedPdu(format!("missing or malformed field {field}")))
}

fn required_int(pdu: &CanonicalJsonObject, field: &str) -> Result<i64> {
    pdu.get(field)
        .and_then(CanonicalJsonValue::as_integer)
        .map(i64::from)
        .ok_or_else(|| Error::MalformedPdu(format!("missing or malformed field {field}")))
}

fn required_id_list(pdu: &CanonicalJsonObject, field: &str) -> Result<Vec<OwnedEventId>> {
    let values = match pdu.get(field) {
        Some(CanonicalJsonValue::Array(values)) => values,
        _ => {
            return Err(Error::MalformedPdu(format!("missing or malformed field {field}")));
        }
    };
    values
        .iter()
        .map(|value| {
            let id = value
                .as_str()
                .ok_or_else(|| Error::MalformedPdu(format!("non-string entry in {field}")))?;
            OwnedEventId::try_from(id)
                .map_err(|e| Error::MalformedPdu(format!("bad event id in {field}: {e}")))
        })
        .collect()
}
