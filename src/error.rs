//! Error types for the Matrixon bridge engine.
//!
//! One enum covers the whole taxonomy: lookup failures, protocol-level
//! rejections, authorisation denials, transport problems and the few
//! actor-terminal conditions. Room actor handlers run under an error
//! boundary: a failed handler replies with its error and leaves the
//! room data untouched.

use ruma::{OwnedEventId, OwnedRoomId};
use thiserror::Error;

/// Bridge error types
#[derive(Debug, Error)]
pub enum Error {
    /// The registry has no actor for this room
    #[error("Room not found: {0}")]
    RoomNotFound(OwnedRoomId),

    /// The room DAG has no event with this id
    #[error("Event not found: {0}")]
    EventNotFound(OwnedEventId),

    /// Signature verification failed for this event
    #[error("Invalid signature on event {0}")]
    InvalidSignature(OwnedEventId),

    /// Content hash did not match; the event was pruned
    #[error("Mismatched content hash on event {0}")]
    MismatchedContentHash(OwnedEventId),

    /// Event carries a room id different from the actor's room
    #[error("Event {0} belongs to room {1}, expected {2}")]
    MismatchedRoomId(OwnedEventId, OwnedRoomId, OwnedRoomId),

    /// A state operation was attempted on an event without a state key
    #[error("State event {0} is missing its state key")]
    MissedStateKey(OwnedEventId),

    /// The event is known but has no materialised state map yet
    #[error("Event {0} has no materialised state map")]
    MissedStateMap(OwnedEventId),

    /// A referenced previous event is not in the DAG
    #[error("Missing previous event {0}")]
    MissedPrevEvent(OwnedEventId),

    /// A referenced event is not known at all
    #[error("Unknown event {0}")]
    UnknownEvent(OwnedEventId),

    /// The auth-events graph contains a cycle
    #[error("Loop in auth chain")]
    LoopInAuthChain,

    /// The event failed the authorisation rules
    #[error("Event {0} failed authorisation")]
    EventAuthError(OwnedEventId),

    /// make_join for a user that is not invited to the room
    #[error("User is not invited to this room")]
    NotInvited,

    /// Room version outside the supported set
    #[error("Incompatible room version: {0}")]
    IncompatibleVersion(String),

    /// Generic authorisation refusal
    #[error("Operation not allowed")]
    NotAllowed,

    /// A PDU is missing a required field or a field has the wrong kind
    #[error("Malformed PDU: {0}")]
    MalformedPdu(String),

    /// Transport-level federation failure
    #[error("Federation request failed: {0}")]
    Federation(String),

    /// Remote server answered with a non-200 status
    #[error("Remote returned status {0}: {1}")]
    RemoteStatus(u16, String),

    /// Federation request timed out
    #[error("Operation timed out")]
    Timeout,

    /// Signing, hashing or canonical-JSON failure
    #[error("Signing error: {0}")]
    Signing(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, Error>;
