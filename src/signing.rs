// =============================================================================
// Matrixon Bridge - Signing Module
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
//   The signing service: holds the process-wide Ed25519 server key and the
//   verify keys of remote servers, and wraps the ruma signature primitives
//   (hash_and_sign_event, verify_event, reference_hash, sign_json, redact)
//   behind bridge error types. Canonical JSON lives entirely in ruma; this
//   module never reimplements it.
//
// =============================================================================

use std::{collections::BTreeMap, sync::RwLock};

use ruma::{
    canonical_json::redact,
    serde::Base64,
    signatures::{self, Ed25519KeyPair, PublicKeyMap},
    CanonicalJsonObject, EventId, OwnedEventId, OwnedServerName, ServerName,
};
use tracing::debug;

use crate::{room_version::RoomVersion, Error, Result};

pub use ruma::signatures::Verified;

/// Process-wide signing state: our keypair plus the trusted verify keys of
/// remote servers. Key discovery is the embedder's concern; verified keys
/// are handed in through [`SigningService::add_verify_key`].
pub struct SigningService {
    server_name: OwnedServerName,
    keypair: Ed25519KeyPair,
    verify_keys: RwLock<PublicKeyMap>,
}

/// PKCS#8 v1 prefix for a raw Ed25519 seed.
const PKCS8_ED25519_PREFIX: [u8; 16] = [48, 46, 2, 1, 0, 48, 5, 6, 3, 43, 101, 112, 4, 34, 4, 32];

impl SigningService {
    /// Create a signing service with a freshly generated Ed25519 key.
    pub fn new(server_name: OwnedServerName, key_version: &str) -> Result<Self> {
        let mut seed = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut seed[..]);
        let document: Vec<u8> = PKCS8_ED25519_PREFIX
            .iter()
            .chain(seed.iter())
            .copied()
            .collect();
        Self::from_der(server_name, &document, key_version)
    }

    /// Create a signing service from a PKCS#8 DER document.
    pub fn from_der(server_name: OwnedServerName, document: &[u8], key_version: &str) -> Result<Self> {
        let keypair = Ed25519KeyPair::from_der(document, key_version.to_owned())
            .map_err(|e| Error::Signing(format!("failed to load keypair: {e}")))?;

        let service = Self {
            server_name,
            keypair,
            verify_keys: RwLock::new(BTreeMap::new()),
        };
        // Our own events must verify against our own key.
        let own_key = Base64::new(service.keypair.public_key().to_vec());
        let own_key_id = format!("ed25519:{}", service.keypair.version());
        let own_server = service.server_name.clone();
        service.add_verify_key(&own_server, own_key_id, own_key);
        debug!(server_name = %service.server_name, "signing service initialized");
        Ok(service)
    }

    pub fn server_name(&self) -> &ServerName {
        &self.server_name
    }

    /// Public part of our signing key, base64-encoded for key serving.
    pub fn public_key(&self) -> (String, Base64) {
        (
            format!("ed25519:{}", self.keypair.version()),
            Base64::new(self.keypair.public_key().to_vec()),
        )
    }

    /// Register a verify key for a remote server.
    pub fn add_verify_key(&self, server: &ServerName, key_id: String, key: Base64) {
        self.verify_keys
            .write()
            .expect("verify key map lock is never poisoned")
            .entry(server.as_str().to_owned())
            .or_default()
            .insert(key_id, key);
    }

    /// Compute content hash and signature over a PDU, in place.
    pub fn sign_event(&self, pdu: &mut CanonicalJsonObject, room_version: &RoomVersion) -> Result<()> {
        signatures::hash_and_sign_event(
            self.server_name.as_str(),
            &self.keypair,
            pdu,
            &room_version.id(),
        )
        .map_err(|e| Error::Signing(format!("failed to hash and sign event: {e}")))
    }

    /// Sign an arbitrary canonical-JSON object (request signing, invites).
    pub fn sign_json(&self, object: &mut CanonicalJsonObject) -> Result<()> {
        signatures::sign_json(self.server_name.as_str(), &self.keypair, object)
            .map_err(|e| Error::Signing(format!("failed to sign object: {e}")))
    }

    /// Derive the event id of a PDU from its reference hash.
    pub fn event_id(&self, pdu: &CanonicalJsonObject, room_version: &RoomVersion) -> Result<OwnedEventId> {
        let hash = signatures::reference_hash(pdu, &room_version.id())
            .map_err(|e| Error::Signing(format!("failed to compute reference hash: {e}")))?;
        EventId::parse(format!("${hash}"))
            .map_err(|e| Error::Signing(format!("reference hash is not a valid event id: {e}")))
    }

    /// Check signatures and content hash of a PDU against the trusted keys.
    ///
    /// `Verified::All` means both passed; `Verified::Signatures` means the
    /// signatures passed but the content hash did not, and the caller must
    /// fall back to the pruned event.
    pub fn verify_event(&self, pdu: &CanonicalJsonObject, room_version: &RoomVersion) -> Result<Verified> {
        let keys = self
            .verify_keys
            .read()
            .expect("verify key map lock is never poisoned");
        signatures::verify_event(&keys, pdu, &room_version.id())
            .map_err(|e| Error::Signing(format!("signature verification failed: {e}")))
    }

    /// Strip a PDU down to the fields protected by the reference hash.
    pub fn prune_event(&self, pdu: CanonicalJsonObject, room_version: &RoomVersion) -> Result<CanonicalJsonObject> {
        redact(pdu, &room_version.id(), None)
            .map_err(|e| Error::Signing(format!("failed to redact event: {e}")))
    }
}

impl std::fmt::Debug for SigningService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningService")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room_version::V11;
    use ruma::{server_name, CanonicalJsonValue};

    fn test_pdu() -> CanonicalJsonObject {
        let value = serde_json::json!({
            "type": "m.room.message",
            "room_id": "!test:example.com",
            "sender": "@alice:example.com",
            "origin_server_ts": 1_700_000_000_000u64,
            "depth": 5,
            "auth_events": [],
            "prev_events": [],
            "content": { "msgtype": "m.text", "body": "hello" },
        });
        match CanonicalJsonValue::try_from(value).unwrap() {
            CanonicalJsonValue::Object(object) => object,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_sign_and_verify_roundtrip() {
        let signing = SigningService::new(server_name!("example.com").to_owned(), "test").unwrap();
        let mut pdu = test_pdu();
        signing.sign_event(&mut pdu, &V11).unwrap();

        assert!(pdu.contains_key("hashes"));
        assert!(pdu.contains_key("signatures"));
        assert!(matches!(signing.verify_event(&pdu, &V11), Ok(Verified::All)));
    }

    #[test]
    fn test_signing_does_not_change_event_id() {
        let signing = SigningService::new(server_name!("example.com").to_owned(), "test").unwrap();
        let mut pdu = test_pdu();
        signing.sign_event(&mut pdu, &V11).unwrap();
        let id_signed = signing.event_id(&pdu, &V11).unwrap();

        let mut resigned = pdu.clone();
        resigned.remove("signatures");
        signing.sign_event(&mut resigned, &V11).unwrap();
        assert_eq!(signing.event_id(&resigned, &V11).unwrap(), id_signed);
    }

    #[test]
    fn test_tampered_content_fails_hash() {
        let signing = SigningService::new(server_name!("example.com").to_owned(), "test").unwrap();
        let mut pdu = test_pdu();
        signing.sign_event(&mut pdu, &V11).unwrap();

        let content = serde_json::json!({ "msgtype": "m.text", "body": "tampered" });
        pdu.insert(
            "content".to_owned(),
            CanonicalJsonValue::try_from(content).unwrap(),
        );
        assert!(matches!(
            signing.verify_event(&pdu, &V11),
            Ok(Verified::Signatures) | Err(_)
        ));
    }

    #[test]
    fn test_unknown_server_fails_verification() {
        let ours = SigningService::new(server_name!("example.com").to_owned(), "test").unwrap();
        let theirs = SigningService::new(server_name!("remote.example").to_owned(), "test").unwrap();

        let mut pdu = test_pdu();
        theirs.sign_event(&mut pdu, &V11).unwrap();
        assert!(ours.verify_event(&pdu, &V11).is_err());

        // After key exchange the same event verifies.
        let (key_id, key) = theirs.public_key();
        ours.add_verify_key(server_name!("remote.example"), key_id, key);
        assert!(matches!(ours.verify_event(&pdu, &V11), Ok(Verified::All)));
    }
}
