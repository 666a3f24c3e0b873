// =============================================================================
// Matrixon Bridge - Room Actor Integration Tests
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
//   End-to-end tests driving room actors against a scripted federation
//   transport and a recording gateway: direct-chat seeding, the
//   make_join/send_join boot, message projection both ways, and the
//   same-txn-id retry discipline for outbound transactions.
//
// =============================================================================

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use matrixon_bridge::{
    config::Config,
    engine::Engine,
    federation::{FederationClient, FederationResponse, Method},
    gateway::{Gateway, Jid},
    pdu::Event,
    room_version::{RoomVersion, V11},
    signing::SigningService,
    Error,
};
use ruma::{
    server_name, user_id, CanonicalJsonObject, CanonicalJsonValue, OwnedEventId, OwnedRoomId,
    OwnedUserId, RoomId, ServerName,
};
use serde_json::{json, Value as JsonValue};

#[derive(Debug, Clone)]
struct RecordedRequest {
    destination: String,
    method: String,
    path: String,
    body: Option<JsonValue>,
}

/// Scripted federation transport: canned responses per endpoint, a status
/// queue for /send, and a full request log.
#[derive(Default)]
struct MockFederation {
    requests: Mutex<Vec<RecordedRequest>>,
    send_statuses: Mutex<VecDeque<u16>>,
    make_join_response: Mutex<Option<JsonValue>>,
    send_join_response: Mutex<Option<JsonValue>>,
}

impl MockFederation {
    fn recorded(&self, path_fragment: &str) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.path.contains(path_fragment))
            .cloned()
            .collect()
    }

    fn push_send_status(&self, status: u16) {
        self.send_statuses.lock().unwrap().push_back(status);
    }
}

#[async_trait]
impl FederationClient for MockFederation {
    async fn send_request(
        &self,
        destination: &ServerName,
        method: Method,
        path: &str,
        _query: &[(String, String)],
        body: Option<JsonValue>,
        _timeout: Duration,
    ) -> matrixon_bridge::Result<FederationResponse> {
        self.requests.lock().unwrap().push(RecordedRequest {
            destination: destination.to_string(),
            method: method.to_string(),
            path: path.to_owned(),
            body: body.clone(),
        });

        if path.contains("/make_join/") {
            let body = self
                .make_join_response
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| Error::Federation("no make_join script".to_owned()))?;
            return Ok(FederationResponse { status: 200, body });
        }
        if path.contains("/send_join/") {
            let body = self
                .send_join_response
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| Error::Federation("no send_join script".to_owned()))?;
            return Ok(FederationResponse { status: 200, body });
        }
        if path.contains("/get_missing_events/") {
            return Ok(FederationResponse { status: 200, body: json!({ "events": [] }) });
        }
        if path.contains("/send/") {
            let status = self
                .send_statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(200);
            return Ok(FederationResponse { status, body: json!({}) });
        }
        Ok(FederationResponse { status: 200, body: json!({}) })
    }
}

#[derive(Default)]
struct RecordingGateway {
    messages: Mutex<Vec<(String, String, String, String)>>,
}

#[async_trait]
impl Gateway for RecordingGateway {
    async fn deliver_message(&self, to: &Jid, from: &Jid, room_id: &RoomId, body: &str) {
        self.messages.lock().unwrap().push((
            to.to_string(),
            from.to_string(),
            room_id.to_string(),
            body.to_owned(),
        ));
    }
}

struct TestWorld {
    engine: Arc<Engine>,
    federation: Arc<MockFederation>,
    gateway: Arc<RecordingGateway>,
}

fn build_world() -> TestWorld {
    let config = Config::new(
        server_name!("matrix.example.com").to_owned(),
        "example.com",
        "matrix.example.com",
    );
    let signing =
        Arc::new(SigningService::new(server_name!("matrix.example.com").to_owned(), "test").unwrap());
    let federation = Arc::new(MockFederation::default());
    let gateway = Arc::new(RecordingGateway::default());
    let engine = Engine::new(config, signing, federation.clone(), gateway.clone());
    TestWorld { engine, federation, gateway }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    // Virtual time: generous headroom over the 30s transaction retry.
    for _ in 0..600 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    panic!("condition not reached in time");
}

fn canonical(value: JsonValue) -> CanonicalJsonObject {
    match CanonicalJsonValue::try_from(value).unwrap() {
        CanonicalJsonValue::Object(object) => object,
        _ => unreachable!(),
    }
}

/// Build and sign a remote PDU, returning its id and wire JSON.
fn signed_pdu(
    signing: &SigningService,
    room_id: &RoomId,
    kind: &str,
    sender: &str,
    state_key: Option<&str>,
    content: JsonValue,
    depth: u64,
    ts: u64,
    auth: &[&OwnedEventId],
    prev: &[&OwnedEventId],
) -> (OwnedEventId, JsonValue) {
    let mut value = json!({
        "type": kind,
        "room_id": room_id.as_str(),
        "sender": sender,
        "origin": signing.server_name().as_str(),
        "origin_server_ts": ts,
        "depth": depth,
        "auth_events": auth.iter().map(|id| id.as_str()).collect::<Vec<_>>(),
        "prev_events": prev.iter().map(|id| id.as_str()).collect::<Vec<_>>(),
        "content": content,
    });
    if let Some(state_key) = state_key {
        value["state_key"] = json!(state_key);
    }
    let mut pdu = canonical(value);
    signing.sign_event(&mut pdu, &V11).unwrap();
    let event_id = signing.event_id(&pdu, &V11).unwrap();
    (event_id, serde_json::to_value(&pdu).unwrap())
}

/// Unsigned event for direct actor intake (resolve_auth_store_event does
/// not re-verify signatures).
fn unsigned_event(
    id: &str,
    room_id: &RoomId,
    kind: &str,
    sender: &str,
    state_key: Option<&str>,
    content: JsonValue,
    depth: u64,
    ts: u64,
    auth: &[OwnedEventId],
    prev: &[OwnedEventId],
) -> Event {
    let mut value = json!({
        "type": kind,
        "room_id": room_id.as_str(),
        "sender": sender,
        "origin_server_ts": ts,
        "depth": depth,
        "auth_events": auth.iter().map(|a| a.as_str()).collect::<Vec<_>>(),
        "prev_events": prev.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
        "content": content,
    });
    if let Some(state_key) = state_key {
        value["state_key"] = json!(state_key);
    }
    Event::with_event_id(
        OwnedEventId::try_from(format!("${id}")).unwrap(),
        canonical(value),
        V11,
    )
    .unwrap()
}

/// Drive a direct-chat creation to completion and return the room.
async fn created_direct_room(world: &TestWorld) -> (OwnedRoomId, matrixon_bridge::RoomHandle) {
    let alice = Jid::new("alice", "example.com");
    let bob = user_id!("@bob:remote.example").to_owned();
    let (room_id, handle) = world.engine.create_direct_room(alice, bob).unwrap();

    // Seeding is done once the invite has gone out to bob's server.
    let federation = world.federation.clone();
    wait_until(move || !federation.recorded("/invite/").is_empty()).await;
    (room_id, handle)
}

async fn leaf_event(handle: &matrixon_bridge::RoomHandle) -> Arc<Event> {
    let leaves = handle.get_latest_events().await.unwrap();
    assert_eq!(leaves.len(), 1, "expected a linear DAG head");
    let leaf_id = leaves.into_iter().next().unwrap();
    handle.find_event(leaf_id).await.unwrap().unwrap()
}

fn state_id(event: &Event, kind: &str, state_key: &str) -> OwnedEventId {
    event
        .state_map
        .as_ref()
        .unwrap()
        .get(&(kind.into(), state_key.to_owned()))
        .unwrap_or_else(|| panic!("missing state entry {kind} {state_key}"))
        .clone()
}

#[tokio::test(start_paused = true)]
async fn test_direct_chat_seed_sequence() {
    let world = build_world();
    let (room_id, handle) = created_direct_room(&world).await;

    let leaf = leaf_event(&handle).await;
    let state_map = leaf.state_map.as_ref().unwrap();
    assert_eq!(state_map.len(), 7, "seed produces seven state entries");

    // The invite is the DAG head and carries the full seeded state.
    assert_eq!(leaf.kind.to_string(), "m.room.member");
    assert_eq!(leaf.state_key.as_deref(), Some("@bob:remote.example"));

    for (kind, state_key) in [
        ("m.room.create", ""),
        ("m.room.member", "@alice:matrix.example.com"),
        ("m.room.power_levels", ""),
        ("m.room.join_rules", ""),
        ("m.room.history_visibility", ""),
        ("m.room.guest_access", ""),
        ("m.room.member", "@bob:remote.example"),
    ] {
        state_id(&leaf, kind, state_key);
    }

    // The invite RPC carried the stripped state and the room version.
    let invites = world.federation.recorded("/invite/");
    assert_eq!(invites.len(), 1);
    let invite = &invites[0];
    assert_eq!(invite.destination, "remote.example");
    assert_eq!(invite.method, "PUT");
    let body = invite.body.as_ref().unwrap();
    assert_eq!(body["room_version"], json!("11"));
    let stripped = body["invite_room_state"].as_array().unwrap();
    assert_eq!(stripped.len(), 3);

    // Depth grows along the seed chain and the room id is everywhere.
    assert_eq!(leaf.depth, 7);
    assert_eq!(leaf.room_id, room_id);
}

#[tokio::test(start_paused = true)]
async fn test_make_join_for_invited_user() {
    let world = build_world();
    let (_room_id, handle) = created_direct_room(&world).await;

    // Wrong version parameter is refused outright.
    let result = handle
        .make_join(
            user_id!("@bob:remote.example").to_owned(),
            vec![("ver".to_owned(), "4".to_owned())],
        )
        .await;
    assert!(matches!(result, Err(Error::IncompatibleVersion(_))));

    // The invited user gets a template.
    let response = handle
        .make_join(
            user_id!("@bob:remote.example").to_owned(),
            vec![("ver".to_owned(), "11".to_owned())],
        )
        .await
        .unwrap();
    assert_eq!(response["room_version"], json!("11"));
    let event = &response["event"];
    assert_eq!(event["type"], json!("m.room.member"));
    assert_eq!(event["state_key"], json!("@bob:remote.example"));
    assert_eq!(event["content"]["membership"], json!("join"));
    assert!(event["auth_events"].as_array().unwrap().len() >= 3);

    // A stranger is not invited.
    let result = handle
        .make_join(
            user_id!("@carol:elsewhere.example").to_owned(),
            vec![("ver".to_owned(), "11".to_owned())],
        )
        .await;
    assert!(matches!(result, Err(Error::NotInvited)));
}

/// Let bob join the already-created direct chat through the actor's
/// external-event intake.
async fn join_bob(handle: &matrixon_bridge::RoomHandle, room_id: &RoomId) -> Arc<Event> {
    let leaf = leaf_event(handle).await;
    let join = unsigned_event(
        "bobjoin",
        room_id,
        "m.room.member",
        "@bob:remote.example",
        Some("@bob:remote.example"),
        json!({ "membership": "join" }),
        leaf.depth + 1,
        1_700_000_100_000,
        &[
            state_id(&leaf, "m.room.create", ""),
            state_id(&leaf, "m.room.power_levels", ""),
            state_id(&leaf, "m.room.join_rules", ""),
            state_id(&leaf, "m.room.member", "@bob:remote.example"),
        ],
        &[leaf.event_id.clone()],
    );
    handle.resolve_auth_store_event(join).await.unwrap();
    leaf_event(handle).await
}

#[tokio::test(start_paused = true)]
async fn test_remote_join_and_inbound_message_delivery() {
    let world = build_world();
    let (room_id, handle) = created_direct_room(&world).await;
    let join_leaf = join_bob(&handle, &room_id).await;
    assert_eq!(join_leaf.state_key.as_deref(), Some("@bob:remote.example"));
    // A state event's own state map points back at the event itself.
    assert_eq!(
        state_id(&join_leaf, "m.room.member", "@bob:remote.example"),
        join_leaf.event_id
    );

    // A text message from bob reaches the gateway, addressed to alice,
    // from bob's mapped service jid.
    let message = unsigned_event(
        "bobmsg",
        &room_id,
        "m.room.message",
        "@bob:remote.example",
        None,
        json!({ "msgtype": "m.text", "body": "hello alice" }),
        join_leaf.depth + 1,
        1_700_000_200_000,
        &[
            state_id(&join_leaf, "m.room.create", ""),
            state_id(&join_leaf, "m.room.power_levels", ""),
            state_id(&join_leaf, "m.room.member", "@bob:remote.example"),
        ],
        &[join_leaf.event_id.clone()],
    );
    handle.resolve_auth_store_event(message).await.unwrap();

    let gateway = world.gateway.clone();
    wait_until(move || !gateway.messages.lock().unwrap().is_empty()).await;
    let messages = world.gateway.messages.lock().unwrap().clone();
    let (to, from, message_room, body) = &messages[0];
    assert_eq!(to, "alice@example.com");
    assert_eq!(from, "bob%remote.example@matrix.example.com");
    assert_eq!(message_room, room_id.as_str());
    assert_eq!(body, "hello alice");
}

// S6: a failed transaction is retried after 30 seconds with the same
// txn id and the same PDU batch.
#[tokio::test(start_paused = true)]
async fn test_txn_resend_idempotency() {
    let world = build_world();
    let (room_id, handle) = created_direct_room(&world).await;
    join_bob(&handle, &room_id).await;

    // First attempt fails with a 500, the retry succeeds.
    world.federation.push_send_status(500);
    world.federation.push_send_status(200);

    handle.send_text("hello bob".to_owned()).unwrap();

    let federation = world.federation.clone();
    wait_until(move || federation.recorded("/send/").len() >= 2).await;
    let sends = world.federation.recorded("/send/");
    assert_eq!(sends.len(), 2);

    // Same txn id (same path) and byte-identical batch on the retry.
    assert_eq!(sends[0].path, sends[1].path);
    assert_eq!(sends[0].body, sends[1].body);
    assert_eq!(sends[0].destination, "remote.example");
    let pdus = sends[0].body.as_ref().unwrap()["pdus"].as_array().unwrap().clone();
    assert_eq!(pdus.len(), 1);
    assert_eq!(pdus[0]["content"]["body"], json!("hello bob"));

    // A second message after recovery opens a fresh transaction.
    handle.send_text("second".to_owned()).unwrap();
    let federation = world.federation.clone();
    wait_until(move || federation.recorded("/send/").len() >= 3).await;
    let sends = world.federation.recorded("/send/");
    assert_eq!(sends.len(), 3);
    assert_ne!(sends[1].path, sends[2].path);
}

// Property 7: the limit is clamped to [0, 20] and min_depth filters.
#[tokio::test(start_paused = true)]
async fn test_get_missing_events_window() {
    let world = build_world();
    let (room_id, handle) = created_direct_room(&world).await;
    let join_leaf = join_bob(&handle, &room_id).await;

    let latest = vec![join_leaf.event_id.clone()];

    // Remote that is not in the room sees nothing.
    let events = handle
        .get_missing_events(
            server_name!("elsewhere.example").to_owned(),
            Vec::new(),
            latest.clone(),
            10,
            0,
        )
        .await
        .unwrap();
    assert!(events.is_empty());

    // Joined remote walks the seed chain, oldest first.
    let events = handle
        .get_missing_events(
            server_name!("remote.example").to_owned(),
            Vec::new(),
            latest.clone(),
            100,
            0,
        )
        .await
        .unwrap();
    assert!(!events.is_empty());
    assert!(events.len() <= 20);
    assert_eq!(events[0]["type"], json!("m.room.create"));

    // Negative limit means nothing; min_depth cuts the walk.
    let events = handle
        .get_missing_events(
            server_name!("remote.example").to_owned(),
            Vec::new(),
            latest.clone(),
            -3,
            0,
        )
        .await
        .unwrap();
    assert!(events.is_empty());

    let events = handle
        .get_missing_events(
            server_name!("remote.example").to_owned(),
            Vec::new(),
            latest,
            100,
            6,
        )
        .await
        .unwrap();
    for event in &events {
        assert!(event["depth"].as_u64().unwrap() >= 6);
    }
}

#[tokio::test(start_paused = true)]
async fn test_get_state_ids_requires_membership() {
    let world = build_world();
    let (room_id, handle) = created_direct_room(&world).await;
    let join_leaf = join_bob(&handle, &room_id).await;

    let result = handle
        .get_state_ids(
            server_name!("elsewhere.example").to_owned(),
            join_leaf.event_id.clone(),
        )
        .await;
    assert!(matches!(result, Err(Error::NotAllowed)));

    let (auth_chain, pdu_ids) = handle
        .get_state_ids(
            server_name!("remote.example").to_owned(),
            join_leaf.event_id.clone(),
        )
        .await
        .unwrap();
    // State before bob's join: the seven seeded entries.
    assert_eq!(pdu_ids.len(), 7);
    assert!(!auth_chain.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_outbound_join_handshake_boot() {
    let world = build_world();

    // The remote side of the federation: its own signing identity, known
    // to our engine after key exchange.
    let remote_signing =
        SigningService::new(server_name!("remote.example").to_owned(), "remote").unwrap();
    let (key_id, key) = remote_signing.public_key();
    world
        .engine
        .signing
        .add_verify_key(server_name!("remote.example"), key_id, key);

    let room_id = RoomId::parse("!remoteroom:remote.example").unwrap();

    // Remote room history: create, creator join, power levels, public
    // join rules.
    let (create_id, create) = signed_pdu(
        &remote_signing, &room_id, "m.room.create", "@bob:remote.example", Some(""),
        json!({ "room_version": "11" }), 1, 1_000, &[], &[],
    );
    let (bob_id, bob) = signed_pdu(
        &remote_signing, &room_id, "m.room.member", "@bob:remote.example",
        Some("@bob:remote.example"), json!({ "membership": "join" }),
        2, 2_000, &[&create_id], &[&create_id],
    );
    let (power_id, power) = signed_pdu(
        &remote_signing, &room_id, "m.room.power_levels", "@bob:remote.example", Some(""),
        json!({
            "users": { "@bob:remote.example": 100 },
            "users_default": 0, "events_default": 0, "state_default": 50,
            "ban": 50, "kick": 50, "redact": 50, "invite": 0, "events": {},
        }),
        3, 3_000, &[&create_id, &bob_id], &[&bob_id],
    );
    let (rules_id, rules) = signed_pdu(
        &remote_signing, &room_id, "m.room.join_rules", "@bob:remote.example", Some(""),
        json!({ "join_rule": "public" }),
        4, 4_000, &[&create_id, &bob_id, &power_id], &[&power_id],
    );

    let alice_id: OwnedUserId = user_id!("@alice:matrix.example.com").to_owned();
    let template = json!({
        "type": "m.room.member",
        "room_id": room_id.as_str(),
        "sender": alice_id.as_str(),
        "state_key": alice_id.as_str(),
        "origin_server_ts": 5_000,
        "depth": 5,
        "auth_events": [create_id.as_str(), power_id.as_str(), rules_id.as_str()],
        "prev_events": [rules_id.as_str()],
        "content": { "membership": "join" },
    });
    *world.federation.make_join_response.lock().unwrap() = Some(json!({
        "room_version": "11",
        "event": template,
    }));
    *world.federation.send_join_response.lock().unwrap() = Some(json!({
        "state": [create, bob.clone(), power, rules],
        "auth_chain": [],
        "event": null,
    }));

    let handle = world
        .engine
        .join_remote_room(
            server_name!("remote.example").to_owned(),
            room_id.clone(),
            Jid::new("alice", "example.com"),
        )
        .unwrap();

    // The mailbox is FIFO, so this call resolves only after the join
    // handler (and boot) completed.
    let leaves = handle.get_latest_events().await.unwrap();
    assert_eq!(leaves.len(), 1, "boot must leave our join as the DAG head");

    let leaf = leaf_event(&handle).await;
    assert_eq!(leaf.kind.to_string(), "m.room.member");
    assert_eq!(leaf.state_key.as_deref(), Some(alice_id.as_str()));
    let state_map = leaf.state_map.as_ref().unwrap();
    assert_eq!(state_map.len(), 5);
    assert_eq!(
        state_map.get(&("m.room.create".into(), String::new())),
        Some(&create_id)
    );

    // The handshake went out in order and prefetched history afterwards.
    assert_eq!(world.federation.recorded("/make_join/").len(), 1);
    assert_eq!(world.federation.recorded("/send_join/").len(), 1);
    let federation = world.federation.clone();
    wait_until(move || !federation.recorded("/get_missing_events/").is_empty()).await;

    // Inbound message from bob now reaches the gateway.
    let message = unsigned_event(
        "welcome",
        &room_id,
        "m.room.message",
        "@bob:remote.example",
        None,
        json!({ "msgtype": "m.text", "body": "welcome!" }),
        leaf.depth + 1,
        6_000,
        &[create_id.clone(), power_id.clone(), bob_id.clone()],
        &[leaf.event_id.clone()],
    );
    handle.resolve_auth_store_event(message).await.unwrap();
    let gateway = world.gateway.clone();
    wait_until(move || !gateway.messages.lock().unwrap().is_empty()).await;
    let messages = world.gateway.messages.lock().unwrap().clone();
    assert_eq!(messages[0].3, "welcome!");
}

#[tokio::test(start_paused = true)]
async fn test_room_version_survives_handle_roundtrip() {
    let world = build_world();
    let (_room_id, handle) = created_direct_room(&world).await;
    let version: RoomVersion = handle.get_room_version().await.unwrap();
    assert_eq!(version.version, "11");
}
