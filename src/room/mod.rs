// =============================================================================
// Matrixon Bridge - Room Actor Module
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
//   The per-room actor: a task owning the room DAG, fed by a single
//   command channel. Synchronous operations carry a oneshot reply; casts
//   fire and forget. Federation responses re-enter the mailbox as
//   messages, so ordering inside a room is exactly handler-completion
//   order. Outbound transactions keep a single in-flight request per
//   remote server with a 30-second same-txn-id retry.
//
// Features:
//   • Event intake: local origination, external batches, missing-event
//     prefetch
//   • make_join / send_join handshake (outbound join)
//   • Direct-chat room seeding
//   • get_missing_events / get_state_ids service for remote servers
//   • Client lifecycle state machine driving the gateway side
//
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use ruma::{
    events::{room::member::MembershipState, StateEventType, TimelineEventType},
    CanonicalJsonObject, CanonicalJsonValue, EventId, Int, MilliSecondsSinceUnixEpoch,
    OwnedEventId, OwnedRoomId, OwnedServerName, OwnedUserId, UserId,
};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::{
    auth::{check_event_auth, AuthState},
    dag::{simple_toposort, RoomDag, StoreOutcome},
    engine::Engine,
    federation::{encode_component, Method},
    gateway::{user_id_to_jid, Jid},
    pdu::{check_event_sig_and_hash, Event, StateMap, MAX_DEPTH},
    room_version::{RoomVersion, SUPPORTED_ROOM_VERSIONS},
    state_res::resolve_state_maps,
    Error, Result,
};

/// Client lifecycle of the local side of a direct chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Undefined,
    Established,
    Leave,
}

#[derive(Debug)]
enum Flow {
    Continue,
    Stop,
}

struct InflightTxn {
    txn_id: String,
    origin_server_ts: u64,
    events: Vec<Arc<Event>>,
}

#[derive(Default)]
struct OutgoingTxns {
    inflight: Option<InflightTxn>,
    queue: Vec<Arc<Event>>,
}

pub(crate) enum RoomCommand {
    GetRoomVersion(oneshot::Sender<RoomVersion>),
    FindEvent(OwnedEventId, oneshot::Sender<Option<Arc<Event>>>),
    GetEvent(OwnedEventId, oneshot::Sender<Result<Arc<Event>>>),
    PartitionMissedEvents(
        Vec<OwnedEventId>,
        oneshot::Sender<(Vec<OwnedEventId>, Vec<OwnedEventId>)>,
    ),
    PartitionEventsWithStatemap(
        Vec<OwnedEventId>,
        oneshot::Sender<(Vec<OwnedEventId>, Vec<OwnedEventId>)>,
    ),
    GetLatestEvents(oneshot::Sender<HashSet<OwnedEventId>>),
    AuthAndStoreExternalEvents(Vec<Event>, oneshot::Sender<Result<()>>),
    ResolveAuthStoreEvent(Box<Event>, oneshot::Sender<Result<()>>),
    GetMissingEvents {
        origin: OwnedServerName,
        earliest: Vec<OwnedEventId>,
        latest: Vec<OwnedEventId>,
        limit: i64,
        min_depth: u64,
        reply: oneshot::Sender<Vec<JsonValue>>,
    },
    GetStateIds {
        origin: OwnedServerName,
        event_id: OwnedEventId,
        reply: oneshot::Sender<Result<(Vec<OwnedEventId>, Vec<OwnedEventId>)>>,
    },
    MakeJoin {
        user_id: OwnedUserId,
        params: Vec<(String, String)>,
        reply: oneshot::Sender<Result<JsonValue>>,
    },
    Join {
        matrix_server: OwnedServerName,
        sender: Jid,
        user_id: OwnedUserId,
    },
    Create {
        local_user: Jid,
        local_user_id: OwnedUserId,
        remote_user_id: OwnedUserId,
    },
    AddEvent(CanonicalJsonObject),
    SendText {
        body: String,
    },
    UpdateClient,
    TxnResult {
        server: OwnedServerName,
        txn_id: String,
        success: bool,
    },
    ResendTxn(OwnedServerName),
    MissingEventsFetched {
        origin: OwnedServerName,
        events: Vec<CanonicalJsonObject>,
    },
}

/// Cheap, cloneable handle to one room actor.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    room_id: OwnedRoomId,
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &OwnedRoomId {
        &self.room_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn cast(&self, command: RoomCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| Error::RoomNotFound(self.room_id.clone()))
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cast(make(reply_tx))?;
        reply_rx
            .await
            .map_err(|_| Error::RoomNotFound(self.room_id.clone()))
    }

    pub async fn get_room_version(&self) -> Result<RoomVersion> {
        self.call(RoomCommand::GetRoomVersion).await
    }

    pub async fn find_event(&self, event_id: OwnedEventId) -> Result<Option<Arc<Event>>> {
        self.call(|reply| RoomCommand::FindEvent(event_id, reply)).await
    }

    pub async fn get_event(&self, event_id: OwnedEventId) -> Result<Arc<Event>> {
        self.call(|reply| RoomCommand::GetEvent(event_id, reply)).await?
    }

    pub async fn partition_missed_events(
        &self,
        ids: Vec<OwnedEventId>,
    ) -> Result<(Vec<OwnedEventId>, Vec<OwnedEventId>)> {
        self.call(|reply| RoomCommand::PartitionMissedEvents(ids, reply)).await
    }

    pub async fn partition_events_with_statemap(
        &self,
        ids: Vec<OwnedEventId>,
    ) -> Result<(Vec<OwnedEventId>, Vec<OwnedEventId>)> {
        self.call(|reply| RoomCommand::PartitionEventsWithStatemap(ids, reply)).await
    }

    pub async fn get_latest_events(&self) -> Result<HashSet<OwnedEventId>> {
        self.call(RoomCommand::GetLatestEvents).await
    }

    /// Topologically sort a batch by auth events, then authorise and store
    /// each. Aborts on the first failure.
    pub async fn auth_and_store_external_events(&self, events: Vec<Event>) -> Result<()> {
        self.call(|reply| RoomCommand::AuthAndStoreExternalEvents(events, reply)).await?
    }

    /// Materialise an event against its parents' state and store it.
    pub async fn resolve_auth_store_event(&self, event: Event) -> Result<()> {
        self.call(|reply| RoomCommand::ResolveAuthStoreEvent(Box::new(event), reply)).await?
    }

    pub async fn get_missing_events(
        &self,
        origin: OwnedServerName,
        earliest: Vec<OwnedEventId>,
        latest: Vec<OwnedEventId>,
        limit: i64,
        min_depth: u64,
    ) -> Result<Vec<JsonValue>> {
        self.call(|reply| RoomCommand::GetMissingEvents {
            origin,
            earliest,
            latest,
            limit,
            min_depth,
            reply,
        })
        .await
    }

    /// State ids at an event: `(auth_chain_ids, pdu_ids)`.
    pub async fn get_state_ids(
        &self,
        origin: OwnedServerName,
        event_id: OwnedEventId,
    ) -> Result<(Vec<OwnedEventId>, Vec<OwnedEventId>)> {
        self.call(|reply| RoomCommand::GetStateIds { origin, event_id, reply }).await?
    }

    /// Synthesise a join template for a remote user.
    pub async fn make_join(
        &self,
        user_id: OwnedUserId,
        params: Vec<(String, String)>,
    ) -> Result<JsonValue> {
        self.call(|reply| RoomCommand::MakeJoin { user_id, params, reply }).await?
    }

    /// Start the outbound make_join/send_join handshake.
    pub fn join(
        &self,
        matrix_server: OwnedServerName,
        sender: Jid,
        user_id: OwnedUserId,
    ) -> Result<()> {
        self.cast(RoomCommand::Join { matrix_server, sender, user_id })
    }

    /// Prime a fresh actor as a direct chat and emit the seed events.
    pub fn create(
        &self,
        local_user: Jid,
        local_user_id: OwnedUserId,
        remote_user_id: OwnedUserId,
    ) -> Result<()> {
        self.cast(RoomCommand::Create { local_user, local_user_id, remote_user_id })
    }

    /// Originate an event locally: fill, hash, sign, authorise, store.
    pub fn add_event(&self, partial: CanonicalJsonObject) -> Result<()> {
        self.cast(RoomCommand::AddEvent(partial))
    }

    /// Send a text message from the local user into the room.
    pub fn send_text(&self, body: String) -> Result<()> {
        self.cast(RoomCommand::SendText { body })
    }
}

pub(crate) struct RoomActor {
    engine: Arc<Engine>,
    room_id: OwnedRoomId,
    room_version: RoomVersion,
    dag: RoomDag,
    local_user: Option<Jid>,
    local_user_id: Option<OwnedUserId>,
    remote_user: Option<OwnedUserId>,
    client_state: ClientState,
    outgoing: HashMap<OwnedServerName, OutgoingTxns>,
    txn_counter: u64,
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomActor {
    pub(crate) fn spawn(engine: Arc<Engine>, room_id: OwnedRoomId) -> Result<RoomHandle> {
        let room_version = RoomVersion::from_version_str(&engine.config.default_room_version)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = RoomActor {
            engine,
            room_id: room_id.clone(),
            room_version,
            dag: RoomDag::new(),
            local_user: None,
            local_user_id: None,
            remote_user: None,
            client_state: ClientState::Undefined,
            outgoing: HashMap::new(),
            txn_counter: u64::from(MilliSecondsSinceUnixEpoch::now().get()),
            tx: tx.clone(),
        };
        tokio::spawn(actor.run(rx));
        Ok(RoomHandle { room_id, tx })
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RoomCommand>) {
        info!(room_id = %self.room_id, "🚀 room actor started");
        while let Some(command) = rx.recv().await {
            match self.handle(command).await {
                Flow::Continue => {}
                Flow::Stop => break,
            }
        }
        self.engine.registry.unregister_room(&self.room_id);
        if let (Some(local), Some(remote)) = (&self.local_user, &self.remote_user) {
            self.engine
                .registry
                .unregister_direct(&local.to_string(), remote);
        }
        info!(room_id = %self.room_id, "room actor terminated");
    }

    async fn handle(&mut self, command: RoomCommand) -> Flow {
        match command {
            RoomCommand::GetRoomVersion(reply) => {
                let _ = reply.send(self.room_version);
            }
            RoomCommand::FindEvent(event_id, reply) => {
                let _ = reply.send(self.dag.get(&event_id));
            }
            RoomCommand::GetEvent(event_id, reply) => {
                let result = self
                    .dag
                    .get(&event_id)
                    .ok_or(Error::EventNotFound(event_id));
                let _ = reply.send(result);
            }
            RoomCommand::PartitionMissedEvents(ids, reply) => {
                let _ = reply.send(self.dag.partition_missed_events(&ids));
            }
            RoomCommand::PartitionEventsWithStatemap(ids, reply) => {
                let _ = reply.send(self.dag.partition_events_with_statemap(&ids));
            }
            RoomCommand::GetLatestEvents(reply) => {
                let _ = reply.send(self.dag.latest_events().clone());
            }
            RoomCommand::AuthAndStoreExternalEvents(events, reply) => {
                let result = self.auth_and_store_external_events(events).await;
                let _ = reply.send(result);
                self.schedule_update_client();
            }
            RoomCommand::ResolveAuthStoreEvent(event, reply) => {
                let result = self.resolve_auth_store_event(*event).await;
                let _ = reply.send(result);
                self.schedule_update_client();
            }
            RoomCommand::GetMissingEvents { origin, earliest, latest, limit, min_depth, reply } => {
                let _ = reply.send(self.get_missing_events(&origin, &earliest, &latest, limit, min_depth));
            }
            RoomCommand::GetStateIds { origin, event_id, reply } => {
                let _ = reply.send(self.get_state_ids(&origin, &event_id));
            }
            RoomCommand::MakeJoin { user_id, params, reply } => {
                let _ = reply.send(self.make_join(&user_id, &params));
            }
            RoomCommand::Join { matrix_server, sender, user_id } => {
                if let Err(e) = self.handle_join(matrix_server, sender, user_id).await {
                    error!(room_id = %self.room_id, error = %e, "join handshake failed, terminating");
                    return Flow::Stop;
                }
            }
            RoomCommand::Create { local_user, local_user_id, remote_user_id } => {
                if let Err(e) = self.handle_create(local_user, local_user_id, remote_user_id).await {
                    error!(room_id = %self.room_id, error = %e, "room creation failed, terminating");
                    return Flow::Stop;
                }
            }
            RoomCommand::AddEvent(partial) => {
                if let Err(e) = self.add_local_event(partial).await {
                    warn!(room_id = %self.room_id, error = %e, "failed to add local event");
                }
            }
            RoomCommand::SendText { body } => {
                if let Err(e) = self.send_text(body).await {
                    warn!(room_id = %self.room_id, error = %e, "failed to send message");
                }
            }
            RoomCommand::UpdateClient => {
                return self.update_client();
            }
            RoomCommand::TxnResult { server, txn_id, success } => {
                self.handle_txn_result(server, txn_id, success);
            }
            RoomCommand::ResendTxn(server) => {
                self.dispatch_txn(&server);
            }
            RoomCommand::MissingEventsFetched { origin, events } => {
                self.handle_missing_events_fetched(origin, events).await;
            }
        }
        Flow::Continue
    }

    // ------------------------------------------------------------------
    // Event intake
    // ------------------------------------------------------------------

    /// Store a batch of external events: toposort by auth events, then
    /// authorise each against its own auth events and store it without a
    /// state map. Aborts on the first authorisation failure.
    async fn auth_and_store_external_events(&mut self, events: Vec<Event>) -> Result<()> {
        let arcs: Vec<Arc<Event>> = events.into_iter().map(Arc::new).collect();
        let sorted = simple_toposort(&arcs)?;
        for event in sorted {
            if event.room_id != self.room_id {
                return Err(Error::MismatchedRoomId(
                    event.event_id.clone(),
                    event.room_id.clone(),
                    self.room_id.clone(),
                ));
            }
            if self.dag.contains(&event.event_id) {
                continue;
            }

            let mut snapshot = AuthState::new();
            for auth_id in &event.auth_events {
                if let Some(auth_event) = self.dag.get(auth_id) {
                    if let Some(pair) = auth_event.state_pair() {
                        snapshot.entry(pair).or_insert(auth_event);
                    }
                }
            }
            if !check_event_auth(&event, &snapshot, self.engine.config.strict_auth) {
                return Err(Error::EventAuthError(event.event_id.clone()));
            }

            let stored = (*event).clone();
            if self.dag.store_event(stored) == StoreOutcome::Inserted {
                self.notify_event(&event).await;
            }
        }
        Ok(())
    }

    /// Materialise one event: resolve its parents' state maps, authorise
    /// against that state, stamp the resulting state map and store.
    async fn resolve_auth_store_event(&mut self, event: Event) -> Result<()> {
        if let Some(existing) = self.dag.get(&event.event_id) {
            if existing.state_map.is_some() {
                return Ok(());
            }
        }
        if event.room_id != self.room_id {
            return Err(Error::MismatchedRoomId(
                event.event_id.clone(),
                event.room_id.clone(),
                self.room_id.clone(),
            ));
        }

        let mut parent_maps = Vec::with_capacity(event.prev_events.len());
        for prev in &event.prev_events {
            let parent = self
                .dag
                .get(prev)
                .ok_or_else(|| Error::MissedPrevEvent(prev.clone()))?;
            let state_map = parent
                .state_map
                .clone()
                .ok_or_else(|| Error::MissedStateMap(prev.clone()))?;
            parent_maps.push(state_map);
        }
        let state_before = resolve_state_maps(&parent_maps, &|id| self.dag.get(id));

        let snapshot = self.materialise(&state_before);
        if !check_event_auth(&event, &snapshot, self.engine.config.strict_auth) {
            return Err(Error::EventAuthError(event.event_id.clone()));
        }

        let mut event = event;
        let mut state_map = state_before;
        if let Some(pair) = event.state_pair() {
            state_map.insert(pair, event.event_id.clone());
        }
        event.state_map = Some(state_map);

        let arc = Arc::new(event.clone());
        if self.dag.store_event(event) != StoreOutcome::Duplicate {
            self.notify_event(&arc).await;
        }
        Ok(())
    }

    /// Local origination: fill the skeleton, hash and sign, authorise
    /// against the current resolved state, then store materialised.
    async fn add_local_event(&mut self, partial: CanonicalJsonObject) -> Result<OwnedEventId> {
        let (mut pdu, state_before) = self.fill_event(partial)?;
        self.engine.signing.sign_event(&mut pdu, &self.room_version)?;
        let event = Event::from_canonical_object(pdu, self.room_version, &self.engine.signing)?;
        let event_id = event.event_id.clone();

        let snapshot = self.materialise(&state_before);
        if !check_event_auth(&event, &snapshot, self.engine.config.strict_auth) {
            return Err(Error::EventAuthError(event_id));
        }

        let mut event = event;
        let mut state_map = state_before;
        if let Some(pair) = event.state_pair() {
            state_map.insert(pair, event_id.clone());
        }
        event.state_map = Some(state_map);

        let arc = Arc::new(event.clone());
        if self.dag.store_event(event) != StoreOutcome::Duplicate {
            self.notify_event(&arc).await;
        }
        self.schedule_update_client();
        Ok(event_id)
    }

    async fn send_text(&mut self, body: String) -> Result<()> {
        let sender = self
            .local_user_id
            .clone()
            .ok_or_else(|| Error::Internal("room has no local user".to_owned()))?;
        let partial = pdu_skeleton(
            "m.room.message",
            sender.as_str(),
            None,
            serde_json::json!({ "msgtype": "m.text", "body": body }),
        )?;
        self.add_local_event(partial).await?;
        Ok(())
    }

    /// Stamp depth, parents, auth events, origin and timestamps onto a
    /// partial PDU. Returns the filled PDU and the resolved state it was
    /// built against.
    fn fill_event(&self, mut partial: CanonicalJsonObject) -> Result<(CanonicalJsonObject, StateMap)> {
        let latest: Vec<OwnedEventId> = self.dag.latest_events().iter().cloned().collect();
        let mut parents = Vec::with_capacity(latest.len());
        for id in &latest {
            let parent = self
                .dag
                .get(id)
                .ok_or_else(|| Error::UnknownEvent(id.clone()))?;
            parents.push(parent);
        }

        let depth = parents
            .iter()
            .map(|p| p.depth)
            .max()
            .unwrap_or(0)
            .saturating_add(1)
            .min(MAX_DEPTH);

        let mut parent_maps = Vec::with_capacity(parents.len());
        for parent in &parents {
            let state_map = parent
                .state_map
                .clone()
                .ok_or_else(|| Error::MissedStateMap(parent.event_id.clone()))?;
            parent_maps.push(state_map);
        }
        let state_map = resolve_state_maps(&parent_maps, &|id| self.dag.get(id));

        let mut auth_events: Vec<OwnedEventId> = Vec::new();
        for key in compute_event_auth_keys(&partial) {
            if let Some(id) = state_map.get(&key) {
                if !auth_events.contains(id) {
                    auth_events.push(id.clone());
                }
            }
        }

        let depth = Int::try_from(depth)
            .map_err(|_| Error::Internal("event depth out of range".to_owned()))?;
        let now = i64::try_from(u64::from(MilliSecondsSinceUnixEpoch::now().get()))
            .map_err(|_| Error::Internal("clock out of range".to_owned()))?;

        partial.insert("room_id".to_owned(), CanonicalJsonValue::String(self.room_id.as_str().to_owned()));
        partial.insert(
            "origin".to_owned(),
            CanonicalJsonValue::String(self.engine.config.server_name.as_str().to_owned()),
        );
        partial.insert(
            "origin_server_ts".to_owned(),
            CanonicalJsonValue::Integer(Int::try_from(now).expect("timestamp fits")),
        );
        partial.insert("depth".to_owned(), CanonicalJsonValue::Integer(depth));
        partial.insert(
            "prev_events".to_owned(),
            CanonicalJsonValue::Array(
                latest
                    .iter()
                    .map(|id| CanonicalJsonValue::String(id.as_str().to_owned()))
                    .collect(),
            ),
        );
        partial.insert(
            "auth_events".to_owned(),
            CanonicalJsonValue::Array(
                auth_events
                    .iter()
                    .map(|id| CanonicalJsonValue::String(id.as_str().to_owned()))
                    .collect(),
            ),
        );
        Ok((partial, state_map))
    }

    fn materialise(&self, state_map: &StateMap) -> AuthState {
        let mut snapshot = AuthState::new();
        for (key, id) in state_map {
            if let Some(event) = self.dag.get(id) {
                snapshot.insert(key.clone(), event);
            }
        }
        snapshot
    }

    fn current_state_map(&self) -> StateMap {
        let maps: Vec<StateMap> = self
            .dag
            .latest_events()
            .iter()
            .filter_map(|id| self.dag.get(id)?.state_map.clone())
            .collect();
        resolve_state_maps(&maps, &|id| self.dag.get(id))
    }

    // ------------------------------------------------------------------
    // Federation service handlers (we are the remote's peer)
    // ------------------------------------------------------------------

    fn get_missing_events(
        &self,
        origin: &OwnedServerName,
        earliest: &[OwnedEventId],
        latest: &[OwnedEventId],
        limit: i64,
        min_depth: u64,
    ) -> Vec<JsonValue> {
        if !self.dag.is_server_joined(origin) {
            debug!(%origin, "get_missing_events from a server that is not joined");
            return Vec::new();
        }
        let limit = limit.clamp(0, 20) as usize;
        let earliest: HashSet<&OwnedEventId> = earliest.iter().collect();
        let mut seen: HashSet<OwnedEventId> = latest.iter().cloned().collect();
        let mut queue: VecDeque<OwnedEventId> = latest.iter().cloned().collect();
        let mut found: Vec<Arc<Event>> = Vec::new();

        'outer: while let Some(id) = queue.pop_front() {
            let Some(event) = self.dag.get(&id) else { continue };
            for prev in &event.prev_events {
                if earliest.contains(prev) || !seen.insert(prev.clone()) {
                    continue;
                }
                let Some(parent) = self.dag.get(prev) else { continue };
                if parent.depth < min_depth {
                    continue;
                }
                found.push(parent);
                queue.push_back(prev.clone());
                if found.len() >= limit {
                    break 'outer;
                }
            }
        }

        // Oldest first, as the remote will replay them forward.
        found.reverse();
        found
            .iter()
            .filter_map(|event| serde_json::to_value(&event.json).ok())
            .collect()
    }

    fn get_state_ids(
        &self,
        origin: &OwnedServerName,
        event_id: &EventId,
    ) -> Result<(Vec<OwnedEventId>, Vec<OwnedEventId>)> {
        if !self.dag.is_server_joined(origin) {
            return Err(Error::NotAllowed);
        }
        let event = self
            .dag
            .get(event_id)
            .ok_or_else(|| Error::EventNotFound(event_id.to_owned()))?;
        let state_map = self.dag.prev_state_map(&event)?;
        let pdu_ids: Vec<OwnedEventId> = state_map.values().cloned().collect();
        let auth_chain = self.dag.auth_chain(&pdu_ids);
        Ok((auth_chain, pdu_ids))
    }

    fn make_join(&self, user_id: &UserId, params: &[(String, String)]) -> Result<JsonValue> {
        let compatible = params
            .iter()
            .any(|(key, value)| key == "ver" && value == self.room_version.version);
        if !compatible {
            return Err(Error::IncompatibleVersion(self.room_version.version.to_owned()));
        }

        let partial = pdu_skeleton(
            "m.room.member",
            user_id.as_str(),
            Some(user_id.as_str()),
            serde_json::json!({ "membership": "join" }),
        )?;
        let (pdu, state_before) = self.fill_event(partial)?;
        let event = Event::from_canonical_object(pdu.clone(), self.room_version, &self.engine.signing)?;

        let snapshot = self.materialise(&state_before);
        if !check_event_auth(&event, &snapshot, self.engine.config.strict_auth) {
            return Err(Error::NotInvited);
        }

        Ok(serde_json::json!({
            "event": serde_json::to_value(&pdu)?,
            "room_version": self.room_version.version,
        }))
    }

    // ------------------------------------------------------------------
    // Outbound join handshake and boot
    // ------------------------------------------------------------------

    async fn handle_join(
        &mut self,
        matrix_server: OwnedServerName,
        sender: Jid,
        user_id: OwnedUserId,
    ) -> Result<()> {
        self.local_user = Some(sender);
        self.local_user_id = Some(user_id.clone());
        info!(room_id = %self.room_id, via = %matrix_server, user = %user_id, "joining remote room");

        // Deliberate warm-up so the remote directory has seen the room.
        tokio::time::sleep(self.engine.config.join_delay()).await;

        let path = format!(
            "/_matrix/federation/v1/make_join/{}/{}",
            encode_component(self.room_id.as_str()),
            encode_component(user_id.as_str()),
        );
        let query: Vec<(String, String)> = SUPPORTED_ROOM_VERSIONS
            .iter()
            .map(|version| ("ver".to_owned(), (*version).to_owned()))
            .collect();
        let response = self
            .engine
            .federation
            .send_request(
                &matrix_server,
                Method::Get,
                &path,
                &query,
                None,
                self.engine.config.federation_timeout(),
            )
            .await?;
        if !response.is_ok() {
            return Err(Error::RemoteStatus(response.status, "make_join refused".to_owned()));
        }

        let version = response.body["room_version"].as_str().unwrap_or("1");
        self.room_version = RoomVersion::from_version_str(version)?;

        let mut join_pdu = canonical_object(response.body["event"].clone())
            .ok_or_else(|| Error::MalformedPdu("make_join template is not an object".to_owned()))?;
        let now = u64::from(MilliSecondsSinceUnixEpoch::now().get());
        join_pdu.insert(
            "origin".to_owned(),
            CanonicalJsonValue::String(self.engine.config.server_name.as_str().to_owned()),
        );
        join_pdu.insert(
            "origin_server_ts".to_owned(),
            CanonicalJsonValue::Integer(
                Int::try_from(now).map_err(|_| Error::Internal("clock out of range".to_owned()))?,
            ),
        );
        self.engine.signing.sign_event(&mut join_pdu, &self.room_version)?;
        let join_event_id = self.engine.signing.event_id(&join_pdu, &self.room_version)?;

        let path = format!(
            "/_matrix/federation/v2/send_join/{}/{}",
            encode_component(self.room_id.as_str()),
            encode_component(join_event_id.as_str()),
        );
        let response = self
            .engine
            .federation
            .send_request(
                &matrix_server,
                Method::Put,
                &path,
                &[],
                Some(serde_json::to_value(&join_pdu)?),
                self.engine.config.missing_events_timeout(),
            )
            .await?;
        if !response.is_ok() {
            return Err(Error::RemoteStatus(response.status, "send_join refused".to_owned()));
        }

        self.boot_from_send_join(matrix_server, join_pdu, join_event_id, response.body)
            .await
    }

    /// Process a send_join response: store the remote state and auth chain
    /// as external events, verify and materialise our join, then prefetch
    /// recent history.
    async fn boot_from_send_join(
        &mut self,
        origin: OwnedServerName,
        join_pdu: CanonicalJsonObject,
        join_event_id: OwnedEventId,
        body: JsonValue,
    ) -> Result<()> {
        let auth_chain = decode_pdu_list(&body["auth_chain"], self.room_version, &self.engine);
        let state_events = decode_pdu_list(&body["state"], self.room_version, &self.engine);

        let mut state_map = StateMap::new();
        for event in &state_events {
            if let Some(pair) = event.state_pair() {
                state_map.insert(pair, event.event_id.clone());
            }
        }

        let mut external = auth_chain;
        external.extend(state_events);
        let count = external.len();
        self.auth_and_store_external_events(external).await?;
        debug!(room_id = %self.room_id, events = count, "stored send_join state");

        let join_object = canonical_object(body["event"].clone()).unwrap_or(join_pdu);
        let mut join_event =
            Event::with_event_id(join_event_id.clone(), join_object, self.room_version)?;

        let snapshot = self.materialise(&state_map);
        if !check_event_auth(&join_event, &snapshot, self.engine.config.strict_auth) {
            return Err(Error::EventAuthError(join_event_id));
        }
        let mut join_state = state_map;
        if let Some(pair) = join_event.state_pair() {
            join_state.insert(pair, join_event_id.clone());
        }
        join_event.state_map = Some(join_state);
        self.dag.store_event(join_event);
        self.schedule_update_client();
        info!(room_id = %self.room_id, "✅ joined remote room");

        // Prefetch a window of predecessors we likely missed.
        self.request_missing_events(origin, Vec::new(), vec![join_event_id], 10);
        Ok(())
    }

    fn request_missing_events(
        &self,
        origin: OwnedServerName,
        earliest: Vec<OwnedEventId>,
        latest: Vec<OwnedEventId>,
        limit: i64,
    ) {
        let engine = self.engine.clone();
        let tx = self.tx.clone();
        let room_id = self.room_id.clone();
        tokio::spawn(async move {
            let path = format!(
                "/_matrix/federation/v1/get_missing_events/{}",
                encode_component(room_id.as_str()),
            );
            let body = serde_json::json!({
                "earliest_events": earliest,
                "latest_events": latest,
                "limit": limit,
            });
            let response = engine
                .federation
                .send_request(
                    &origin,
                    Method::Post,
                    &path,
                    &[],
                    Some(body),
                    engine.config.missing_events_timeout(),
                )
                .await;
            match response {
                Ok(response) if response.is_ok() => {
                    let events: Vec<CanonicalJsonObject> = response.body["events"]
                        .as_array()
                        .map(|values| {
                            values
                                .iter()
                                .filter_map(|value| canonical_object(value.clone()))
                                .collect()
                        })
                        .unwrap_or_default();
                    let _ = tx.send(RoomCommand::MissingEventsFetched { origin, events });
                }
                Ok(response) => {
                    warn!(%room_id, status = response.status, "get_missing_events refused");
                }
                Err(e) => {
                    warn!(%room_id, error = %e, "get_missing_events failed");
                }
            }
        });
    }

    async fn handle_missing_events_fetched(
        &mut self,
        origin: OwnedServerName,
        pdus: Vec<CanonicalJsonObject>,
    ) {
        debug!(room_id = %self.room_id, %origin, count = pdus.len(), "prefetched missing events");
        let mut events = Vec::new();
        for pdu in pdus {
            match check_event_sig_and_hash(&self.engine.signing, pdu, self.room_version) {
                Ok(event) => events.push(event),
                Err(e) => warn!(room_id = %self.room_id, error = %e, "dropping prefetched event"),
            }
        }
        if let Err(e) = self.auth_and_store_external_events(events).await {
            warn!(room_id = %self.room_id, error = %e, "failed to store prefetched events");
        }
        self.schedule_update_client();
    }

    // ------------------------------------------------------------------
    // Direct-chat creation
    // ------------------------------------------------------------------

    /// Seed a fresh direct-chat room. The sequence is fixed; the invite at
    /// the end brings the remote side in.
    async fn handle_create(
        &mut self,
        local_user: Jid,
        local_user_id: OwnedUserId,
        remote_user_id: OwnedUserId,
    ) -> Result<()> {
        info!(room_id = %self.room_id, local = %local_user_id, remote = %remote_user_id, "creating direct chat room");
        self.local_user = Some(local_user);
        self.local_user_id = Some(local_user_id.clone());
        self.remote_user = Some(remote_user_id.clone());

        let creator = local_user_id.as_str();
        let mut create_content = serde_json::json!({ "room_version": self.room_version.version });
        if !self.room_version.implicit_room_creator {
            create_content["creator"] = serde_json::json!(creator);
        }

        let seed: Vec<(&str, Option<String>, JsonValue)> = vec![
            ("m.room.create", Some(String::new()), create_content),
            (
                "m.room.member",
                Some(creator.to_owned()),
                serde_json::json!({ "membership": "join" }),
            ),
            (
                "m.room.power_levels",
                Some(String::new()),
                serde_json::json!({
                    "users": { creator: 100 },
                    "users_default": 0,
                    "events_default": 0,
                    "state_default": 50,
                    "ban": 50,
                    "kick": 50,
                    "redact": 50,
                    "invite": 0,
                    "events": {},
                    "notifications": { "room": 50 },
                }),
            ),
            (
                "m.room.join_rules",
                Some(String::new()),
                serde_json::json!({ "join_rule": "invite" }),
            ),
            (
                "m.room.history_visibility",
                Some(String::new()),
                serde_json::json!({ "history_visibility": "shared" }),
            ),
            (
                "m.room.guest_access",
                Some(String::new()),
                serde_json::json!({ "guest_access": "can_join" }),
            ),
            (
                "m.room.member",
                Some(remote_user_id.as_str().to_owned()),
                serde_json::json!({ "membership": "invite" }),
            ),
        ];

        for (kind, state_key, content) in seed {
            let partial = pdu_skeleton(kind, creator, state_key.as_deref(), content)?;
            self.add_local_event(partial).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Projection to the gateway and to remote servers
    // ------------------------------------------------------------------

    fn is_local_sender(&self, event: &Event) -> bool {
        self.local_user_id
            .as_ref()
            .map(|local| *local == event.sender)
            .unwrap_or(false)
    }

    async fn notify_event(&mut self, event: &Arc<Event>) {
        if event.kind == TimelineEventType::RoomMessage {
            if event.content_str("msgtype") != Some("m.text") {
                return;
            }
            let body = event.content_str("body").unwrap_or_default().to_owned();
            if self.is_local_sender(event) {
                for server in self.remote_joined_servers() {
                    self.send_txn(server, event.clone());
                }
            } else if let Some(local) = self.local_user.clone() {
                let from = user_id_to_jid(&event.sender, &self.engine.config);
                self.engine
                    .gateway
                    .deliver_message(&local, &from, &self.room_id, &body)
                    .await;
            }
        } else if event.kind == TimelineEventType::RoomMember
            && event.membership() == Some(MembershipState::Invite)
            && self.is_local_sender(event)
        {
            let Some(target) = event.state_key.as_deref().and_then(|k| UserId::parse(k).ok())
            else {
                return;
            };
            if target.server_name() != self.engine.config.server_name {
                self.send_invite(event, target.server_name().to_owned());
            }
        }
    }

    /// Remote servers with at least one joined user, per the current state.
    fn remote_joined_servers(&self) -> Vec<OwnedServerName> {
        let state_map = self.current_state_map();
        let mut servers: Vec<OwnedServerName> = Vec::new();
        for ((kind, state_key), event_id) in &state_map {
            if *kind != StateEventType::RoomMember {
                continue;
            }
            let Ok(user) = UserId::parse(state_key.as_str()) else { continue };
            if user.server_name() == self.engine.config.server_name {
                continue;
            }
            let joined = self
                .dag
                .get(event_id)
                .and_then(|e| e.membership())
                .map(|m| m == MembershipState::Join)
                .unwrap_or(false);
            if joined && !servers.contains(&user.server_name().to_owned()) {
                servers.push(user.server_name().to_owned());
            }
        }
        servers
    }

    /// Invite RPC to the target's server, carrying a stripped-state
    /// extract so their client can render the invite.
    fn send_invite(&self, event: &Arc<Event>, target_server: OwnedServerName) {
        let state_map = event.state_map.clone().unwrap_or_default();
        let mut invite_room_state = Vec::new();
        for key in [
            (StateEventType::RoomCreate, String::new()),
            (StateEventType::RoomJoinRules, String::new()),
            (StateEventType::RoomMember, event.sender.as_str().to_owned()),
        ] {
            let Some(id) = state_map.get(&key) else { continue };
            let Some(state_event) = self.dag.get(id) else { continue };
            invite_room_state.push(serde_json::json!({
                "type": state_event.kind.to_string(),
                "state_key": state_event.state_key,
                "sender": state_event.sender,
                "content": state_event.content().cloned().unwrap_or_default(),
            }));
        }

        let path = format!(
            "/_matrix/federation/v2/invite/{}/{}",
            encode_component(self.room_id.as_str()),
            encode_component(event.event_id.as_str()),
        );
        let body = serde_json::json!({
            "event": event.json,
            "room_version": self.room_version.version,
            "invite_room_state": invite_room_state,
        });
        let engine = self.engine.clone();
        let room_id = self.room_id.clone();
        let timeout = self.engine.config.federation_timeout();
        tokio::spawn(async move {
            match engine
                .federation
                .send_request(&target_server, Method::Put, &path, &[], Some(body), timeout)
                .await
            {
                Ok(response) if response.is_ok() => {
                    debug!(%room_id, %target_server, "invite delivered");
                }
                Ok(response) => {
                    warn!(%room_id, %target_server, status = response.status, "invite refused");
                }
                Err(e) => {
                    warn!(%room_id, %target_server, error = %e, "invite failed");
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Outbound transactions
    // ------------------------------------------------------------------

    fn send_txn(&mut self, server: OwnedServerName, event: Arc<Event>) {
        self.outgoing.entry(server.clone()).or_default().queue.push(event);
        self.flush_txns(&server);
    }

    /// Start a new transaction when none is in flight and the queue is
    /// non-empty.
    fn flush_txns(&mut self, server: &OwnedServerName) {
        let Some(entry) = self.outgoing.get_mut(server) else { return };
        if entry.inflight.is_some() || entry.queue.is_empty() {
            return;
        }
        self.txn_counter += 1;
        let txn_id = self.txn_counter.to_string();
        let events = std::mem::take(&mut entry.queue);
        entry.inflight = Some(InflightTxn {
            txn_id,
            origin_server_ts: u64::from(MilliSecondsSinceUnixEpoch::now().get()),
            events,
        });
        self.dispatch_txn(server);
    }

    /// Send (or re-send) the current in-flight transaction. The txn id and
    /// PDU batch stay identical across retries so the remote can
    /// deduplicate.
    fn dispatch_txn(&self, server: &OwnedServerName) {
        let Some(inflight) = self
            .outgoing
            .get(server)
            .and_then(|entry| entry.inflight.as_ref())
        else {
            return;
        };

        let pdus: Vec<JsonValue> = inflight
            .events
            .iter()
            .filter_map(|event| serde_json::to_value(&event.json).ok())
            .collect();
        let body = serde_json::json!({
            "origin": self.engine.config.server_name.as_str(),
            "origin_server_ts": inflight.origin_server_ts,
            "pdus": pdus,
        });
        let path = format!(
            "/_matrix/federation/v1/send/{}",
            encode_component(&inflight.txn_id),
        );
        let txn_id = inflight.txn_id.clone();
        let server = server.clone();
        let engine = self.engine.clone();
        let tx = self.tx.clone();
        let timeout = self.engine.config.federation_timeout();
        tokio::spawn(async move {
            let success = match engine
                .federation
                .send_request(&server, Method::Put, &path, &[], Some(body), timeout)
                .await
            {
                Ok(response) => response.is_ok(),
                Err(e) => {
                    warn!(%server, error = %e, "transaction send failed");
                    false
                }
            };
            let _ = tx.send(RoomCommand::TxnResult { server, txn_id, success });
        });
    }

    fn handle_txn_result(&mut self, server: OwnedServerName, txn_id: String, success: bool) {
        let Some(entry) = self.outgoing.get_mut(&server) else { return };
        let Some(inflight) = entry.inflight.as_ref() else { return };
        if inflight.txn_id != txn_id {
            return;
        }

        if success {
            entry.inflight = None;
            self.flush_txns(&server);
        } else {
            let delay = self.engine.config.txn_retry_delay();
            warn!(room_id = %self.room_id, %server, txn_id, "transaction failed, retrying in {}s", delay.as_secs());
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(RoomCommand::ResendTxn(server));
            });
        }
    }

    // ------------------------------------------------------------------
    // Client lifecycle state machine
    // ------------------------------------------------------------------

    fn schedule_update_client(&self) {
        let _ = self.tx.send(RoomCommand::UpdateClient);
    }

    fn update_client(&mut self) -> Flow {
        let Some(local_id) = self.local_user_id.clone() else {
            return Flow::Continue;
        };
        let state_map = self.current_state_map();
        let mut joined: Vec<OwnedUserId> = Vec::new();
        for ((kind, state_key), event_id) in &state_map {
            if *kind != StateEventType::RoomMember {
                continue;
            }
            let is_join = self
                .dag
                .get(event_id)
                .and_then(|e| e.membership())
                .map(|m| m == MembershipState::Join)
                .unwrap_or(false);
            if is_join {
                if let Ok(user) = UserId::parse(state_key.as_str()) {
                    joined.push(user);
                }
            }
        }
        let local_joined = joined.contains(&local_id);

        match self.client_state {
            ClientState::Undefined => {
                if !local_joined {
                    return Flow::Continue;
                }
                let others: Vec<&OwnedUserId> =
                    joined.iter().filter(|user| **user != local_id).collect();
                match others.as_slice() {
                    [] => {}
                    [other] => match &self.remote_user {
                        Some(remote) if remote == *other => {
                            info!(room_id = %self.room_id, remote = %remote, "direct chat established");
                            self.client_state = ClientState::Established;
                        }
                        None => {
                            info!(room_id = %self.room_id, remote = %other, "direct chat established");
                            self.remote_user = Some((*other).clone());
                            self.client_state = ClientState::Established;
                        }
                        Some(_) => return self.start_leave("unknown_remote_user"),
                    },
                    _ => return self.start_leave("too_many_users"),
                }
            }
            ClientState::Established => {
                if !local_joined {
                    info!(room_id = %self.room_id, "local user left, terminating");
                    return Flow::Stop;
                }
                if let Some(remote) = self.remote_user.clone() {
                    if !joined.contains(&remote) {
                        return self.start_leave("remote_user_left");
                    }
                }
            }
            ClientState::Leave => return Flow::Stop,
        }
        Flow::Continue
    }

    fn start_leave(&mut self, reason: &str) -> Flow {
        warn!(room_id = %self.room_id, reason, "leaving room");
        self.client_state = ClientState::Leave;
        if let Some(local_id) = self.local_user_id.clone() {
            match pdu_skeleton(
                "m.room.member",
                local_id.as_str(),
                Some(local_id.as_str()),
                serde_json::json!({ "membership": "leave", "reason": reason }),
            ) {
                Ok(partial) => {
                    let _ = self.tx.send(RoomCommand::AddEvent(partial));
                }
                Err(e) => warn!(room_id = %self.room_id, error = %e, "failed to build leave event"),
            }
        }
        self.schedule_update_client();
        Flow::Continue
    }
}

/// Minimal PDU skeleton for local origination; fill_event stamps the rest.
fn pdu_skeleton(
    kind: &str,
    sender: &str,
    state_key: Option<&str>,
    content: JsonValue,
) -> Result<CanonicalJsonObject> {
    let mut value = serde_json::json!({
        "type": kind,
        "sender": sender,
        "content": content,
    });
    if let Some(state_key) = state_key {
        value["state_key"] = serde_json::json!(state_key);
    }
    canonical_object(value).ok_or_else(|| Error::MalformedPdu("skeleton is not an object".to_owned()))
}

fn canonical_object(value: JsonValue) -> Option<CanonicalJsonObject> {
    match CanonicalJsonValue::try_from(value) {
        Ok(CanonicalJsonValue::Object(object)) => Some(object),
        _ => None,
    }
}

fn decode_pdu_list(value: &JsonValue, room_version: RoomVersion, engine: &Engine) -> Vec<Event> {
    let mut events = Vec::new();
    let Some(values) = value.as_array() else {
        return events;
    };
    for value in values {
        let Some(object) = canonical_object(value.clone()) else {
            warn!("dropping non-object pdu");
            continue;
        };
        match check_event_sig_and_hash(&engine.signing, object, room_version) {
            Ok(event) => events.push(event),
            Err(e) => warn!(error = %e, "dropping pdu with bad signature or hash"),
        }
    }
    events
}

/// The auth-event selection: which state entries authorise a PDU of this
/// shape.
fn compute_event_auth_keys(partial: &CanonicalJsonObject) -> Vec<(StateEventType, String)> {
    let Some(kind) = partial.get("type").and_then(CanonicalJsonValue::as_str) else {
        return Vec::new();
    };
    if kind == "m.room.create" {
        return Vec::new();
    }
    let Some(sender) = partial.get("sender").and_then(CanonicalJsonValue::as_str) else {
        return Vec::new();
    };

    let mut keys = vec![
        (StateEventType::RoomCreate, String::new()),
        (StateEventType::RoomPowerLevels, String::new()),
        (StateEventType::RoomMember, sender.to_owned()),
    ];

    if kind == "m.room.member" {
        let content = match partial.get("content") {
            Some(CanonicalJsonValue::Object(content)) => Some(content),
            _ => None,
        };
        if let Some(target) = partial.get("state_key").and_then(CanonicalJsonValue::as_str) {
            let key = (StateEventType::RoomMember, target.to_owned());
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        let membership = content
            .and_then(|c| c.get("membership"))
            .and_then(CanonicalJsonValue::as_str)
            .unwrap_or("");
        match membership {
            "join" => {
                keys.push((StateEventType::RoomJoinRules, String::new()));
                if let Some(authoriser) = content
                    .and_then(|c| c.get("join_authorised_via_users_server"))
                    .and_then(CanonicalJsonValue::as_str)
                {
                    keys.push((StateEventType::RoomMember, authoriser.to_owned()));
                }
            }
            "invite" => {
                keys.push((StateEventType::RoomJoinRules, String::new()));
                let token = content
                    .and_then(|c| c.get("third_party_invite"))
                    .and_then(|tpi| match tpi {
                        CanonicalJsonValue::Object(tpi) => tpi.get("signed"),
                        _ => None,
                    })
                    .and_then(|signed| match signed {
                        CanonicalJsonValue::Object(signed) => signed.get("token"),
                        _ => None,
                    })
                    .and_then(CanonicalJsonValue::as_str);
                if let Some(token) = token {
                    keys.push((StateEventType::RoomThirdPartyInvite, token.to_owned()));
                }
            }
            "knock" => {
                keys.push((StateEventType::RoomJoinRules, String::new()));
            }
            _ => {}
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skeleton(kind: &str, sender: &str, state_key: Option<&str>, content: JsonValue) -> CanonicalJsonObject {
        pdu_skeleton(kind, sender, state_key, content).unwrap()
    }

    #[test]
    fn test_auth_keys_for_create_are_empty() {
        let pdu = skeleton("m.room.create", "@alice:x.example", Some(""), serde_json::json!({}));
        assert!(compute_event_auth_keys(&pdu).is_empty());
    }

    #[test]
    fn test_auth_keys_for_message() {
        let pdu = skeleton(
            "m.room.message",
            "@alice:x.example",
            None,
            serde_json::json!({ "msgtype": "m.text", "body": "hi" }),
        );
        assert_eq!(
            compute_event_auth_keys(&pdu),
            vec![
                (StateEventType::RoomCreate, String::new()),
                (StateEventType::RoomPowerLevels, String::new()),
                (StateEventType::RoomMember, "@alice:x.example".to_owned()),
            ]
        );
    }

    #[test]
    fn test_auth_keys_for_join_include_join_rules() {
        let pdu = skeleton(
            "m.room.member",
            "@alice:x.example",
            Some("@alice:x.example"),
            serde_json::json!({ "membership": "join" }),
        );
        let keys = compute_event_auth_keys(&pdu);
        assert!(keys.contains(&(StateEventType::RoomJoinRules, String::new())));
        // sender == target: the member key appears once.
        assert_eq!(
            keys.iter()
                .filter(|(kind, state_key)| *kind == StateEventType::RoomMember
                    && state_key == "@alice:x.example")
                .count(),
            1
        );
    }

    #[test]
    fn test_auth_keys_for_invite_with_third_party_token() {
        let pdu = skeleton(
            "m.room.member",
            "@alice:x.example",
            Some("@bob:x.example"),
            serde_json::json!({
                "membership": "invite",
                "third_party_invite": { "signed": { "token": "tok" } },
            }),
        );
        let keys = compute_event_auth_keys(&pdu);
        assert!(keys.contains(&(StateEventType::RoomThirdPartyInvite, "tok".to_owned())));
        assert!(keys.contains(&(StateEventType::RoomJoinRules, String::new())));
        assert!(keys.contains(&(StateEventType::RoomMember, "@bob:x.example".to_owned())));
    }

    #[test]
    fn test_auth_keys_for_restricted_join_include_authoriser() {
        let pdu = skeleton(
            "m.room.member",
            "@bob:x.example",
            Some("@bob:x.example"),
            serde_json::json!({
                "membership": "join",
                "join_authorised_via_users_server": "@alice:x.example",
            }),
        );
        let keys = compute_event_auth_keys(&pdu);
        assert!(keys.contains(&(StateEventType::RoomMember, "@alice:x.example".to_owned())));
    }
}
