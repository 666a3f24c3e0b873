// =============================================================================
// Matrixon Bridge - Room DAG Module
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
//   The in-memory event DAG of one room: the id -> event map, the leaf
//   bookkeeping (latest / nonlatest partition) and the auth-chain walks.
//   Events are never deleted for the lifetime of the room actor. Parents
//   are referenced by id only; referents resolve through the map.
//
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ruma::{
    events::{room::member::MembershipState, StateEventType},
    EventId, OwnedEventId, ServerName, UserId,
};
use tracing::debug;

use crate::{
    pdu::{Event, StateMap},
    state_res, Error, Result,
};

/// What [`RoomDag::store_event`] did with the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// New event, leaves updated.
    Inserted,
    /// Known event upgraded in place with a state map.
    Upgraded,
    /// Already present, nothing changed.
    Duplicate,
}

/// The event store of one room.
#[derive(Debug, Default)]
pub struct RoomDag {
    events: HashMap<OwnedEventId, Arc<Event>>,
    latest_events: HashSet<OwnedEventId>,
    nonlatest_events: HashSet<OwnedEventId>,
}

impl RoomDag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, event_id: &EventId) -> Option<Arc<Event>> {
        self.events.get(event_id).cloned()
    }

    pub fn contains(&self, event_id: &EventId) -> bool {
        self.events.contains_key(event_id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Current DAG leaves: events with no known child in this room.
    pub fn latest_events(&self) -> &HashSet<OwnedEventId> {
        &self.latest_events
    }

    /// Store an event, updating the leaf partition.
    ///
    /// A known event with `state_map = None` is upgraded in place when the
    /// incoming copy is materialised; a known materialised event is left
    /// alone. The state map only ever goes from `None` to `Some`.
    pub fn store_event(&mut self, event: Event) -> StoreOutcome {
        if let Some(existing) = self.events.get_mut(&event.event_id) {
            if existing.state_map.is_none() && event.state_map.is_some() {
                debug!(event_id = %event.event_id, "materialising stored event");
                *existing = Arc::new(event);
                return StoreOutcome::Upgraded;
            }
            return StoreOutcome::Duplicate;
        }

        let event_id = event.event_id.clone();
        for prev in &event.prev_events {
            self.latest_events.remove(prev);
            self.nonlatest_events.insert(prev.clone());
        }
        if !self.nonlatest_events.contains(&event_id) {
            self.latest_events.insert(event_id.clone());
        }
        self.events.insert(event_id, Arc::new(event));
        StoreOutcome::Inserted
    }

    /// Split `ids` into those we know and those we do not.
    pub fn partition_missed_events(
        &self,
        ids: &[OwnedEventId],
    ) -> (Vec<OwnedEventId>, Vec<OwnedEventId>) {
        ids.iter()
            .cloned()
            .partition(|id| self.events.contains_key(id))
    }

    /// Split `ids` into materialised and non-materialised events. Unknown
    /// ids count as non-materialised.
    pub fn partition_events_with_statemap(
        &self,
        ids: &[OwnedEventId],
    ) -> (Vec<OwnedEventId>, Vec<OwnedEventId>) {
        ids.iter().cloned().partition(|id| {
            self.events
                .get(id)
                .map(|e| e.state_map.is_some())
                .unwrap_or(false)
        })
    }

    /// Whether some user of `server` is joined according to the state at
    /// any current leaf.
    pub fn is_server_joined(&self, server: &ServerName) -> bool {
        self.latest_events.iter().any(|leaf| {
            let Some(leaf) = self.events.get(leaf) else {
                return false;
            };
            let Some(state_map) = &leaf.state_map else {
                return false;
            };
            state_map.iter().any(|((kind, state_key), member_id)| {
                if *kind != StateEventType::RoomMember {
                    return false;
                }
                let Ok(user) = UserId::parse(state_key.as_str()) else {
                    return false;
                };
                user.server_name() == server
                    && self
                        .events
                        .get(member_id)
                        .and_then(|e| e.membership())
                        .map(|m| m == MembershipState::Join)
                        .unwrap_or(false)
            })
        })
    }

    /// Resolved room state before `event`: the resolution of its parents'
    /// state maps. Falls back to the event's own state map minus its own
    /// entry when the parents are not materialised (remote-seeded joins).
    pub fn prev_state_map(&self, event: &Event) -> Result<StateMap> {
        if event.prev_events.is_empty() {
            return Ok(StateMap::new());
        }

        let mut parent_maps = Vec::with_capacity(event.prev_events.len());
        let mut missing = false;
        for prev in &event.prev_events {
            match self.events.get(prev) {
                Some(parent) => match &parent.state_map {
                    Some(state_map) => parent_maps.push(state_map.clone()),
                    None => {
                        missing = true;
                        break;
                    }
                },
                None => {
                    missing = true;
                    break;
                }
            }
        }

        if missing {
            if let Some(own) = &event.state_map {
                let mut map = own.clone();
                if let Some(pair) = event.state_pair() {
                    map.remove(&pair);
                }
                return Ok(map);
            }
            return Err(Error::MissedStateMap(event.event_id.clone()));
        }

        Ok(state_res::resolve_state_maps(&parent_maps, &|id| self.get(id)))
    }

    /// Closure of `start` under auth-events pointers, unknown ids skipped.
    pub fn auth_chain(&self, start: &[OwnedEventId]) -> Vec<OwnedEventId> {
        let mut seen: HashSet<OwnedEventId> = HashSet::new();
        let mut stack: Vec<OwnedEventId> = start.to_vec();
        let mut chain = Vec::new();
        while let Some(id) = stack.pop() {
            let Some(event) = self.events.get(&id) else {
                continue;
            };
            for auth_id in &event.auth_events {
                if seen.insert(auth_id.clone()) {
                    chain.push(auth_id.clone());
                    stack.push(auth_id.clone());
                }
            }
        }
        chain
    }
}

/// Topological sort over auth-events pointers: every event comes after the
/// auth events it references. A gray revisit signals a cycle.
pub fn simple_toposort(events: &[Arc<Event>]) -> Result<Vec<Arc<Event>>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Gray,
        Black,
    }

    let by_id: HashMap<&EventId, &Arc<Event>> = events
        .iter()
        .map(|e| (e.event_id.as_ref(), e))
        .collect();
    let mut marks: HashMap<&EventId, Mark> = HashMap::new();
    let mut sorted: Vec<Arc<Event>> = Vec::with_capacity(events.len());

    fn visit<'a>(
        id: &'a EventId,
        by_id: &HashMap<&'a EventId, &'a Arc<Event>>,
        marks: &mut HashMap<&'a EventId, Mark>,
        sorted: &mut Vec<Arc<Event>>,
    ) -> Result<()> {
        match marks.get(id) {
            Some(Mark::Black) => return Ok(()),
            Some(Mark::Gray) => return Err(Error::LoopInAuthChain),
            None => {}
        }
        let Some(event) = by_id.get(id) else {
            // References outside the input set are resolved elsewhere.
            return Ok(());
        };
        marks.insert(id, Mark::Gray);
        for auth_id in &event.auth_events {
            visit(auth_id, by_id, marks, sorted)?;
        }
        marks.insert(id, Mark::Black);
        sorted.push((*event).clone());
        Ok(())
    }

    for event in events {
        visit(event.event_id.as_ref(), &by_id, &mut marks, &mut sorted)?;
    }
    Ok(sorted)
}
