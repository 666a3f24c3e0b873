// =============================================================================
// Matrixon Bridge - State Resolution Module
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
//   Matrix state resolution (v2): conflict partition, auth difference via
//   a per-input bitmask walk, reverse-topological ordering of power events,
//   mainline ordering of the rest, and two iterative auth passes. Events
//   that fail a pass are dropped with a log line; resolution itself never
//   aborts.
//
// =============================================================================

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use ruma::{
    events::{room::member::MembershipState, StateEventType, TimelineEventType},
    EventId, OwnedEventId,
};
use tracing::{debug, warn};

use crate::auth::{self, check_event_auth, AuthState};
use crate::pdu::{Event, StateMap};

/// Resolve a set of state maps into one.
///
/// Short-circuits on zero or one input. The fetch closure resolves event
/// ids against the room DAG; unknown events are dropped from resolution.
pub fn resolve_state_maps<F>(maps: &[StateMap], fetch: &F) -> StateMap
where
    F: Fn(&EventId) -> Option<Arc<Event>>,
{
    match maps {
        [] => StateMap::new(),
        [single] => single.clone(),
        _ => resolve(maps, fetch),
    }
}

fn resolve<F>(maps: &[StateMap], fetch: &F) -> StateMap
where
    F: Fn(&EventId) -> Option<Arc<Event>>,
{
    // 1. Partition into unconflicted and conflicted entries.
    let (unconflicted, conflicted) = partition_maps(maps);
    if conflicted.is_empty() {
        return unconflicted;
    }

    // 2. + 3. Auth difference, then the full conflicted set.
    let mut full_conflicted: HashSet<OwnedEventId> = auth_difference(maps, &conflicted, fetch);
    for values in conflicted.values() {
        full_conflicted.extend(values.iter().cloned());
    }
    debug!(
        conflicted_keys = conflicted.len(),
        full_conflicted = full_conflicted.len(),
        "resolving state conflict"
    );

    // 4. + 5. Power events and their auth ancestors inside the conflicted
    // set, in reverse topological power ordering.
    let power_ids: Vec<OwnedEventId> = full_conflicted
        .iter()
        .filter(|id| fetch(id).map(|e| is_power_event(&e)).unwrap_or(false))
        .cloned()
        .collect();
    let sorted_power = sort_power_events(&power_ids, &full_conflicted, fetch);

    // 6. First iterative auth pass over the power events.
    let after_power = iterative_auth_checks(&sorted_power, &unconflicted, fetch);

    // 7. Mainline ordering of whatever is left.
    let sorted_power_set: HashSet<&OwnedEventId> = sorted_power.iter().collect();
    let mut remaining: Vec<OwnedEventId> = full_conflicted
        .iter()
        .filter(|id| !sorted_power_set.contains(id))
        .cloned()
        .collect();
    remaining = mainline_sort(
        remaining,
        after_power
            .get(&(StateEventType::RoomPowerLevels, String::new()))
            .cloned(),
        fetch,
    );

    // 8. Second iterative auth pass over the rest.
    let mut resolved = iterative_auth_checks(&remaining, &after_power, fetch);

    // 9. The unconflicted map wins on any collision.
    for (key, value) in unconflicted {
        resolved.insert(key, value);
    }
    resolved
}

fn partition_maps(maps: &[StateMap]) -> (StateMap, HashMap<crate::pdu::StateKey, Vec<OwnedEventId>>) {
    let mut keys: HashSet<&crate::pdu::StateKey> = HashSet::new();
    for map in maps {
        keys.extend(map.keys());
    }

    let mut unconflicted = StateMap::new();
    let mut conflicted: HashMap<crate::pdu::StateKey, Vec<OwnedEventId>> = HashMap::new();
    for key in keys {
        let mut values: Vec<Option<&OwnedEventId>> = maps.iter().map(|m| m.get(key)).collect();
        values.sort();
        values.dedup();
        match values.as_slice() {
            [Some(value)] => {
                unconflicted.insert(key.clone(), (*value).clone());
            }
            _ => {
                conflicted.insert(
                    key.clone(),
                    values.into_iter().flatten().cloned().collect(),
                );
            }
        }
    }
    (unconflicted, conflicted)
}

/// Events in the union of the conflicted auth chains but not in their
/// intersection.
///
/// Each input map contributes one bit; the walk goes highest depth first so
/// children mark their ancestors before those are examined. An event whose
/// mask covers every input is common to all chains and pruned.
fn auth_difference<F>(
    maps: &[StateMap],
    conflicted: &HashMap<crate::pdu::StateKey, Vec<OwnedEventId>>,
    fetch: &F,
) -> HashSet<OwnedEventId>
where
    F: Fn(&EventId) -> Option<Arc<Event>>,
{
    let full_mask: u64 = (1u64 << maps.len()) - 1;
    let mut masks: HashMap<OwnedEventId, u64> = HashMap::new();
    let mut heap: BinaryHeap<(u64, OwnedEventId)> = BinaryHeap::new();

    for (index, map) in maps.iter().enumerate() {
        let bit = 1u64 << index;
        for key in conflicted.keys() {
            let Some(id) = map.get(key) else { continue };
            let entry = masks.entry(id.clone()).or_insert_with(|| {
                if let Some(event) = fetch(id) {
                    heap.push((event.depth, id.clone()));
                }
                0
            });
            *entry |= bit;
        }
    }

    let mut difference = HashSet::new();
    let mut done: HashSet<OwnedEventId> = HashSet::new();
    while let Some((_, id)) = heap.pop() {
        if !done.insert(id.clone()) {
            continue;
        }
        let mask = masks.get(&id).copied().unwrap_or(0);
        if mask != full_mask {
            difference.insert(id.clone());
        }
        let Some(event) = fetch(&id) else { continue };
        for auth_id in &event.auth_events {
            let entry = masks.entry(auth_id.clone()).or_insert_with(|| {
                if let Some(parent) = fetch(auth_id) {
                    heap.push((parent.depth, auth_id.clone()));
                }
                0
            });
            *entry |= mask;
        }
    }
    difference
}

/// A power event shifts authority: power levels, join rules, or a member
/// event removing someone else from the room.
pub fn is_power_event(event: &Event) -> bool {
    match &event.kind {
        TimelineEventType::RoomPowerLevels | TimelineEventType::RoomJoinRules => {
            event.state_key.as_deref() == Some("")
        }
        TimelineEventType::RoomMember => {
            let foreign = event
                .state_key
                .as_deref()
                .map(|k| k != event.sender.as_str())
                .unwrap_or(false);
            foreign
                && matches!(
                    event.membership(),
                    Some(MembershipState::Leave | MembershipState::Ban)
                )
        }
        _ => false,
    }
}

/// Kahn sort over the auth subgraph restricted to `scope`, picking among
/// ready events by `(-sender power, origin_server_ts, event_id)`.
///
/// The sorted set is the power events plus their auth ancestors inside the
/// scope, ancestors first.
fn sort_power_events<F>(
    power_ids: &[OwnedEventId],
    scope: &HashSet<OwnedEventId>,
    fetch: &F,
) -> Vec<OwnedEventId>
where
    F: Fn(&EventId) -> Option<Arc<Event>>,
{
    // Collect the power events and their in-scope auth ancestors.
    let mut nodes: HashSet<OwnedEventId> = HashSet::new();
    let mut stack: Vec<OwnedEventId> = power_ids.to_vec();
    while let Some(id) = stack.pop() {
        if !nodes.insert(id.clone()) {
            continue;
        }
        let Some(event) = fetch(&id) else { continue };
        for auth_id in &event.auth_events {
            if scope.contains(auth_id) && !nodes.contains(auth_id) {
                stack.push(auth_id.clone());
            }
        }
    }

    // children / indegree over the restricted graph.
    let mut children: HashMap<OwnedEventId, Vec<OwnedEventId>> = HashMap::new();
    let mut indegree: HashMap<OwnedEventId, usize> = HashMap::new();
    for id in &nodes {
        indegree.entry(id.clone()).or_insert(0);
        let Some(event) = fetch(id) else { continue };
        for auth_id in &event.auth_events {
            if nodes.contains(auth_id) {
                children.entry(auth_id.clone()).or_default().push(id.clone());
                *indegree.entry(id.clone()).or_insert(0) += 1;
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<(i64, u64, OwnedEventId)>> = BinaryHeap::new();
    for (id, degree) in &indegree {
        if *degree == 0 {
            ready.push(Reverse(sort_key(id, fetch)));
        }
    }

    let mut sorted = Vec::with_capacity(nodes.len());
    while let Some(Reverse((_, _, id))) = ready.pop() {
        sorted.push(id.clone());
        for child in children.get(&id).cloned().unwrap_or_default() {
            let degree = indegree.get_mut(&child).expect("child was registered");
            *degree -= 1;
            if *degree == 0 {
                ready.push(Reverse(sort_key(&child, fetch)));
            }
        }
    }
    sorted
}

/// `(-power, origin_server_ts, id)`: higher power sorts first, then older,
/// then lexicographic id.
fn sort_key<F>(id: &OwnedEventId, fetch: &F) -> (i64, u64, OwnedEventId)
where
    F: Fn(&EventId) -> Option<Arc<Event>>,
{
    match fetch(id) {
        Some(event) => (
            -sender_power_at_event(&event, fetch),
            u64::from(event.origin_server_ts.get()),
            id.clone(),
        ),
        None => (0, 0, id.clone()),
    }
}

/// Sender power at the event, read from the power-levels event in its auth
/// chain; without one, the creator rule applies.
fn sender_power_at_event<F>(event: &Event, fetch: &F) -> i64
where
    F: Fn(&EventId) -> Option<Arc<Event>>,
{
    if let Some(power_levels) = find_power_level_event(event, fetch).and_then(|id| fetch(&id)) {
        let content = power_levels.content();
        let user_level = content
            .and_then(|c| c.get("users"))
            .and_then(|users| match users {
                ruma::CanonicalJsonValue::Object(users) => users.get(event.sender.as_str()),
                _ => None,
            })
            .and_then(auth::get_int);
        return user_level.unwrap_or_else(|| {
            content
                .and_then(|c| c.get("users_default"))
                .and_then(auth::get_int)
                .unwrap_or(0)
        });
    }

    // No power levels yet: the creator has 100, everyone else 0.
    let create = event.auth_events.iter().find_map(|id| {
        fetch(id).filter(|e| e.kind == TimelineEventType::RoomCreate)
    });
    let create = match create {
        Some(create) => create,
        None if event.kind == TimelineEventType::RoomCreate => {
            return if auth::creator_of(event).as_deref() == Some(event.sender.as_str()) {
                100
            } else {
                0
            };
        }
        None => return 0,
    };
    if auth::creator_of(&create).as_deref() == Some(event.sender.as_str()) {
        100
    } else {
        0
    }
}

/// First power-levels event reachable through the auth events.
fn find_power_level_event<F>(event: &Event, fetch: &F) -> Option<OwnedEventId>
where
    F: Fn(&EventId) -> Option<Arc<Event>>,
{
    event.auth_events.iter().find_map(|id| {
        let auth_event = fetch(id)?;
        (auth_event.kind == TimelineEventType::RoomPowerLevels
            && auth_event.state_key.as_deref() == Some(""))
        .then(|| id.clone())
    })
}

/// Order the non-power events against the mainline of the resolved power
/// levels: events anchored deeper in power-level history apply first.
fn mainline_sort<F>(
    mut ids: Vec<OwnedEventId>,
    resolved_power: Option<OwnedEventId>,
    fetch: &F,
) -> Vec<OwnedEventId>
where
    F: Fn(&EventId) -> Option<Arc<Event>>,
{
    let mut mainline_index: HashMap<OwnedEventId, i64> = HashMap::new();
    let mut index = -1i64;
    let mut cursor = resolved_power;
    while let Some(id) = cursor {
        if mainline_index.contains_key(&id) {
            break;
        }
        mainline_index.insert(id.clone(), index);
        index -= 1;
        cursor = fetch(&id).and_then(|e| find_power_level_event(&e, fetch));
    }

    let mut keyed: Vec<((i64, u64, OwnedEventId), OwnedEventId)> = ids
        .drain(..)
        .map(|id| {
            let key = match fetch(&id) {
                Some(event) => (
                    mainline_position(&event, &mainline_index, fetch),
                    u64::from(event.origin_server_ts.get()),
                    id.clone(),
                ),
                None => (0, 0, id.clone()),
            };
            (key, id)
        })
        .collect();
    keyed.sort();
    keyed.into_iter().map(|(_, id)| id).collect()
}

/// Index of the first power-level ancestor on the mainline, 0 if none.
fn mainline_position<F>(
    event: &Event,
    mainline_index: &HashMap<OwnedEventId, i64>,
    fetch: &F,
) -> i64
where
    F: Fn(&EventId) -> Option<Arc<Event>>,
{
    let mut seen: HashSet<OwnedEventId> = HashSet::new();
    let mut cursor = find_power_level_event(event, fetch);
    while let Some(id) = cursor {
        if let Some(index) = mainline_index.get(&id) {
            return *index;
        }
        if !seen.insert(id.clone()) {
            break;
        }
        cursor = fetch(&id).and_then(|e| find_power_level_event(&e, fetch));
    }
    0
}

/// Run the auth rules over `order`, threading the accepted events into the
/// running state. The snapshot for each event is the running state plus its
/// own auth events for any key not yet present.
fn iterative_auth_checks<F>(order: &[OwnedEventId], base: &StateMap, fetch: &F) -> StateMap
where
    F: Fn(&EventId) -> Option<Arc<Event>>,
{
    let mut state = base.clone();
    for id in order {
        let Some(event) = fetch(id) else {
            warn!(event_id = %id, "dropping unknown event during state resolution");
            continue;
        };

        let mut snapshot: AuthState = AuthState::new();
        for (key, value) in &state {
            if let Some(resolved) = fetch(value) {
                snapshot.insert(key.clone(), resolved);
            }
        }
        for auth_id in &event.auth_events {
            if let Some(auth_event) = fetch(auth_id) {
                if let Some(pair) = auth_event.state_pair() {
                    snapshot.entry(pair).or_insert(auth_event);
                }
            }
        }

        if check_event_auth(&event, &snapshot, false) {
            if let Some(pair) = event.state_pair() {
                state.insert(pair, id.clone());
            }
        } else {
            warn!(event_id = %id, "dropping event rejected during state resolution");
        }
    }
    state
}
