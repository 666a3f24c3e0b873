// =============================================================================
// Matrixon Bridge - Event Auth Module
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
//   The authorisation rules: given an event and a state snapshot, decide
//   whether the event is allowed. Dispatches on event type, with the
//   membership table and the power-levels delta check carrying most of the
//   weight. Any malformed shape or internal failure inside rule evaluation
//   collapses to a denial.
//
// =============================================================================

use std::{collections::HashMap, sync::Arc};

use ruma::{
    events::{room::member::MembershipState, StateEventType, TimelineEventType},
    CanonicalJsonObject, CanonicalJsonValue, UserId,
};
use tracing::debug;

use crate::pdu::{Event, StateKey};

/// A state snapshot with events materialised, as consumed by the rules.
pub type AuthState = HashMap<StateKey, Arc<Event>>;

const DEFAULT_KICK_LEVEL: i64 = 50;
const DEFAULT_BAN_LEVEL: i64 = 50;
const DEFAULT_INVITE_LEVEL: i64 = 0;

/// Scalar fields of an m.room.power_levels content.
const POWER_LEVEL_SCALARS: &[&str] = &[
    "users_default",
    "events_default",
    "state_default",
    "ban",
    "redact",
    "kick",
    "invite",
];

/// Map-valued fields of an m.room.power_levels content.
const POWER_LEVEL_MAPS: &[&str] = &["events", "users", "notifications"];

/// Decide whether `event` is allowed given the state snapshot.
///
/// `strict` rejects the recognised-but-unenforced branches (third-party
/// invites, restricted joins through an authorising server) instead of
/// letting them through.
pub fn check_event_auth(event: &Event, auth_state: &AuthState, strict: bool) -> bool {
    match auth_check(event, auth_state, strict) {
        Ok(()) => true,
        Err(reason) => {
            debug!(event_id = %event.event_id, kind = %event.kind, reason, "event failed authorisation");
            false
        }
    }
}

fn auth_check(event: &Event, state: &AuthState, strict: bool) -> Result<(), String> {
    if event.kind == TimelineEventType::RoomCreate {
        return check_create(event, state);
    }

    let create = state
        .get(&(StateEventType::RoomCreate, String::new()))
        .ok_or("no m.room.create in auth state")?
        .clone();

    if event.kind == TimelineEventType::RoomMember {
        check_member(event, &create, state, strict)
    } else {
        check_default(event, &create, state)
    }
}

fn check_create(event: &Event, state: &AuthState) -> Result<(), String> {
    if !state.is_empty() {
        return Err("m.room.create with a non-empty state snapshot".to_owned());
    }
    let room_domain = event
        .room_id
        .as_str()
        .split_once(':')
        .map(|(_, domain)| domain)
        .ok_or("room id has no server part")?;
    if event.sender.server_name().as_str() != room_domain {
        return Err("create sender is on a different server than the room".to_owned());
    }
    if !event.room_version.implicit_room_creator && event.content_str("creator").is_none() {
        return Err("create event without content.creator".to_owned());
    }
    Ok(())
}

fn check_member(
    event: &Event,
    create: &Arc<Event>,
    state: &AuthState,
    strict: bool,
) -> Result<(), String> {
    let target = event
        .state_key
        .as_deref()
        .ok_or("membership event without state key")?;
    let membership = event.membership().ok_or("membership event without membership")?;

    match membership {
        MembershipState::Join => check_join(event, create, state, target, strict),
        MembershipState::Invite => check_invite(event, state, target, strict),
        MembershipState::Leave => check_leave(event, state, target),
        MembershipState::Ban => check_ban(event, state, target),
        MembershipState::Knock => check_knock(event, state, target),
        _ => Err(format!("unknown membership {membership}")),
    }
}

fn check_join(
    event: &Event,
    create: &Arc<Event>,
    state: &AuthState,
    target: &str,
    strict: bool,
) -> Result<(), String> {
    // The room creator joining their own fresh room authorises with the
    // create event alone.
    if event.auth_events.len() == 1 && event.sender.as_str() == target {
        if creator_of(create).as_deref() == Some(event.sender.as_str()) {
            return Ok(());
        }
    }

    if event.sender.as_str() != target {
        return Err("join sender does not match target".to_owned());
    }

    let prior = member_state(state, target);
    match prior {
        Some(MembershipState::Ban) => return Err("target is banned".to_owned()),
        Some(MembershipState::Join) => return Ok(()),
        _ => {}
    }

    // TODO: joins carrying join_authorised_via_users_server are accepted on
    // the invite path only; the authorising-server membership and power
    // checks are not implemented.
    if event.content_field("join_authorised_via_users_server").is_some() && strict {
        return Err("restricted join via authorising server is not supported".to_owned());
    }

    let rule = join_rule(state);
    let invited = matches!(prior, Some(MembershipState::Invite));
    let allowed = match rule.as_str() {
        "public" => true,
        "invite" | "knock" | "restricted" => invited,
        "knock_restricted" if event.room_version.knock_restricted_join_rule => invited,
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(format!("join rule {rule} forbids this join"))
    }
}

fn check_invite(event: &Event, state: &AuthState, target: &str, strict: bool) -> Result<(), String> {
    if event.content_field("third_party_invite").is_some() {
        // TODO: third-party invite token verification.
        if strict {
            return Err("third-party invites are not supported".to_owned());
        }
    }

    if member_state(state, event.sender.as_str()) != Some(MembershipState::Join) {
        return Err("invite sender is not joined".to_owned());
    }
    match member_state(state, target) {
        Some(MembershipState::Ban) => return Err("invite target is banned".to_owned()),
        Some(MembershipState::Join) => return Err("invite target is already joined".to_owned()),
        _ => {}
    }

    let sender_power = get_user_power_level(event.sender.as_str(), state);
    let invite_level = power_level_scalar(state, "invite").unwrap_or(DEFAULT_INVITE_LEVEL);
    if sender_power < invite_level {
        return Err(format!(
            "sender power {sender_power} below invite level {invite_level}"
        ));
    }
    Ok(())
}

fn check_leave(event: &Event, state: &AuthState, target: &str) -> Result<(), String> {
    if event.sender.as_str() == target {
        return match member_state(state, target) {
            Some(MembershipState::Invite | MembershipState::Join | MembershipState::Knock) => Ok(()),
            other => Err(format!("cannot leave from membership {other:?}")),
        };
    }

    if member_state(state, event.sender.as_str()) != Some(MembershipState::Join) {
        return Err("kick sender is not joined".to_owned());
    }

    let sender_power = get_user_power_level(event.sender.as_str(), state);
    let target_power = get_user_power_level(target, state);

    if member_state(state, target) == Some(MembershipState::Ban) {
        let ban_level = power_level_scalar(state, "ban").unwrap_or(DEFAULT_BAN_LEVEL);
        if sender_power < ban_level {
            return Err("sender cannot lift a ban".to_owned());
        }
    }

    let kick_level = power_level_scalar(state, "kick").unwrap_or(DEFAULT_KICK_LEVEL);
    if sender_power < kick_level {
        return Err(format!("sender power {sender_power} below kick level {kick_level}"));
    }
    if sender_power <= target_power {
        return Err("kick target is not less powerful than sender".to_owned());
    }
    Ok(())
}

fn check_ban(event: &Event, state: &AuthState, target: &str) -> Result<(), String> {
    if member_state(state, event.sender.as_str()) != Some(MembershipState::Join) {
        return Err("ban sender is not joined".to_owned());
    }
    let sender_power = get_user_power_level(event.sender.as_str(), state);
    let target_power = get_user_power_level(target, state);
    let ban_level = power_level_scalar(state, "ban").unwrap_or(DEFAULT_BAN_LEVEL);
    if sender_power < ban_level {
        return Err(format!("sender power {sender_power} below ban level {ban_level}"));
    }
    if sender_power <= target_power {
        return Err("ban target is not less powerful than sender".to_owned());
    }
    Ok(())
}

fn check_knock(event: &Event, state: &AuthState, target: &str) -> Result<(), String> {
    if event.sender.as_str() != target {
        return Err("knock sender does not match target".to_owned());
    }
    let rule = join_rule(state);
    let knockable = rule == "knock"
        || (rule == "knock_restricted" && event.room_version.knock_restricted_join_rule);
    if !knockable {
        return Err(format!("join rule {rule} forbids knocking"));
    }
    match member_state(state, target) {
        Some(MembershipState::Ban) => Err("knock target is banned".to_owned()),
        Some(MembershipState::Join) => Err("knock target is already joined".to_owned()),
        _ => Ok(()),
    }
}

fn check_default(event: &Event, create: &Arc<Event>, state: &AuthState) -> Result<(), String> {
    if member_state(state, event.sender.as_str()) != Some(MembershipState::Join) {
        return Err("sender is not joined".to_owned());
    }

    let sender_power = user_power_level(event.sender.as_str(), state, create);
    let required = required_power_level(event, state);
    if sender_power < required {
        return Err(format!(
            "sender power {sender_power} below required level {required}"
        ));
    }

    if let Some(state_key) = event.state_key.as_deref() {
        if state_key.starts_with('@') && state_key != event.sender.as_str() {
            return Err("state key refers to another user".to_owned());
        }
    }

    if event.kind == TimelineEventType::RoomPowerLevels {
        check_power_levels(event, state, sender_power)?;
    }
    Ok(())
}

/// The power-levels delta check: every changed field must be within the
/// sender's own level, and foreign `users` entries may only be changed
/// below it.
fn check_power_levels(event: &Event, state: &AuthState, sender_power: i64) -> Result<(), String> {
    let new_content = event.content().ok_or("power_levels event without content")?;
    let old_content = state
        .get(&(StateEventType::RoomPowerLevels, String::new()))
        .and_then(|e| e.content().cloned());
    let strict_int = event.room_version.enforce_int_power_levels;

    for user in field_map(Some(new_content), "users").keys() {
        if UserId::parse(user.as_str()).is_err() {
            return Err(format!("malformed user id {user} in users"));
        }
    }

    for field in POWER_LEVEL_SCALARS {
        let old_value = read_level(old_content.as_ref(), field, strict_int)?;
        let new_value = read_level(Some(new_content), field, strict_int)?;
        check_level_change(field, None, old_value, new_value, sender_power, event)?;
    }

    for map in POWER_LEVEL_MAPS {
        let old_map = field_map(old_content.as_ref(), map);
        let new_map = field_map(Some(new_content), map);
        let mut keys: Vec<&String> = old_map.keys().chain(new_map.keys()).collect();
        keys.sort();
        keys.dedup();
        for key in keys {
            let old_value = match old_map.get(key) {
                Some(value) => Some(level_value(value, strict_int).ok_or_else(|| {
                    format!("non-integer power level for {key} in old {map}")
                })?),
                None => None,
            };
            let new_value = match new_map.get(key) {
                Some(value) => Some(level_value(value, strict_int).ok_or_else(|| {
                    format!("non-integer power level for {key} in {map}")
                })?),
                None => None,
            };
            let foreign_user = *map == "users" && key != event.sender.as_str();
            check_level_change(map, Some(key), old_value, new_value, sender_power, event)
                .and_then(|()| {
                    // Mutating another user's entry requires strictly more
                    // power than that user currently has.
                    if foreign_user && old_value != new_value {
                        if let Some(old) = old_value {
                            if old > sender_power - 1 {
                                return Err(format!(
                                    "cannot change level of {key} at or above own level"
                                ));
                            }
                        }
                    }
                    Ok(())
                })?;
        }
    }
    Ok(())
}

fn check_level_change(
    field: &str,
    key: Option<&String>,
    old_value: Option<i64>,
    new_value: Option<i64>,
    sender_power: i64,
    _event: &Event,
) -> Result<(), String> {
    if old_value == new_value {
        return Ok(());
    }
    let label = match key {
        Some(key) => format!("{field}[{key}]"),
        None => field.to_owned(),
    };
    if let Some(old) = old_value {
        if old > sender_power {
            return Err(format!("old {label} level {old} above sender power"));
        }
    }
    if let Some(new) = new_value {
        if new > sender_power {
            return Err(format!("new {label} level {new} above sender power"));
        }
    }
    Ok(())
}

fn read_level(
    content: Option<&CanonicalJsonObject>,
    field: &str,
    strict_int: bool,
) -> Result<Option<i64>, String> {
    match content.and_then(|c| c.get(field)) {
        None => Ok(None),
        Some(value) => level_value(value, strict_int)
            .map(Some)
            .ok_or_else(|| format!("non-integer power level in {field}")),
    }
}

fn field_map<'a>(
    content: Option<&'a CanonicalJsonObject>,
    field: &str,
) -> &'a CanonicalJsonObject {
    static EMPTY: std::sync::OnceLock<CanonicalJsonObject> = std::sync::OnceLock::new();
    match content.and_then(|c| c.get(field)) {
        Some(CanonicalJsonValue::Object(object)) => object,
        _ => EMPTY.get_or_init(CanonicalJsonObject::new),
    }
}

/// Integer reading per the profile: integers always, numeric strings only
/// in relaxed mode.
fn level_value(value: &CanonicalJsonValue, strict_int: bool) -> Option<i64> {
    match value {
        CanonicalJsonValue::Integer(i) => Some(i64::from(*i)),
        CanonicalJsonValue::String(s) if !strict_int => s.parse::<i64>().ok(),
        _ => None,
    }
}

/// Relaxed integer reading, used everywhere a stored power level is read.
pub(crate) fn get_int(value: &CanonicalJsonValue) -> Option<i64> {
    level_value(value, false)
}

/// Current membership of `user` in the snapshot.
pub(crate) fn member_state(state: &AuthState, user: &str) -> Option<MembershipState> {
    state
        .get(&(StateEventType::RoomMember, user.to_owned()))
        .and_then(|e| e.membership())
}

fn join_rule(state: &AuthState) -> String {
    state
        .get(&(StateEventType::RoomJoinRules, String::new()))
        .and_then(|e| e.content_str("join_rule").map(str::to_owned))
        .unwrap_or_else(|| "invite".to_owned())
}

/// The room creator: `content.creator` of the create event, or its sender
/// under the implicit-creator profile.
pub(crate) fn creator_of(create: &Event) -> Option<String> {
    if create.room_version.implicit_room_creator {
        Some(create.sender.as_str().to_owned())
    } else {
        create.content_str("creator").map(str::to_owned)
    }
}

/// Power level of `user`: `users[user] || users_default || 0`, with the
/// creator defaulting to 100 when the room has no power-levels event.
pub fn get_user_power_level(user: &str, state: &AuthState) -> i64 {
    let create = state.get(&(StateEventType::RoomCreate, String::new()));
    match create {
        Some(create) => {
            let create = create.clone();
            user_power_level(user, state, &create)
        }
        None => 0,
    }
}

fn user_power_level(user: &str, state: &AuthState, create: &Arc<Event>) -> i64 {
    match state.get(&(StateEventType::RoomPowerLevels, String::new())) {
        Some(power_levels) => {
            let content = power_levels.content();
            let user_level = content
                .and_then(|c| c.get("users"))
                .and_then(|users| match users {
                    CanonicalJsonValue::Object(users) => users.get(user),
                    _ => None,
                })
                .and_then(get_int);
            if let Some(level) = user_level {
                return level;
            }
            content
                .and_then(|c| c.get("users_default"))
                .and_then(get_int)
                .unwrap_or(0)
        }
        None => {
            if creator_of(create).as_deref() == Some(user) {
                100
            } else {
                0
            }
        }
    }
}

fn power_level_scalar(state: &AuthState, field: &str) -> Option<i64> {
    state
        .get(&(StateEventType::RoomPowerLevels, String::new()))?
        .content_field(field)
        .and_then(get_int)
}

/// Required power for a non-membership event:
/// `events[type] || events_default || 0`.
fn required_power_level(event: &Event, state: &AuthState) -> i64 {
    let content = match state.get(&(StateEventType::RoomPowerLevels, String::new())) {
        Some(power_levels) => match power_levels.content() {
            Some(content) => content,
            None => return 0,
        },
        None => return 0,
    };
    let per_type = match content.get("events") {
        Some(CanonicalJsonValue::Object(events)) => {
            events.get(event.kind.to_string().as_str()).and_then(get_int)
        }
        _ => None,
    };
    per_type.unwrap_or_else(|| content.get("events_default").and_then(get_int).unwrap_or(0))
}
