//! Authorization rules
//!
//! Evaluates an event against the room's auth state: the create event,
//! power levels, join rules, and the memberships of sender and target.
//! Rejection here is a hard per-event failure; the event is logged and
//! discarded.

use crate::store;
use serde_json::Value;
use std::sync::Arc;
use tessera_core::{Error, Pdu, Result, RoomId, UserId};
use tessera_storage::StorageEngine;

const DEFAULT_BAN_LEVEL: i64 = 50;
const DEFAULT_KICK_LEVEL: i64 = 50;
const DEFAULT_INVITE_LEVEL: i64 = 0;
const CREATOR_LEVEL: i64 = 100;

/// The slice of room state the rules consult.
#[derive(Debug, Default)]
pub struct AuthContext {
    pub create: Option<Pdu>,
    pub power_levels: Option<Pdu>,
    pub join_rules: Option<Pdu>,
    pub sender_membership: Option<String>,
    /// Membership of the member event's target, when applicable.
    pub target_membership: Option<String>,
}

/// Load the auth context for an event from current room state.
pub async fn load_auth_context(
    storage: &Arc<dyn StorageEngine>,
    room_id: &RoomId,
    sender: &UserId,
    target: Option<&str>,
) -> Result<AuthContext> {
    let create = store::load_state_event(storage, room_id, "m.room.create", "").await?;
    let power_levels = store::load_state_event(storage, room_id, "m.room.power_levels", "").await?;
    let join_rules = store::load_state_event(storage, room_id, "m.room.join_rules", "").await?;

    let sender_membership =
        store::load_state_event(storage, room_id, "m.room.member", sender.as_str())
            .await?
            .and_then(|pdu| pdu.body.membership().map(str::to_owned));

    let target_membership = match target {
        Some(target) if target != sender.as_str() => {
            store::load_state_event(storage, room_id, "m.room.member", target)
                .await?
                .and_then(|pdu| pdu.body.membership().map(str::to_owned))
        }
        Some(_) => sender_membership.clone(),
        None => None,
    };

    Ok(AuthContext {
        create,
        power_levels,
        join_rules,
        sender_membership,
        target_membership,
    })
}

/// Apply the authorization rules to one event.
pub fn auth_check(pdu: &Pdu, ctx: &AuthContext) -> Result<()> {
    if pdu.body.kind == "m.room.create" {
        if ctx.create.is_some() {
            return Err(Error::unauthorized("room already has m.room.create"));
        }
        if !pdu.body.prev_events.is_empty() {
            return Err(Error::unauthorized("m.room.create cannot have prev_events"));
        }
        return Ok(());
    }

    if ctx.create.is_none() {
        return Err(Error::unauthorized(format!(
            "no m.room.create in {}",
            pdu.body.room_id
        )));
    }

    if pdu.body.kind == "m.room.member" {
        return member_check(pdu, ctx);
    }

    if ctx.sender_membership.as_deref() != Some("join") {
        return Err(Error::unauthorized(format!(
            "sender {} is not joined to {}",
            pdu.body.sender, pdu.body.room_id
        )));
    }

    let required = required_level(pdu, ctx);
    let power = user_level(ctx, pdu.body.sender.as_str());
    if power < required {
        return Err(Error::unauthorized(format!(
            "sender {} has power {power}, needs {required} for {}",
            pdu.body.sender, pdu.body.kind
        )));
    }

    Ok(())
}

fn member_check(pdu: &Pdu, ctx: &AuthContext) -> Result<()> {
    let membership = pdu
        .body
        .membership()
        .ok_or_else(|| Error::unauthorized("member event without membership"))?;
    let target = pdu
        .body
        .state_key
        .as_deref()
        .ok_or_else(|| Error::unauthorized("member event without state_key"))?;

    let sender = pdu.body.sender.as_str();
    let self_change = sender == target;
    let sender_level = user_level(ctx, sender);
    let target_level = user_level(ctx, target);
    let sender_joined = ctx.sender_membership.as_deref() == Some("join");

    match membership {
        "join" => {
            if !self_change {
                return Err(Error::unauthorized("cannot join on behalf of another user"));
            }
            if ctx.target_membership.as_deref() == Some("ban") {
                return Err(Error::unauthorized(format!("{target} is banned")));
            }
            let rejoining = matches!(ctx.target_membership.as_deref(), Some("join" | "invite"));
            if sender == creator(ctx) || rejoining || join_rule(ctx) == "public" {
                Ok(())
            } else {
                Err(Error::unauthorized(format!(
                    "join rules forbid {sender} joining {}",
                    pdu.body.room_id
                )))
            }
        }
        "invite" => {
            if !sender_joined {
                return Err(Error::unauthorized("inviter is not joined"));
            }
            if ctx.target_membership.as_deref() == Some("ban") {
                return Err(Error::unauthorized(format!("{target} is banned")));
            }
            if sender_level < level(ctx, "invite", DEFAULT_INVITE_LEVEL) {
                return Err(Error::unauthorized("insufficient power to invite"));
            }
            Ok(())
        }
        "leave" => {
            if self_change {
                if matches!(ctx.sender_membership.as_deref(), Some("join" | "invite")) {
                    Ok(())
                } else {
                    Err(Error::unauthorized("cannot leave a room not joined"))
                }
            } else {
                // A kick.
                if !sender_joined {
                    return Err(Error::unauthorized("kicker is not joined"));
                }
                if sender_level < level(ctx, "kick", DEFAULT_KICK_LEVEL)
                    || sender_level <= target_level
                {
                    return Err(Error::unauthorized("insufficient power to kick"));
                }
                Ok(())
            }
        }
        "ban" => {
            if !sender_joined {
                return Err(Error::unauthorized("banner is not joined"));
            }
            if sender_level < level(ctx, "ban", DEFAULT_BAN_LEVEL) || sender_level <= target_level {
                return Err(Error::unauthorized("insufficient power to ban"));
            }
            Ok(())
        }
        other => Err(Error::unauthorized(format!(
            "membership '{other}' is not authorizable"
        ))),
    }
}

fn creator(ctx: &AuthContext) -> &str {
    let Some(create) = &ctx.create else {
        return "";
    };
    create
        .body
        .content_field("creator")
        .and_then(Value::as_str)
        .unwrap_or_else(|| create.body.sender.as_str())
}

fn join_rule(ctx: &AuthContext) -> &str {
    ctx.join_rules
        .as_ref()
        .and_then(|pdu| pdu.body.content_field("join_rule"))
        .and_then(Value::as_str)
        .unwrap_or("invite")
}

/// A named top-level level from the power levels content.
fn level(ctx: &AuthContext, name: &str, default: i64) -> i64 {
    ctx.power_levels
        .as_ref()
        .and_then(|pdu| pdu.body.content_field(name))
        .and_then(Value::as_i64)
        .unwrap_or(default)
}

/// A user's power level. Without a power levels event the creator holds
/// the default creator level and everyone else zero.
fn user_level(ctx: &AuthContext, user: &str) -> i64 {
    let Some(power_levels) = &ctx.power_levels else {
        return if user == creator(ctx) { CREATOR_LEVEL } else { 0 };
    };

    let explicit = power_levels
        .body
        .content_field("users")
        .and_then(Value::as_object)
        .and_then(|users| users.get(user))
        .and_then(Value::as_i64);

    explicit.unwrap_or_else(|| level(ctx, "users_default", 0))
}

/// The level required to send this event.
fn required_level(pdu: &Pdu, ctx: &AuthContext) -> i64 {
    let Some(power_levels) = &ctx.power_levels else {
        return 0;
    };

    let explicit = power_levels
        .body
        .content_field("events")
        .and_then(Value::as_object)
        .and_then(|events| events.get(&pdu.body.kind))
        .and_then(Value::as_i64);

    explicit.unwrap_or_else(|| {
        if pdu.is_state() {
            level(ctx, "state_default", 50)
        } else {
            level(ctx, "events_default", 0)
        }
    })
}
