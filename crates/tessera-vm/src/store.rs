//! Column key encodings and read helpers
//!
//! Every key the evaluator writes or reads is encoded here, in one
//! place: room-scoped keys are the room id, a NUL separator, and the
//! scoped parts. Depths are big-endian so the timeline column sorts by
//! depth under a prefix scan.

use crate::state_res::StateMap;
use async_trait::async_trait;
use std::sync::Arc;
use tessera_core::{Error, EventId, Pdu, Result, RoomId, ServerName};
use tessera_fetch::RoomOrigins;
use tessera_storage::{columns, StorageEngine};

/// Additional column: forward extremities per room.
pub const ROOM_HEADS: &str = "room_heads";

pub fn event_key(event_id: &EventId) -> Vec<u8> {
    event_id.as_str().as_bytes().to_vec()
}

pub fn seq_key(sequence: u64) -> Vec<u8> {
    sequence.to_be_bytes().to_vec()
}

fn room_scoped(room_id: &RoomId, parts: &[&[u8]]) -> Vec<u8> {
    let mut key = room_id.as_str().as_bytes().to_vec();
    for part in parts {
        key.push(0);
        key.extend_from_slice(part);
    }
    key
}

pub fn room_prefix(room_id: &RoomId) -> Vec<u8> {
    let mut key = room_id.as_str().as_bytes().to_vec();
    key.push(0);
    key
}

pub fn room_events_key(room_id: &RoomId, depth: u64, event_id: &EventId) -> Vec<u8> {
    room_scoped(
        room_id,
        &[&depth.to_be_bytes(), event_id.as_str().as_bytes()],
    )
}

pub fn room_state_key(room_id: &RoomId, kind: &str, state_key: &str) -> Vec<u8> {
    room_scoped(room_id, &[kind.as_bytes(), state_key.as_bytes()])
}

pub fn room_origins_key(room_id: &RoomId, origin: &ServerName) -> Vec<u8> {
    room_scoped(room_id, &[origin.as_str().as_bytes()])
}

pub fn room_heads_key(room_id: &RoomId, event_id: &EventId) -> Vec<u8> {
    room_scoped(room_id, &[event_id.as_str().as_bytes()])
}

/// Whether an event has been committed.
pub async fn event_exists(storage: &Arc<dyn StorageEngine>, event_id: &EventId) -> Result<bool> {
    storage
        .has(columns::EVENT_JSON, &event_key(event_id))
        .await
        .map_err(Error::from)
}

/// Load a committed event.
pub async fn load_event(
    storage: &Arc<dyn StorageEngine>,
    event_id: &EventId,
) -> Result<Option<Pdu>> {
    let Some(bytes) = storage
        .get(columns::EVENT_JSON, &event_key(event_id))
        .await
        .map_err(Error::from)?
    else {
        return Ok(None);
    };
    Pdu::from_json_bytes_claimed(&bytes, event_id.clone()).map(Some)
}

/// Load the current state map of a room.
pub async fn load_state_map(
    storage: &Arc<dyn StorageEngine>,
    room_id: &RoomId,
) -> Result<StateMap> {
    let prefix = room_prefix(room_id);
    let cells = storage
        .scan_prefix(columns::ROOM_STATE, &prefix)
        .await
        .map_err(Error::from)?;

    let mut state = StateMap::new();
    for (key, value) in cells {
        let scoped = &key[prefix.len()..];
        let Some(split) = scoped.iter().position(|b| *b == 0) else {
            continue;
        };
        let kind = String::from_utf8_lossy(&scoped[..split]).into_owned();
        let state_key = String::from_utf8_lossy(&scoped[split + 1..]).into_owned();
        let event_id = EventId::new(String::from_utf8_lossy(&value).into_owned());
        state.insert((kind, state_key), event_id);
    }
    Ok(state)
}

/// Load the event currently occupying one state cell.
pub async fn load_state_event(
    storage: &Arc<dyn StorageEngine>,
    room_id: &RoomId,
    kind: &str,
    state_key: &str,
) -> Result<Option<Pdu>> {
    let Some(value) = storage
        .get(columns::ROOM_STATE, &room_state_key(room_id, kind, state_key))
        .await
        .map_err(Error::from)?
    else {
        return Ok(None);
    };
    let event_id = EventId::new(String::from_utf8_lossy(&value).into_owned());
    load_event(storage, &event_id).await
}

/// Forward extremities of a room with their depths.
pub async fn room_heads(
    storage: &Arc<dyn StorageEngine>,
    room_id: &RoomId,
) -> Result<Vec<(EventId, i64)>> {
    let prefix = room_prefix(room_id);
    let heads = storage
        .scan_prefix(ROOM_HEADS, &prefix)
        .await
        .map_err(Error::from)?;

    Ok(heads
        .into_iter()
        .map(|(key, value)| {
            let event_id = EventId::new(String::from_utf8_lossy(&key[prefix.len()..]).into_owned());
            let depth = value
                .as_slice()
                .try_into()
                .map(i64::from_be_bytes)
                .unwrap_or(0);
            (event_id, depth)
        })
        .collect())
}

/// Committed `(sequence, event_id)` points after `seq`, in order. The
/// durable counterpart of the registry's `seqnext` for tailers that
/// outlive the evals.
pub async fn committed_after(
    storage: &Arc<dyn StorageEngine>,
    seq: u64,
) -> Result<Vec<(u64, EventId)>> {
    let points = storage
        .scan_prefix(columns::EVENT_SEQ, &[])
        .await
        .map_err(Error::from)?;

    Ok(points
        .into_iter()
        .filter_map(|(key, value)| {
            let sequence = key.as_slice().try_into().map(u64::from_be_bytes).ok()?;
            (sequence > seq).then(|| {
                (
                    sequence,
                    EventId::new(String::from_utf8_lossy(&value).into_owned()),
                )
            })
        })
        .collect())
}

/// Room origin enumeration backed by the `room_origins` column.
pub struct StorageRoomOrigins {
    storage: Arc<dyn StorageEngine>,
}

impl StorageRoomOrigins {
    pub fn new(storage: Arc<dyn StorageEngine>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl RoomOrigins for StorageRoomOrigins {
    async fn origins(&self, room_id: &RoomId) -> Result<Vec<ServerName>> {
        let prefix = room_prefix(room_id);
        let rows = self
            .storage
            .scan_prefix(columns::ROOM_ORIGINS, &prefix)
            .await
            .map_err(Error::from)?;

        Ok(rows
            .into_iter()
            .map(|(key, _)| {
                ServerName::new(String::from_utf8_lossy(&key[prefix.len()..]).into_owned())
            })
            .collect())
    }
}
