//! The persistent data unit: a signed room event
//!
//! A `Pdu` is an immutable JSON object plus its event id. The id is not
//! part of the serialized body (v4 rooms derive it from the reference
//! hash), so the two travel together in one struct. Field types are loose
//! on purpose: a malformed event must still parse so the conformance
//! report can describe what is wrong with it.

use crate::errors::Result;
use crate::id::{EventId, KeyId, RoomId, ServerName, UserId};
use crate::{canonical, signing};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Hard ceiling on the canonical serialized size of one event.
pub const MAX_EVENT_SIZE: usize = 65_535;

/// Signature map: server name to key id to unpadded base64 signature.
pub type Signatures = BTreeMap<ServerName, BTreeMap<KeyId, String>>;

/// The `hashes` object carried by every signed event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHashes {
    /// Unpadded standard base64 of the SHA-256 content hash.
    pub sha256: String,
}

/// The serialized body of a room event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PduBody {
    #[serde(default, skip_serializing_if = "RoomId::is_empty")]
    pub room_id: RoomId,

    #[serde(default, skip_serializing_if = "UserId::is_empty")]
    pub sender: UserId,

    /// The event type, `m.room.*` for protocol events.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    /// Present exactly when the event is a state event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,

    /// Authoring server; absent on some vintages, fall back to the
    /// sender's host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<ServerName>,

    #[serde(default)]
    pub origin_server_ts: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prev_events: Vec<EventId>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auth_events: Vec<EventId>,

    /// For `m.room.redaction`: the event being redacted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<EventId>,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<EventHashes>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: Signatures,

    /// Never hashed or signed; carried for the benefit of consumers.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub unsigned: Value,
}

impl PduBody {
    /// A content field by name, when content is an object.
    pub fn content_field(&self, name: &str) -> Option<&Value> {
        self.content.as_object().and_then(|map| map.get(name))
    }

    /// The `membership` string out of the content, for member events.
    pub fn membership(&self) -> Option<&str> {
        self.content_field("membership").and_then(Value::as_str)
    }
}

/// A room event bound to its (claimed or derived) event id.
#[derive(Debug, Clone, PartialEq)]
pub struct Pdu {
    pub event_id: EventId,
    pub body: PduBody,
}

impl Pdu {
    /// Bind a body to an already-known event id.
    pub fn from_parts(event_id: EventId, body: PduBody) -> Self {
        Self { event_id, body }
    }

    /// Parse a body and derive its v4 event id from the reference hash.
    pub fn from_body(body: PduBody) -> Result<Self> {
        let event_id = signing::event_id_for(&body)?;
        Ok(Self { event_id, body })
    }

    /// Parse raw JSON bytes and derive the event id.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        let body: PduBody = serde_json::from_slice(bytes)?;
        Self::from_body(body)
    }

    /// Parse raw JSON bytes under a claimed id, without verifying the
    /// claim. Callers that care run `signing::check_id` afterwards.
    pub fn from_json_bytes_claimed(bytes: &[u8], claimed: EventId) -> Result<Self> {
        let body: PduBody = serde_json::from_slice(bytes)?;
        Ok(Self {
            event_id: claimed,
            body,
        })
    }

    /// The authoring server: explicit `origin`, else the sender's host.
    pub fn origin(&self) -> ServerName {
        match &self.body.origin {
            Some(origin) => origin.clone(),
            None => ServerName::new(self.body.sender.host().unwrap_or_default()),
        }
    }

    /// State events carry a `state_key`.
    pub fn is_state(&self) -> bool {
        self.body.state_key.is_some()
    }

    /// The canonical serialized body.
    pub fn serialized(&self) -> Result<String> {
        let value = serde_json::to_value(&self.body)?;
        canonical::to_canonical_string(&value)
    }

    /// Size of the canonical serialized body in bytes.
    pub fn serialized_size(&self) -> Result<usize> {
        self.serialized().map(|s| s.len())
    }

    /// Sort key for batch ordering: depth, then origin timestamp, then id.
    pub fn sort_key(&self) -> (i64, u64, &str) {
        (
            self.body.depth.unwrap_or(i64::MAX),
            self.body.origin_server_ts,
            self.event_id.as_str(),
        )
    }
}
