//! Event hashing, event ids, and event signatures
//!
//! Three related computations over the canonical form:
//!
//! - the **content hash** (SHA-256 over the event minus `signatures`,
//!   `unsigned`, `hashes`), stored in `hashes.sha256`
//! - the **reference hash** (SHA-256 over the redacted event minus
//!   `signatures` and `unsigned`, with `hashes` retained), whose URL-safe
//!   unpadded base64 is the v4 event id
//! - the **server signature**, Ed25519 over the same redacted payload
//!
//! Because signatures are stripped from both payloads, signing an event
//! never changes its id, and additional signatures can accrue without
//! invalidating earlier ones.

use crate::canonical;
use crate::crypto::{Signature, SigningKey, VerifyingKey};
use crate::errors::{Error, Result};
use crate::id::{EventId, KeyId, ServerName};
use crate::pdu::{EventHashes, Pdu, PduBody};
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Top-level keys that survive redaction.
const ESSENTIAL_KEYS: &[&str] = &[
    "auth_events",
    "content",
    "depth",
    "hashes",
    "membership",
    "origin",
    "origin_server_ts",
    "prev_events",
    "prev_state",
    "room_id",
    "sender",
    "signatures",
    "state_key",
    "type",
];

fn essential_content_keys(kind: &str) -> &'static [&'static str] {
    match kind {
        "m.room.member" => &["membership"],
        "m.room.create" => &["creator"],
        "m.room.join_rules" => &["join_rule"],
        "m.room.power_levels" => &[
            "ban",
            "events",
            "events_default",
            "kick",
            "redact",
            "state_default",
            "users",
            "users_default",
        ],
        "m.room.history_visibility" => &["history_visibility"],
        "m.room.aliases" => &["aliases"],
        _ => &[],
    }
}

/// The redacted form of an event body, as a JSON value.
pub fn redact(body: &PduBody) -> Result<Value> {
    let mut value = serde_json::to_value(body)?;
    let Value::Object(ref mut object) = value else {
        return Err(Error::bad_json("event body is not a JSON object"));
    };

    object.retain(|key, _| ESSENTIAL_KEYS.contains(&key.as_str()));

    let keep = essential_content_keys(&body.kind);
    if let Some(Value::Object(content)) = object.get_mut("content") {
        content.retain(|key, _| keep.contains(&key.as_str()));
    }

    Ok(value)
}

fn strip(value: &mut Value, keys: &[&str]) {
    if let Value::Object(object) = value {
        for key in keys {
            object.remove(*key);
        }
    }
}

fn sha256_canonical(value: &Value) -> Result<[u8; 32]> {
    let bytes = canonical::to_canonical_bytes(value)?;
    Ok(Sha256::digest(&bytes).into())
}

/// SHA-256 content hash: the full event minus `signatures`, `unsigned`,
/// and any pre-existing `hashes`.
pub fn content_hash(body: &PduBody) -> Result<[u8; 32]> {
    let mut value = serde_json::to_value(body)?;
    strip(&mut value, &["signatures", "unsigned", "hashes"]);
    sha256_canonical(&value)
}

/// The `hashes` object for a body, ready to attach.
pub fn content_hashes(body: &PduBody) -> Result<EventHashes> {
    Ok(EventHashes {
        sha256: STANDARD_NO_PAD.encode(content_hash(body)?),
    })
}

/// Attach the content hash to a body under construction.
pub fn hash_event(body: &mut PduBody) -> Result<()> {
    body.hashes = Some(content_hashes(body)?);
    Ok(())
}

/// Recompute the content hash and compare against the carried one.
pub fn verify_content_hash(body: &PduBody) -> Result<bool> {
    let Some(carried) = &body.hashes else {
        return Ok(false);
    };
    Ok(carried.sha256 == STANDARD_NO_PAD.encode(content_hash(body)?))
}

/// SHA-256 reference hash: the redacted event minus `signatures` and
/// `unsigned`, with `hashes` retained.
pub fn reference_hash(body: &PduBody) -> Result<[u8; 32]> {
    let mut value = redact(body)?;
    strip(&mut value, &["signatures", "unsigned"]);
    sha256_canonical(&value)
}

/// The v4 event id derived from the reference hash.
pub fn event_id_for(body: &PduBody) -> Result<EventId> {
    let hash = reference_hash(body)?;
    Ok(EventId::new(format!("${}", URL_SAFE_NO_PAD.encode(hash))))
}

/// True when the carried event id matches the recomputed reference hash.
pub fn check_id(pdu: &Pdu) -> bool {
    match event_id_for(&pdu.body) {
        Ok(derived) => derived == pdu.event_id,
        Err(_) => false,
    }
}

fn signing_payload(body: &PduBody) -> Result<Vec<u8>> {
    let mut value = redact(body)?;
    strip(&mut value, &["signatures", "unsigned"]);
    canonical::to_canonical_bytes(&value)
}

/// Sign a body and insert the signature under `server`/`key_id`.
pub fn sign_event(
    body: &mut PduBody,
    server: &ServerName,
    key_id: &KeyId,
    key: &SigningKey,
) -> Result<()> {
    let payload = signing_payload(body)?;
    let signature = key.sign(&payload);
    body.signatures
        .entry(server.clone())
        .or_default()
        .insert(key_id.clone(), signature.to_base64());
    Ok(())
}

/// Verify the signature carried under `server`/`key_id`.
pub fn verify_event(
    body: &PduBody,
    server: &ServerName,
    key_id: &KeyId,
    key: &VerifyingKey,
) -> Result<()> {
    let encoded = body
        .signatures
        .get(server)
        .and_then(|keys| keys.get(key_id))
        .ok_or_else(|| {
            Error::bad_signature(format!("no signature by {server} with key {key_id}"))
        })?;

    let signature = Signature::from_base64(encoded)?;
    key.verify(&signing_payload(body)?, &signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{RoomId, UserId};
    use serde_json::json;

    fn test_body() -> PduBody {
        PduBody {
            room_id: RoomId::from("!room:example.org"),
            sender: UserId::from("@alice:example.org"),
            kind: "m.room.message".into(),
            origin: Some(ServerName::from("example.org")),
            origin_server_ts: 1_700_000_000_000,
            depth: Some(7),
            prev_events: vec![EventId::from("$prev")],
            auth_events: vec![EventId::from("$auth")],
            content: json!({"body": "hello", "msgtype": "m.text"}),
            ..PduBody::default()
        }
    }

    #[test]
    fn content_hash_roundtrip() {
        let mut body = test_body();
        hash_event(&mut body).unwrap();
        assert!(verify_content_hash(&body).unwrap());

        body.content = json!({"body": "tampered"});
        assert!(!verify_content_hash(&body).unwrap());
    }

    #[test]
    fn event_id_stable_under_signing() {
        let mut body = test_body();
        hash_event(&mut body).unwrap();
        let before = event_id_for(&body).unwrap();

        let key = SigningKey::from_bytes([3u8; 32]);
        sign_event(
            &mut body,
            &ServerName::from("example.org"),
            &KeyId::from("ed25519:auto"),
            &key,
        )
        .unwrap();

        assert_eq!(event_id_for(&body).unwrap(), before);
    }

    #[test]
    fn sign_then_verify() {
        let mut body = test_body();
        hash_event(&mut body).unwrap();

        let server = ServerName::from("example.org");
        let key_id = KeyId::from("ed25519:auto");
        let key = SigningKey::from_bytes([9u8; 32]);
        sign_event(&mut body, &server, &key_id, &key).unwrap();

        let verifying = key.verifying_key();
        assert!(verify_event(&body, &server, &key_id, &verifying).is_ok());

        // A different key must not verify.
        let other = SigningKey::from_bytes([10u8; 32]).verifying_key();
        assert!(verify_event(&body, &server, &key_id, &other).is_err());
    }

    #[test]
    fn redaction_strips_message_content() {
        let body = test_body();
        let redacted = redact(&body).unwrap();
        assert_eq!(redacted["content"], json!({}));
        assert_eq!(redacted["room_id"], json!("!room:example.org"));
        assert!(redacted.get("unsigned").is_none());
    }

    #[test]
    fn redaction_keeps_membership() {
        let mut body = test_body();
        body.kind = "m.room.member".into();
        body.state_key = Some("@alice:example.org".into());
        body.content = json!({"membership": "join", "displayname": "Alice"});

        let redacted = redact(&body).unwrap();
        assert_eq!(redacted["content"], json!({"membership": "join"}));
    }

    #[test]
    fn check_id_detects_tamper() {
        let mut body = test_body();
        hash_event(&mut body).unwrap();
        let pdu = Pdu::from_body(body).unwrap();
        assert!(check_id(&pdu));

        let mut tampered = pdu.clone();
        tampered.body.depth = Some(8);
        assert!(!check_id(&tampered));
    }
}
