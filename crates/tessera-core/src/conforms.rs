//! Structural conformance report for events
//!
//! Every inbound event is screened against a fixed set of structural
//! rules before any cryptography or authorization runs. The outcome is a
//! bitmask report rather than an early error: callers decide which codes
//! are fatal, and evaluation options can downgrade individual codes via a
//! skip mask.

use crate::pdu::Pdu;
use crate::signing;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One structural defect an event can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Code {
    InvalidOrMissingEventId,
    InvalidOrMissingRoomId,
    InvalidOrMissingSenderId,
    MissingType,
    MissingOrigin,
    InvalidOrigin,
    InvalidOrMissingRedactsId,
    MissingContentMembership,
    InvalidContentMembership,
    MissingMemberStateKey,
    InvalidMemberStateKey,
    MissingPrevEvents,
    MissingAuthEvents,
    DepthNegative,
    DepthZero,
    MissingSignatures,
    MissingOriginSignature,
    MismatchOriginSender,
    MismatchCreateSender,
    MismatchAliasesStateKey,
    SelfRedacts,
    SelfPrevEvent,
    SelfAuthEvent,
    DupPrevEvent,
    DupAuthEvent,
    MismatchEventId,
}

impl Code {
    /// Every code, in bit order.
    pub const ALL: [Code; 26] = [
        Code::InvalidOrMissingEventId,
        Code::InvalidOrMissingRoomId,
        Code::InvalidOrMissingSenderId,
        Code::MissingType,
        Code::MissingOrigin,
        Code::InvalidOrigin,
        Code::InvalidOrMissingRedactsId,
        Code::MissingContentMembership,
        Code::InvalidContentMembership,
        Code::MissingMemberStateKey,
        Code::InvalidMemberStateKey,
        Code::MissingPrevEvents,
        Code::MissingAuthEvents,
        Code::DepthNegative,
        Code::DepthZero,
        Code::MissingSignatures,
        Code::MissingOriginSignature,
        Code::MismatchOriginSender,
        Code::MismatchCreateSender,
        Code::MismatchAliasesStateKey,
        Code::SelfRedacts,
        Code::SelfPrevEvent,
        Code::SelfAuthEvent,
        Code::DupPrevEvent,
        Code::DupAuthEvent,
        Code::MismatchEventId,
    ];

    /// The report name of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::InvalidOrMissingEventId => "INVALID_OR_MISSING_EVENT_ID",
            Code::InvalidOrMissingRoomId => "INVALID_OR_MISSING_ROOM_ID",
            Code::InvalidOrMissingSenderId => "INVALID_OR_MISSING_SENDER_ID",
            Code::MissingType => "MISSING_TYPE",
            Code::MissingOrigin => "MISSING_ORIGIN",
            Code::InvalidOrigin => "INVALID_ORIGIN",
            Code::InvalidOrMissingRedactsId => "INVALID_OR_MISSING_REDACTS_ID",
            Code::MissingContentMembership => "MISSING_CONTENT_MEMBERSHIP",
            Code::InvalidContentMembership => "INVALID_CONTENT_MEMBERSHIP",
            Code::MissingMemberStateKey => "MISSING_MEMBER_STATE_KEY",
            Code::InvalidMemberStateKey => "INVALID_MEMBER_STATE_KEY",
            Code::MissingPrevEvents => "MISSING_PREV_EVENTS",
            Code::MissingAuthEvents => "MISSING_AUTH_EVENTS",
            Code::DepthNegative => "DEPTH_NEGATIVE",
            Code::DepthZero => "DEPTH_ZERO",
            Code::MissingSignatures => "MISSING_SIGNATURES",
            Code::MissingOriginSignature => "MISSING_ORIGIN_SIGNATURE",
            Code::MismatchOriginSender => "MISMATCH_ORIGIN_SENDER",
            Code::MismatchCreateSender => "MISMATCH_CREATE_SENDER",
            Code::MismatchAliasesStateKey => "MISMATCH_ALIASES_STATE_KEY",
            Code::SelfRedacts => "SELF_REDACTS",
            Code::SelfPrevEvent => "SELF_PREV_EVENT",
            Code::SelfAuthEvent => "SELF_AUTH_EVENT",
            Code::DupPrevEvent => "DUP_PREV_EVENT",
            Code::DupAuthEvent => "DUP_AUTH_EVENT",
            Code::MismatchEventId => "MISMATCH_EVENT_ID",
        }
    }

    /// Look a code up by its report name.
    pub fn from_name(name: &str) -> Option<Code> {
        Code::ALL.iter().copied().find(|c| c.as_str() == name)
    }

    fn bit(&self) -> u64 {
        1u64 << (*self as u8)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bitmask report of an event's structural defects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conforms {
    report: u64,
}

impl Conforms {
    /// Build a skip mask out of codes to downgrade.
    pub fn mask(codes: &[Code]) -> u64 {
        codes.iter().fold(0, |acc, code| acc | code.bit())
    }

    /// Run every structural check against an event.
    pub fn check(pdu: &Pdu) -> Self {
        let mut report = Conforms::default();
        let body = &pdu.body;

        if !pdu.event_id.is_valid() {
            report.set(Code::InvalidOrMissingEventId);
        } else if !signing::check_id(pdu) {
            report.set(Code::MismatchEventId);
        }

        if !body.room_id.is_valid() {
            report.set(Code::InvalidOrMissingRoomId);
        }

        if !body.sender.is_valid() {
            report.set(Code::InvalidOrMissingSenderId);
        }

        if body.kind.is_empty() {
            report.set(Code::MissingType);
        }

        match &body.origin {
            None => report.set(Code::MissingOrigin),
            Some(origin) if origin.is_empty() => report.set(Code::MissingOrigin),
            Some(origin) if !origin.is_valid() => report.set(Code::InvalidOrigin),
            Some(_) => {}
        }

        if body.signatures.is_empty() {
            report.set(Code::MissingSignatures);
        }

        let origin_signed = body
            .origin
            .as_ref()
            .and_then(|origin| body.signatures.get(origin))
            .map(|keys| !keys.is_empty())
            .unwrap_or(false);
        if !origin_signed {
            report.set(Code::MissingOriginSignature);
        }

        if !report.has(Code::InvalidOrMissingSenderId) {
            let origin = body.origin.as_ref().map(|o| o.as_str()).unwrap_or("");
            if Some(origin) != body.sender.host() {
                report.set(Code::MismatchOriginSender);
            }
        }

        if body.kind == "m.room.create" && body.room_id.host() != body.sender.host() {
            report.set(Code::MismatchCreateSender);
        }

        // The state_key of m.room.aliases is the server whose aliases change.
        if body.kind == "m.room.aliases" && body.sender.host() != body.state_key.as_deref() {
            report.set(Code::MismatchAliasesStateKey);
        }

        if body.kind == "m.room.redaction" {
            let valid = body
                .redacts
                .as_ref()
                .map(|id| id.is_valid())
                .unwrap_or(false);
            if !valid {
                report.set(Code::InvalidOrMissingRedactsId);
            }
        }

        if body.redacts.as_ref() == Some(&pdu.event_id) {
            report.set(Code::SelfRedacts);
        }

        if body.kind == "m.room.member" {
            match body.membership() {
                None | Some("") => report.set(Code::MissingContentMembership),
                Some(membership) if !membership.bytes().all(|b| b.is_ascii_lowercase()) => {
                    report.set(Code::InvalidContentMembership)
                }
                Some(_) => {}
            }

            match &body.state_key {
                None => report.set(Code::MissingMemberStateKey),
                Some(key) if key.is_empty() => report.set(Code::MissingMemberStateKey),
                Some(key) if !crate::id::UserId::from(key.as_str()).is_valid() => {
                    report.set(Code::InvalidMemberStateKey)
                }
                Some(_) => {}
            }
        }

        if body.kind != "m.room.create" {
            if body.prev_events.is_empty() {
                report.set(Code::MissingPrevEvents);
            }
            if body.auth_events.is_empty() {
                report.set(Code::MissingAuthEvents);
            }
            if body.depth == Some(0) {
                report.set(Code::DepthZero);
            }
        }

        if matches!(body.depth, Some(depth) if depth < 0) {
            report.set(Code::DepthNegative);
        }

        for prev in &body.prev_events {
            if *prev == pdu.event_id {
                report.set(Code::SelfPrevEvent);
            }
        }
        for auth in &body.auth_events {
            if *auth == pdu.event_id {
                report.set(Code::SelfAuthEvent);
            }
        }

        if has_duplicates(&body.prev_events) {
            report.set(Code::DupPrevEvent);
        }
        if has_duplicates(&body.auth_events) {
            report.set(Code::DupAuthEvent);
        }

        report
    }

    /// Run the checks, then clear every code in the skip mask.
    pub fn check_with_skip(pdu: &Pdu, skip: u64) -> Self {
        let mut report = Self::check(pdu);
        report.report &= !skip;
        report
    }

    pub fn set(&mut self, code: Code) {
        self.report |= code.bit();
    }

    pub fn del(&mut self, code: Code) {
        self.report &= !code.bit();
    }

    pub fn has(&self, code: Code) -> bool {
        self.report & code.bit() != 0
    }

    /// True when no defect was found.
    pub fn clean(&self) -> bool {
        self.report == 0
    }

    /// Space-separated names of every set code.
    pub fn report_string(&self) -> String {
        let names: Vec<&str> = Code::ALL
            .iter()
            .filter(|code| self.has(**code))
            .map(|code| code.as_str())
            .collect();
        names.join(" ")
    }
}

impl fmt::Display for Conforms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.report_string())
    }
}

fn has_duplicates(ids: &[crate::id::EventId]) -> bool {
    for (i, id) in ids.iter().enumerate() {
        if ids[i + 1..].contains(id) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{EventId, KeyId, RoomId, ServerName, UserId};
    use crate::pdu::{Pdu, PduBody};
    use crate::signing;
    use serde_json::json;

    fn conforming_pdu() -> Pdu {
        let mut body = PduBody {
            room_id: RoomId::from("!room:example.org"),
            sender: UserId::from("@alice:example.org"),
            kind: "m.room.message".into(),
            origin: Some(ServerName::from("example.org")),
            origin_server_ts: 1_700_000_000_000,
            depth: Some(3),
            prev_events: vec![EventId::from("$prev")],
            auth_events: vec![EventId::from("$auth")],
            content: json!({"body": "hi"}),
            ..PduBody::default()
        };
        signing::hash_event(&mut body).unwrap();
        let key = crate::crypto::SigningKey::from_bytes([1u8; 32]);
        signing::sign_event(
            &mut body,
            &ServerName::from("example.org"),
            &KeyId::from("ed25519:auto"),
            &key,
        )
        .unwrap();
        Pdu::from_body(body).unwrap()
    }

    #[test]
    fn clean_event_reports_nothing() {
        let report = Conforms::check(&conforming_pdu());
        assert!(report.clean(), "unexpected report: {report}");
    }

    #[test]
    fn missing_signature_flagged() {
        let mut pdu = conforming_pdu();
        pdu.body.signatures.clear();
        let report = Conforms::check(&pdu);
        assert!(report.has(Code::MissingSignatures));
        assert!(report.has(Code::MissingOriginSignature));
    }

    #[test]
    fn origin_sender_mismatch() {
        let mut pdu = conforming_pdu();
        pdu.body.origin = Some(ServerName::from("other.example"));
        let report = Conforms::check(&pdu);
        assert!(report.has(Code::MismatchOriginSender));
    }

    #[test]
    fn tampered_id_mismatch() {
        let mut pdu = conforming_pdu();
        pdu.event_id = EventId::from("$AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");
        let report = Conforms::check(&pdu);
        assert!(report.has(Code::MismatchEventId));
    }

    #[test]
    fn member_membership_rules() {
        let mut pdu = conforming_pdu();
        pdu.body.kind = "m.room.member".into();
        pdu.body.state_key = Some("@alice:example.org".into());
        pdu.body.content = json!({});
        let report = Conforms::check(&pdu);
        assert!(report.has(Code::MissingContentMembership));

        pdu.body.content = json!({"membership": "JOIN"});
        let report = Conforms::check(&pdu);
        assert!(report.has(Code::InvalidContentMembership));
    }

    #[test]
    fn duplicate_and_self_references() {
        let mut pdu = conforming_pdu();
        pdu.body.prev_events = vec![EventId::from("$dup"), EventId::from("$dup")];
        pdu.body.auth_events = vec![pdu.event_id.clone()];
        let report = Conforms::check(&pdu);
        assert!(report.has(Code::DupPrevEvent));
        assert!(report.has(Code::SelfAuthEvent));
    }

    #[test]
    fn skip_mask_downgrades() {
        let mut pdu = conforming_pdu();
        pdu.body.prev_events.clear();
        pdu.body.auth_events.clear();

        let strict = Conforms::check(&pdu);
        assert!(!strict.clean());

        let skip = Conforms::mask(&[Code::MissingPrevEvents, Code::MissingAuthEvents]);
        let lax = Conforms::check_with_skip(&pdu, skip);
        assert!(lax.clean(), "unexpected report: {lax}");
    }

    #[test]
    fn code_reflection_roundtrip() {
        for code in Code::ALL {
            assert_eq!(Code::from_name(code.as_str()), Some(code));
        }
    }

    #[test]
    fn create_event_exemptions() {
        let mut pdu = conforming_pdu();
        pdu.body.kind = "m.room.create".into();
        pdu.body.state_key = Some(String::new());
        pdu.body.prev_events.clear();
        pdu.body.auth_events.clear();
        pdu.body.depth = Some(0);
        pdu.body.content = json!({"creator": "@alice:example.org"});
        // Re-derive id and hashes after mutation.
        signing::hash_event(&mut pdu.body).unwrap();
        let pdu = Pdu::from_body(pdu.body).unwrap();

        let report = Conforms::check(&pdu);
        assert!(!report.has(Code::MissingPrevEvents));
        assert!(!report.has(Code::MissingAuthEvents));
        assert!(!report.has(Code::DepthZero));
    }
}
