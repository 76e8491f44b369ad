//! Tessera Core: event model and signing primitives
//!
//! This crate carries the foundation types shared by every other Tessera
//! crate: Matrix identifiers, the `Pdu` event model, the canonical JSON
//! serializer whose output is a hard interop contract, content and
//! reference hashing, Ed25519 event signatures, the structural conformance
//! report, and the small concurrency primitives (runlevel, dock) the
//! evaluation and fetch layers are built on.
//!
//! ## Core Components
//!
//! - **Identifiers**: sigil-validated string newtypes (`$event`, `!room`,
//!   `@user`, server names, key ids)
//! - **Pdu**: an immutable signed room event plus its derived event id
//! - **Canonical JSON**: sorted keys, no whitespace, bounded integers
//! - **Signing**: content hashes, reference hashes, event signatures
//! - **Conforms**: bitmask report of structural defects
//! - **Runlevel / Dock**: process lifecycle gate and wait-until-predicate
//!   condition variable for cooperative tasks

pub mod canonical;
pub mod conforms;
pub mod crypto;
pub mod dock;
pub mod errors;
pub mod id;
pub mod pdu;
pub mod runlevel;
pub mod signing;
pub mod time;

pub use conforms::{Code, Conforms};
pub use crypto::{Signature, SigningKey, VerifyingKey};
pub use dock::Dock;
pub use errors::{Error, Result};
pub use id::{EventId, KeyId, RoomId, ServerName, UserId};
pub use pdu::{EventHashes, Pdu, PduBody, Signatures, MAX_EVENT_SIZE};
pub use runlevel::{Runlevel, RunlevelHandle};
pub use time::{unix_now, unix_now_ms};
