//! Tessera Federation: peers and the request substrate
//!
//! The pieces of the federation layer the evaluation core consumes:
//!
//! - **ServerPool**: per-hostname peer records with a latched error state;
//!   the latch is the only mechanism that removes a peer from origin
//!   selection
//! - **FederationRequest**: typed descriptors for the wire surface this
//!   core issues (event retrieval, room state, backfill, join templates,
//!   directory queries, server keys, version)
//! - **FederationClient**: the effect trait the HTTP/TLS pool implements;
//!   `MemoryFederationClient` ships here for tests and simulation

pub mod client;
pub mod peer;
pub mod request;

pub use client::{FederationClient, FederationError, MemoryFederationClient, PooledClient, Scripted};
pub use peer::{ServerPeer, ServerPool};
pub use request::{FederationRequest, QueryKind};
