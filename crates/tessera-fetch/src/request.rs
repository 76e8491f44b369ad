//! Fetch request state and the consumer-facing ticket

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tessera_core::{Error, EventId, Pdu, Result, RoomId, ServerName};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// The completed product of a fetch: the validated event and the raw
/// response buffer it was parsed from.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub room_id: RoomId,
    pub event_id: EventId,
    /// The peer that produced the accepted response.
    pub origin: ServerName,
    pub pdu: Pdu,
    pub raw: Vec<u8>,
}

/// Consumer handle for one submission. Every submitter of the same
/// event id holds its own ticket against the same underlying request.
#[derive(Debug)]
pub struct FetchTicket {
    pub(crate) rx: oneshot::Receiver<Result<FetchResult>>,
}

impl FetchTicket {
    /// Wait for the request to finish. If the fetch unit shuts down
    /// with the request unresolved, this reports not-found.
    pub async fn wait(self) -> Result<FetchResult> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::not_found("fetch request dropped unresolved")),
        }
    }
}

/// Read-only view of one in-flight request, for introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequestInfo {
    pub room_id: RoomId,
    pub event_id: EventId,
    pub origin: Option<ServerName>,
    pub attempted: BTreeSet<ServerName>,
    pub started: u64,
    pub last: u64,
    pub finished: u64,
    /// Number of consumers waiting on the request.
    pub listeners: usize,
}

/// State for one outstanding federation query, keyed by event id.
pub(crate) struct FetchRequest {
    pub room_id: RoomId,
    pub event_id: EventId,

    /// Currently-selected peer; cleared on retry.
    pub origin: Option<ServerName>,

    /// Peers tried over the request's lifetime; never cleared, which is
    /// what drives rotation to fresh peers.
    pub attempted: BTreeSet<ServerName>,

    /// Unix seconds; `finished` stays 0 while inflight.
    pub started: u64,
    pub last: u64,
    pub finished: u64,

    /// Most recent failure; cleared on retry, latched at exhaustion.
    pub eptr: Option<Error>,

    /// The accepted response, set just before finish.
    pub outcome: Option<FetchResult>,

    /// Consumers to resolve at finish.
    pub waiters: Vec<oneshot::Sender<Result<FetchResult>>>,

    /// The in-flight transport attempt, if any.
    pub attempt: Option<JoinHandle<()>>,

    /// Monotonic per-request attempt counter; completions from stale
    /// attempts are discarded by generation mismatch.
    pub generation: u64,
}

impl FetchRequest {
    pub fn new(room_id: RoomId, event_id: EventId) -> Self {
        Self {
            room_id,
            event_id,
            origin: None,
            attempted: BTreeSet::new(),
            started: 0,
            last: 0,
            finished: 0,
            eptr: None,
            outcome: None,
            waiters: Vec::new(),
            attempt: None,
            generation: 0,
        }
    }

    /// Attach one more consumer.
    pub fn subscribe(&mut self) -> FetchTicket {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        FetchTicket { rx }
    }

    /// Cancel the in-flight transport attempt, if any.
    pub fn cancel_attempt(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
    }

    pub fn info(&self) -> FetchRequestInfo {
        FetchRequestInfo {
            room_id: self.room_id.clone(),
            event_id: self.event_id.clone(),
            origin: self.origin.clone(),
            attempted: self.attempted.clone(),
            started: self.started,
            last: self.last,
            finished: self.finished,
            listeners: self.waiters.len(),
        }
    }
}
