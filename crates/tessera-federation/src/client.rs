//! The federation client effect trait
//!
//! The HTTP/TLS pool is an external collaborator; this trait is the seam
//! it plugs into. `MemoryFederationClient` implements the same trait over
//! scripted responses for tests and simulation, and `PooledClient` wraps
//! any client with the server-pool accounting and error latching.

use crate::peer::ServerPool;
use crate::request::FederationRequest;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tessera_core::ServerName;
use tracing::debug;

/// Transport-level failures surfaced by a client.
#[derive(Debug, Clone, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum FederationError {
    /// The peer answered with a non-success HTTP status.
    #[error("HTTP {status} from {origin}: {body}")]
    Http {
        /// Status code returned
        status: u16,
        /// Origin that answered
        origin: String,
        /// Response body, truncated by the transport
        body: String,
    },

    /// The request could not be delivered at all.
    #[error("Unreachable {origin}: {reason}")]
    Unreachable {
        /// Origin that could not be reached
        origin: String,
        /// Resolution or connection failure description
        reason: String,
    },

    /// The attempt exceeded its wall clock budget.
    #[error("Timeout talking to {origin}")]
    Timeout {
        /// Origin the attempt targeted
        origin: String,
    },

    /// The transport was cancelled mid-flight.
    #[error("Cancelled")]
    Cancelled,
}

impl From<FederationError> for tessera_core::Error {
    fn from(err: FederationError) -> Self {
        match err {
            FederationError::Timeout { .. } => {
                tessera_core::Error::RequestTimeout { timeout_secs: 0 }
            }
            other => tessera_core::Error::remote(other.to_string()),
        }
    }
}

/// The seam the HTTP/TLS pool implements.
#[async_trait]
pub trait FederationClient: Send + Sync {
    /// Issue one request against one origin and return the raw response
    /// body. Transport concerns (resolution, TLS, redirects) live behind
    /// this call.
    async fn send(
        &self,
        origin: &ServerName,
        request: &FederationRequest,
    ) -> Result<Vec<u8>, FederationError>;
}

/// One scripted reaction of the in-memory client.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Answer with these bytes.
    Ok(Vec<u8>),
    /// Fail with this error.
    Err(FederationError),
    /// Never answer; the attempt hangs until cancelled or timed out.
    Hang,
}

#[derive(Debug, Default)]
struct MemoryInner {
    responses: HashMap<(ServerName, String), VecDeque<Scripted>>,
    calls: Vec<(ServerName, String)>,
}

/// Scripted federation client for tests and simulation.
///
/// Responses are queued per `(origin, path)`; each call consumes one.
/// When the queue is empty the last scripted reaction is repeated, and an
/// unscripted pair fails as unreachable.
#[derive(Debug, Default)]
pub struct MemoryFederationClient {
    inner: Mutex<MemoryInner>,
}

impl MemoryFederationClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a scripted reaction for an origin/request pair.
    pub fn script(&self, origin: &ServerName, request: &FederationRequest, outcome: Scripted) {
        let mut inner = self.inner.lock();
        inner
            .responses
            .entry((origin.clone(), request.path()))
            .or_default()
            .push_back(outcome);
    }

    /// Queue a successful JSON response.
    pub fn respond(&self, origin: &ServerName, request: &FederationRequest, body: Vec<u8>) {
        self.script(origin, request, Scripted::Ok(body));
    }

    /// Queue a failure.
    pub fn fail(&self, origin: &ServerName, request: &FederationRequest, error: FederationError) {
        self.script(origin, request, Scripted::Err(error));
    }

    /// Queue a hang: the attempt never completes.
    pub fn hang(&self, origin: &ServerName, request: &FederationRequest) {
        self.script(origin, request, Scripted::Hang);
    }

    /// Every `(origin, path)` pair sent so far, in order.
    pub fn calls(&self) -> Vec<(ServerName, String)> {
        self.inner.lock().calls.clone()
    }

    /// Total number of sends.
    pub fn call_count(&self) -> usize {
        self.inner.lock().calls.len()
    }

    /// Number of sends that targeted an origin.
    pub fn calls_to(&self, origin: &ServerName) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|(o, _)| o == origin)
            .count()
    }
}

#[async_trait]
impl FederationClient for MemoryFederationClient {
    async fn send(
        &self,
        origin: &ServerName,
        request: &FederationRequest,
    ) -> Result<Vec<u8>, FederationError> {
        let outcome = {
            let mut inner = self.inner.lock();
            let path = request.path();
            inner.calls.push((origin.clone(), path.clone()));

            let queue = inner.responses.get_mut(&(origin.clone(), path));
            match queue {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match outcome {
            Some(Scripted::Ok(bytes)) => Ok(bytes),
            Some(Scripted::Err(error)) => Err(error),
            Some(Scripted::Hang) => {
                futures::future::pending::<()>().await;
                unreachable!("pending future resolved")
            }
            None => Err(FederationError::Unreachable {
                origin: origin.to_string(),
                reason: "no scripted response".into(),
            }),
        }
    }
}

/// Wraps a client with server-pool accounting and error latching.
///
/// Failures latch `err_msg` on the peer record, which is what removes the
/// peer from subsequent origin selection until an explicit `errclear`.
pub struct PooledClient<C> {
    client: Arc<C>,
    pool: Arc<ServerPool>,
}

impl<C> PooledClient<C> {
    pub fn new(client: Arc<C>, pool: Arc<ServerPool>) -> Self {
        Self { client, pool }
    }

    /// The pool this client reports into.
    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }
}

#[async_trait]
impl<C: FederationClient> FederationClient for PooledClient<C> {
    async fn send(
        &self,
        origin: &ServerName,
        request: &FederationRequest,
    ) -> Result<Vec<u8>, FederationError> {
        let write_size = request.path().len() as u64;
        self.pool.begin_request(origin, write_size);

        let result = self.client.send(origin, request).await;

        match &result {
            Ok(body) => {
                self.pool.end_request(origin, write_size, body.len() as u64);
            }
            Err(error) => {
                self.pool.end_request(origin, write_size, 0);
                debug!(origin = %origin, error = %error, "federation send failed");
                self.pool.errset(origin, error.to_string());
            }
        }

        result
    }
}
