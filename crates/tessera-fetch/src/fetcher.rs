//! The fetch unit
//!
//! One global set of outstanding requests keyed by event id, a worker
//! task that drives attempts to completion, and an origin rotation
//! discipline: every retry selects a fresh peer because the attempted
//! set is never cleared, and exhaustion of the candidate set is the only
//! terminal failure. Transient errors (HTTP failures, timeouts, bogus
//! responses) are swallowed locally and rotate.

use crate::opts::FetchOpts;
use crate::origins::RoomOrigins;
use crate::request::{FetchRequest, FetchRequestInfo, FetchResult, FetchTicket};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tessera_core::{
    signing, unix_now, Conforms, Dock, Error, EventId, Pdu, Result, RoomId, RunlevelHandle,
    ServerName,
};
use tessera_federation::{FederationClient, FederationRequest};
use tessera_keys::KeyCache;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

/// Outcome of one transport attempt, routed back to the worker.
struct Completion {
    event_id: EventId,
    generation: u64,
    outcome: std::result::Result<Vec<u8>, tessera_federation::FederationError>,
}

#[derive(Default)]
struct RequestSet {
    by_event: BTreeMap<EventId, FetchRequest>,
    by_room: BTreeMap<RoomId, BTreeSet<EventId>>,
}

struct Shared {
    opts: FetchOpts,
    client: Arc<dyn FederationClient>,
    origins: Arc<dyn RoomOrigins>,
    keys: Arc<KeyCache>,
    pool: Arc<tessera_federation::ServerPool>,
    local: ServerName,
    runlevel: RunlevelHandle,
    dock: Dock,
    requests: Mutex<RequestSet>,
    count: AtomicUsize,
    completions: mpsc::UnboundedSender<Completion>,
}

/// The fetch unit: submission surface plus the worker that owns request
/// completion.
pub struct Fetcher {
    shared: Arc<Shared>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Fetcher {
    /// Construct the unit and spawn its worker task.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        opts: FetchOpts,
        client: Arc<dyn FederationClient>,
        origins: Arc<dyn RoomOrigins>,
        keys: Arc<KeyCache>,
        pool: Arc<tessera_federation::ServerPool>,
        local: ServerName,
        runlevel: RunlevelHandle,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            opts,
            client,
            origins,
            keys,
            pool,
            local,
            runlevel,
            dock: Dock::new(),
            requests: Mutex::new(RequestSet::default()),
            count: AtomicUsize::new(0),
            completions: tx,
        });

        let worker = tokio::spawn(run_worker(Arc::clone(&shared), rx));
        Arc::new(Self {
            shared,
            worker: parking_lot::Mutex::new(Some(worker)),
        })
    }

    /// Submit a fetch for an event. Waits for runlevel `RUN`, then for a
    /// free slot under the back-pressure bound. Submitting an id that is
    /// already in flight attaches another listener to the existing
    /// request; exactly one federation request runs per id.
    pub async fn start(&self, room_id: &RoomId, event_id: &EventId) -> Result<FetchTicket> {
        let shared = &self.shared;
        if !shared.opts.enable {
            return Err(Error::unavailable("fetch unit is disabled"));
        }

        shared.runlevel.wait_for_run().await.map_err(|_| {
            Error::unavailable(format!(
                "cannot fetch {event_id} in {room_id} in runlevel '{}'",
                shared.runlevel.get()
            ))
        })?;

        let max = shared.opts.requests_max;
        shared
            .dock
            .wait_until(|| shared.count.load(Ordering::SeqCst) < max)
            .await;

        let mut set = shared.requests.lock().await;
        if let Some(request) = set.by_event.get_mut(event_id) {
            debug_assert_eq!(&request.room_id, room_id);
            trace!(event_id = %event_id, "coalescing duplicate fetch submission");
            return Ok(request.subscribe());
        }

        let mut request = FetchRequest::new(room_id.clone(), event_id.clone());
        let ticket = request.subscribe();
        start_request(shared, &mut request).await;

        let finished = request.finished != 0;
        if !finished {
            set.by_room
                .entry(room_id.clone())
                .or_default()
                .insert(event_id.clone());
            set.by_event.insert(event_id.clone(), request);
            shared.count.fetch_add(1, Ordering::SeqCst);
        }
        shared.dock.notify_all();

        Ok(ticket)
    }

    /// Number of outstanding requests.
    pub fn count(&self) -> usize {
        self.shared.count.load(Ordering::SeqCst)
    }

    /// True when a request for the id is outstanding.
    pub async fn exists(&self, event_id: &EventId) -> bool {
        self.shared.requests.lock().await.by_event.contains_key(event_id)
    }

    /// Read-only view of one outstanding request.
    pub async fn info(&self, event_id: &EventId) -> Option<FetchRequestInfo> {
        self.shared
            .requests
            .lock()
            .await
            .by_event
            .get(event_id)
            .map(FetchRequest::info)
    }

    /// Snapshots of every outstanding request.
    pub async fn snapshot(&self) -> Vec<FetchRequestInfo> {
        self.shared
            .requests
            .lock()
            .await
            .by_event
            .values()
            .map(FetchRequest::info)
            .collect()
    }

    /// Event ids pending for a room.
    pub async fn pending_for_room(&self, room_id: &RoomId) -> Vec<EventId> {
        self.shared
            .requests
            .lock()
            .await
            .by_room
            .get(room_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Tear the worker down and resolve outstanding tickets as dropped.
    pub async fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }

        let mut set = self.shared.requests.lock().await;
        for (_, mut request) in std::mem::take(&mut set.by_event) {
            request.cancel_attempt();
        }
        set.by_room.clear();
        self.shared.count.store(0, Ordering::SeqCst);
        self.shared.dock.notify_all();
    }
}

impl Drop for Fetcher {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

/// Worker loop: drain attempt completions, and on every quiet interval
/// run the cleanup pass that starts unstarted requests, retries attempts
/// past their budget, and purges finished entries.
async fn run_worker(shared: Arc<Shared>, mut completions: mpsc::UnboundedReceiver<Completion>) {
    loop {
        tokio::select! {
            maybe = completions.recv() => match maybe {
                Some(completion) => handle_completion(&shared, completion).await,
                None => {
                    error!("fetch completion channel closed; worker exiting");
                    return;
                }
            },
            _ = tokio::time::sleep(shared.opts.timeout) => {
                request_cleanup(&shared).await;
            }
        }
    }
}

async fn handle_completion(shared: &Arc<Shared>, completion: Completion) {
    let mut set = shared.requests.lock().await;
    let Some(request) = set.by_event.get_mut(&completion.event_id) else {
        return;
    };
    if request.finished != 0 || request.generation != completion.generation {
        return;
    }
    request.attempt = None;

    match completion.outcome {
        Ok(bytes) => match check_response(shared, request, &bytes) {
            Ok(pdu) => {
                let origin = request.origin.clone().unwrap_or_else(|| ServerName::new(""));
                debug!(
                    event_id = %request.event_id,
                    room_id = %request.room_id,
                    origin = %origin,
                    bytes = bytes.len(),
                    "received good fetch response"
                );
                request.outcome = Some(FetchResult {
                    room_id: request.room_id.clone(),
                    event_id: request.event_id.clone(),
                    origin,
                    pdu,
                    raw: bytes,
                });
                finish(request);
            }
            Err(error) => {
                debug!(
                    event_id = %request.event_id,
                    origin = ?request.origin,
                    error = %error,
                    "erroneous fetch response; rotating"
                );
                request.eptr = Some(error);
                retry(shared, request).await;
            }
        },
        Err(transport) => {
            debug!(
                event_id = %request.event_id,
                origin = ?request.origin,
                error = %transport,
                "fetch attempt failed; rotating"
            );
            request.eptr = Some(transport.into());
            retry(shared, request).await;
        }
    }

    let finished = request.finished != 0;
    let event_id = completion.event_id;
    if finished {
        remove_request(shared, &mut set, &event_id);
    }
}

/// Start what is unstarted, retry what has exceeded its attempt budget,
/// purge what has finished. Returns the number purged.
async fn request_cleanup(shared: &Arc<Shared>) -> usize {
    let mut set = shared.requests.lock().await;
    let now = unix_now();
    let budget = shared.opts.timeout.as_secs();

    let ids: Vec<EventId> = set.by_event.keys().cloned().collect();
    for id in &ids {
        let Some(request) = set.by_event.get_mut(id) else {
            continue;
        };

        if request.finished != 0 {
            continue;
        }
        if request.started == 0 {
            start_request(shared, request).await;
        } else if request.last + budget < now {
            retry(shared, request).await;
        }
    }

    let mut purged = 0;
    for id in ids {
        let finished = set
            .by_event
            .get(&id)
            .map(|request| request.finished != 0)
            .unwrap_or(false);
        if finished {
            remove_request(shared, &mut set, &id);
            purged += 1;
        }
    }
    purged
}

fn remove_request(shared: &Arc<Shared>, set: &mut RequestSet, event_id: &EventId) {
    if let Some(request) = set.by_event.remove(event_id) {
        if let Some(ids) = set.by_room.get_mut(&request.room_id) {
            ids.remove(event_id);
            if ids.is_empty() {
                set.by_room.remove(&request.room_id);
            }
        }
        shared.count.fetch_sub(1, Ordering::SeqCst);
        shared.dock.notify_all();
    }
}

/// Drive a request to its next attempt. Selects an origin when none is
/// pinned; exhaustion of the candidate set finishes the request with the
/// latched error.
async fn start_request(shared: &Arc<Shared>, request: &mut FetchRequest) -> bool {
    debug_assert_eq!(request.finished, 0);
    if request.started == 0 {
        request.started = unix_now();
    }

    if request.origin.is_none() {
        match select_random_origin(shared, request).await {
            Ok(origin) => request.origin = Some(origin),
            Err(error) => {
                request.eptr = Some(error);
                finish(request);
                return false;
            }
        }
    }

    if let Some(origin) = request.origin.clone() {
        issue(shared, request, origin);
        true
    } else {
        finish(request);
        false
    }
}

/// Uniformly sample a viable origin and record it as attempted before
/// the attempt is issued.
async fn select_random_origin(
    shared: &Arc<Shared>,
    request: &mut FetchRequest,
) -> Result<ServerName> {
    let candidates = shared.origins.origins(&request.room_id).await?;
    let viable: Vec<ServerName> = candidates
        .into_iter()
        .filter(|origin| {
            // Not ourselves, not a peer we already tried and failed
            // with, not a peer latched with an error in the pool.
            *origin != shared.local
                && !request.attempted.contains(origin)
                && shared.pool.errmsg(origin).is_none()
        })
        .collect();

    if viable.is_empty() {
        return Err(Error::not_found(format!(
            "cannot find any server to fetch {} in {}",
            request.event_id, request.room_id
        )));
    }

    let pick = viable[rand::thread_rng().gen_range(0..viable.len())].clone();
    request.attempted.insert(pick.clone());
    Ok(pick)
}

/// Issue one transport attempt against the pinned origin.
fn issue(shared: &Arc<Shared>, request: &mut FetchRequest, origin: ServerName) {
    request.last = unix_now();
    request.generation += 1;

    debug!(
        event_id = %request.event_id,
        room_id = %request.room_id,
        origin = %origin,
        attempt = request.generation,
        "starting fetch attempt"
    );

    let wire = FederationRequest::Event {
        event_id: request.event_id.clone(),
    };
    let client = Arc::clone(&shared.client);
    let completions = shared.completions.clone();
    let event_id = request.event_id.clone();
    let generation = request.generation;
    let budget = shared.opts.timeout;

    request.attempt = Some(tokio::spawn(async move {
        let outcome = match tokio::time::timeout(budget, client.send(&origin, &wire)).await {
            Ok(result) => result,
            Err(_) => Err(tessera_federation::FederationError::Timeout {
                origin: origin.to_string(),
            }),
        };
        let _ = completions.send(Completion {
            event_id,
            generation,
            outcome,
        });
    }));

    shared.dock.notify_all();
}

/// Cancel the transport, clear the latched error and pinned origin, and
/// start again. The attempted set is kept, so the next selection lands
/// on a fresh peer.
async fn retry(shared: &Arc<Shared>, request: &mut FetchRequest) {
    debug_assert_eq!(request.finished, 0);
    request.cancel_attempt();
    request.eptr = None;
    request.origin = None;
    start_request(shared, request).await;
}

/// Mark the request finished and resolve every listener with either the
/// latched error or the accepted result.
fn finish(request: &mut FetchRequest) {
    request.finished = unix_now().max(1);

    let outcome = match (&request.eptr, &request.outcome) {
        (Some(error), _) => Err(error.clone()),
        (None, Some(result)) => Ok(result.clone()),
        (None, None) => Err(Error::not_found("fetch finished without a result")),
    };

    for waiter in request.waiters.drain(..) {
        let _ = waiter.send(outcome.clone());
    }
}

/// Validate a response body. Order matters and short-circuits: parse,
/// then id equality, then conformance, then signature when the key is
/// already cached. Workers never fetch keys.
fn check_response(shared: &Arc<Shared>, request: &FetchRequest, bytes: &[u8]) -> Result<Pdu> {
    let pdu = Pdu::from_json_bytes_claimed(bytes, request.event_id.clone())?;

    if shared.opts.check_event_id && !signing::check_id(&pdu) {
        let claim = signing::event_id_for(&pdu.body)
            .map(|id| id.to_string())
            .unwrap_or_else(|_| "<unhashable>".to_string());
        return Err(Error::remote(format!(
            "event id claim:{claim} != sought:{}",
            request.event_id
        )));
    }

    if shared.opts.check_conforms {
        let report = Conforms::check(&pdu);
        if !report.clean() {
            return Err(Error::not_conform(report.report_string()));
        }
    }

    if shared.opts.check_signature {
        let server = pdu.origin();
        let key_id = pdu
            .body
            .signatures
            .get(&server)
            .and_then(|keys| keys.keys().next().cloned())
            .ok_or_else(|| {
                Error::bad_signature(format!("cannot find any keys for '{server}' in signatures"))
            })?;

        if let Some(key) = shared.keys.get(&server, &key_id) {
            signing::verify_event(&pdu.body, &server, &key_id, &key)?;
        }
    }

    Ok(pdu)
}
