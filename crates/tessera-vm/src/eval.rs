//! The evaluation state machine
//!
//! An `Eval` takes one or more candidate events through conformance,
//! hash and signature verification, parent resolution (fetching missing
//! ancestors over federation), authorization, state resolution, an
//! atomic commit, and post-commit notification. Evals self-register in
//! the sequence registry on construction and deregister on drop, so the
//! registry always reflects exactly the live evaluations.
//!
//! Per-event failures reject the event and the batch continues (unless
//! `fail_fast`); a storage failure aborts the whole eval and propagates.

use crate::auth;
use crate::hooks::{CommitNotice, HookBus};
use crate::opts::{EvalOpts, InjectOpts};
use crate::registry::{EvalInfo, Registry, TaskId};
use crate::state_res::StateResolver;
use crate::store;
use std::collections::BTreeSet;
use std::sync::Arc;
use tessera_core::{
    signing, unix_now_ms, Conforms, Error, EventId, KeyId, Pdu, PduBody, Result, ServerName,
    SigningKey, UserId, MAX_EVENT_SIZE,
};
use tessera_fetch::Fetcher;
use tessera_keys::KeyCache;
use tessera_storage::{columns, Delta, StorageEngine, Transaction};
use tracing::{debug, info, warn};

/// Everything an evaluation reaches for, constructed once at startup and
/// passed explicitly.
pub struct World {
    pub registry: Arc<Registry>,
    pub storage: Arc<dyn StorageEngine>,
    pub keys: Arc<KeyCache>,
    pub fetcher: Arc<Fetcher>,
    pub hooks: HookBus,
    pub resolver: Arc<dyn StateResolver>,
    /// The local server.
    pub origin: ServerName,
    pub key_id: KeyId,
    pub signing_key: SigningKey,
}

impl World {
    /// Assemble a world. The local signing key's public half is seeded
    /// into the key cache so locally issued events verify like any
    /// other.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        storage: Arc<dyn StorageEngine>,
        keys: Arc<KeyCache>,
        fetcher: Arc<Fetcher>,
        hooks: HookBus,
        resolver: Arc<dyn StateResolver>,
        origin: ServerName,
        key_id: KeyId,
        signing_key: SigningKey,
    ) -> Arc<Self> {
        keys.insert(
            origin.clone(),
            key_id.clone(),
            signing_key.verifying_key(),
            u64::MAX,
        );
        Arc::new(Self {
            registry,
            storage,
            keys,
            fetcher,
            hooks,
            resolver,
            origin,
            key_id,
            signing_key,
        })
    }
}

/// Outcome of one event within an eval.
#[derive(Debug)]
pub enum PduOutcome {
    /// Committed under this sequence.
    Committed { sequence: u64 },
    /// Already in storage; evaluation was a no-op success.
    AlreadyCommitted,
    /// Hard per-event rejection.
    Rejected { reason: Error },
    /// Soft failure: a parent could not be resolved from any peer.
    Skipped { reason: Error },
}

impl PduOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(
            self,
            PduOutcome::Committed { .. } | PduOutcome::AlreadyCommitted
        )
    }
}

/// Per-batch evaluation report.
#[derive(Debug, Default)]
pub struct EvalReport {
    pub outcomes: Vec<(EventId, PduOutcome)>,
}

impl EvalReport {
    pub fn committed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, PduOutcome::Committed { .. }))
            .count()
    }

    pub fn rejected(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, PduOutcome::Rejected { .. }))
            .count()
    }

    pub fn all_committed(&self) -> bool {
        !self.outcomes.is_empty()
            && self.outcomes.iter().all(|(_, outcome)| outcome.is_committed())
    }

    pub fn outcome(&self, event_id: &EventId) -> Option<&PduOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == event_id)
            .map(|(_, outcome)| outcome)
    }

    pub fn sequence_of(&self, event_id: &EventId) -> Option<u64> {
        match self.outcome(event_id) {
            Some(PduOutcome::Committed { sequence }) => Some(*sequence),
            _ => None,
        }
    }
}

/// A partial event for the local-origin injection path: the caller
/// supplies what it knows, injection synthesizes the rest.
#[derive(Debug, Clone)]
pub struct EventStub {
    pub room_id: tessera_core::RoomId,
    pub sender: UserId,
    pub kind: String,
    pub state_key: Option<String>,
    pub redacts: Option<EventId>,
    pub content: serde_json::Value,
}

/// RAII guard for the registry's coarse activity flags.
struct ActivityFlag {
    registry: Arc<Registry>,
    injecting: bool,
}

impl ActivityFlag {
    fn executing(registry: &Arc<Registry>) -> Self {
        registry.enter_executing();
        Self {
            registry: registry.clone(),
            injecting: false,
        }
    }

    fn injecting(registry: &Arc<Registry>) -> Self {
        registry.enter_injecting();
        Self {
            registry: registry.clone(),
            injecting: true,
        }
    }
}

impl Drop for ActivityFlag {
    fn drop(&mut self) {
        if self.injecting {
            self.registry.exit_injecting();
        } else {
            self.registry.exit_executing();
        }
    }
}

/// One evaluation context.
pub struct Eval {
    id: u64,
    task: TaskId,
    opts: EvalOpts,
    world: Arc<World>,
}

impl Eval {
    /// Construct and register. The newest live eval on the same task
    /// becomes this eval's parent.
    pub fn new(world: Arc<World>, opts: EvalOpts, task: TaskId) -> Self {
        let id = world.registry.register(task);
        Self {
            id,
            task,
            opts,
            world,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Registry snapshot of this eval.
    pub fn info(&self) -> Option<EvalInfo> {
        self.world.registry.info(self.id)
    }

    /// The commit sequence, zero until this eval has committed.
    pub fn sequence(&self) -> u64 {
        self.info().map(|info| info.sequence).unwrap_or(0)
    }

    /// Record the event id this eval refers to before its body is known.
    pub fn set_event_id(&self, event_id: EventId) {
        self.world.registry.set_event_id(self.id, event_id);
    }

    /// Evaluate a batch of events.
    pub async fn execute(&mut self, events: Vec<Pdu>) -> Result<EvalReport> {
        let _flag = ActivityFlag::executing(&self.world.registry);
        self.execute_inner(events).await
    }

    async fn execute_inner(&mut self, mut events: Vec<Pdu>) -> Result<EvalReport> {
        if events.len() > self.opts.limit {
            warn!(
                eval = self.id,
                given = events.len(),
                limit = self.opts.limit,
                "truncating oversize batch"
            );
            events.truncate(self.opts.limit);
        }

        // Sorting first keeps parents ahead of children within the
        // batch; the events may span rooms, which is fine.
        if !self.opts.ordered {
            events.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        }

        self.world.registry.set_pdu_ids(
            self.id,
            events.iter().map(|pdu| pdu.event_id.clone()).collect(),
        );

        if self.opts.verify {
            self.prefetch_keys(&events).await;
        }

        let mut report = EvalReport::default();
        for pdu in events {
            let event_id = pdu.event_id.clone();
            let outcome = self.evaluate(pdu).await?;

            let failed = matches!(
                outcome,
                PduOutcome::Rejected { .. } | PduOutcome::Skipped { .. }
            );
            report.outcomes.push((event_id, outcome));

            if failed && self.opts.fail_fast {
                break;
            }
        }
        Ok(report)
    }

    /// Synthesize, sign, and evaluate a locally issued event.
    pub async fn inject(&mut self, stub: EventStub, iopts: &InjectOpts) -> Result<EvalReport> {
        let _flag = ActivityFlag::injecting(&self.world.registry);

        let mut body = PduBody {
            room_id: stub.room_id,
            sender: stub.sender,
            kind: stub.kind,
            state_key: stub.state_key,
            redacts: stub.redacts,
            content: stub.content,
            ..PduBody::default()
        };

        if iopts.add_origin {
            body.origin = Some(self.world.origin.clone());
            body.origin_server_ts = unix_now_ms();
        }

        if iopts.add_prev_events {
            if body.kind == "m.room.create" {
                body.depth = Some(1);
            } else {
                let heads = store::room_heads(&self.world.storage, &body.room_id).await?;
                body.prev_events = heads.iter().map(|(id, _)| id.clone()).collect();
                body.depth = Some(heads.iter().map(|(_, depth)| *depth).max().unwrap_or(0) + 1);
            }
        }

        if iopts.add_auth_events && body.kind != "m.room.create" {
            body.auth_events = self.select_auth_events(&body).await?;
        }

        if iopts.add_hash {
            signing::hash_event(&mut body)?;
        }

        if iopts.add_signature {
            signing::sign_event(
                &mut body,
                &self.world.origin,
                &self.world.key_id,
                &self.world.signing_key,
            )?;
        }

        let pdu = Pdu::from_body(body)?;

        // Only this server's events come through here.
        if pdu.origin() != self.world.origin {
            return Err(Error::unauthorized(format!(
                "issuing event for origin '{}'",
                pdu.origin()
            )));
        }

        self.world
            .registry
            .set_issue_id(self.id, pdu.event_id.clone());
        debug!(eval = self.id, event_id = %pdu.event_id, "issuing local event");
        self.execute_inner(vec![pdu]).await
    }

    /// Auth selection for injection: the create event, the power
    /// levels, and the sender's membership, when present in state.
    async fn select_auth_events(&self, body: &PduBody) -> Result<Vec<EventId>> {
        let storage = &self.world.storage;
        let mut auth = Vec::new();

        for (kind, state_key) in [
            ("m.room.create", String::new()),
            ("m.room.power_levels", String::new()),
            ("m.room.member", body.sender.as_str().to_owned()),
        ] {
            if let Some(event) =
                store::load_state_event(storage, &body.room_id, kind, &state_key).await?
            {
                auth.push(event.event_id);
            }
        }
        Ok(auth)
    }

    /// Batched pre-fetch of signing keys missing for this batch. When
    /// the eval acts on behalf of a remote node, only that node's
    /// events participate, to deny amplification; other events still
    /// resolve their keys lazily during per-event verification.
    async fn prefetch_keys(&self, events: &[Pdu]) {
        let mut missing: BTreeSet<(ServerName, KeyId)> = BTreeSet::new();
        for pdu in events {
            let origin = pdu.origin();

            if let Some(node_id) = &self.opts.node_id {
                if node_id != &origin {
                    continue;
                }
            }

            if let Some(keys) = pdu.body.signatures.get(&origin) {
                for key_id in keys.keys() {
                    if !self.world.keys.has(&origin, key_id) {
                        missing.insert((origin.clone(), key_id.clone()));
                    }
                }
            }
        }

        if missing.is_empty() {
            return;
        }

        debug!(
            eval = self.id,
            keys = missing.len(),
            events = events.len(),
            "fetching new keys for batch"
        );

        let queries: Vec<(ServerName, KeyId)> = missing.into_iter().collect();
        let fetched = self.world.keys.fetch(&queries).await;
        if fetched > 0 {
            info!(
                eval = self.id,
                fetched,
                requested = queries.len(),
                "fetched new keys for batch"
            );
        }
    }

    /// Drive one event through the phases. `Ok` outcomes cover both
    /// acceptance and per-event failure; `Err` aborts the eval.
    async fn evaluate(&mut self, pdu: Pdu) -> Result<PduOutcome> {
        // Phase: conform.
        let report = Conforms::check_with_skip(&pdu, self.opts.non_conform);
        if !report.clean() {
            warn!(eval = self.id, event_id = %pdu.event_id, report = %report, "non-conforming event");
            return Ok(PduOutcome::Rejected {
                reason: Error::not_conform(report.report_string()),
            });
        }

        match pdu.serialized_size() {
            Ok(size) if size > MAX_EVENT_SIZE => {
                return Ok(PduOutcome::Rejected {
                    reason: Error::bad_json(format!(
                        "event is {size} bytes, larger than the maximum {MAX_EVENT_SIZE}"
                    )),
                });
            }
            Ok(_) => {}
            Err(error) => return Ok(PduOutcome::Rejected { reason: error }),
        }

        // One eval per event id across the process.
        if self.opts.unique && self.world.registry.count(&pdu.event_id) > 1 {
            return Ok(PduOutcome::Rejected {
                reason: Error::unavailable(format!(
                    "{} is already being evaluated",
                    pdu.event_id
                )),
            });
        }

        // Re-evaluation is a no-op success.
        if store::event_exists(&self.world.storage, &pdu.event_id).await? {
            debug!(eval = self.id, event_id = %pdu.event_id, "already committed");
            return Ok(PduOutcome::AlreadyCommitted);
        }

        // Phase: hashes and signatures.
        if self.opts.verify {
            match signing::verify_content_hash(&pdu.body) {
                Ok(true) => {}
                Ok(false) => {
                    return Ok(PduOutcome::Rejected {
                        reason: Error::bad_signature("content hash mismatch"),
                    })
                }
                Err(error) => return Ok(PduOutcome::Rejected { reason: error }),
            }

            if let Err(reason) = self.verify_signature(&pdu).await {
                warn!(eval = self.id, event_id = %pdu.event_id, error = %reason, "signature rejected");
                return Ok(PduOutcome::Rejected { reason });
            }
        }

        // Phase: resolve parents, fetching over federation when absent.
        if self.opts.prev_check_exists {
            if let Err(reason) = self.resolve_prevs(&pdu).await? {
                debug!(eval = self.id, event_id = %pdu.event_id, error = %reason, "parent unresolved; skipping");
                return Ok(PduOutcome::Skipped { reason });
            }
        }

        // Phase: authorization against current room state.
        let ctx = auth::load_auth_context(
            &self.world.storage,
            &pdu.body.room_id,
            &pdu.body.sender,
            pdu.body.state_key.as_deref(),
        )
        .await?;
        if let Err(reason) = auth::auth_check(&pdu, &ctx) {
            warn!(eval = self.id, event_id = %pdu.event_id, error = %reason, "unauthorized event");
            return Ok(PduOutcome::Rejected { reason });
        }

        // Phases: state resolution, commit, notify.
        let sequence = self.commit(&pdu).await?;

        if self.opts.notify {
            self.world.hooks.publish(CommitNotice {
                sequence,
                event_id: pdu.event_id.clone(),
                room_id: pdu.body.room_id.clone(),
                kind: pdu.body.kind.clone(),
            });
        }

        Ok(PduOutcome::Committed { sequence })
    }

    /// Verify the origin server's signature, fetching the key when it
    /// is not cached. Lazy key fetching is permitted here, in contrast
    /// to the fetch-unit worker.
    async fn verify_signature(&self, pdu: &Pdu) -> std::result::Result<(), Error> {
        let server = pdu.origin();
        let key_id = pdu
            .body
            .signatures
            .get(&server)
            .and_then(|keys| keys.keys().next().cloned())
            .ok_or_else(|| {
                Error::bad_signature(format!("no signature by origin '{server}'"))
            })?;

        let key = match self.world.keys.get(&server, &key_id) {
            Some(key) => key,
            None => {
                self.world
                    .keys
                    .fetch(&[(server.clone(), key_id.clone())])
                    .await;
                self.world.keys.get(&server, &key_id).ok_or_else(|| {
                    Error::bad_signature(format!(
                        "verification key {key_id} for '{server}' unavailable"
                    ))
                })?
            }
        };

        signing::verify_event(&pdu.body, &server, &key_id, &key)
    }

    /// Ensure every parent exists, fetching missing ones and evaluating
    /// them in a child eval on this task. The outer `Result` aborts the
    /// eval; the inner one is the per-event soft failure.
    ///
    /// Explicitly boxed (rather than `async fn`) because this recurses
    /// through `execute`, and an opaque recursive future type cannot be
    /// proven `Send` by the compiler.
    fn resolve_prevs<'a>(
        &'a mut self,
        pdu: &'a Pdu,
    ) -> futures::future::BoxFuture<'a, Result<std::result::Result<(), Error>>> {
        Box::pin(async move {
        for prev in &pdu.body.prev_events {
            if store::event_exists(&self.world.storage, prev).await? {
                continue;
            }

            debug!(
                eval = self.id,
                event_id = %pdu.event_id,
                parent = %prev,
                "fetching missing parent"
            );

            let ticket = match self.world.fetcher.start(&pdu.body.room_id, prev).await {
                Ok(ticket) => ticket,
                Err(error) => return Ok(Err(error)),
            };
            let fetched = match ticket.wait().await {
                Ok(result) => result,
                Err(error) => return Ok(Err(error)),
            };

            let mut child = Eval::new(Arc::clone(&self.world), self.opts.clone(), self.task);
            let nested: futures::future::BoxFuture<'_, Result<EvalReport>> =
                Box::pin(child.execute(vec![fetched.pdu]));
            let outcome = nested.await?;
            drop(child);

            if !outcome.all_committed() {
                return Ok(Err(Error::not_found(format!(
                    "fetched parent {prev} could not be committed"
                ))));
            }
        }
        Ok(Ok(()))
        })
    }

    /// Assemble the single atomic transaction for one event and commit
    /// it. The sequence is allocated immediately before the commit is
    /// issued.
    async fn commit(&mut self, pdu: &Pdu) -> Result<u64> {
        let serialized = pdu.serialized()?;
        let room_id = &pdu.body.room_id;
        let depth = pdu.body.depth.unwrap_or(0).max(0);

        let mut txn = Transaction::new();
        txn.append(Delta::set(
            columns::EVENT_JSON,
            store::event_key(&pdu.event_id),
            serialized.into_bytes(),
        ));
        txn.append(Delta::set(
            columns::ROOM_EVENTS,
            store::room_events_key(room_id, depth as u64, &pdu.event_id),
            store::event_key(&pdu.event_id),
        ));
        txn.append(Delta::set(
            columns::ROOM_ORIGINS,
            store::room_origins_key(room_id, &pdu.origin()),
            Vec::new(),
        ));

        // This event becomes a forward extremity; its parents stop
        // being ones.
        txn.append(Delta::set(
            store::ROOM_HEADS,
            store::room_heads_key(room_id, &pdu.event_id),
            depth.to_be_bytes().to_vec(),
        ));
        for prev in &pdu.body.prev_events {
            txn.append(Delta::delete(
                store::ROOM_HEADS,
                store::room_heads_key(room_id, prev),
            ));
        }

        if pdu.is_state() {
            let pre = store::load_state_map(&self.world.storage, room_id).await?;
            let post = self.world.resolver.resolve(&pre, std::slice::from_ref(pdu));
            for (cell, winner) in &post {
                if pre.get(cell) != Some(winner) {
                    txn.append(Delta::set(
                        columns::ROOM_STATE,
                        store::room_state_key(room_id, &cell.0, &cell.1),
                        store::event_key(winner),
                    ));
                }
            }
        }

        let sequence = self.world.registry.alloc_sequence(self.id);
        txn.append(Delta::set(
            columns::EVENT_SEQ,
            store::seq_key(sequence),
            store::event_key(&pdu.event_id),
        ));

        self.world.storage.commit(txn).await.map_err(Error::from)?;

        debug!(
            eval = self.id,
            event_id = %pdu.event_id,
            room_id = %room_id,
            sequence,
            "committed event"
        );
        Ok(sequence)
    }
}

impl Drop for Eval {
    fn drop(&mut self) {
        self.world.registry.deregister(self.id);
    }
}
