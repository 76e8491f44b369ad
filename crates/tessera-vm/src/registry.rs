//! The sequence registry
//!
//! A flat table of live evaluations keyed by eval id, plus the two
//! process counters: the strictly-increasing eval id and the commit
//! sequence. Parent/child structure is derived from the table — an eval
//! registering on a task becomes the child of the task's newest live
//! eval — so no cross-references exist outside this module.
//!
//! Mutations happen at yield-free stretches; the synchronous lock is
//! never held across a suspension point.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tessera_core::EventId;
use tracing::error;

/// Identifier of a cooperative task driving evaluations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TaskId(pub u64);

static TASK_CTR: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Allocate a fresh process-unique task id.
    pub fn allocate() -> Self {
        Self(TASK_CTR.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct EvalRecord {
    id: u64,
    task: TaskId,
    /// Zero until the eval enters its commit phase.
    sequence: u64,
    parent: Option<u64>,
    child: Option<u64>,
    /// Ids of the events the eval is working through.
    pdu_ids: Vec<EventId>,
    /// Event id of an injection payload, once derived.
    issue_id: Option<EventId>,
    /// One-event-id shortcut, set before the body is known.
    event_id: Option<EventId>,
}

/// Read-only snapshot of one live evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalInfo {
    pub id: u64,
    pub task: TaskId,
    pub sequence: u64,
    pub parent: Option<u64>,
    pub child: Option<u64>,
    pub pdu_ids: Vec<EventId>,
}

#[derive(Debug, Default)]
struct Inner {
    id_ctr: u64,
    seq_ctr: u64,
    executing: usize,
    injecting: usize,
    records: BTreeMap<u64, EvalRecord>,
}

/// Process-wide collection of live evaluations.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new evaluation on a task. The newest live eval of the
    /// same task becomes its parent; that parent must not already have a
    /// child (evals nest strictly).
    pub fn register(&self, task: TaskId) -> u64 {
        let mut inner = self.inner.lock();
        inner.id_ctr += 1;
        let id = inner.id_ctr;

        let parent = inner
            .records
            .values()
            .filter(|record| record.task == task)
            .map(|record| record.id)
            .max();

        if let Some(parent_id) = parent {
            if let Some(parent_record) = inner.records.get_mut(&parent_id) {
                debug_assert!(
                    parent_record.child.is_none(),
                    "registering under a parent that already has a child"
                );
                parent_record.child = Some(id);
            }
        }

        inner.records.insert(
            id,
            EvalRecord {
                id,
                task,
                sequence: 0,
                parent,
                child: None,
                pdu_ids: Vec::new(),
                issue_id: None,
                event_id: None,
            },
        );
        id
    }

    /// Remove an evaluation. Evals must be released in LIFO order per
    /// task: a record with a live child cannot be deregistered.
    pub fn deregister(&self, id: u64) {
        let mut inner = self.inner.lock();
        let Some(record) = inner.records.remove(&id) else {
            return;
        };

        if record.child.is_some() {
            error!(eval = id, "deregistering an eval that still has a child");
            debug_assert!(record.child.is_none(), "evals must be released LIFO");
        }

        if let Some(parent_id) = record.parent {
            if let Some(parent) = inner.records.get_mut(&parent_id) {
                debug_assert_eq!(parent.child, Some(id));
                parent.child = None;
            }
        }
    }

    /// Allocate the next commit sequence and bind it to the eval.
    /// Strictly increasing over the process lifetime.
    pub fn alloc_sequence(&self, id: u64) -> u64 {
        let mut inner = self.inner.lock();
        inner.seq_ctr += 1;
        let sequence = inner.seq_ctr;
        if let Some(record) = inner.records.get_mut(&id) {
            record.sequence = sequence;
        }
        sequence
    }

    /// Smallest positive sequence among live evals.
    pub fn seqmin(&self) -> Option<u64> {
        self.inner
            .lock()
            .records
            .values()
            .map(|record| record.sequence)
            .filter(|sequence| *sequence > 0)
            .min()
    }

    /// Largest positive sequence among live evals.
    pub fn seqmax(&self) -> Option<u64> {
        self.inner
            .lock()
            .records
            .values()
            .map(|record| record.sequence)
            .filter(|sequence| *sequence > 0)
            .max()
    }

    /// Smallest live sequence strictly greater than `seq`.
    pub fn seqnext(&self, seq: u64) -> Option<u64> {
        self.inner
            .lock()
            .records
            .values()
            .map(|record| record.sequence)
            .filter(|sequence| *sequence > seq)
            .min()
    }

    /// True iff exactly one live eval carries the sequence.
    pub fn sequnique(&self, seq: u64) -> bool {
        self.inner
            .lock()
            .records
            .values()
            .filter(|record| record.sequence == seq)
            .count()
            == 1
    }

    /// Find the live eval working on an event id: an in-flight pdu, an
    /// injection payload, or the one-id shortcut.
    pub fn find(&self, event_id: &EventId) -> Option<u64> {
        self.inner
            .lock()
            .records
            .values()
            .find(|record| record_matches(record, event_id))
            .map(|record| record.id)
    }

    /// Number of live evals working on an event id.
    pub fn count(&self, event_id: &EventId) -> usize {
        self.inner
            .lock()
            .records
            .values()
            .filter(|record| record_matches(record, event_id))
            .count()
    }

    /// Number of live evals on a task.
    pub fn count_task(&self, task: TaskId) -> usize {
        self.inner
            .lock()
            .records
            .values()
            .filter(|record| record.task == task)
            .count()
    }

    /// The newest live eval of the same task other than `id`.
    pub fn find_parent(&self, id: u64) -> Option<u64> {
        let inner = self.inner.lock();
        let task = inner.records.get(&id)?.task;
        inner
            .records
            .values()
            .filter(|record| record.task == task && record.id != id)
            .map(|record| record.id)
            .max()
    }

    /// The oldest ancestor of an eval on its task.
    pub fn find_root(&self, id: u64) -> Option<u64> {
        let inner = self.inner.lock();
        let mut current = inner.records.get(&id)?;
        let mut root = None;
        while let Some(parent_id) = current.parent {
            let Some(parent) = inner.records.get(&parent_id) else {
                break;
            };
            root = Some(parent.id);
            current = parent;
        }
        root
    }

    /// Snapshot one live eval.
    pub fn info(&self, id: u64) -> Option<EvalInfo> {
        self.inner.lock().records.get(&id).map(record_info)
    }

    /// Visit every live eval in id order; stop when the closure returns
    /// false. Returns whether the walk ran to completion.
    pub fn for_each(&self, mut f: impl FnMut(&EvalInfo) -> bool) -> bool {
        let inner = self.inner.lock();
        for record in inner.records.values() {
            if !f(&record_info(record)) {
                return false;
            }
        }
        true
    }

    /// Number of live evals.
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    /// Record the event ids an eval is working through.
    pub fn set_pdu_ids(&self, id: u64, ids: Vec<EventId>) {
        if let Some(record) = self.inner.lock().records.get_mut(&id) {
            record.pdu_ids = ids;
        }
    }

    /// Record the derived id of an injection payload.
    pub fn set_issue_id(&self, id: u64, event_id: EventId) {
        if let Some(record) = self.inner.lock().records.get_mut(&id) {
            record.issue_id = Some(event_id);
        }
    }

    /// Record the one-event-id shortcut.
    pub fn set_event_id(&self, id: u64, event_id: EventId) {
        if let Some(record) = self.inner.lock().records.get_mut(&id) {
            record.event_id = Some(event_id);
        }
    }

    /// Coarse activity flags.
    pub fn executing(&self) -> bool {
        self.inner.lock().executing > 0
    }

    pub fn injecting(&self) -> bool {
        self.inner.lock().injecting > 0
    }

    pub(crate) fn enter_executing(&self) {
        self.inner.lock().executing += 1;
    }

    pub(crate) fn exit_executing(&self) {
        let mut inner = self.inner.lock();
        inner.executing = inner.executing.saturating_sub(1);
    }

    pub(crate) fn enter_injecting(&self) {
        self.inner.lock().injecting += 1;
    }

    pub(crate) fn exit_injecting(&self) {
        let mut inner = self.inner.lock();
        inner.injecting = inner.injecting.saturating_sub(1);
    }
}

fn record_info(record: &EvalRecord) -> EvalInfo {
    EvalInfo {
        id: record.id,
        task: record.task,
        sequence: record.sequence,
        parent: record.parent,
        child: record.child,
        pdu_ids: record.pdu_ids.clone(),
    }
}

fn record_matches(record: &EvalRecord, event_id: &EventId) -> bool {
    if !record.pdu_ids.is_empty() {
        record.pdu_ids.iter().any(|id| id == event_id)
    } else if let Some(issue) = &record.issue_id {
        issue == event_id
    } else {
        record.event_id.as_ref() == Some(event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_strictly_monotonic() {
        let registry = Registry::new();
        let task = TaskId::allocate();
        let a = registry.register(task);
        let b = registry.register(task);
        assert!(b > a);
        registry.deregister(b);
        registry.deregister(a);
        let c = registry.register(task);
        assert!(c > b);
        registry.deregister(c);
    }

    #[test]
    fn parent_child_linkage_per_task() {
        let registry = Registry::new();
        let task = TaskId::allocate();
        let other = TaskId::allocate();

        let outer = registry.register(task);
        let unrelated = registry.register(other);
        let inner = registry.register(task);

        let info = registry.info(inner).unwrap();
        assert_eq!(info.parent, Some(outer));
        assert_eq!(registry.info(outer).unwrap().child, Some(inner));
        assert_eq!(registry.info(unrelated).unwrap().parent, None);

        assert_eq!(registry.find_parent(inner), Some(outer));
        assert_eq!(registry.find_root(inner), Some(outer));

        registry.deregister(inner);
        assert_eq!(registry.info(outer).unwrap().child, None);
        registry.deregister(unrelated);
        registry.deregister(outer);
    }

    #[test]
    fn sequence_queries() {
        let registry = Registry::new();
        let a = registry.register(TaskId::allocate());
        let b = registry.register(TaskId::allocate());
        let c = registry.register(TaskId::allocate());

        assert_eq!(registry.seqmin(), None);
        assert_eq!(registry.seqmax(), None);

        let seq_a = registry.alloc_sequence(a);
        let seq_b = registry.alloc_sequence(b);
        assert!(seq_b > seq_a);

        assert_eq!(registry.seqmin(), Some(seq_a));
        assert_eq!(registry.seqmax(), Some(seq_b));
        assert_eq!(registry.seqnext(0), Some(seq_a));
        assert_eq!(registry.seqnext(seq_a), Some(seq_b));
        assert_eq!(registry.seqnext(seq_b), None);
        assert!(registry.sequnique(seq_a));

        // Pre-commit evals are excluded from seqmin.
        assert_eq!(registry.info(c).unwrap().sequence, 0);

        registry.deregister(c);
        registry.deregister(b);
        registry.deregister(a);
    }

    #[test]
    fn find_by_event_id_forms() {
        let registry = Registry::new();
        let id = EventId::from("$wanted");

        let a = registry.register(TaskId::allocate());
        registry.set_pdu_ids(a, vec![id.clone()]);
        let b = registry.register(TaskId::allocate());
        registry.set_issue_id(b, id.clone());
        let c = registry.register(TaskId::allocate());
        registry.set_event_id(c, id.clone());

        assert_eq!(registry.count(&id), 3);
        assert_eq!(registry.find(&id), Some(a));

        registry.deregister(c);
        registry.deregister(b);
        registry.deregister(a);
    }
}
