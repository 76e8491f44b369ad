//! State resolution seam and the default resolver
//!
//! Resolution is a pure function of the pre-state and the candidate
//! events; it never fails. The default resolver keeps, per
//! `(type, state_key)` cell, the candidate winning the deterministic
//! `(depth, origin_server_ts, event_id)` order, with any candidate
//! superseding the pre-state entry for its cell.

use std::collections::BTreeMap;
use tessera_core::{EventId, Pdu};

/// Room state snapshot: `(type, state_key)` to event id.
pub type StateMap = BTreeMap<(String, String), EventId>;

/// Pure conflict resolution over the auth DAG and the pre-state.
pub trait StateResolver: Send + Sync {
    /// Compute the post-state given the pre-state and the state events
    /// being committed.
    fn resolve(&self, pre: &StateMap, candidates: &[Pdu]) -> StateMap;
}

/// Deterministic last-writer-wins resolver over the event sort order.
#[derive(Debug, Default)]
pub struct DefaultResolver;

impl StateResolver for DefaultResolver {
    fn resolve(&self, pre: &StateMap, candidates: &[Pdu]) -> StateMap {
        let mut post = pre.clone();
        let mut winners: BTreeMap<(String, String), &Pdu> = BTreeMap::new();

        for candidate in candidates {
            let Some(state_key) = candidate.body.state_key.clone() else {
                continue;
            };
            let cell = (candidate.body.kind.clone(), state_key);

            match winners.get(&cell) {
                Some(current) if current.sort_key() >= candidate.sort_key() => {}
                _ => {
                    winners.insert(cell, candidate);
                }
            }
        }

        for (cell, winner) in winners {
            post.insert(cell, winner.event_id.clone());
        }
        post
    }
}
