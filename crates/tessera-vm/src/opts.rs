//! Evaluation options

use serde::{Deserialize, Serialize};
use tessera_core::ServerName;

/// Immutable option bundle carried by every evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalOpts {
    /// Max events processed in a batch; overflow is truncated.
    pub limit: usize,

    /// Preserve caller-supplied event order instead of sorting by
    /// `(depth, origin_server_ts, event_id)`.
    pub ordered: bool,

    /// Verify content hashes and signatures. Off for trusted replay.
    pub verify: bool,

    /// Emit post-commit hooks. Off for replay and import.
    pub notify: bool,

    /// Require parents to exist, fetching them over federation when
    /// absent; off permits orphans.
    pub prev_check_exists: bool,

    /// Stop the batch at the first per-event rejection.
    pub fail_fast: bool,

    /// Refuse an event id that is already being evaluated elsewhere
    /// in-process.
    pub unique: bool,

    /// Bitmask of conformance codes downgraded from fatal.
    pub non_conform: u64,

    /// When set, this evaluation acts on behalf of a single remote node:
    /// parallel key fetching is restricted to events originating there
    /// to prevent amplification.
    pub node_id: Option<ServerName>,
}

impl Default for EvalOpts {
    fn default() -> Self {
        Self {
            limit: 128,
            ordered: false,
            verify: true,
            notify: true,
            prev_check_exists: true,
            fail_fast: false,
            unique: true,
            non_conform: 0,
            node_id: None,
        }
    }
}

impl EvalOpts {
    /// Options for trusted replay/import: no verification, no hooks,
    /// orphans permitted.
    pub fn for_import() -> Self {
        Self {
            verify: false,
            notify: false,
            prev_check_exists: false,
            ..Self::default()
        }
    }
}

/// Options for the local-origin injection path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectOpts {
    /// The underlying evaluation options.
    pub base: EvalOpts,

    /// Fill `origin` and `origin_server_ts` from the local server.
    pub add_origin: bool,

    /// Fill `prev_events` from the room's forward extremities and
    /// `depth` from their maximum.
    pub add_prev_events: bool,

    /// Select `auth_events` from the current room state.
    pub add_auth_events: bool,

    /// Attach the content hash.
    pub add_hash: bool,

    /// Attach the local server's signature.
    pub add_signature: bool,
}

impl Default for InjectOpts {
    fn default() -> Self {
        Self {
            base: EvalOpts::default(),
            add_origin: true,
            add_prev_events: true,
            add_auth_events: true,
            add_hash: true,
            add_signature: true,
        }
    }
}
