//! Tessera VM: the event evaluation core
//!
//! Processes any event from any place from any time: validates it,
//! resolves its missing ancestors over federation, authorizes it against
//! room state, and commits it under a process-wide monotonic sequence.
//! The sequence registry tracks every live evaluation, deriving the
//! parent/child nesting that lets reentrant fetches evaluate ancestors
//! on the same task without deadlock.

pub mod auth;
pub mod eval;
pub mod hooks;
pub mod opts;
pub mod registry;
pub mod state_res;
pub mod store;

pub use eval::{Eval, EvalReport, EventStub, PduOutcome, World};
pub use hooks::{CommitNotice, HookBus};
pub use opts::{EvalOpts, InjectOpts};
pub use registry::{EvalInfo, Registry, TaskId};
pub use state_res::{DefaultResolver, StateMap, StateResolver};
pub use store::StorageRoomOrigins;
