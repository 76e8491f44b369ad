//! Process runlevel
//!
//! A coarse lifecycle state consulted before accepting new work. The
//! fetch submission path refuses to queue requests unless the process is
//! at `Run`, and surfaces `Unavailable` once shutdown has begun.

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Process-wide lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Runlevel {
    /// Starting up; work is deferred, not refused.
    Start,
    /// Normal operation.
    Run,
    /// Shutting down; new work is refused.
    Quit,
}

impl fmt::Display for Runlevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Runlevel::Start => "START",
            Runlevel::Run => "RUN",
            Runlevel::Quit => "QUIT",
        };
        f.write_str(name)
    }
}

/// Shared handle to the runlevel; cheap to clone.
#[derive(Debug, Clone)]
pub struct RunlevelHandle {
    tx: Arc<watch::Sender<Runlevel>>,
}

impl RunlevelHandle {
    /// Create a handle starting at `Start`.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Runlevel::Start);
        Self { tx: Arc::new(tx) }
    }

    /// Create a handle already at `Run`, for tests and tools.
    pub fn running() -> Self {
        let handle = Self::new();
        handle.set(Runlevel::Run);
        handle
    }

    /// The current level.
    pub fn get(&self) -> Runlevel {
        *self.tx.borrow()
    }

    /// Transition to a new level, waking all waiters.
    pub fn set(&self, level: Runlevel) {
        self.tx.send_replace(level);
    }

    /// Wait until the process is at `Run`, or fail with `Unavailable`
    /// once it reaches `Quit`.
    pub async fn wait_for_run(&self) -> Result<()> {
        let mut rx = self.tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                Runlevel::Run => return Ok(()),
                Runlevel::Quit => {
                    return Err(Error::unavailable(format!(
                        "cannot accept work in runlevel '{}'",
                        Runlevel::Quit
                    )))
                }
                Runlevel::Start => {}
            }

            if rx.changed().await.is_err() {
                return Err(Error::unavailable("runlevel channel closed"));
            }
        }
    }
}

impl Default for RunlevelHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_passes_immediately() {
        let handle = RunlevelHandle::running();
        assert!(handle.wait_for_run().await.is_ok());
    }

    #[tokio::test]
    async fn quit_refuses() {
        let handle = RunlevelHandle::new();
        handle.set(Runlevel::Quit);
        assert!(matches!(
            handle.wait_for_run().await,
            Err(Error::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn start_waits_for_transition() {
        let handle = RunlevelHandle::new();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_for_run().await })
        };

        tokio::task::yield_now().await;
        handle.set(Runlevel::Run);
        assert!(waiter.await.unwrap().is_ok());
    }
}
