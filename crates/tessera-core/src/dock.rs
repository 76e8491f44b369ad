//! Dock: a wait-until-predicate condition variable
//!
//! Cooperative tasks park on a dock until a predicate over shared state
//! becomes true; any task that mutates that state calls `notify_all`.
//! The registration-before-recheck ordering below closes the window where
//! a notification lands between evaluating the predicate and parking.

use tokio::sync::Notify;

/// A named rendezvous point for cooperative tasks.
#[derive(Debug, Default)]
pub struct Dock {
    notify: Notify,
}

impl Dock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park until `pred` returns true. The predicate must be cheap and
    /// must not suspend; it is re-evaluated after every notification.
    pub async fn wait_until(&self, mut pred: impl FnMut() -> bool) {
        loop {
            if pred() {
                return;
            }

            let notified = self.notify.notified();
            if pred() {
                return;
            }
            notified.await;
        }
    }

    /// Wake every parked task so it re-evaluates its predicate.
    pub fn notify_all(&self) {
        self.notify.notify_waiters();
    }
}
