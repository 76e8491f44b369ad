//! Post-commit notification bus
//!
//! Commits publish a notice in sequence order; subscribers tail the bus
//! with a broadcast receiver. Lagging subscribers lose the oldest
//! notices rather than applying back-pressure to committers.

use serde::{Deserialize, Serialize};
use tessera_core::{EventId, RoomId};
use tokio::sync::broadcast;

/// One committed point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitNotice {
    pub sequence: u64,
    pub event_id: EventId,
    pub room_id: RoomId,
    /// The event type, for cheap subscriber-side filtering.
    pub kind: String,
}

/// Broadcast bus for post-commit hooks.
#[derive(Debug, Clone)]
pub struct HookBus {
    tx: broadcast::Sender<CommitNotice>,
}

impl HookBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Attach a subscriber; it observes notices published after this.
    pub fn subscribe(&self) -> broadcast::Receiver<CommitNotice> {
        self.tx.subscribe()
    }

    /// Publish one notice. Delivery is best-effort: with no subscribers
    /// the notice is dropped.
    pub fn publish(&self, notice: CommitNotice) {
        let _ = self.tx.send(notice);
    }
}

impl Default for HookBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_observe_in_order() {
        let bus = HookBus::new(8);
        let mut rx = bus.subscribe();

        for sequence in 1..=3u64 {
            bus.publish(CommitNotice {
                sequence,
                event_id: EventId::from(format!("$e{sequence}")),
                room_id: RoomId::from("!r:x"),
                kind: "m.room.message".into(),
            });
        }

        for expected in 1..=3u64 {
            let notice = rx.recv().await.unwrap();
            assert_eq!(notice.sequence, expected);
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = HookBus::default();
        bus.publish(CommitNotice {
            sequence: 1,
            event_id: EventId::from("$e"),
            room_id: RoomId::from("!r:x"),
            kind: "m.room.message".into(),
        });
    }
}
