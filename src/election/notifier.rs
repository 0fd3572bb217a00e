//! Leadership change notifications
//!
//! Transitions are published on an in-process broadcast channel under the
//! [`LEADER_CHANGE_TOPIC`] topic. Delivery is best-effort: with no
//! subscribers the event is dropped, and a subscriber that falls behind
//! sees `RecvError::Lagged` and skips ahead. Subscribers should treat every
//! event as a hint to re-read `is_leader`.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Topic name leadership events are published under
pub const LEADER_CHANGE_TOPIC: &str = "leader_change";

const CHANNEL_CAPACITY: usize = 256;

/// One leadership transition observed by this process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderChangeEvent {
    pub key: String,
    /// This process now leads `key`
    pub is_leader: bool,
    /// Leader identity as far as this process knows; empty if none
    pub leader_host: String,
}

#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<LeaderChangeEvent>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn topic(&self) -> &'static str {
        LEADER_CHANGE_TOPIC
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeaderChangeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: LeaderChangeEvent) {
        tracing::debug!(
            topic = LEADER_CHANGE_TOPIC,
            key = %event.key,
            is_leader = event.is_leader,
            leader = %event.leader_host,
            "publishing leader change"
        );
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}
