//! Typed publish/subscribe event stream.
//!
//! Publishers never await subscribers: events go through a broadcast
//! channel and slow receivers observe `Lagged` rather than back-pressuring
//! consensus. Per-component ordering is preserved by the channel.

use tokio::sync::broadcast;

use crate::types::Hash256;

/// Channel capacity; slow subscribers past this lag lose oldest events.
const EVENT_CAPACITY: usize = 10_000;

#[derive(Clone, Debug)]
pub enum NodeEvent {
    BlockApplied {
        height: u64,
        hash: Hash256,
        validator: String,
    },
    TransactionApplied {
        hash: Hash256,
        sender: String,
        recipient: String,
        amount: u64,
    },
    TransactionAccepted {
        hash: Hash256,
    },
    TransactionRejected {
        hash: Hash256,
        reason: String,
    },
    TransactionEvicted {
        hash: Hash256,
    },
    TransactionExpired {
        hash: Hash256,
    },
    ValidatorRegistered {
        address: String,
    },
    ValidatorActivated {
        address: String,
    },
    ValidatorDeactivated {
        address: String,
    },
    ValidatorJailed {
        address: String,
        until_ms: u64,
    },
    ValidatorUnjailed {
        address: String,
    },
    ValidatorTombstoned {
        address: String,
    },
    RewardBlock {
        validator: String,
        amount: u64,
    },
    RewardDeveloper {
        validator: String,
        amount: u64,
    },
    RewardEarlyValidator {
        validator: String,
        amount: u64,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget publish. A send error only means nobody is
    /// listening, which is fine.
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
