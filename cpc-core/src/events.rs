use crate::error::TxError;
use crate::hash::Hash32;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// In-process chain events. Delivery is at-least-once to live subscribers
/// and best-effort only: a lagging or absent consumer loses events, which
/// is exactly the contract external pending-nonce trackers are written
/// against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChainEvent {
    TxAccepted {
        tx_id: Hash32,
    },
    TxConfirmed {
        tx_id: Hash32,
        block_height: u64,
        block_hash: Hash32,
    },
    TxFailed {
        tx_id: Hash32,
        reason: TxError,
    },
    BlockCreated {
        block_hash: Hash32,
        height: u64,
    },
}

/// Broadcast fan-out bus shared by the mempool, the state writer and the
/// RPC event stream.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ChainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: ChainEvent) {
        // A send error only means nobody is subscribed right now.
        if self.sender.send(event).is_err() {
            tracing::trace!("event dropped: no live subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(ChainEvent::BlockCreated {
            block_hash: Hash32::zero(),
            height: 7,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            ChainEvent::BlockCreated {
                block_hash: Hash32::zero(),
                height: 7,
            }
        );
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        bus.publish(ChainEvent::TxAccepted {
            tx_id: Hash32::zero(),
        });
    }
}
