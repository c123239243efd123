//! Fan-out of conditioned readings to live subscribers.
//!
//! Each subscriber is represented by the sending half of its bounded
//! outbound queue; the connection's writer task drains the other half into
//! the socket. Broadcasting never waits: a closed queue marks the subscriber
//! for pruning, a full queue drops that one message for that subscriber.

use crate::core::ConditionedReading;
use crate::counters::SharedCounters;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Serialized message queued for one subscriber.
pub type OutboundMessage = Arc<str>;

/// Identifier assigned to a subscriber connection on registration.
pub type SubscriberId = Uuid;

/// A registered subscriber connection.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub remote: SocketAddr,
    sender: mpsc::Sender<OutboundMessage>,
}

/// Result of one broadcast sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    /// Subscribers whose queue was full
    pub dropped: usize,
    /// Subscribers removed because their connection was gone
    pub pruned: usize,
}

/// Registry of live subscribers and the broadcast primitive over them.
pub struct Broadcaster {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    counters: SharedCounters,
}

impl Broadcaster {
    pub fn new(counters: SharedCounters) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            counters,
        }
    }

    /// Add a connection to the active set.
    pub fn register(&self, remote: SocketAddr, sender: mpsc::Sender<OutboundMessage>) -> SubscriberId {
        let id = Uuid::new_v4();
        let mut subscribers = self.subscribers.write();
        subscribers.insert(id, Subscriber { id, remote, sender });
        tracing::info!(
            subscriber = %id,
            remote = %remote,
            total = subscribers.len(),
            "Subscriber registered"
        );
        id
    }

    /// Remove a connection. Returns false if it was already gone.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write();
        let removed = subscribers.remove(&id);
        if let Some(subscriber) = &removed {
            tracing::info!(
                subscriber = %id,
                remote = %subscriber.remote,
                total = subscribers.len(),
                "Subscriber unregistered"
            );
        }
        removed.is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn subscribers(&self) -> Vec<Subscriber> {
        self.subscribers.read().values().cloned().collect()
    }

    /// Serialize a reading once and offer it to every subscriber.
    pub fn broadcast(&self, reading: &ConditionedReading) -> BroadcastOutcome {
        let message: OutboundMessage = match serde_json::to_string(reading) {
            Ok(json) => json.into(),
            Err(e) => {
                tracing::error!(error = %e, source = %reading.user, "Failed to serialize reading");
                return BroadcastOutcome::default();
            }
        };
        self.counters.record_broadcast();
        self.broadcast_message(message)
    }

    /// Offer an already serialized message to every subscriber.
    pub fn broadcast_message(&self, message: OutboundMessage) -> BroadcastOutcome {
        let snapshot = self.subscribers();
        let mut outcome = BroadcastOutcome::default();
        let mut closed = Vec::new();

        for subscriber in &snapshot {
            match subscriber.sender.try_send(message.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscriber = %subscriber.id,
                        remote = %subscriber.remote,
                        "Subscriber queue full, dropping message"
                    );
                    outcome.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => closed.push(subscriber.id),
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in &closed {
                if subscribers.remove(id).is_some() {
                    outcome.pruned += 1;
                }
            }
            tracing::info!(
                pruned = outcome.pruned,
                total = subscribers.len(),
                "Removed disconnected subscribers"
            );
        }

        if outcome.dropped > 0 {
            self.counters.record_dropped_deliveries(outcome.dropped as u64);
        }
        if outcome.pruned > 0 {
            self.counters.record_pruned(outcome.pruned as u64);
        }
        outcome
    }
}
