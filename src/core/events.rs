// src/core/events.rs

//! The event bus that carries accepted writes to the replication subsystem.
//!
//! Every write the dispatch path accepts is published here as a fully-formed
//! RESP command array. The backlog feeder subscribes and assigns replication
//! offsets; AOF persistence takes its own, acked path (see `persistence::aof`)
//! because durability has to be confirmed before the client is answered.

use crate::core::protocol::RespFrame;
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::debug;

/// The capacity of the broadcast channel for replication. Large enough to
/// absorb bursts of writes without lagging subscribers.
const BROADCAST_BUS_CAPACITY: usize = 16384;

#[derive(Debug)]
pub struct EventBus {
    replication_sender: Sender<RespFrame>,
}

impl EventBus {
    pub fn new() -> Self {
        let (replication_sender, _) = broadcast::channel(BROADCAST_BUS_CAPACITY);
        Self { replication_sender }
    }

    /// Publishes an accepted write for replication fan-out. Having no active
    /// subscriber (no replicas, or a replica role) is not an error.
    pub fn publish(&self, frame: RespFrame) {
        if self.replication_sender.send(frame).is_err() {
            debug!("Published a write with no active replication subscribers.");
        }
    }

    /// Provides a new receiver for a replication task to subscribe to updates.
    pub fn subscribe_for_replication(&self) -> Receiver<RespFrame> {
        self.replication_sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
