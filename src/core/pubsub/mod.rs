// src/core/pubsub/mod.rs

//! A minimal publish-subscribe hub. It exists for the failover announcement
//! channel (`__sentinel__:failover`) and the plain SUBSCRIBE/PUBLISH surface.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, Receiver, Sender};

/// The capacity of each individual broadcast channel.
const CHANNEL_CAPACITY: usize = 128;

/// `PubSubManager` is the hub for all Pub/Sub functionality. It uses a
/// `DashMap` for thread-safe management of channel subscriptions.
#[derive(Debug, Default)]
pub struct PubSubManager {
    /// A map from a channel name to its broadcast sender.
    channels: DashMap<Bytes, Arc<Sender<Bytes>>>,
}

impl PubSubManager {
    pub fn new() -> Self {
        Default::default()
    }

    /// Subscribes a client to a specific channel, creating it if needed.
    /// Returns the `Receiver` the connection handler will listen on.
    pub fn subscribe(&self, channel_name: &Bytes) -> Receiver<Bytes> {
        self.channels
            .entry(channel_name.clone())
            .or_insert_with(|| Arc::new(broadcast::channel(CHANNEL_CAPACITY).0))
            .value()
            .subscribe()
    }

    /// Publishes a message, returning the number of receivers it reached.
    pub fn publish(&self, channel_name: &Bytes, message: Bytes) -> usize {
        match self.channels.get(channel_name) {
            Some(sender) => sender.send(message).unwrap_or(0),
            None => 0,
        }
    }

    /// Drops channels with no remaining subscribers.
    pub fn purge_empty_channels(&self) {
        self.channels
            .retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn subscriber_count(&self, channel_name: &Bytes) -> usize {
        self.channels
            .get(channel_name)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}
