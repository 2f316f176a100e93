//! Subscription book mapping stream keys to connections.

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, PoisonError},
};

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

/// Builds the stream key for a conversation/message pair.
pub fn stream_key(conversation_id: &str, assistant_message_id: &str) -> String {
    format!("{conversation_id}:{assistant_message_id}")
}

/// Outcome of one publish: how many frames were delivered and how many
/// stale connections were pruned while delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishSummary {
    pub delivered: usize,
    pub pruned: usize,
}

#[derive(Default)]
struct StreamTables {
    senders: HashMap<String, UnboundedSender<String>>,
    by_stream: HashMap<String, HashSet<String>>,
    by_connection: HashMap<String, HashSet<String>>,
}

/// Maps stream keys to subscriber connections and back.
///
/// Connections are text senders; the payload is serialized once per publish
/// and fanned out. A send failure marks the connection stale and removes it
/// (both directions) within the same lock, so later publishes never see it.
#[derive(Default)]
pub struct StreamRegistry {
    tables: Mutex<StreamTables>,
}

impl StreamRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection's outbound sender under `connection_id`,
    /// replacing any prior sender for the same id.
    pub fn register_connection(&self, connection_id: &str, sender: UnboundedSender<String>) {
        let mut tables = self.lock();
        tables.senders.insert(connection_id.to_string(), sender);
        tables
            .by_connection
            .entry(connection_id.to_string())
            .or_default();
    }

    /// Subscribes a registered connection to `key`. False when the
    /// connection is unknown.
    pub fn subscribe(&self, key: &str, connection_id: &str) -> bool {
        let mut tables = self.lock();
        if !tables.senders.contains_key(connection_id) {
            return false;
        }
        tables
            .by_stream
            .entry(key.to_string())
            .or_default()
            .insert(connection_id.to_string());
        tables
            .by_connection
            .entry(connection_id.to_string())
            .or_default()
            .insert(key.to_string());
        true
    }

    /// Drops one subscription. True when it existed.
    pub fn unsubscribe(&self, key: &str, connection_id: &str) -> bool {
        let mut tables = self.lock();
        let removed = tables
            .by_stream
            .get_mut(key)
            .map(|subscribers| subscribers.remove(connection_id))
            .unwrap_or(false);
        if let Some(streams) = tables.by_connection.get_mut(connection_id) {
            streams.remove(key);
        }
        if tables
            .by_stream
            .get(key)
            .is_some_and(HashSet::is_empty)
        {
            tables.by_stream.remove(key);
        }
        removed
    }

    /// Removes a connection and every subscription it held.
    pub fn drop_connection(&self, connection_id: &str) {
        let mut tables = self.lock();
        remove_connection_locked(&mut tables, connection_id);
    }

    /// Serializes `payload` once and fans it out to every subscriber of
    /// `key`, pruning connections whose sender is gone.
    pub fn publish(&self, key: &str, payload: &Value) -> PublishSummary {
        let frame = payload.to_string();
        let mut summary = PublishSummary::default();
        let mut tables = self.lock();
        let Some(subscribers) = tables.by_stream.get(key) else {
            return summary;
        };
        let subscribers: Vec<String> = subscribers.iter().cloned().collect();
        let mut stale = Vec::new();
        for connection_id in subscribers {
            match tables.senders.get(&connection_id) {
                Some(sender) if sender.send(frame.clone()).is_ok() => {
                    summary.delivered += 1;
                }
                _ => stale.push(connection_id),
            }
        }
        for connection_id in stale {
            remove_connection_locked(&mut tables, &connection_id);
            summary.pruned += 1;
        }
        if summary.pruned > 0 {
            tracing::debug!(
                stream = %key,
                delivered = summary.delivered,
                pruned = summary.pruned,
                "pruned stale stream subscribers during publish"
            );
        }
        summary
    }

    /// Number of live subscribers on `key`.
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.lock()
            .by_stream
            .get(key)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Streams a connection is subscribed to, sorted.
    pub fn subscriptions_of(&self, connection_id: &str) -> Vec<String> {
        let mut streams: Vec<String> = self
            .lock()
            .by_connection
            .get(connection_id)
            .map(|streams| streams.iter().cloned().collect())
            .unwrap_or_default();
        streams.sort();
        streams
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StreamTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn remove_connection_locked(tables: &mut StreamTables, connection_id: &str) {
    tables.senders.remove(connection_id);
    if let Some(streams) = tables.by_connection.remove(connection_id) {
        for key in streams {
            if let Some(subscribers) = tables.by_stream.get_mut(&key) {
                subscribers.remove(connection_id);
                if subscribers.is_empty() {
                    tables.by_stream.remove(&key);
                }
            }
        }
    }
}
