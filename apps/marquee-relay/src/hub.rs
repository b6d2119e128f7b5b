use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::protocol::{ConnectionId, ServerMessage};

/// Connection group multiplexer: maps topic names to the connections
/// subscribed to them and delivers broadcasts/unicasts as fire-and-forget
/// sends on each connection's outbound channel. All operations are pure
/// in-memory work; nothing here blocks or awaits.
#[derive(Clone, Default)]
pub struct TopicHub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    topics: DashMap<String, HashSet<ConnectionId>>,
    connections: DashMap<ConnectionId, ConnectionEntry>,
}

struct ConnectionEntry {
    tx: UnboundedSender<ServerMessage>,
    subscriptions: HashSet<String>,
}

impl TopicHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbound channel. Must precede any subscribe.
    pub fn attach(&self, conn: ConnectionId, tx: UnboundedSender<ServerMessage>) {
        self.inner.connections.insert(
            conn,
            ConnectionEntry {
                tx,
                subscriptions: HashSet::new(),
            },
        );
    }

    /// Forget a connection: its channel and every topic membership.
    pub fn detach(&self, conn: ConnectionId) {
        let subscriptions = match self.inner.connections.remove(&conn) {
            Some((_, entry)) => entry.subscriptions,
            None => return,
        };
        for topic in subscriptions {
            self.remove_from_topic(&topic, conn);
        }
    }

    pub fn subscribe(&self, conn: ConnectionId, topic: &str) {
        let known = match self.inner.connections.get_mut(&conn) {
            Some(mut entry) => {
                entry.subscriptions.insert(topic.to_string());
                true
            }
            None => false,
        };
        if !known {
            debug!(%conn, topic, "subscribe for unknown connection ignored");
            return;
        }
        self.inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(conn);
    }

    pub fn unsubscribe(&self, conn: ConnectionId, topic: &str) {
        if let Some(mut entry) = self.inner.connections.get_mut(&conn) {
            entry.subscriptions.remove(topic);
        }
        self.remove_from_topic(topic, conn);
    }

    /// Send to every subscriber of `topic`. Connections whose receiver is
    /// gone are evicted on the spot, the way a closed peer is dropped from
    /// a broadcast group.
    pub fn broadcast(&self, topic: &str, message: &ServerMessage) {
        // Copy the membership out first; holding a topics guard while
        // touching the connections map invites lock-order trouble.
        let members: Vec<ConnectionId> = match self.inner.topics.get(topic) {
            Some(set) => set.iter().copied().collect(),
            None => return,
        };

        let mut dead = Vec::new();
        for conn in members {
            let tx = match self.inner.connections.get(&conn) {
                Some(entry) => entry.tx.clone(),
                None => continue,
            };
            if tx.send(message.clone()).is_err() {
                dead.push(conn);
            }
        }
        for conn in dead {
            debug!(%conn, topic, "evicting connection with closed receiver");
            self.detach(conn);
        }
    }

    /// Send to one connection only. A closed receiver is left for the
    /// disconnect reconciler; the send result is not interesting here.
    pub fn unicast(&self, conn: ConnectionId, message: ServerMessage) {
        if let Some(entry) = self.inner.connections.get(&conn) {
            let _ = entry.tx.send(message);
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    fn remove_from_topic(&self, topic: &str, conn: ConnectionId) {
        let mut emptied = false;
        if let Some(mut set) = self.inner.topics.get_mut(topic) {
            set.remove(&conn);
            emptied = set.is_empty();
        }
        if emptied {
            self.inner
                .topics
                .remove_if(topic, |_, set| set.is_empty());
        }
    }
}
