use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use leasy_core::ids::{ConnectionId, UserId};
use leasy_core::wire::RoutingIdentity;

/// Identifies which logical chat window a transport instance represents:
/// who opened it, whom they are talking to, and on which surface.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    pub sender: UserId,
    pub counterparty: UserId,
    pub origin: String,
}

impl From<RoutingIdentity> for RoutingKey {
    fn from(identity: RoutingIdentity) -> Self {
        Self {
            sender: identity.sender,
            counterparty: identity.counterparty,
            origin: identity.origin,
        }
    }
}

/// A registered transport connection. Never persisted; lives exactly as long
/// as its registry entry.
pub struct Connection {
    pub id: ConnectionId,
    pub key: RoutingKey,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: Mutex<Instant>,
}

impl Connection {
    fn new(id: ConnectionId, key: RoutingKey, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            key,
            tx,
            connected: AtomicBool::new(true),
            last_pong: Mutex::new(Instant::now()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    pub fn last_pong(&self) -> Instant {
        *self.last_pong.lock()
    }

    /// Forward a raw frame to this connection's writer. Returns false when
    /// the queue is full or the writer is gone.
    pub fn forward(&self, message: String) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    connection_id = %self.id,
                    msg_len = msg.len(),
                    "send queue full, dropping push"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// In-memory bookkeeping of every open transport connection.
///
/// The registry is the only shared mutable state in the chat core. It is
/// owned by the server process; handlers and per-socket tasks reach it
/// through an Arc.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a connection under its routing key. No uniqueness constraint:
    /// multiple tabs/origins for the same pair coexist, each tracked
    /// independently. Returns the receiver feeding the socket's writer task.
    pub fn register(&self, key: RoutingKey) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let conn = Arc::new(Connection::new(id.clone(), key, tx));
        self.connections.insert(id.clone(), conn);
        (id, rx)
    }

    /// Remove a connection: transport close, probe timeout, or shutdown.
    pub fn unregister(&self, id: &ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(id) {
            conn.connected.store(false, Ordering::Relaxed);
        }
    }

    pub fn record_pong(&self, id: &ConnectionId) {
        if let Some(conn) = self.connections.get(id) {
            conn.record_pong();
        }
    }

    pub fn last_pong(&self, id: &ConnectionId) -> Option<Instant> {
        self.connections.get(id).map(|c| c.last_pong())
    }

    /// Reverse lookup for message delivery: the connections `recipient` has
    /// open towards `sender`. When several connections share an origin label
    /// only the earliest-registered one is kept, so a window opened twice
    /// under the same origin receives a single copy while each distinct
    /// origin still receives its own.
    pub fn find_recipients(
        &self,
        sender: &UserId,
        recipient: &UserId,
    ) -> Vec<Arc<Connection>> {
        let mut matched: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|entry| {
                let key = &entry.value().key;
                key.sender == *recipient && key.counterparty == *sender
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        // Connection ids are time-ordered, so sorting restores registration order.
        matched.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));

        let mut result: Vec<Arc<Connection>> = Vec::new();
        for conn in matched {
            if !result.iter().any(|kept| kept.key.origin == conn.key.origin) {
                result.push(conn);
            }
        }
        result
    }

    /// Number of registered connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Remove connections whose last pong is older than `cutoff`. Backstop
    /// against sockets that died without a clean close.
    pub fn prune_dead(&self, cutoff: Duration) -> usize {
        let now = Instant::now();
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| now.duration_since(entry.value().last_pong()) > cutoff)
            .map(|entry| entry.value().id.clone())
            .collect();

        let mut removed = 0;
        for id in dead {
            self.unregister(&id);
            removed += 1;
            tracing::info!(connection_id = %id, "pruned dead connection");
        }
        removed
    }
}
