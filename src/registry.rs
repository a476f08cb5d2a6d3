use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use futures::future::join_all;

use crate::{CloseCode, Connection, ConnectionId, Message};

/// The table of live connections, keyed by id.
///
/// Cloning is cheap and every clone sees the same table. Lookups and broadcasts take a snapshot
/// of the entries and release the lock before any frame is written, so a slow peer never blocks
/// registration or delivery to other peers.
#[derive(Clone, Default)]
pub struct Registry {
    connections: Arc<RwLock<HashMap<ConnectionId, Arc<Connection>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `conn` under its id and returns the connection it displaced, if any.
    pub fn register(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let prev = self.write().insert(conn.id(), conn);
        log::debug!("registered, {} connections", self.len());
        prev
    }

    /// Removes the entry for `id`, but only if it still points at `conn`.
    ///
    /// A connection that was displaced by a newer one under the same id must not remove its
    /// successor when it closes.
    pub fn unregister(&self, id: ConnectionId, conn: &Connection) -> bool {
        let mut connections = self.write();
        match connections.get(&id) {
            Some(entry) if std::ptr::eq(Arc::as_ptr(entry), conn) => {
                connections.remove(&id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.read().get(&id).cloned()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Ids of every registered connection, in no particular order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.read().keys().copied().collect()
    }

    /// Sends `message` to the connection registered as `id`.
    ///
    /// Returns `false` when no such connection exists or the send failed. Unknown ids are not
    /// an error: peers come and go while messages addressed to them are in flight.
    pub async fn send_to(&self, id: ConnectionId, message: impl Into<Message>) -> bool {
        let Some(conn) = self.get(id) else {
            log::debug!("send_to {}: no such connection", id);
            return false;
        };

        match conn.send(message).await {
            Ok(()) => true,
            Err(err) => {
                log::debug!("send_to {}: {}", id, err);
                false
            }
        }
    }

    /// Sends `message` to every registered connection. Returns how many sends succeeded.
    pub async fn broadcast(&self, message: impl Into<Message>) -> usize {
        self.deliver(self.snapshot(None), message.into()).await
    }

    /// Sends `message` to every registered connection except `skip`.
    pub async fn broadcast_except(&self, skip: ConnectionId, message: impl Into<Message>) -> usize {
        self.deliver(self.snapshot(Some(skip)), message.into()).await
    }

    /// Closes every registered connection with [`CloseCode::Away`].
    pub async fn shutdown_all(&self) {
        let conns = self.snapshot(None);
        log::info!("closing {} connections", conns.len());
        join_all(conns.iter().map(|conn| conn.close(CloseCode::Away))).await;
    }

    fn snapshot(&self, skip: Option<ConnectionId>) -> Vec<Arc<Connection>> {
        self.read()
            .iter()
            .filter(|(id, _)| Some(**id) != skip)
            .map(|(_, conn)| conn.clone())
            .collect()
    }

    async fn deliver(&self, conns: Vec<Arc<Connection>>, message: Message) -> usize {
        let sends = conns.iter().map(|conn| {
            let message = message.clone();
            async move {
                match conn.send(message).await {
                    Ok(()) => true,
                    Err(err) => {
                        log::debug!("broadcast to {}: {}", conn.id(), err);
                        false
                    }
                }
            }
        });

        join_all(sends).await.into_iter().filter(|sent| *sent).count()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("connections", &self.len())
            .finish()
    }
}
