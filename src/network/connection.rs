use log::{debug, info};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::ServerMessage;

/// How the server reaches one registered peer.
///
/// `outbound` feeds that connection's writer task, so everything sent
/// through one handle arrives in order.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: Uuid,
    pub addr: SocketAddr,
    pub connected_at: Instant,
    pub outbound: mpsc::UnboundedSender<ServerMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Accepted,
    Taken,
    Full,
}

/// Live username → connection map shared by every connection task.
#[derive(Clone)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<String, ConnectionHandle>>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            max_connections,
        }
    }

    /// Check-and-insert under a single write guard: of any number of
    /// concurrent attempts for one name, exactly one is accepted.
    pub async fn try_register(&self, username: &str, handle: ConnectionHandle) -> Registration {
        let mut connections = self.connections.write().await;

        if connections.len() >= self.max_connections && !connections.contains_key(username) {
            return Registration::Full;
        }

        match connections.entry(username.to_string()) {
            Entry::Occupied(_) => {
                debug!("Username {} already registered", username);
                Registration::Taken
            }
            Entry::Vacant(e) => {
                info!("Registered {} -> {} ({})", username, handle.addr, handle.id);
                e.insert(handle);
                Registration::Accepted
            }
        }
    }

    /// Removes `username` only if it still belongs to connection `id`.
    pub async fn remove(&self, username: &str, id: Uuid) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(username) {
            Some(handle) if handle.id == id => {
                connections.remove(username);
                info!("Unregistered {} ({} remaining)", username, connections.len());
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, username: &str) -> Option<ConnectionHandle> {
        let connections = self.connections.read().await;
        connections.get(username).cloned()
    }

    /// Every registered peer except `username`.
    pub async fn others(&self, username: &str) -> Vec<(String, ConnectionHandle)> {
        let connections = self.connections.read().await;
        connections
            .iter()
            .filter(|(name, _)| name.as_str() != username)
            .map(|(name, handle)| (name.clone(), handle.clone()))
            .collect()
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.connections.read().await.contains_key(username)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn usernames(&self) -> Vec<String> {
        let connections = self.connections.read().await;
        let mut names: Vec<String> = connections.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            id: Uuid::new_v4(),
            addr: "127.0.0.1:40000".parse().unwrap(),
            connected_at: Instant::now(),
            outbound: tx,
        };
        (handle, rx)
    }

    #[tokio::test]
    async fn test_duplicate_rejected_not_overwritten() {
        let registry = ConnectionRegistry::new(16);
        let (first, _rx1) = handle();
        let (second, _rx2) = handle();
        let first_id = first.id;

        assert_eq!(registry.try_register("alice", first).await, Registration::Accepted);
        assert_eq!(registry.try_register("alice", second).await, Registration::Taken);
        assert_eq!(registry.get("alice").await.unwrap().id, first_id);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_usernames_are_case_sensitive() {
        let registry = ConnectionRegistry::new(16);
        let (a, _rx1) = handle();
        let (b, _rx2) = handle();

        assert_eq!(registry.try_register("alice", a).await, Registration::Accepted);
        assert_eq!(registry.try_register("Alice", b).await, Registration::Accepted);
        assert_eq!(registry.usernames().await, vec!["Alice", "alice"]);
    }

    #[tokio::test]
    async fn test_concurrent_registration_single_winner() {
        let registry = ConnectionRegistry::new(64);
        let mut tasks = Vec::new();
        let mut receivers = Vec::new();

        for _ in 0..32 {
            let (h, rx) = handle();
            receivers.push(rx);
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move { registry.try_register("bob", h).await }));
        }

        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap() == Registration::Accepted {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_requires_owning_connection() {
        let registry = ConnectionRegistry::new(16);
        let (h, _rx) = handle();
        let id = h.id;
        registry.try_register("carol", h).await;

        assert!(!registry.remove("carol", Uuid::new_v4()).await);
        assert!(registry.contains("carol").await);
        assert!(registry.remove("carol", id).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_others_excludes_sender_and_cap_applies() {
        let registry = ConnectionRegistry::new(2);
        let (a, _rx1) = handle();
        let (b, _rx2) = handle();
        let (c, _rx3) = handle();

        registry.try_register("alice", a).await;
        registry.try_register("bob", b).await;
        assert_eq!(registry.try_register("carol", c).await, Registration::Full);

        let others: Vec<String> = registry.others("alice").await.into_iter().map(|(n, _)| n).collect();
        assert_eq!(others, vec!["bob"]);
    }
}
