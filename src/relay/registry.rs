//! Registry of open client connections
//!
//! Shared by every connection task; all mutation goes through `add`/`remove`
//! under the registry lock.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use super::{ClientConnection, ConnectionId};

/// Registry invariant violations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Connection already registered: {0}")]
    Duplicate(ConnectionId),

    #[error("Connection not registered: {0}")]
    NotFound(ConnectionId),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Set of currently open connections, each present exactly once
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly opened connection
    pub async fn add(&self, connection: Arc<ClientConnection>) -> RegistryResult<()> {
        let mut connections = self.connections.write().await;
        let id = connection.id();
        if connections.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        connections.insert(id, connection);
        debug!("Registered connection {} ({} open)", id, connections.len());
        Ok(())
    }

    /// Deregister a closed connection
    pub async fn remove(&self, id: ConnectionId) -> RegistryResult<Arc<ClientConnection>> {
        let mut connections = self.connections.write().await;
        let connection = connections.remove(&id).ok_or(RegistryError::NotFound(id))?;
        debug!("Deregistered connection {} ({} open)", id, connections.len());
        Ok(connection)
    }

    /// Number of open connections
    pub async fn size(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.read().await.get(&id).cloned()
    }

    /// Ids of all open connections, in no particular order
    pub async fn ids(&self) -> Vec<ConnectionId> {
        self.connections.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    fn connection() -> Arc<ClientConnection> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(ClientConnection::new("test", tx))
    }

    #[tokio::test]
    async fn test_registry_new() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.size().await, 0);
        assert!(registry.ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_add_n_connections() {
        let registry = ConnectionRegistry::new();
        let mut expected = HashSet::new();
        for _ in 0..25 {
            let conn = connection();
            expected.insert(conn.id());
            registry.add(conn).await.unwrap();
        }

        assert_eq!(registry.size().await, 25);
        let ids: HashSet<_> = registry.ids().await.into_iter().collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_add_duplicate() {
        let registry = ConnectionRegistry::new();
        let conn = connection();
        registry.add(Arc::clone(&conn)).await.unwrap();

        let result = registry.add(Arc::clone(&conn)).await;
        assert!(matches!(result, Err(RegistryError::Duplicate(id)) if id == conn.id()));
        assert_eq!(registry.size().await, 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let registry = ConnectionRegistry::new();
        let conn = connection();
        registry.add(Arc::clone(&conn)).await.unwrap();
        assert!(registry.contains(conn.id()).await);

        let removed = registry.remove(conn.id()).await.unwrap();
        assert_eq!(removed.id(), conn.id());
        assert!(!registry.contains(conn.id()).await);
        assert!(registry.get(conn.id()).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_not_found() {
        let registry = ConnectionRegistry::new();
        let conn = connection();
        let result = registry.remove(conn.id()).await;
        assert!(matches!(result, Err(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_adds() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.add(connection()).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.size().await, 16);
    }
}
