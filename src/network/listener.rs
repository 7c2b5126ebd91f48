//! Listener - accepts sockets and keys them by connection id
//!
//! The registry is owned by whoever builds the listener and shared with it,
//! so the server and the accept loop see the same map.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};

use super::connection::{Connection, ConnectionId};
use super::server::{ServerError, ServerResult};
use super::{NetworkConfig, TransferHooks};
use crate::transfer::{Depot, Role, TransferContext};

/// Live server-side connections by id
pub type ConnectionRegistry<D> = Arc<RwLock<HashMap<ConnectionId, Arc<Connection<D>>>>>;

pub fn registry<D: Depot>() -> ConnectionRegistry<D> {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Per-connection operations a server performs by id
#[async_trait]
pub trait Listener: Send + Sync {
    /// Send the connection's next phase
    async fn send(&self, id: ConnectionId) -> ServerResult<()>;

    /// Receive the connection's next phase
    async fn receive(&self, id: ConnectionId) -> ServerResult<()>;

    /// Remove one connection and shut its socket down
    async fn close_client(&self, id: ConnectionId) -> ServerResult<()>;

    /// Remove and shut down every connection
    async fn clear_clients(&self);
}

pub struct EthernetListener<D: Depot, H: TransferHooks<D::Item>> {
    config: NetworkConfig,
    registry: ConnectionRegistry<D>,
    depot: Arc<D>,
    hooks: Arc<H>,
    next_id: AtomicU64,
}

impl<D: Depot, H: TransferHooks<D::Item>> EthernetListener<D, H> {
    pub fn new(
        config: NetworkConfig,
        registry: ConnectionRegistry<D>,
        depot: Arc<D>,
        hooks: Arc<H>,
    ) -> Self {
        Self {
            config,
            registry,
            depot,
            hooks,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry<D> {
        &self.registry
    }

    pub fn hooks(&self) -> &Arc<H> {
        &self.hooks
    }

    pub async fn connection(&self, id: ConnectionId) -> ServerResult<Arc<Connection<D>>> {
        self.registry
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ServerError::UnknownConnection(id))
    }

    /// Ids of every registered connection, oldest first
    pub async fn clients(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.registry.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Wrap an accepted socket and add it to the registry
    pub async fn register(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> ServerResult<Arc<Connection<D>>> {
        stream.set_nodelay(self.config.nodelay)?;

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let context = TransferContext::new(self.config.identity.clone(), self.config.transfer.clone());
        let connection = Arc::new(Connection::new(
            stream,
            addr,
            id,
            Role::Server,
            context,
            self.depot.clone(),
        ));
        connection
            .with_transfer(|transfer| self.hooks.connected(transfer))
            .await;

        self.registry.write().await.insert(id, connection.clone());
        tracing::info!("Registered connection {} from {}", id, addr);
        Ok(connection)
    }

    /// Accept until a shutdown message arrives, handing each new connection to `on_accept`
    pub async fn accept_loop<F>(
        &self,
        listener: TcpListener,
        mut shutdown_rx: mpsc::Receiver<()>,
        on_accept: F,
    ) where
        F: Fn(Arc<Connection<D>>) + Send,
    {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            tracing::info!("New connection from {}", addr);
                            match self.register(stream, addr).await {
                                Ok(connection) => on_accept(connection),
                                Err(e) => tracing::error!("Failed to register {}: {}", addr, e),
                            }
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Listener shutdown requested");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl<D: Depot, H: TransferHooks<D::Item>> Listener for EthernetListener<D, H> {
    async fn send(&self, id: ConnectionId) -> ServerResult<()> {
        let connection = self.connection(id).await?;
        connection.send(&*self.hooks).await?;
        Ok(())
    }

    async fn receive(&self, id: ConnectionId) -> ServerResult<()> {
        let connection = self.connection(id).await?;
        connection.receive(&*self.hooks).await?;
        Ok(())
    }

    async fn close_client(&self, id: ConnectionId) -> ServerResult<()> {
        let removed = self.registry.write().await.remove(&id);
        match removed {
            Some(connection) => {
                connection.shutdown().await;
                Ok(())
            }
            None => Err(ServerError::UnknownConnection(id)),
        }
    }

    async fn clear_clients(&self) {
        let connections: Vec<_> = self
            .registry
            .write()
            .await
            .drain()
            .map(|(_, connection)| connection)
            .collect();

        for connection in connections {
            connection.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NoHooks;
    use crate::transfer::MemoryDepot;

    #[tokio::test]
    async fn test_register_and_close() {
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let listener = EthernetListener::new(
            NetworkConfig::default(),
            registry(),
            Arc::new(MemoryDepot::new()),
            Arc::new(NoHooks),
        );

        let (client, accepted) = tokio::join!(TcpStream::connect(addr), socket.accept());
        let _client = client.unwrap();
        let (stream, peer) = accepted.unwrap();

        let connection = listener.register(stream, peer).await.unwrap();
        assert_eq!(connection.id(), ConnectionId(1));
        assert_eq!(connection.role(), Role::Server);
        assert_eq!(listener.clients().await, vec![ConnectionId(1)]);

        listener.close_client(ConnectionId(1)).await.unwrap();
        assert!(listener.clients().await.is_empty());
        assert!(matches!(
            listener.close_client(ConnectionId(1)).await,
            Err(ServerError::UnknownConnection(_))
        ));
        assert!(matches!(
            listener.send(ConnectionId(7)).await,
            Err(ServerError::UnknownConnection(_))
        ));
    }
}
