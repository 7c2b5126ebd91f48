//! Ethernet client
//!
//! Connects to a transfer server and drives rounds over one connection. The
//! socket is established by a background task; the caller waits on the
//! `connected` signal, either from async code or from a plain thread.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::RwLock;

use super::connection::{Connection, ConnectionError, ConnectionId};
use super::{NetworkConfig, TransferHooks};
use crate::transfer::{Depot, Role, Signal, TransferContext, TransferError};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

type ConnectOutcome = ClientResult<(TcpStream, SocketAddr)>;
type ConnectSlot = Arc<StdMutex<Option<ConnectOutcome>>>;

/// Transfer client
pub struct EthernetClient<D: Depot, H: TransferHooks<D::Item>> {
    config: NetworkConfig,
    depot: Arc<D>,
    hooks: Arc<H>,
    state: Arc<RwLock<ClientState>>,
    connection: Arc<RwLock<Option<Arc<Connection<D>>>>>,
    /// Set once the background connect attempt has finished
    connected: Arc<Signal>,
}

impl<D: Depot, H: TransferHooks<D::Item>> EthernetClient<D, H> {
    pub fn new(config: NetworkConfig, depot: Arc<D>, hooks: Arc<H>) -> Self {
        Self {
            config,
            depot,
            hooks,
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            connection: Arc::new(RwLock::new(None)),
            connected: Arc::new(Signal::new()),
        }
    }

    /// Point the client at another server
    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.host = host.into();
        self.config.port = port;
        self
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn depot(&self) -> &Arc<D> {
        &self.depot
    }

    pub fn hooks(&self) -> &Arc<H> {
        &self.hooks
    }

    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    /// Connect and wait for the attempt to finish
    pub async fn connect(&self) -> ClientResult<Arc<Connection<D>>> {
        self.begin_connect().await?;
        let slot = self.spawn_connect(&Handle::current());
        self.connected.wait().await;
        self.finish_connect(slot).await
    }

    /// Connect from a thread outside the runtime, blocking until done
    pub fn connect_blocking(&self, runtime: &Handle) -> ClientResult<Arc<Connection<D>>> {
        runtime.block_on(self.begin_connect())?;
        let slot = self.spawn_connect(runtime);
        self.connected.wait_blocking();
        runtime.block_on(self.finish_connect(slot))
    }

    async fn begin_connect(&self) -> ClientResult<()> {
        self.config.transfer.validate()?;

        let mut state = self.state.write().await;
        if *state != ClientState::Disconnected {
            return Err(ClientError::AlreadyConnected);
        }
        *state = ClientState::Connecting;
        Ok(())
    }

    fn spawn_connect(&self, runtime: &Handle) -> ConnectSlot {
        let slot: ConnectSlot = Arc::new(StdMutex::new(None));
        self.connected.reset();

        let host = self.config.host.clone();
        let port = self.config.port;
        let addr = self.config.endpoint();
        let connected = self.connected.clone();
        let result_slot = slot.clone();

        tracing::info!("Connecting to {}", addr);

        runtime.spawn(async move {
            let attempt = async {
                let server_addr = super::resolve_host(&host, port).await?;
                let stream = TcpStream::connect(server_addr).await?;
                Ok::<_, std::io::Error>((stream, server_addr))
            };

            // Unbounded: the attempt ends when the OS gives up on the socket
            let outcome = attempt
                .await
                .map_err(|source| ClientError::Connect { addr, source });

            *result_slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
            connected.set();
        });

        slot
    }

    async fn finish_connect(&self, slot: ConnectSlot) -> ClientResult<Arc<Connection<D>>> {
        let outcome = slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or(Err(ClientError::NotConnected));

        let (stream, server_addr) = match outcome {
            Ok(pair) => pair,
            Err(e) => {
                *self.state.write().await = ClientState::Disconnected;
                return Err(e);
            }
        };
        stream.set_nodelay(self.config.nodelay)?;

        let context = TransferContext::new(self.config.identity.clone(), self.config.transfer.clone());
        let connection = Arc::new(Connection::new(
            stream,
            server_addr,
            ConnectionId(0),
            Role::Client,
            context,
            self.depot.clone(),
        ));
        connection
            .with_transfer(|transfer| self.hooks.connected(transfer))
            .await;

        *self.connection.write().await = Some(connection.clone());
        *self.state.write().await = ClientState::Connected;

        tracing::info!("Connected to {}", server_addr);
        Ok(connection)
    }

    /// The live connection
    pub async fn connection(&self) -> ClientResult<Arc<Connection<D>>> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    /// Send the next phase: the header, then the message if one was announced
    pub async fn send(&self) -> ClientResult<()> {
        let connection = self.connection().await?;
        connection.send(&*self.hooks).await?;
        Ok(())
    }

    /// Receive the next phase: the header, then the message if one was announced
    pub async fn receive(&self) -> ClientResult<()> {
        let connection = self.connection().await?;
        connection.receive(&*self.hooks).await?;
        Ok(())
    }

    /// Run one full round: send the request, then receive the response
    ///
    /// The connection is closed afterwards when either side asked for it.
    pub async fn round(&self) -> ClientResult<Arc<Connection<D>>> {
        let connection = self.connection().await?;
        let hooks = &*self.hooks;

        connection.begin_round().await;
        connection.send_header(hooks).await?;
        if connection.has_message_to_send().await {
            connection.send_message(hooks).await?;
        }

        connection.receive_header(hooks).await?;
        if connection.has_message_to_receive().await {
            connection.receive_message(hooks).await?;
        }

        if connection.is_closing().await {
            tracing::debug!("Round asked to close the connection to {}", connection.remote_addr());
            self.close().await;
        }
        Ok(connection)
    }

    /// Non-blocking liveness check of the underlying socket
    pub async fn is_connected(&self) -> bool {
        match self.connection.read().await.as_ref() {
            Some(connection) => connection.is_connected(),
            None => false,
        }
    }

    /// Shut the connection down; a no-op when not connected
    pub async fn close(&self) {
        let connection = self.connection.write().await.take();
        *self.state.write().await = ClientState::Disconnected;

        if let Some(connection) = connection {
            connection.shutdown().await;
            tracing::info!("Disconnected from {}", connection.remote_addr());
        }
    }
}
