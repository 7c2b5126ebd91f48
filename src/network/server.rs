//! Ethernet server
//!
//! Accepts connections and answers rounds on each of them. A round reads the
//! request header first. Unless the request asked for synchronic mode, the
//! request message and the response then travel concurrently; in synchronic
//! mode the response waits until every request chunk has been received and
//! the message hook has seen them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::task::AbortHandle;

use super::connection::{Connection, ConnectionError, ConnectionId};
use super::listener::{self, ConnectionRegistry, EthernetListener, Listener};
use super::{NetworkConfig, TransferHooks};
use crate::transfer::{Depot, Role, TransferError};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Receives one human-readable line per connection event
pub type EchoFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Round tasks of the live connections
type TaskTable = Arc<StdMutex<HashMap<ConnectionId, AbortHandle>>>;

/// Transfer server
pub struct EthernetServer<D: Depot, H: TransferHooks<D::Item>> {
    config: NetworkConfig,
    listener: Arc<EthernetListener<D, H>>,
    echo: Option<EchoFn>,
    /// Shutdown signal for the accept loop
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Whether the accept loop is running
    running: Arc<RwLock<bool>>,
    /// Round task of each live connection; a task removes itself when done
    tasks: TaskTable,
    local_addr: Option<SocketAddr>,
}

impl<D: Depot, H: TransferHooks<D::Item>> EthernetServer<D, H> {
    pub fn new(config: NetworkConfig, depot: Arc<D>, hooks: Arc<H>) -> Self {
        Self::with_registry(config, listener::registry(), depot, hooks)
    }

    /// Build a server around a registry owned by the caller
    pub fn with_registry(
        config: NetworkConfig,
        registry: ConnectionRegistry<D>,
        depot: Arc<D>,
        hooks: Arc<H>,
    ) -> Self {
        let listener = EthernetListener::new(config.clone(), registry, depot, hooks);
        Self {
            config,
            listener: Arc::new(listener),
            echo: None,
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
            tasks: Arc::new(StdMutex::new(HashMap::new())),
            local_addr: None,
        }
    }

    pub fn with_echo(mut self, echo: EchoFn) -> Self {
        self.echo = Some(echo);
        self
    }

    pub fn listener(&self) -> &Arc<EthernetListener<D, H>> {
        &self.listener
    }

    /// Address the server is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind and start accepting connections
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }
        self.config.transfer.validate()?;

        let bind_addr = self.config.endpoint();
        let socket = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = socket.local_addr()?;
        tracing::info!("Server listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        let listener = self.listener.clone();
        let echo = self.echo.clone();
        let tasks = self.tasks.clone();
        let running = self.running.clone();

        // Spawn the accept loop
        tokio::spawn(async move {
            let serving = listener.clone();
            listener
                .accept_loop(socket, shutdown_rx, move |connection| {
                    let id = connection.id();
                    let serving = serving.clone();
                    let echo = echo.clone();
                    let finished = tasks.clone();

                    // Held across the spawn so the task cannot remove itself first
                    let mut table = tasks.lock().unwrap_or_else(PoisonError::into_inner);
                    let task = tokio::spawn(async move {
                        serve_connection(serving, connection, echo).await;
                        finished
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&id);
                    });
                    table.insert(id, task.abort_handle());
                })
                .await;

            let mut running = running.write().await;
            *running = false;
        });

        Ok(local_addr)
    }

    /// Stop accepting and close every connection
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        let tasks: Vec<AbortHandle> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in tasks {
            task.abort();
        }

        self.listener.clear_clients().await;
        tracing::info!("Server stopped");
        Ok(())
    }

    /// Ids of the connected clients
    pub async fn clients(&self) -> Vec<ConnectionId> {
        self.listener.clients().await
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Connections whose round task is still running
    pub fn active_tasks(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn emit(echo: &Option<EchoFn>, line: &str) {
    if let Some(echo) = echo {
        echo(line);
    }
}

/// Answer rounds on one connection until it closes
async fn serve_connection<D, H>(
    listener: Arc<EthernetListener<D, H>>,
    connection: Arc<Connection<D>>,
    echo: Option<EchoFn>,
) where
    D: Depot,
    H: TransferHooks<D::Item>,
{
    let id = connection.id();
    emit(
        &echo,
        &format!("Accepted {} from {}", id, connection.remote_addr()),
    );

    loop {
        connection.begin_round().await;

        if let Err(e) = run_round(&*listener, &connection).await {
            match e {
                ServerError::Connection(ConnectionError::Closed) => {
                    tracing::debug!("Connection {} closed by peer", id)
                }
                e => tracing::warn!("Round on {} failed: {}", id, e),
            }
            break;
        }

        let (notice, closing) = connection
            .with_transfer(|transfer| {
                (
                    transfer.response_header.notice.clone(),
                    transfer.context.close,
                )
            })
            .await;

        let stats = connection.stats();
        let mut line = format!(
            "Round {} on {}: {} chunks in, {} chunks out",
            stats.rounds, id, stats.chunks_received, stats.chunks_sent
        );
        if let Some(notice) = notice {
            line.push_str(": ");
            line.push_str(&notice);
        }
        emit(&echo, &line);

        // Close is honoured only once the response has gone out
        if closing {
            break;
        }
    }

    if listener.close_client(id).await.is_ok() {
        emit(&echo, &format!("Closed {}", id));
    }
}

/// One server round on an already reset connection
async fn run_round<L, D>(listener: &L, connection: &Connection<D>) -> ServerResult<()>
where
    L: Listener + ?Sized,
    D: Depot,
{
    let id = connection.id();
    listener.receive(id).await?;

    let signals = connection.signals();
    let synchronic = connection
        .with_transfer(|transfer| transfer.context.synchronic)
        .await;
    let pipelined = Role::Server.policy().pipelines(synchronic);

    let request = async {
        if connection.has_message_to_receive().await {
            listener.receive(id).await?;
        }
        Ok::<_, ServerError>(())
    };

    let response = async {
        if !pipelined {
            signals.chunks_received.wait().await;
            // The request's message hook has run once this is set
            signals.message_received.wait().await;
        }
        listener.send(id).await?;
        if connection.has_message_to_send().await {
            listener.send(id).await?;
        }
        Ok::<_, ServerError>(())
    };

    tokio::try_join!(request, response)?;
    Ok(())
}
