//! Connection handling
//!
//! A connection owns one socket, split into its read and write halves, and
//! exactly one transfer. Each phase method performs the socket I/O for that
//! phase, runs the matching transfer operation, invokes the hook, and then
//! sets the phase signal. The transfer lock is never held across socket I/O,
//! so the two halves can run a pipelined round concurrently.

use bytes::Bytes;
use socket2::SockRef;
use std::fmt;
use std::mem::MaybeUninit;
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};

use super::TransferHooks;
use crate::protocol::MarkupKind;
use crate::transfer::{
    Depot, Direction, Inbound, Phase, PhaseSignals, Role, Transfer, TransferContext,
    TransferError, TransferOperation,
};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("{0:?} frame does not fit its receive buffer")]
    Overflow(Phase),

    #[error("Connection closed")]
    Closed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Key of a connection in the server registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket established, no round started yet
    Connecting,
    /// Header phase of a round in progress
    HeaderExchange,
    /// Message chunks in flight
    MessageExchange,
    /// Shutting the socket down
    Closing,
    /// Socket shut down
    Closed,
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub rounds: u64,
    pub headers_sent: u64,
    pub headers_received: u64,
    pub chunks_sent: u64,
    pub chunks_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// One socket and the transfer it carries
pub struct Connection<D: Depot> {
    id: ConnectionId,
    remote_addr: SocketAddr,
    role: Role,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    transfer: Mutex<Transfer<D::Item>>,
    signals: Arc<PhaseSignals>,
    depot: Arc<D>,
    state: StdMutex<ConnectionState>,
    stats: StdMutex<ConnectionStats>,
}

impl<D: Depot> Connection<D> {
    /// Wrap an established stream
    pub fn new(
        stream: TcpStream,
        remote_addr: SocketAddr,
        id: ConnectionId,
        role: Role,
        context: TransferContext,
        depot: Arc<D>,
    ) -> Self {
        let signals = context.signals();
        let (reader, writer) = stream.into_split();

        Self {
            id,
            remote_addr,
            role,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            transfer: Mutex::new(Transfer::new(context)),
            signals,
            depot,
            state: StdMutex::new(ConnectionState::Connecting),
            stats: StdMutex::new(ConnectionStats::default()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn signals(&self) -> Arc<PhaseSignals> {
        self.signals.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats_mut().clone()
    }

    fn stats_mut(&self) -> StdMutexGuard<'_, ConnectionStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the transfer for inspection or preparation
    pub async fn transfer(&self) -> MutexGuard<'_, Transfer<D::Item>> {
        self.transfer.lock().await
    }

    pub async fn with_transfer<R>(&self, f: impl FnOnce(&mut Transfer<D::Item>) -> R) -> R {
        let mut transfer = self.transfer.lock().await;
        f(&mut transfer)
    }

    pub async fn has_message_to_send(&self) -> bool {
        self.transfer.lock().await.context.has_message_to_send
    }

    pub async fn has_message_to_receive(&self) -> bool {
        self.transfer.lock().await.context.has_message_to_receive
    }

    /// Whether a round has asked for this connection to close
    pub async fn is_closing(&self) -> bool {
        self.transfer.lock().await.context.close
    }

    /// Clear the previous round's state before starting another
    pub async fn begin_round(&self) {
        self.transfer.lock().await.reset_round(self.role);
        self.stats_mut().rounds += 1;
        self.set_state(ConnectionState::HeaderExchange);
    }

    /// Send the header, or the message once the header announced one
    pub async fn send<H>(&self, hooks: &H) -> ConnectionResult<()>
    where
        H: TransferHooks<D::Item> + ?Sized,
    {
        if self.has_message_to_send().await {
            self.send_message(hooks).await
        } else {
            self.send_header(hooks).await
        }
    }

    /// Receive the header, or the message once the header announced one
    pub async fn receive<H>(&self, hooks: &H) -> ConnectionResult<()>
    where
        H: TransferHooks<D::Item> + ?Sized,
    {
        if self.has_message_to_receive().await {
            self.receive_message(hooks).await
        } else {
            self.receive_header(hooks).await
        }
    }

    pub async fn send_header<H>(&self, hooks: &H) -> ConnectionResult<()>
    where
        H: TransferHooks<D::Item> + ?Sized,
    {
        let result = self.try_send_header(hooks).await;
        self.settle(result).await
    }

    pub async fn send_message<H>(&self, hooks: &H) -> ConnectionResult<()>
    where
        H: TransferHooks<D::Item> + ?Sized,
    {
        let result = self.try_send_message(hooks).await;
        self.settle(result).await
    }

    pub async fn receive_header<H>(&self, hooks: &H) -> ConnectionResult<()>
    where
        H: TransferHooks<D::Item> + ?Sized,
    {
        let result = self.try_receive_header(hooks).await;
        self.settle(result).await
    }

    pub async fn receive_message<H>(&self, hooks: &H) -> ConnectionResult<()>
    where
        H: TransferHooks<D::Item> + ?Sized,
    {
        let result = self.try_receive_message(hooks).await;
        self.settle(result).await
    }

    async fn try_send_header<H>(&self, hooks: &H) -> ConnectionResult<()>
    where
        H: TransferHooks<D::Item> + ?Sized,
    {
        self.set_state(ConnectionState::HeaderExchange);

        let bytes = {
            let mut transfer = self.transfer.lock().await;
            TransferOperation::new(&mut transfer, &*self.depot, self.role).dispatch(
                Direction::Send,
                Phase::Header,
                None,
            )?;
            transfer.context.take_output()
        };
        self.write(&bytes).await?;

        {
            let mut transfer = self.transfer.lock().await;
            self.stats_mut().headers_sent += 1;
            tracing::debug!(
                "{:?} {} sent header: {} items",
                self.role,
                self.id,
                transfer.outgoing_header_mut(self.role).items_count
            );
            hooks.header_sent(&mut transfer);
        }
        self.signals.header_sent.set();
        Ok(())
    }

    async fn try_send_message<H>(&self, hooks: &H) -> ConnectionResult<()>
    where
        H: TransferHooks<D::Item> + ?Sized,
    {
        self.set_state(ConnectionState::MessageExchange);

        loop {
            let (bytes, markup) = {
                let mut transfer = self.transfer.lock().await;
                if !transfer.context.has_message_to_send {
                    break;
                }
                let markup = TransferOperation::new(&mut transfer, &*self.depot, self.role)
                    .dispatch(Direction::Send, Phase::Message, None)?;
                (transfer.context.take_output(), markup)
            };

            self.write(&bytes).await?;
            self.stats_mut().chunks_sent += 1;
            tracing::trace!("{} sent {} byte chunk ({:?})", self.id, bytes.len(), markup);
        }

        {
            let mut transfer = self.transfer.lock().await;
            hooks.message_sent(&mut transfer);
        }
        self.signals.message_sent.set();
        Ok(())
    }

    async fn try_receive_header<H>(&self, hooks: &H) -> ConnectionResult<()>
    where
        H: TransferHooks<D::Item> + ?Sized,
    {
        self.set_state(ConnectionState::HeaderExchange);
        let (frame, markup) = self.read_frame(Phase::Header).await?;

        {
            let mut transfer = self.transfer.lock().await;
            TransferOperation::new(&mut transfer, &*self.depot, self.role).dispatch(
                Direction::Receive,
                Phase::Header,
                Some(Inbound {
                    frame: &frame,
                    markup,
                }),
            )?;
            self.stats_mut().headers_received += 1;
            tracing::debug!(
                "{:?} {} received header: {} items to receive",
                self.role,
                self.id,
                transfer.context.items_left
            );
            hooks.header_received(&mut transfer);
        }
        self.signals.header_received.set();
        Ok(())
    }

    async fn try_receive_message<H>(&self, hooks: &H) -> ConnectionResult<()>
    where
        H: TransferHooks<D::Item> + ?Sized,
    {
        self.set_state(ConnectionState::MessageExchange);

        while self.has_message_to_receive().await {
            let (frame, markup) = self.read_frame(Phase::Message).await?;

            let mut transfer = self.transfer.lock().await;
            TransferOperation::new(&mut transfer, &*self.depot, self.role).dispatch(
                Direction::Receive,
                Phase::Message,
                Some(Inbound {
                    frame: &frame,
                    markup,
                }),
            )?;
            self.stats_mut().chunks_received += 1;
        }

        {
            let mut transfer = self.transfer.lock().await;
            hooks.message_received(&mut transfer);
        }
        self.signals.message_received.set();
        Ok(())
    }

    /// Read until the scanner reports a terminator for `phase`
    async fn read_frame(&self, phase: Phase) -> ConnectionResult<(Bytes, MarkupKind)> {
        let mut reader = self.reader.lock().await;
        let mut scratch = Vec::new();
        let mut received = 0;

        loop {
            let spare = {
                let mut transfer = self.transfer.lock().await;
                let context = &mut transfer.context;
                context.spare(phase)[..received].copy_from_slice(&scratch[..received]);

                // Bytes left over from an earlier read are scanned before reading more
                let markup = context.read(phase, received)?;
                if markup != MarkupKind::None {
                    let frame = context.take_frame(phase).unwrap_or_default();
                    return Ok((frame, markup));
                }
                context.spare(phase).len()
            };

            if spare == 0 {
                return Err(ConnectionError::Overflow(phase));
            }

            scratch.resize(spare, 0);
            received = reader.read(&mut scratch[..spare]).await?;
            if received == 0 {
                return Err(ConnectionError::Closed);
            }
            self.stats_mut().bytes_received += received as u64;
        }
    }

    async fn write(&self, bytes: &[u8]) -> ConnectionResult<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        self.stats_mut().bytes_sent += bytes.len() as u64;
        Ok(())
    }

    /// Connection faults halt the round and release every signal
    async fn settle(&self, result: ConnectionResult<()>) -> ConnectionResult<()> {
        if let Err(e) = &result {
            match e {
                ConnectionError::Closed => {
                    tracing::debug!("{:?} {} closed by {}", self.role, self.id, self.remote_addr)
                }
                _ => tracing::error!("{:?} {} failed: {}", self.role, self.id, e),
            }
            self.transfer.lock().await.context.halt();
            self.set_state(ConnectionState::Closing);
            self.signals.release();
        }
        result
    }

    /// Non-blocking liveness probe
    ///
    /// A socket that is readable but has zero bytes to give was closed by the
    /// peer.
    pub fn is_connected(&self) -> bool {
        if matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return false;
        }

        // A read in flight owns the socket and will report the close itself
        let Ok(reader) = self.reader.try_lock() else {
            return true;
        };

        let socket = SockRef::from(reader.as_ref());
        let mut probe = [MaybeUninit::<u8>::uninit(); 1];
        match socket.peek(&mut probe) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }

    /// Shut the socket down once the in-flight phase is done
    pub async fn shutdown(&self) {
        self.set_state(ConnectionState::Closing);

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Shutdown of {} ignored: {}", self.id, e);
        }

        self.set_state(ConnectionState::Closed);
        self.signals.release();
        tracing::info!("Connection {} to {} closed", self.id, self.remote_addr);
    }
}

impl<D: Depot> Drop for Connection<D> {
    fn drop(&mut self) {
        let reader = self.reader.get_mut();
        let _ = SockRef::from(reader.as_ref()).shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NoHooks;
    use crate::transfer::{Identity, MemoryDepot, Parcel, TransferConfig, TransferMessage};
    use tokio::net::TcpListener;

    async fn pair() -> (Connection<MemoryDepot>, Connection<MemoryDepot>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();
        let (server, peer) = accepted.unwrap();

        let config = TransferConfig {
            batch_size: 8,
            message_capacity: 64,
            ..Default::default()
        };
        let client = Connection::new(
            client,
            addr,
            ConnectionId(0),
            Role::Client,
            TransferContext::new(Identity::new("client", "Client"), config.clone()),
            Arc::new(MemoryDepot::new()),
        );
        let server = Connection::new(
            server,
            peer,
            ConnectionId(1),
            Role::Server,
            TransferContext::new(Identity::new("server", "Server"), config),
            Arc::new(MemoryDepot::new()),
        );
        (client, server)
    }

    #[tokio::test]
    async fn test_header_and_message_over_socket() {
        let (client, server) = pair().await;
        client
            .with_transfer(|t| {
                t.request_message =
                    TransferMessage::new(vec![Parcel::new("doc", b"twenty bytes of text".to_vec())])
            })
            .await;

        client.send(&NoHooks).await.unwrap();
        assert!(client.has_message_to_send().await);
        client.send(&NoHooks).await.unwrap();
        assert!(!client.has_message_to_send().await);

        server.receive(&NoHooks).await.unwrap();
        assert!(server.signals().header_received.is_set());
        assert!(server.has_message_to_receive().await);
        server.receive(&NoHooks).await.unwrap();
        assert!(server.signals().chunks_received.is_set());

        let transfer = server.transfer().await;
        assert_eq!(transfer.request_message.data[0].body, b"twenty bytes of text");
        assert_eq!(transfer.request_message.input_chunks, vec![3]);
        drop(transfer);

        assert_eq!(client.stats().chunks_sent, 3);
        assert_eq!(server.stats().chunks_received, 3);
    }

    #[tokio::test]
    async fn test_burst_larger_than_message_buffer() {
        let (client, server) = pair().await;
        let mut body = vec![0x04u8; 40];
        body.extend(0..150u8);
        body.push(0x17);
        let expected = body.clone();
        client
            .with_transfer(|t| {
                t.request_message = TransferMessage::new(vec![
                    Parcel::new("mixed", body),
                    Parcel::new("tail", b"tail\x04".to_vec()),
                ])
            })
            .await;

        // Every frame is on the wire before the server reads anything
        client.send(&NoHooks).await.unwrap();
        client.send(&NoHooks).await.unwrap();
        assert!(client.stats().bytes_sent > 64 * 4);

        server.receive(&NoHooks).await.unwrap();
        server.receive(&NoHooks).await.unwrap();

        let transfer = server.transfer().await;
        assert_eq!(transfer.request_message.input_chunks, vec![24, 1]);
        assert_eq!(transfer.request_message.data[0].body, expected);
        assert_eq!(transfer.request_message.data[1].body, b"tail\x04");
        assert_eq!(transfer.context.errors, 0);
        assert_eq!(transfer.context.pending(), 0);
        drop(transfer);

        assert_eq!(server.stats().chunks_received, 25);
    }

    #[tokio::test]
    async fn test_peer_close_is_detected() {
        let (client, server) = pair().await;
        assert!(client.is_connected());

        server.shutdown().await;
        drop(server);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(!client.is_connected());
        let result = client.receive(&NoHooks).await;
        assert!(matches!(result, Err(ConnectionError::Closed)));
        assert!(client.signals().header_received.is_set());
        assert!(client.is_closing().await);
    }
}
