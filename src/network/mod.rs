//! Network module - Drives transfer rounds over TCP
//!
//! Provides:
//! - Connections owning one socket and one transfer context each
//! - A client that connects, sends, and receives rounds
//! - A listener and server that accept connections and answer rounds
//! - Hooks invoked once per completed phase

mod client;
mod connection;
mod hooks;
mod listener;
mod server;

pub use client::*;
pub use connection::*;
pub use hooks::*;
pub use listener::*;
pub use server::*;

use std::net::SocketAddr;

use crate::transfer::{Identity, TransferConfig};

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Host to connect to, or to bind on
    pub host: String,
    /// Port to listen on or connect to
    pub port: u16,
    /// Disable Nagle's algorithm on every socket
    pub nodelay: bool,
    /// Identity announced in outgoing headers
    pub identity: Identity,
    /// Buffer sizes, batching, and framing
    pub transfer: TransferConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: crate::protocol::DEFAULT_PORT,
            nodelay: true,
            identity: Identity::generate("ethernet-transfer"),
            transfer: TransferConfig::default(),
        }
    }
}

impl NetworkConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_transfer(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn synchronic(mut self, synchronic: bool) -> Self {
        self.transfer.synchronic = synchronic;
        self
    }

    /// `host:port` as given, without resolving
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
