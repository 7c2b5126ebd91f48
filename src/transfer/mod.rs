//! Transfer module - Rounds, their payloads, and the state that drives them
//!
//! Provides:
//! - The transferable-object and depot contracts payloads must satisfy
//! - Transfer headers and messages, grouped into one round
//! - The per-connection transfer context and its wait signals
//! - The operation table that advances a round one phase at a time

mod context;
mod operation;
mod parcel;
mod signal;

pub use context::*;
pub use operation::*;
pub use parcel::*;
pub use signal::*;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{
    escaped_len, CodecError, HeaderEncoding, DEFAULT_RUN_LENGTH, PROTOCOL_VERSION,
};

/// Transfer errors
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid transferable: {0}")]
    InvalidContract(String),

    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("No merge target for {0}")]
    MissingTarget(String),

    #[error("Unexpected chunk for item {0}")]
    UnexpectedChunk(usize),

    #[error("Deserialize error: {0}")]
    Deserialize(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type TransferResult<T> = Result<T, TransferError>;

/// Who is on the other end of a round
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// A fresh random id with the given display name
    pub fn generate(name: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), name)
    }
}

/// Header-side description of one transferable item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    pub key: String,
    /// Body size in bytes
    pub size: u64,
    /// Message chunks the body occupies
    pub chunks: u32,
}

impl ItemDescriptor {
    /// Fails when the chunk count does not fit the header's counters
    pub fn new(key: impl Into<String>, size: usize, batch_size: usize) -> TransferResult<Self> {
        let key = key.into();
        let batch_size = batch_size.max(1);
        let chunks = u32::try_from(size.div_ceil(batch_size).max(1)).map_err(|_| {
            TransferError::InvalidContract(format!(
                "{} needs more than {} chunks of {} bytes",
                key,
                u32::MAX,
                batch_size
            ))
        })?;
        let size = u64::try_from(size)
            .map_err(|_| TransferError::InvalidContract(format!("{} is too large", key)))?;
        Ok(Self { key, size, chunks })
    }
}

/// Result of serializing one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serialized {
    /// Bytes were written; the next chunk starts at this offset
    Next(usize),
    /// Nothing left to write at the requested offset
    Exhausted,
}

/// Contract every payload item must satisfy to travel in a round
pub trait Transferable: Send + Sync + 'static {
    /// Key and counts announced in the header
    fn descriptor(&self, batch_size: usize) -> TransferResult<ItemDescriptor>;

    /// Append at most `batch_size` body bytes starting at `offset`
    fn serialize(&self, buffer: &mut BytesMut, offset: usize, batch_size: usize) -> Serialized;

    /// Fold one received chunk into this item
    fn deserialize(&mut self, chunk: &[u8]) -> TransferResult<()>;
}

/// Verdict of a registration handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Accepted(String),
    Rejected(String),
}

/// Local store owning the merge targets incoming rounds land in
pub trait Depot: Send + Sync + 'static {
    type Item: Transferable;

    /// Whether a merge target exists for this peer
    fn contains(&self, identity: &Identity) -> bool;

    /// Lightweight handshake for a peer without a merge target
    fn register(&self, identity: &Identity) -> Registration;

    /// Locate or create the item an announced descriptor is received into
    fn locate(&self, identity: &Identity, descriptor: &ItemDescriptor)
        -> TransferResult<Self::Item>;

    /// Merge a fully received item into its target
    fn merge(&self, identity: &Identity, item: &Self::Item) -> TransferResult<()>;
}

/// Tunables of a transfer context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Receive buffer size for the header phase
    #[serde(default = "default_header_capacity")]
    pub header_capacity: usize,
    /// Receive buffer size for one message chunk
    #[serde(default = "default_message_capacity")]
    pub message_capacity: usize,
    /// Body bytes per message chunk
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Identical markup bytes that make a terminator
    #[serde(default = "default_run_length")]
    pub run_length: usize,
    /// Ask the peer for strict request/response alternation
    #[serde(default)]
    pub synchronic: bool,
    #[serde(default)]
    pub encoding: HeaderEncoding,
}

fn default_header_capacity() -> usize {
    64 * 1024
}

fn default_message_capacity() -> usize {
    default_batch_size() + default_batch_size() / 4
}

fn default_batch_size() -> usize {
    64 * 1024
}

fn default_run_length() -> usize {
    DEFAULT_RUN_LENGTH
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            header_capacity: default_header_capacity(),
            message_capacity: default_message_capacity(),
            batch_size: default_batch_size(),
            run_length: default_run_length(),
            synchronic: false,
            encoding: HeaderEncoding::default(),
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> TransferResult<()> {
        if self.run_length < 2 {
            return Err(TransferError::Config("run_length must be at least 2".into()));
        }
        if self.batch_size == 0 {
            return Err(TransferError::Config("batch_size must be positive".into()));
        }
        // A fully escaped chunk plus its terminator has to fit
        let chunk_frame = escaped_len(self.batch_size, self.run_length) + self.run_length;
        if chunk_frame > self.message_capacity {
            return Err(TransferError::Config(format!(
                "batch_size {} needs up to {} bytes per chunk, message_capacity is {}",
                self.batch_size, chunk_frame, self.message_capacity
            )));
        }
        if self.header_capacity <= self.run_length {
            return Err(TransferError::Config(
                "header_capacity must exceed run_length".into(),
            ));
        }
        Ok(())
    }
}

/// Header phase of one direction of a round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHeader {
    pub version: u32,
    pub identity: Identity,
    pub data: Vec<ItemDescriptor>,
    pub items_count: u32,
    /// Message chunks announced across all items
    pub objects_count: u64,
    pub synchronic: bool,
    pub denied: bool,
    pub close: bool,
    pub errors: u32,
    pub notice: Option<String>,
}

impl Default for TransferHeader {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            identity: Identity::default(),
            data: Vec::new(),
            items_count: 0,
            objects_count: 0,
            synchronic: false,
            denied: false,
            close: false,
            errors: 0,
            notice: None,
        }
    }
}

impl TransferHeader {
    pub fn set_data(&mut self, data: Vec<ItemDescriptor>) {
        self.items_count = data.len() as u32;
        self.objects_count = data.iter().map(|item| u64::from(item.chunks)).sum();
        self.data = data;
    }

    /// Add a line to the notice
    pub fn append_notice(&mut self, line: impl AsRef<str>) {
        match &mut self.notice {
            Some(notice) => {
                notice.push('\n');
                notice.push_str(line.as_ref());
            }
            None => self.notice = Some(line.as_ref().to_string()),
        }
    }

    /// Check the announced items honour the transferable contract
    pub fn validate(&self) -> TransferResult<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(TransferError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: self.version,
            });
        }
        if self.items_count as usize != self.data.len() {
            return Err(TransferError::InvalidContract(format!(
                "items_count {} does not match {} descriptors",
                self.items_count,
                self.data.len()
            )));
        }
        for item in &self.data {
            if item.key.is_empty() {
                return Err(TransferError::InvalidContract("item without key".into()));
            }
            if item.chunks == 0 {
                return Err(TransferError::InvalidContract(format!(
                    "item {} announces no chunks",
                    item.key
                )));
            }
        }
        Ok(())
    }
}

/// Message phase of one direction of a round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMessage<T> {
    pub data: Vec<T>,
    pub items_count: usize,
    pub objects_count: usize,
    /// Chunks consumed or produced for the active item
    pub current_chunk: usize,
    /// Declared chunk count per received item
    pub input_chunks: Vec<u32>,
    /// Declared chunk count per sent item
    pub output_chunks: Vec<u32>,
}

impl<T> Default for TransferMessage<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            items_count: 0,
            objects_count: 0,
            current_chunk: 0,
            input_chunks: Vec::new(),
            output_chunks: Vec::new(),
        }
    }
}

impl<T> TransferMessage<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self {
            items_count: data.len(),
            data,
            ..Default::default()
        }
    }

    pub fn set_data(&mut self, data: Vec<T>) {
        self.items_count = data.len();
        self.data = data;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// One round: request and response headers and messages around one context
#[derive(Debug)]
pub struct Transfer<T> {
    pub context: TransferContext,
    pub request_header: TransferHeader,
    pub response_header: TransferHeader,
    pub request_message: TransferMessage<T>,
    pub response_message: TransferMessage<T>,
}

/// Role-oriented view of a round
pub(crate) struct Parts<'a, T> {
    pub context: &'a mut TransferContext,
    pub incoming_header: &'a mut TransferHeader,
    pub incoming: &'a mut TransferMessage<T>,
    pub outgoing_header: &'a mut TransferHeader,
    pub outgoing: &'a mut TransferMessage<T>,
}

impl<T> Transfer<T> {
    pub fn new(context: TransferContext) -> Self {
        Self {
            context,
            request_header: TransferHeader::default(),
            response_header: TransferHeader::default(),
            request_message: TransferMessage::default(),
            response_message: TransferMessage::default(),
        }
    }

    /// The message this role sends
    pub fn outgoing_mut(&mut self, role: Role) -> &mut TransferMessage<T> {
        match role {
            Role::Client => &mut self.request_message,
            Role::Server => &mut self.response_message,
        }
    }

    /// The message this role receives
    pub fn incoming(&self, role: Role) -> &TransferMessage<T> {
        match role {
            Role::Client => &self.response_message,
            Role::Server => &self.request_message,
        }
    }

    /// The header this role sends
    pub fn outgoing_header_mut(&mut self, role: Role) -> &mut TransferHeader {
        match role {
            Role::Client => &mut self.request_header,
            Role::Server => &mut self.response_header,
        }
    }

    pub(crate) fn parts(&mut self, role: Role) -> Parts<'_, T> {
        let Transfer {
            context,
            request_header,
            response_header,
            request_message,
            response_message,
        } = self;

        match role {
            Role::Client => Parts {
                context,
                incoming_header: response_header,
                incoming: response_message,
                outgoing_header: request_header,
                outgoing: request_message,
            },
            Role::Server => Parts {
                context,
                incoming_header: request_header,
                incoming: request_message,
                outgoing_header: response_header,
                outgoing: response_message,
            },
        }
    }

    /// Prepare for the next round on a kept-alive connection
    ///
    /// The client keeps its prepared request; the server rebuilds its response
    /// from the next request, so it starts from nothing.
    pub fn reset_round(&mut self, role: Role) {
        self.context.reset_round();
        self.request_header = TransferHeader::default();
        self.response_header = TransferHeader::default();

        let parts = self.parts(role);
        parts.incoming.clear();
        if role == Role::Server {
            parts.outgoing.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_chunks() {
        assert_eq!(ItemDescriptor::new("a", 0, 8).unwrap().chunks, 1);
        assert_eq!(ItemDescriptor::new("a", 8, 8).unwrap().chunks, 1);
        assert_eq!(ItemDescriptor::new("a", 9, 8).unwrap().chunks, 2);
        assert_eq!(ItemDescriptor::new("a", 64, 8).unwrap().chunks, 8);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_descriptor_rejects_chunk_overflow() {
        let size = u32::MAX as usize + 1;
        assert!(matches!(
            ItemDescriptor::new("huge", size, 1),
            Err(TransferError::InvalidContract(_))
        ));
        assert_eq!(
            ItemDescriptor::new("huge", size, 2).unwrap().chunks,
            u32::MAX / 2 + 1
        );
    }

    #[test]
    fn test_header_roundtrip_keeps_items_count() {
        let mut header = TransferHeader::default();
        header.identity = Identity::new("client-1", "Client");
        header.set_data(vec![
            ItemDescriptor::new("one", 10, 4).unwrap(),
            ItemDescriptor::new("two", 3, 4).unwrap(),
        ]);
        header.append_notice("hello");

        for encoding in [HeaderEncoding::Bincode, HeaderEncoding::Json] {
            let bytes = encoding.encode(&header).unwrap();
            let decoded: TransferHeader = encoding.decode(&bytes).unwrap();
            assert_eq!(decoded.items_count, 2);
            assert_eq!(decoded.objects_count, 4);
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn test_header_validation() {
        let mut header = TransferHeader::default();
        header.set_data(vec![ItemDescriptor::new("ok", 1, 4).unwrap()]);
        assert!(header.validate().is_ok());

        header.items_count = 5;
        assert!(matches!(
            header.validate(),
            Err(TransferError::InvalidContract(_))
        ));

        header.set_data(vec![ItemDescriptor::new("", 1, 4).unwrap()]);
        assert!(header.validate().is_err());

        header.set_data(Vec::new());
        header.version = PROTOCOL_VERSION + 1;
        assert!(matches!(
            header.validate(),
            Err(TransferError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_notice_accumulates() {
        let mut header = TransferHeader::default();
        header.append_notice("first");
        header.append_notice("second");
        assert_eq!(header.notice.as_deref(), Some("first\nsecond"));
    }

    #[test]
    fn test_config_validation() {
        assert!(TransferConfig::default().validate().is_ok());

        let config = TransferConfig {
            batch_size: 1024,
            message_capacity: 1030,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        // Room for the chunk and terminator, not for escape bytes
        let config = TransferConfig {
            batch_size: 64,
            message_capacity: 80,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TransferConfig {
            run_length: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
