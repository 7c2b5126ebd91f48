//! Transfer operation - one phase transition of a round
//!
//! Every transition is a cell of (role, direction, phase). The role picks
//! which header and message of the round are incoming or outgoing and which
//! policy applies; the four (direction, phase) cells are shared.
//!
//! Protocol faults while receiving never escape this layer. They halt the
//! round, bump the error counter, and are written into the outgoing header's
//! notice so the peer still gets a response.

use bytes::BytesMut;

use super::{
    Depot, Registration, Serialized, Transfer, TransferContext, TransferError, TransferHeader,
    TransferResult, Transferable,
};
use crate::protocol::MarkupKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Header,
    Message,
}

/// Where a role differs from its counterpart
pub trait RolePolicy: Send + Sync {
    fn role(&self) -> Role;

    /// Refuse an incoming header outright
    fn refusal(&self, header: &TransferHeader) -> Option<String>;

    /// Take the peer's synchronic flag as this connection's mode
    fn adopts_synchronic(&self) -> bool;

    /// Whether the reply may go out before the incoming message is complete
    fn pipelines(&self, synchronic: bool) -> bool;
}

/// Sends first, honours the server's verdict
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientPolicy;

impl RolePolicy for ClientPolicy {
    fn role(&self) -> Role {
        Role::Client
    }

    fn refusal(&self, header: &TransferHeader) -> Option<String> {
        header.denied.then(|| {
            header
                .notice
                .clone()
                .unwrap_or_else(|| "Registration denied by server".to_string())
        })
    }

    fn adopts_synchronic(&self) -> bool {
        false
    }

    fn pipelines(&self, _synchronic: bool) -> bool {
        false
    }
}

/// Replies to requests, pipelined unless the request asks for alternation
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerPolicy;

impl RolePolicy for ServerPolicy {
    fn role(&self) -> Role {
        Role::Server
    }

    fn refusal(&self, _header: &TransferHeader) -> Option<String> {
        None
    }

    fn adopts_synchronic(&self) -> bool {
        true
    }

    fn pipelines(&self, synchronic: bool) -> bool {
        !synchronic
    }
}

static CLIENT_POLICY: ClientPolicy = ClientPolicy;
static SERVER_POLICY: ServerPolicy = ServerPolicy;

impl Role {
    pub fn policy(self) -> &'static dyn RolePolicy {
        match self {
            Role::Client => &CLIENT_POLICY,
            Role::Server => &SERVER_POLICY,
        }
    }
}

/// Data handed to a receive transition
#[derive(Debug, Clone, Copy)]
pub struct Inbound<'a> {
    pub frame: &'a [u8],
    pub markup: MarkupKind,
}

/// Runs one transition against a round
pub struct TransferOperation<'a, D: Depot> {
    transfer: &'a mut Transfer<D::Item>,
    depot: &'a D,
    role: Role,
}

impl<'a, D: Depot> TransferOperation<'a, D> {
    pub fn new(transfer: &'a mut Transfer<D::Item>, depot: &'a D, role: Role) -> Self {
        Self {
            transfer,
            depot,
            role,
        }
    }

    /// Perform the transition for (direction, phase)
    ///
    /// Receive cells require `inbound`. Send cells return the markup the
    /// written frame was closed with.
    pub fn dispatch(
        &mut self,
        direction: Direction,
        phase: Phase,
        inbound: Option<Inbound<'_>>,
    ) -> TransferResult<MarkupKind> {
        match (direction, phase) {
            (Direction::Receive, phase) => {
                let inbound = inbound.ok_or_else(|| {
                    TransferError::InvalidContract(format!("{:?} receive without data", phase))
                })?;
                match phase {
                    Phase::Header => self.header_receive(inbound.frame),
                    Phase::Message => self.message_receive(inbound.frame, inbound.markup),
                }
                Ok(inbound.markup)
            }
            (Direction::Send, Phase::Header) => {
                self.header_send()?;
                Ok(MarkupKind::End)
            }
            (Direction::Send, Phase::Message) => self.message_send(),
        }
    }

    /// Decode the peer's header and decide whether a message phase follows
    pub fn header_receive(&mut self, frame: &[u8]) {
        if let Err(e) = self.try_header_receive(frame) {
            self.fault(e);
        }
    }

    fn try_header_receive(&mut self, frame: &[u8]) -> TransferResult<()> {
        let policy = self.role.policy();
        let depot = self.depot;
        let parts = self.transfer.parts(self.role);
        let context = parts.context;

        let header: TransferHeader = context.encoding().decode(frame)?;
        header.validate()?;

        let identity = header.identity.clone();
        context.peer = Some(identity.clone());
        if policy.adopts_synchronic() {
            context.synchronic = header.synchronic;
        }
        if header.close {
            context.close = true;
        }

        let items_count = header.items_count as usize;
        let declared: Vec<u32> = header.data.iter().map(|item| item.chunks).collect();
        let descriptors = header.data.clone();
        *parts.incoming_header = header;

        if let Some(reason) = policy.refusal(&*parts.incoming_header) {
            deny(context, parts.outgoing_header, &reason);
            return Ok(());
        }

        if !depot.contains(&identity) {
            match depot.register(&identity) {
                Registration::Accepted(notice) => {
                    tracing::debug!("Registered peer {} ({})", identity.name, identity.id);
                    parts.outgoing_header.append_notice(notice);
                }
                Registration::Rejected(reason) => {
                    deny(context, parts.outgoing_header, &reason);
                    return Ok(());
                }
            }
            if !depot.contains(&identity) {
                return Err(TransferError::MissingTarget(identity.id));
            }
        }
        context.denied = false;

        let items = descriptors
            .iter()
            .map(|descriptor| depot.locate(&identity, descriptor))
            .collect::<TransferResult<Vec<_>>>()?;

        parts.incoming.set_data(items);
        parts.incoming.input_chunks = declared;
        parts.incoming.objects_count = parts.incoming.input_chunks.iter().map(|&c| c as usize).sum();
        parts.incoming.current_chunk = 0;

        context.items_left = items_count;
        context.input_id = 0;
        context.input_chunk = 0;

        let signals = context.signals();
        if items_count == 0 || context.close {
            context.has_message_to_receive = false;
            signals.message_received.set();
            signals.chunks_received.set();
        } else {
            context.has_message_to_receive = true;
        }
        Ok(())
    }

    /// Describe the outgoing items and encode the header into the output buffer
    pub fn header_send(&mut self) -> TransferResult<()> {
        let parts = self.transfer.parts(self.role);
        let context = parts.context;
        let batch_size = context.batch_size();

        let descriptors = if context.close {
            Vec::new()
        } else {
            parts
                .outgoing
                .data
                .iter()
                .map(|item| item.descriptor(batch_size))
                .collect::<TransferResult<Vec<_>>>()?
        };

        parts.outgoing.output_chunks = descriptors.iter().map(|item| item.chunks).collect();
        parts.outgoing.items_count = descriptors.len();
        parts.outgoing.objects_count = parts.outgoing.output_chunks.iter().map(|&c| c as usize).sum();
        parts.outgoing.current_chunk = 0;

        let header = parts.outgoing_header;
        header.set_data(descriptors);
        header.identity = context.identity.clone();
        header.synchronic = context.synchronic;
        header.denied = context.denied;
        header.close = context.close;
        header.errors = context.errors;

        context.has_message_to_send = header.items_count > 0;
        context.output_id = 0;
        context.output_chunk = 0;
        context.output_offset = 0;

        let bytes = context.encoding().encode(&*header)?;
        context.write_frame(Phase::Header, &bytes, MarkupKind::End)?;
        Ok(())
    }

    /// Fold one received chunk into the item at the receive index
    pub fn message_receive(&mut self, frame: &[u8], markup: MarkupKind) {
        if let Err(e) = self.try_message_receive(frame, markup) {
            self.fault(e);
        }
    }

    fn try_message_receive(&mut self, frame: &[u8], markup: MarkupKind) -> TransferResult<()> {
        let depot = self.depot;
        let parts = self.transfer.parts(self.role);
        let context = parts.context;

        let index = context.input_id;
        if context.items_left == 0 {
            return Err(TransferError::UnexpectedChunk(index));
        }
        let identity = context
            .peer
            .clone()
            .ok_or_else(|| TransferError::MissingTarget("unknown peer".into()))?;
        let item = parts
            .incoming
            .data
            .get_mut(index)
            .ok_or(TransferError::UnexpectedChunk(index))?;

        context.item_index = index;
        item.deserialize(frame)?;
        context.input_chunk += 1;
        parts.incoming.current_chunk = context.input_chunk;

        let declared = parts.incoming.input_chunks.get(index).copied().unwrap_or(1) as usize;
        if markup == MarkupKind::End || context.input_chunk >= declared {
            depot.merge(&identity, item)?;
            context.items_left -= 1;
            context.input_chunk = 0;

            if context.items_left == 0 {
                context.has_message_to_receive = false;
                context.signals().chunks_received.set();
            } else {
                context.input_id += 1;
            }
        }
        Ok(())
    }

    /// Serialize the next chunk of the item at the send index
    pub fn message_send(&mut self) -> TransferResult<MarkupKind> {
        let parts = self.transfer.parts(self.role);
        let context = parts.context;
        let batch_size = context.batch_size();

        let index = context.output_id;
        let item = parts
            .outgoing
            .data
            .get(index)
            .ok_or_else(|| TransferError::InvalidContract(format!("no item at index {}", index)))?;
        let declared = parts.outgoing.output_chunks.get(index).copied().unwrap_or(1) as usize;

        context.item_index = index;
        let mut chunk = BytesMut::with_capacity(batch_size);
        let markup = match item.serialize(&mut chunk, context.output_offset, batch_size) {
            Serialized::Next(next) => {
                if chunk.len() > batch_size {
                    return Err(TransferError::InvalidContract(format!(
                        "item {} wrote {} bytes into a {} byte batch",
                        index,
                        chunk.len(),
                        batch_size
                    )));
                }
                context.output_offset = next;
                context.output_chunk += 1;
                if context.output_chunk >= declared {
                    MarkupKind::End
                } else {
                    MarkupKind::Block
                }
            }
            Serialized::Exhausted => {
                chunk.clear();
                MarkupKind::End
            }
        };
        parts.outgoing.current_chunk = context.output_chunk;

        context.write_frame(Phase::Message, &chunk, markup)?;

        if markup == MarkupKind::End {
            context.output_chunk = 0;
            if index + 1 < parts.outgoing.data.len() {
                context.output_id = index + 1;
                context.output_offset = 0;
            } else {
                context.has_message_to_send = false;
            }
        }
        Ok(markup)
    }

    fn fault(&mut self, error: TransferError) {
        tracing::warn!("Protocol fault ({:?}): {}", self.role, error);

        let parts = self.transfer.parts(self.role);
        let context = parts.context;
        context.halt();
        context.errors += 1;
        parts.outgoing_header.append_notice(error.to_string());

        let signals = context.signals();
        signals.message_received.set();
        signals.chunks_received.set();
    }
}

fn deny(context: &mut TransferContext, outgoing: &mut TransferHeader, reason: &str) {
    let peer = context.peer.as_ref().map(|peer| peer.id.as_str());
    tracing::info!("Round denied for {}: {}", peer.unwrap_or("unknown"), reason);
    context.denied = true;
    context.halt();
    outgoing.append_notice(reason);

    let signals = context.signals();
    signals.message_received.set();
    signals.chunks_received.set();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{unescape, HeaderEncoding};
    use crate::transfer::{Identity, MemoryDepot, Parcel, TransferConfig, TransferMessage};
    use bytes::Bytes;

    fn config() -> TransferConfig {
        TransferConfig {
            batch_size: 4,
            message_capacity: 64,
            ..Default::default()
        }
    }

    /// Frame content of one written frame, terminator stripped and unescaped
    fn frame_of(wire: &[u8]) -> Bytes {
        unescape(&wire[..wire.len() - 16], 16).unwrap()
    }

    fn transfer(id: &str) -> Transfer<Parcel> {
        Transfer::new(TransferContext::new(Identity::new(id, id), config()))
    }

    /// Encode the client's request header and hand it to the server
    fn deliver_header(
        client: &mut Transfer<Parcel>,
        client_depot: &MemoryDepot,
        server: &mut Transfer<Parcel>,
        server_depot: &MemoryDepot,
    ) {
        TransferOperation::new(client, client_depot, Role::Client)
            .header_send()
            .unwrap();
        let wire = client.context.take_output();
        TransferOperation::new(server, server_depot, Role::Server).header_receive(&frame_of(&wire));
    }

    #[test]
    fn test_empty_header_collapses_round() {
        let depot = MemoryDepot::new();
        let mut client = transfer("client");
        let mut server = transfer("server");

        deliver_header(&mut client, &depot, &mut server, &depot);

        assert!(!client.context.has_message_to_send);
        assert!(!server.context.has_message_to_receive);
        assert!(!server.context.denied);
        assert!(server.context.signals().chunks_received.is_set());
        assert!(server.response_header.notice.as_deref().unwrap().starts_with("Registered"));
    }

    #[test]
    fn test_rejected_registration() {
        let client_depot = MemoryDepot::new();
        let server_depot = MemoryDepot::restricted(Vec::<String>::new());
        let mut client = transfer("client");
        let mut server = transfer("server");

        deliver_header(&mut client, &client_depot, &mut server, &server_depot);

        let ctx = &server.context;
        assert!(ctx.denied);
        assert!(ctx.close);
        assert!(!ctx.has_message_to_send);
        assert!(!ctx.has_message_to_receive);
    }

    #[test]
    fn test_garbage_header_faults_into_response() {
        let depot = MemoryDepot::new();
        let mut server = transfer("server");

        TransferOperation::new(&mut server, &depot, Role::Server).header_receive(b"\xff\xff");

        assert!(server.context.close);
        assert_eq!(server.context.errors, 1);
        assert!(server.response_header.notice.is_some());

        TransferOperation::new(&mut server, &depot, Role::Server)
            .header_send()
            .unwrap();
        let wire = server.context.take_output();
        let header: TransferHeader = HeaderEncoding::Bincode
            .decode(&frame_of(&wire))
            .unwrap();
        assert!(header.close);
        assert_eq!(header.errors, 1);
        assert_eq!(header.items_count, 0);
    }

    #[test]
    fn test_items_complete_in_order() {
        let depot = MemoryDepot::new();
        let mut client = transfer("client");
        let mut server = transfer("server");
        client.request_message = TransferMessage::new(vec![
            Parcel::new("first", b"0123456789".to_vec()),
            Parcel::new("second", b"a\x04".to_vec()),
        ]);

        deliver_header(&mut client, &depot, &mut server, &depot);
        assert_eq!(server.context.items_left, 2);
        assert_eq!(server.request_message.input_chunks, vec![3, 1]);

        let mut completed = Vec::new();
        while client.context.has_message_to_send {
            let markup = TransferOperation::new(&mut client, &depot, Role::Client)
                .message_send()
                .unwrap();
            let wire = client.context.take_output();
            let before = server.context.items_left;
            let index = server.context.input_id;
            TransferOperation::new(&mut server, &depot, Role::Server)
                .message_receive(&frame_of(&wire), markup);
            if server.context.items_left < before {
                completed.push(index);
            }
        }

        assert_eq!(completed, vec![0, 1]);
        assert_eq!(server.context.items_left, 0);
        assert!(!server.context.has_message_to_receive);
        assert_eq!(depot.get("client", "first").unwrap().body, b"0123456789");
        assert_eq!(depot.get("client", "second").unwrap().body, b"a\x04");

        // A stray chunk after completion is a fault, not a second completion
        TransferOperation::new(&mut server, &depot, Role::Server)
            .message_receive(b"x", MarkupKind::End);
        assert_eq!(server.context.items_left, 0);
        assert_eq!(server.context.errors, 1);
    }

    #[test]
    fn test_exhausted_last_item_keeps_index() {
        let depot = MemoryDepot::new();
        let mut client = transfer("client");
        client.request_message = TransferMessage::new(vec![
            Parcel::new("full", b"abcd".to_vec()),
            Parcel::new("empty", Vec::new()),
        ]);
        TransferOperation::new(&mut client, &depot, Role::Client)
            .header_send()
            .unwrap();

        let mut op = TransferOperation::new(&mut client, &depot, Role::Client);
        assert_eq!(op.message_send().unwrap(), MarkupKind::End);
        assert_eq!(op.message_send().unwrap(), MarkupKind::End);

        assert_eq!(client.context.output_id, 1);
        assert!(!client.context.has_message_to_send);
    }

    #[test]
    fn test_dispatch_requires_inbound_for_receive() {
        let depot = MemoryDepot::new();
        let mut server = transfer("server");
        let mut op = TransferOperation::new(&mut server, &depot, Role::Server);
        assert!(op.dispatch(Direction::Receive, Phase::Header, None).is_err());
        assert_eq!(
            op.dispatch(Direction::Send, Phase::Header, None).unwrap(),
            MarkupKind::End
        );
    }

    #[test]
    fn test_policies() {
        assert!(Role::Server.policy().pipelines(false));
        assert!(!Role::Server.policy().pipelines(true));
        assert!(!Role::Client.policy().pipelines(false));

        let mut header = TransferHeader::default();
        assert!(Role::Client.policy().refusal(&header).is_none());
        header.denied = true;
        assert!(Role::Client.policy().refusal(&header).is_some());
        assert!(Role::Server.policy().refusal(&header).is_none());
    }
}
