//! Per-connection transfer state
//!
//! The context owns the fixed-size receive buffers of both phases, the
//! outgoing frame buffer, the phase flags, the running item/chunk counters,
//! and the phase signals. Exactly one operation touches it at a time.
//!
//! Bytes read past the end of a frame are parked in a pending queue and fed
//! to whichever phase buffer reads next, as far as it has room.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;

use super::{Identity, Phase, PhaseSignals, TransferConfig, TransferResult};
use crate::protocol::{unescape, FrameWriter, HeaderEncoding, MarkupKind, MarkupScanner};

/// Receive buffer that never grows past its construction size
#[derive(Debug)]
pub struct FrameBuffer {
    data: Box<[u8]>,
    filled: usize,
}

impl FrameBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn filled(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Free space after the received bytes
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    pub fn commit(&mut self, count: usize) {
        self.filled = (self.filled + count).min(self.data.len());
    }

    /// Move as much of `source` as fits, returning the bytes taken
    pub fn fill_from(&mut self, source: &mut BytesMut) -> usize {
        let count = (self.data.len() - self.filled).min(source.len());
        let bytes = source.split_to(count);
        self.data[self.filled..self.filled + count].copy_from_slice(&bytes);
        self.filled += count;
        count
    }

    /// Copy out the first `frame_len` bytes and drop everything before `next`
    pub fn split_frame(&mut self, frame_len: usize, next: usize) -> Bytes {
        let frame = Bytes::copy_from_slice(&self.data[..frame_len]);
        self.data.copy_within(next..self.filled, 0);
        self.filled -= next;
        frame
    }

    /// Remove and return everything received so far
    pub fn drain(&mut self) -> Vec<u8> {
        let bytes = self.filled().to_vec();
        self.filled = 0;
        bytes
    }

    pub fn clear(&mut self) {
        self.filled = 0;
    }
}

/// Mutable state of one connection's rounds
#[derive(Debug)]
pub struct TransferContext {
    /// Local identity sent in every header
    pub identity: Identity,
    /// Identity announced by the peer's last header
    pub peer: Option<Identity>,

    pub close: bool,
    pub denied: bool,
    pub synchronic: bool,
    pub has_message_to_send: bool,
    pub has_message_to_receive: bool,

    /// Item the chunk counters currently apply to
    pub item_index: usize,
    /// Item being received
    pub input_id: usize,
    /// Item being sent
    pub output_id: usize,
    /// Items still to be received this round
    pub items_left: usize,
    /// Chunks consumed for the item at `input_id`
    pub input_chunk: usize,
    /// Chunks produced for the item at `output_id`
    pub output_chunk: usize,
    /// Last acknowledged serialize offset for the item at `output_id`
    pub output_offset: usize,
    /// Protocol faults seen this round
    pub errors: u32,

    config: TransferConfig,
    header_buffer: FrameBuffer,
    message_buffer: FrameBuffer,
    header_scanner: MarkupScanner,
    message_scanner: MarkupScanner,
    header_frame: Option<Bytes>,
    message_frame: Option<Bytes>,
    /// Received bytes not yet moved into a phase buffer
    pending: BytesMut,
    output: BytesMut,
    signals: Arc<PhaseSignals>,
}

impl TransferContext {
    pub fn new(identity: Identity, config: TransferConfig) -> Self {
        Self {
            identity,
            peer: None,
            close: false,
            denied: false,
            synchronic: config.synchronic,
            has_message_to_send: false,
            has_message_to_receive: false,
            item_index: 0,
            input_id: 0,
            output_id: 0,
            items_left: 0,
            input_chunk: 0,
            output_chunk: 0,
            output_offset: 0,
            errors: 0,
            header_buffer: FrameBuffer::with_capacity(config.header_capacity),
            message_buffer: FrameBuffer::with_capacity(config.message_capacity),
            header_scanner: MarkupScanner::new(config.run_length),
            message_scanner: MarkupScanner::new(config.run_length),
            header_frame: None,
            message_frame: None,
            pending: BytesMut::new(),
            output: BytesMut::new(),
            signals: Arc::new(PhaseSignals::new()),
            config,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    pub fn encoding(&self) -> HeaderEncoding {
        self.config.encoding
    }

    pub fn signals(&self) -> Arc<PhaseSignals> {
        self.signals.clone()
    }

    /// Free receive space of a phase's buffer
    pub fn spare(&mut self, phase: Phase) -> &mut [u8] {
        match phase {
            Phase::Header => self.header_buffer.spare_mut(),
            Phase::Message => self.message_buffer.spare_mut(),
        }
    }

    /// Received bytes waiting for a phase buffer
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn read_header(&mut self, received: usize) -> TransferResult<MarkupKind> {
        self.read(Phase::Header, received)
    }

    pub fn read_message(&mut self, received: usize) -> TransferResult<MarkupKind> {
        self.read(Phase::Message, received)
    }

    /// Account for `received` new bytes of a phase and look for a terminator
    ///
    /// Pending bytes are pulled in before giving up, so `MarkupKind::None`
    /// means more has to come from the socket.
    pub fn read(&mut self, phase: Phase, received: usize) -> TransferResult<MarkupKind> {
        let (buffer, scanner) = match phase {
            Phase::Header => (&mut self.header_buffer, &mut self.header_scanner),
            Phase::Message => (&mut self.message_buffer, &mut self.message_scanner),
        };
        buffer.commit(received);

        let found = loop {
            if let Some(found) = scanner.scan(buffer.filled()) {
                break found;
            }
            if buffer.fill_from(&mut self.pending) == 0 {
                return Ok(MarkupKind::None);
            }
        };

        let frame = buffer.split_frame(found.frame_len, found.next);
        let rest = buffer.drain();
        requeue(&mut self.pending, &rest);

        let frame = unescape(&frame, self.config.run_length)?;
        match phase {
            Phase::Header => self.header_frame = Some(frame),
            Phase::Message => self.message_frame = Some(frame),
        }
        Ok(found.kind)
    }

    /// Take the frame completed by the last successful read
    pub fn take_frame(&mut self, phase: Phase) -> Option<Bytes> {
        match phase {
            Phase::Header => self.header_frame.take(),
            Phase::Message => self.message_frame.take(),
        }
    }

    /// Append a terminated frame to the outgoing buffer
    pub fn write_frame(
        &mut self,
        phase: Phase,
        frame: &[u8],
        marker: MarkupKind,
    ) -> TransferResult<usize> {
        // The peer's receive buffer of the same size has to hold it
        let max_frame = match phase {
            Phase::Header => self.config.header_capacity,
            Phase::Message => self.config.message_capacity,
        };
        let writer = FrameWriter::new(self.config.run_length, max_frame);
        Ok(writer.write(&mut self.output, frame, marker)?)
    }

    /// Bytes ready to go out on the socket
    pub fn take_output(&mut self) -> Bytes {
        self.output.split().freeze()
    }

    /// Clear one round's flags, counters, and signals
    ///
    /// `close`, `denied`, `synchronic`, and received bytes belonging to the
    /// next round survive.
    pub fn reset_round(&mut self) {
        self.has_message_to_send = false;
        self.has_message_to_receive = false;
        self.item_index = 0;
        self.input_id = 0;
        self.output_id = 0;
        self.items_left = 0;
        self.input_chunk = 0;
        self.output_chunk = 0;
        self.output_offset = 0;
        self.errors = 0;
        self.header_frame = None;
        self.message_frame = None;
        self.output.clear();

        // A partial frame left by an aborted phase stays ahead of later bytes
        let mut rest = self.header_buffer.drain();
        rest.extend(self.message_buffer.drain());
        requeue(&mut self.pending, &rest);

        self.header_scanner.reset();
        self.message_scanner.reset();
        self.signals.reset();
    }

    /// Stop the round: no further message phases in either direction
    pub fn halt(&mut self) {
        self.close = true;
        self.has_message_to_send = false;
        self.has_message_to_receive = false;
    }
}

/// Put `bytes` back in front of everything already pending
fn requeue(pending: &mut BytesMut, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    let mut queue = BytesMut::with_capacity(bytes.len() + pending.len());
    queue.extend_from_slice(bytes);
    queue.extend_from_slice(pending);
    *pending = queue;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> TransferContext {
        TransferContext::new(Identity::new("local", "Local"), TransferConfig::default())
    }

    fn receive(ctx: &mut TransferContext, phase: Phase, bytes: &[u8]) -> MarkupKind {
        ctx.spare(phase)[..bytes.len()].copy_from_slice(bytes);
        ctx.read(phase, bytes.len()).unwrap()
    }

    fn run(kind: MarkupKind) -> Vec<u8> {
        vec![kind.as_byte(); 16]
    }

    #[test]
    fn test_header_then_pipelined_message() {
        let mut ctx = context();
        let mut wire = b"head".to_vec();
        wire.extend(run(MarkupKind::End));
        wire.extend(b"chunk");
        wire.extend(run(MarkupKind::Block));

        assert_eq!(receive(&mut ctx, Phase::Header, &wire), MarkupKind::End);
        assert_eq!(ctx.take_frame(Phase::Header).unwrap(), &b"head"[..]);

        assert_eq!(ctx.read_message(0).unwrap(), MarkupKind::Block);
        assert_eq!(ctx.take_frame(Phase::Message).unwrap(), &b"chunk"[..]);
    }

    #[test]
    fn test_partial_header_waits() {
        let mut ctx = context();
        assert_eq!(receive(&mut ctx, Phase::Header, b"hea"), MarkupKind::None);
        assert!(ctx.take_frame(Phase::Header).is_none());

        let mut rest = b"d".to_vec();
        rest.extend(run(MarkupKind::End));
        assert_eq!(receive(&mut ctx, Phase::Header, &rest), MarkupKind::End);
        assert_eq!(ctx.take_frame(Phase::Header).unwrap(), &b"head"[..]);
    }

    #[test]
    fn test_next_round_bytes_survive_reset() {
        let mut ctx = context();
        let mut wire = b"last".to_vec();
        wire.extend(run(MarkupKind::End));
        wire.extend(b"next");
        wire.extend(run(MarkupKind::End));

        assert_eq!(receive(&mut ctx, Phase::Message, &wire), MarkupKind::End);
        ctx.reset_round();

        assert_eq!(ctx.read_header(0).unwrap(), MarkupKind::End);
        assert_eq!(ctx.take_frame(Phase::Header).unwrap(), &b"next"[..]);
    }

    #[test]
    fn test_pipelined_chunks_beyond_message_capacity() {
        let config = TransferConfig {
            message_capacity: 32,
            batch_size: 8,
            ..Default::default()
        };
        let mut ctx = TransferContext::new(Identity::default(), config);

        let mut wire = b"head".to_vec();
        wire.extend(run(MarkupKind::End));
        let chunks: Vec<Vec<u8>> = (0..6u8).map(|i| vec![b'a' + i; 8]).collect();
        for chunk in &chunks {
            wire.extend(chunk);
            wire.extend(run(MarkupKind::Block));
        }

        assert_eq!(receive(&mut ctx, Phase::Header, &wire), MarkupKind::End);
        assert_eq!(ctx.take_frame(Phase::Header).unwrap(), &b"head"[..]);
        assert_eq!(ctx.pending(), 6 * 24);

        for chunk in &chunks {
            assert_eq!(ctx.read_message(0).unwrap(), MarkupKind::Block);
            assert_eq!(ctx.take_frame(Phase::Message).unwrap(), &chunk[..]);
        }
        assert_eq!(ctx.read_message(0).unwrap(), MarkupKind::None);
        assert_eq!(ctx.pending(), 0);
    }

    #[test]
    fn test_frame_larger_than_buffer_leaves_no_room() {
        let config = TransferConfig {
            message_capacity: 32,
            batch_size: 8,
            ..Default::default()
        };
        let mut ctx = TransferContext::new(Identity::default(), config);

        let mut wire = b"head".to_vec();
        wire.extend(run(MarkupKind::End));
        wire.extend([b'x'; 40]);

        assert_eq!(receive(&mut ctx, Phase::Header, &wire), MarkupKind::End);
        assert_eq!(ctx.read_message(0).unwrap(), MarkupKind::None);
        assert!(ctx.spare(Phase::Message).is_empty());
        assert_eq!(ctx.pending(), 8);
    }

    #[test]
    fn test_escaped_frames_are_restored() {
        let mut ctx = context();
        ctx.write_frame(Phase::Message, b"ends in end\x04", MarkupKind::End)
            .unwrap();
        ctx.write_frame(Phase::Header, b"next", MarkupKind::End).unwrap();
        let wire = ctx.take_output();

        assert_eq!(receive(&mut ctx, Phase::Message, &wire), MarkupKind::End);
        assert_eq!(
            ctx.take_frame(Phase::Message).unwrap(),
            &b"ends in end\x04"[..]
        );

        ctx.reset_round();
        assert_eq!(ctx.read_header(0).unwrap(), MarkupKind::End);
        assert_eq!(ctx.take_frame(Phase::Header).unwrap(), &b"next"[..]);
    }

    #[test]
    fn test_buffer_is_fixed_size() {
        let config = TransferConfig {
            header_capacity: 32,
            ..Default::default()
        };
        let mut ctx = TransferContext::new(Identity::default(), config);
        assert_eq!(ctx.spare(Phase::Header).len(), 32);

        receive(&mut ctx, Phase::Header, &[b'x'; 32]);
        assert!(ctx.spare(Phase::Header).is_empty());
    }

    #[test]
    fn test_halt_clears_message_flags() {
        let mut ctx = context();
        ctx.has_message_to_send = true;
        ctx.has_message_to_receive = true;
        ctx.halt();
        assert!(ctx.close);
        assert!(!ctx.has_message_to_send);
        assert!(!ctx.has_message_to_receive);
    }
}
