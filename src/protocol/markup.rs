//! Markup bytes and the sentinel-run scanner
//!
//! Frames are not length-prefixed. Each frame is closed by a run of identical
//! continuation-class bytes:
//! - a `Block` run ends the current chunk, more chunks of the item follow
//! - an `End` run ends the current item, or the header
//!
//! Shorter runs of the same bytes are ordinary payload. Outgoing frames are
//! escaped by `FrameWriter` so their content never forms or extends a run.

use serde::{Deserialize, Serialize};

/// Default number of identical markup bytes that make a terminator
pub const DEFAULT_RUN_LENGTH: usize = 16;

/// Reserved byte values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MarkupKind {
    None = 0x00,
    Empty = 0x1A,
    Line = 0x0A,
    Space = 0x20,
    Semi = 0x3B,
    Coma = 0x2C,
    Colon = 0x3A,
    Dot = 0x2E,
    /// Chunk terminator
    Block = 0x17,
    /// Item and header terminator
    End = 0x04,
}

impl MarkupKind {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(MarkupKind::None),
            0x1A => Some(MarkupKind::Empty),
            0x0A => Some(MarkupKind::Line),
            0x20 => Some(MarkupKind::Space),
            0x3B => Some(MarkupKind::Semi),
            0x2C => Some(MarkupKind::Coma),
            0x3A => Some(MarkupKind::Colon),
            0x2E => Some(MarkupKind::Dot),
            0x17 => Some(MarkupKind::Block),
            0x04 => Some(MarkupKind::End),
            _ => None,
        }
    }

    /// `Block` and `End` close frames; everything else only separates
    pub fn is_continuation(self) -> bool {
        matches!(self, MarkupKind::Block | MarkupKind::End)
    }

    pub fn is_separator(self) -> bool {
        !self.is_continuation()
    }
}

/// Which way the scanner walks the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanDirection {
    /// From the last scanned position toward the end; resumable across reads
    #[default]
    Forward,
    /// From the tail toward the start; only finds a terminator that ends the buffer
    Backward,
}

/// A terminator located in a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminator {
    pub kind: MarkupKind,
    /// Bytes of frame content before the run
    pub frame_len: usize,
    /// First index after the run
    pub next: usize,
}

/// Scans received bytes for terminator runs
#[derive(Debug, Clone)]
pub struct MarkupScanner {
    run_length: usize,
    direction: ScanDirection,
    offset: usize,
    cursor: usize,
    run_byte: u8,
    run: usize,
}

impl MarkupScanner {
    pub fn new(run_length: usize) -> Self {
        Self {
            run_length: run_length.max(1),
            direction: ScanDirection::Forward,
            offset: 0,
            cursor: 0,
            run_byte: 0,
            run: 0,
        }
    }

    pub fn with_direction(mut self, direction: ScanDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Skip the first `offset` bytes of every buffer
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn run_length(&self) -> usize {
        self.run_length
    }

    /// Index up to which the buffer has been scanned
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Forget all progress, for a buffer whose contents were replaced
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.run = 0;
        self.run_byte = 0;
    }

    /// Scan `buffer`, which holds every byte received for the current frame
    pub fn scan(&mut self, buffer: &[u8]) -> Option<Terminator> {
        match self.direction {
            ScanDirection::Forward => self.scan_forward(buffer),
            ScanDirection::Backward => self.scan_backward(buffer),
        }
    }

    fn scan_forward(&mut self, buffer: &[u8]) -> Option<Terminator> {
        let start = self.cursor.max(self.offset);

        for (index, &byte) in buffer.iter().enumerate().skip(start) {
            match MarkupKind::from_byte(byte) {
                Some(kind) if kind.is_continuation() => {
                    if self.run > 0 && self.run_byte == byte {
                        self.run += 1;
                    } else {
                        self.run_byte = byte;
                        self.run = 1;
                    }

                    if self.run == self.run_length {
                        let next = index + 1;
                        let frame_len = next - self.run_length;
                        self.reset();
                        return Some(Terminator {
                            kind,
                            frame_len,
                            next,
                        });
                    }
                }
                _ => self.run = 0,
            }
        }

        self.cursor = buffer.len();
        None
    }

    fn scan_backward(&mut self, buffer: &[u8]) -> Option<Terminator> {
        let end = buffer.len().saturating_sub(self.offset);
        let tail = &buffer[..end];
        let &last = tail.last()?;

        let kind = MarkupKind::from_byte(last).filter(|kind| kind.is_continuation())?;
        let run = tail.iter().rev().take_while(|&&byte| byte == last).count();

        self.cursor = end;
        if run < self.run_length {
            return None;
        }

        Some(Terminator {
            kind,
            frame_len: end - run,
            next: end,
        })
    }
}

impl Default for MarkupScanner {
    fn default() -> Self {
        Self::new(DEFAULT_RUN_LENGTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(kind: MarkupKind, len: usize) -> Vec<u8> {
        vec![kind.as_byte(); len]
    }

    #[test]
    fn test_markup_classes() {
        assert!(MarkupKind::Block.is_continuation());
        assert!(MarkupKind::End.is_continuation());
        for kind in [
            MarkupKind::None,
            MarkupKind::Empty,
            MarkupKind::Line,
            MarkupKind::Space,
            MarkupKind::Semi,
            MarkupKind::Coma,
            MarkupKind::Colon,
            MarkupKind::Dot,
        ] {
            assert!(kind.is_separator());
            assert_eq!(MarkupKind::from_byte(kind.as_byte()), Some(kind));
        }
    }

    #[test]
    fn test_exact_block_run() {
        let mut scanner = MarkupScanner::default();
        let mut buf = b"chunk".to_vec();
        buf.extend(run(MarkupKind::Block, 16));

        let found = scanner.scan(&buf).unwrap();
        assert_eq!(found.kind, MarkupKind::Block);
        assert_eq!(found.frame_len, 5);
        assert_eq!(found.next, buf.len());
    }

    #[test]
    fn test_exact_end_run() {
        let mut scanner = MarkupScanner::default();
        let buf = run(MarkupKind::End, 16);

        let found = scanner.scan(&buf).unwrap();
        assert_eq!(found.kind, MarkupKind::End);
        assert_eq!(found.frame_len, 0);
    }

    #[test]
    fn test_short_run_is_payload() {
        let mut scanner = MarkupScanner::default();
        let mut buf = b"abc".to_vec();
        buf.extend(run(MarkupKind::End, 15));
        buf.extend(b"def");

        assert_eq!(scanner.scan(&buf), None);
        assert_eq!(scanner.cursor(), buf.len());
    }

    #[test]
    fn test_mixed_markup_does_not_count() {
        let mut scanner = MarkupScanner::default();
        let mut buf = run(MarkupKind::End, 8);
        buf.extend(run(MarkupKind::Block, 8));

        assert_eq!(scanner.scan(&buf), None);
    }

    #[test]
    fn test_run_split_across_reads() {
        let mut scanner = MarkupScanner::default();
        let mut buf = b"header".to_vec();
        buf.extend(run(MarkupKind::End, 10));
        assert_eq!(scanner.scan(&buf), None);

        buf.extend(run(MarkupKind::End, 6));
        buf.extend(b"next");
        let found = scanner.scan(&buf).unwrap();
        assert_eq!(found.kind, MarkupKind::End);
        assert_eq!(found.frame_len, 6);
        assert_eq!(&buf[found.next..], b"next");
    }

    #[test]
    fn test_backward_scan() {
        let mut scanner = MarkupScanner::default().with_direction(ScanDirection::Backward);
        let mut buf = b"body".to_vec();
        buf.extend(run(MarkupKind::Block, 20));

        let found = scanner.scan(&buf).unwrap();
        assert_eq!(found.kind, MarkupKind::Block);
        assert_eq!(found.frame_len, 4);

        buf.push(b'x');
        assert_eq!(scanner.scan(&buf), None);
    }

    #[test]
    fn test_offset_skips_prefix() {
        let mut scanner = MarkupScanner::new(4).with_offset(4);
        let mut buf = run(MarkupKind::End, 4);
        buf.extend(b"ab");
        assert_eq!(scanner.scan(&buf), None);

        buf.extend(run(MarkupKind::End, 4));
        let found = scanner.scan(&buf).unwrap();
        assert_eq!(found.frame_len, 6);
    }
}
