//! Header encodings and outgoing frame assembly
//!
//! The header phase is an encoded object graph; message chunks are whatever
//! bytes the payload items produce. Either way a frame goes out as
//! `[escaped frame bytes][run of markup bytes]`.
//!
//! Escaping keeps every frame free of anything the scanner could mistake for
//! a terminator: an `Empty` byte is inserted after each `run_length - 1`
//! identical `Block`/`End` bytes, and one more follows a frame whose last
//! byte is `Block`, `End`, or `Empty`.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::markup::MarkupKind;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Not a terminator: {0:?}")]
    NotTerminator(MarkupKind),

    #[error("Missing escape byte at offset {0}")]
    MissingEscape(usize),
}

/// Byte inserted to break up markup runs inside a frame
pub const ESCAPE: MarkupKind = MarkupKind::Empty;

/// Longest markup run a frame may carry unescaped
fn escape_after(run_length: usize) -> usize {
    run_length.saturating_sub(1).max(1)
}

fn is_markup_byte(byte: u8) -> bool {
    MarkupKind::from_byte(byte).is_some_and(MarkupKind::is_continuation)
}

/// Largest size `len` frame bytes can take once escaped
pub fn escaped_len(len: usize, run_length: usize) -> usize {
    len + len / escape_after(run_length) + 1
}

/// Tracks the run of identical markup bytes at the end of a byte stream
#[derive(Debug, Default)]
struct RunTracker {
    previous: Option<u8>,
    run: usize,
}

impl RunTracker {
    /// Account for one byte and return the run it extends
    fn push(&mut self, byte: u8) -> usize {
        self.run = if !is_markup_byte(byte) {
            0
        } else if self.previous == Some(byte) {
            self.run + 1
        } else {
            1
        };
        self.previous = Some(byte);
        self.run
    }

    fn reset(&mut self) {
        self.previous = None;
        self.run = 0;
    }
}

/// Undo the escaping of a received frame
pub fn unescape(frame: &[u8], run_length: usize) -> Result<Bytes, CodecError> {
    let body = match frame.split_last() {
        Some((&last, body)) if last == ESCAPE.as_byte() => body,
        _ => frame,
    };

    let limit = escape_after(run_length);
    let mut out = BytesMut::with_capacity(body.len());
    let mut tracker = RunTracker::default();
    let mut escaped = false;

    for (offset, &byte) in body.iter().enumerate() {
        if escaped {
            if byte != ESCAPE.as_byte() {
                return Err(CodecError::MissingEscape(offset));
            }
            escaped = false;
            tracker.reset();
            continue;
        }
        out.put_u8(byte);
        escaped = tracker.push(byte) == limit;
    }

    if escaped {
        return Err(CodecError::MissingEscape(body.len()));
    }
    Ok(out.freeze())
}

/// Byte encoding of the header phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderEncoding {
    /// Compact binary object graph
    #[default]
    Bincode,
    /// Human-readable, for diagnostics
    Json,
}

impl HeaderEncoding {
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            HeaderEncoding::Bincode => Ok(bincode::serialize(value)?),
            HeaderEncoding::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            HeaderEncoding::Bincode => Ok(bincode::deserialize(bytes)?),
            HeaderEncoding::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

/// Appends terminated frames to an output buffer
#[derive(Debug, Clone, Copy)]
pub struct FrameWriter {
    run_length: usize,
    max_frame: usize,
}

impl FrameWriter {
    /// `max_frame` bounds frame content plus its terminator run
    pub fn new(run_length: usize, max_frame: usize) -> Self {
        Self {
            run_length,
            max_frame,
        }
    }

    /// Append the escaped frame and its terminator, returning the bytes added
    pub fn write(
        &self,
        out: &mut BytesMut,
        frame: &[u8],
        marker: MarkupKind,
    ) -> Result<usize, CodecError> {
        if !marker.is_continuation() {
            return Err(CodecError::NotTerminator(marker));
        }

        let start = out.len();
        out.reserve(escaped_len(frame.len(), self.run_length) + self.run_length);

        let limit = escape_after(self.run_length);
        let mut tracker = RunTracker::default();
        for &byte in frame {
            out.put_u8(byte);
            if tracker.push(byte) == limit {
                out.put_u8(ESCAPE.as_byte());
                tracker.reset();
            }
        }
        if frame
            .last()
            .is_some_and(|&last| is_markup_byte(last) || last == ESCAPE.as_byte())
        {
            out.put_u8(ESCAPE.as_byte());
        }

        let total = out.len() - start + self.run_length;
        if total > self.max_frame {
            out.truncate(start);
            return Err(CodecError::FrameTooLarge(total, self.max_frame));
        }

        out.put_bytes(marker.as_byte(), self.run_length);
        Ok(total)
    }
}
