//! Protocol module - Wire format of a transfer round
//!
//! A round on the wire:
//! - header bytes, closed by a run of `End` markup bytes
//! - per item, one or more message chunks, each closed by a `Block` run
//!   except the item's last chunk, which is closed by an `End` run

mod codec;
mod markup;

pub use codec::*;
pub use markup::*;

/// Protocol version carried in every header
pub const PROTOCOL_VERSION: u32 = 1;

/// Default port for transfer servers
pub const DEFAULT_PORT: u16 = 28500;
