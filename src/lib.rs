//! Ethernet Transfer - sentinel-framed object transfer over TCP
//!
//! A client and a server exchange rounds over one socket. Each direction of a
//! round is a header announcing the items, followed by the items' message
//! chunks. Frames are delimited by runs of identical markup bytes instead of
//! length prefixes.

pub mod config;
pub mod network;
pub mod protocol;
pub mod transfer;
