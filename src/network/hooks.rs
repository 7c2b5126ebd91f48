//! Phase hooks
//!
//! Each hook runs once per completed phase, while the connection's transfer is
//! locked, so it can read what arrived and prepare what goes out next.

use crate::transfer::Transfer;

pub trait TransferHooks<T>: Send + Sync + 'static {
    /// The socket is up; prepare the first request here
    fn connected(&self, _transfer: &mut Transfer<T>) {}

    /// The peer's header arrived; a server fills its response here
    fn header_received(&self, _transfer: &mut Transfer<T>) {}

    fn header_sent(&self, _transfer: &mut Transfer<T>) {}

    /// Every announced item has been received and merged
    fn message_received(&self, _transfer: &mut Transfer<T>) {}

    fn message_sent(&self, _transfer: &mut Transfer<T>) {}
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl<T> TransferHooks<T> for NoHooks {}
