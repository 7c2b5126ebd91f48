//! Binary wait signals
//!
//! A signal is either set or clear. Waiters block until it is set; setting
//! wakes every waiter and stays set until `reset`. Async tasks wait with
//! [`Signal::wait`], plain threads with [`Signal::wait_blocking`].

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct Signal {
    state: Mutex<bool>,
    condvar: Condvar,
    notify: Notify,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, bool> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self) {
        let mut state = self.state();
        *state = true;
        self.condvar.notify_all();
        self.notify.notify_waiters();
    }

    pub fn reset(&self) {
        *self.state() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.state()
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent `set` is not missed
            notified.as_mut().enable();

            if self.is_set() {
                return;
            }
            notified.await;
        }
    }

    /// Must not be called from inside an async task
    pub fn wait_blocking(&self) {
        let mut state = self.state();
        while !*state {
            state = self
                .condvar
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// The five phase signals of one connection
#[derive(Debug, Default)]
pub struct PhaseSignals {
    pub header_received: Signal,
    pub header_sent: Signal,
    pub message_received: Signal,
    pub message_sent: Signal,
    pub chunks_received: Signal,
}

impl PhaseSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear every signal at the start of a round
    pub fn reset(&self) {
        self.header_received.reset();
        self.header_sent.reset();
        self.message_received.reset();
        self.message_sent.reset();
        self.chunks_received.reset();
    }

    /// Set every signal so nobody stays blocked on a failed connection
    pub fn release(&self) {
        self.header_received.set();
        self.header_sent.set();
        self.message_received.set();
        self.message_sent.set();
        self.chunks_received.set();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_wait_pends_until_set() {
        let signal = Signal::new();
        let mut wait = task::spawn(signal.wait());

        assert_pending!(wait.poll());
        signal.set();
        assert!(wait.is_woken());
        assert_ready!(wait.poll());
    }

    #[test]
    fn test_set_signal_returns_immediately() {
        let signal = Signal::new();
        signal.set();
        let mut wait = task::spawn(signal.wait());
        assert_ready!(wait.poll());
    }

    #[test]
    fn test_reset_clears() {
        let signal = Signal::new();
        signal.set();
        signal.reset();
        assert!(!signal.is_set());
    }

    #[test]
    fn test_blocking_wait_from_thread() {
        let signal = Arc::new(Signal::new());
        let waiter = {
            let signal = signal.clone();
            std::thread::spawn(move || signal.wait_blocking())
        };

        signal.set();
        waiter.join().unwrap();
    }

    #[test]
    fn test_release_sets_all() {
        let signals = PhaseSignals::new();
        signals.release();
        assert!(signals.header_received.is_set());
        assert!(signals.chunks_received.is_set());

        signals.reset();
        assert!(!signals.message_sent.is_set());
    }
}
