//! Cancellation tokens that can wake a thread blocked on a channel.
//!
//! A token owns the only sender of a private signal channel. Cancelling drops
//! that sender, so every receiver obtained through [`CancellationToken::signal`]
//! becomes ready at once and any `select!` waiting on it returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{select, Receiver, RecvTimeoutError, Sender};

/// Returned by the blocking helpers when the token fired before a value arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug)]
struct TokenInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (trigger, signal) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(None),
                trigger: Mutex::new(Some(trigger)),
                signal,
            }),
        }
    }

    /// Fire the token. Returns `true` only for the call that flipped it.
    pub fn cancel(&self, reason: Option<&str>) -> bool {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self
            .inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = reason.map(str::to_string);
        // Dropping the only sender disconnects every signal receiver.
        self.inner
            .trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Receiver that becomes ready (disconnected) once the token fires.
    /// Meant to be used as one arm of a `crossbeam_channel::select!`.
    pub fn signal(&self) -> Receiver<()> {
        self.inner.signal.clone()
    }

    /// Block until `rx` yields a value or the token fires.
    pub fn wait_for<T>(&self, rx: &Receiver<T>) -> Result<Option<T>, Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        let signal = self.signal();
        select! {
            recv(rx) -> msg => Ok(msg.ok()),
            recv(signal) -> _ => Err(Cancelled),
        }
    }

    /// Sleep for `timeout` unless the token fires first.
    pub fn sleep(&self, timeout: Duration) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        match self.inner.signal.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => Ok(()),
            _ => Err(Cancelled),
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
