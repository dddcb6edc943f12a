use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::trace;

use crate::error::BridgeError;

/// The four lifecycle states of a socket.
///
/// Variants are ordered, so "at or past closing" is a plain comparison
/// (see [`ReadyState::is_closing`]).  Transitions only ever move forward;
/// `Closing` may be skipped when a socket fails abruptly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    /// Returns `true` once the socket has started (or finished) closing.
    #[must_use]
    pub fn is_closing(self) -> bool {
        self >= Self::Closing
    }
}

/// Monotonic lifecycle cell shared between a socket and its observers.
///
/// The one-shot `open` and `close` signals are exposed as futures
/// ([`opened`](Lifecycle::opened), [`closed`](Lifecycle::closed)); any
/// number of tasks may wait on them, before or after the transition.
pub struct Lifecycle {
    state: watch::Sender<ReadyState>,
    was_opened: AtomicBool,
    failure: Mutex<Option<BridgeError>>,
}

impl Lifecycle {
    #[must_use]
    pub fn new(initial: ReadyState) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            state,
            was_opened: AtomicBool::new(initial >= ReadyState::Open && initial < ReadyState::Closed),
            failure: Mutex::new(None),
        }
    }

    /// Current state.  This is a plain read, suitable for per-chunk checks.
    #[must_use]
    pub fn state(&self) -> ReadyState {
        *self.state.borrow()
    }

    /// Moves to `next` if it lies ahead of the current state.
    ///
    /// Returns `true` when the state actually changed.
    pub fn advance(&self, next: ReadyState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if next <= *current {
                return false;
            }
            // Stored before waiters are woken, so `opened()` never sees the
            // new state without it.
            if next == ReadyState::Open {
                self.was_opened.store(true, Ordering::Release);
            }
            *current = next;
            true
        });
        if changed {
            trace!(state = ?next, "Socket state advanced");
        }
        changed
    }

    /// Records `err` as the reason the socket ended and moves to `Closed`.
    ///
    /// Only the first failure is kept.
    pub fn fail(&self, err: BridgeError) {
        if self.state() == ReadyState::Closed {
            return;
        }
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert(err);
        }
        self.advance(ReadyState::Closed);
    }

    /// The failure recorded by [`fail`](Lifecycle::fail), if any.
    #[must_use]
    pub fn failure(&self) -> Option<BridgeError> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }

    /// Resolves once the socket has left `Connecting`.
    ///
    /// # Errors
    ///
    /// Returns the recorded failure (or [`BridgeError::ClosedBeforeOpen`])
    /// if the socket reached `Closed` without ever being `Open`.
    pub async fn opened(&self) -> Result<(), BridgeError> {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|s| *s != ReadyState::Connecting).await;
        if self.was_opened.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(self.failure().unwrap_or(BridgeError::ClosedBeforeOpen))
        }
    }

    /// Resolves once the socket is `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ReadyState::Closed).await;
    }

    /// A receiver that observes every subsequent state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ReadyState> {
        self.state.subscribe()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new(ReadyState::Connecting)
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &self.state())
            .field("failure", &self.failure())
            .finish()
    }
}
