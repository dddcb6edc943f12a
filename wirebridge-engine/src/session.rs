use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use wirebridge_core::error::BridgeError;
use wirebridge_core::transport::ProtocolStream;

/// Where a [`ChannelSession`] is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Waiting for [`SessionHandle::mark_opened`].
    Handshaking,
    Opened,
    /// `end()` was called; buffered output is draining.
    Ending,
    Closed,
}

/// A [`ProtocolStream`] backed by a pair of bounded channels.
///
/// The bridge side of the session is this type; the application side is
/// the [`SessionHandle`] returned alongside it.  Bytes the bridge writes
/// show up in [`SessionHandle::recv`], bytes the application sends through
/// [`SessionHandle::send`] are what the bridge reads.
pub struct ChannelSession {
    inbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    outbound: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    state: watch::Sender<SessionState>,
    input_done: AtomicBool,
    output_done: AtomicBool,
    destroyed: AtomicBool,
    reason: Mutex<Option<BridgeError>>,
}

impl ChannelSession {
    /// Creates a session that is ready for writes straight away.
    #[must_use]
    pub fn new(capacity: usize) -> (Arc<Self>, SessionHandle) {
        Self::build(capacity, SessionState::Opened)
    }

    /// Creates a session whose `opened` signal waits for
    /// [`SessionHandle::mark_opened`].
    #[must_use]
    pub fn with_handshake(capacity: usize) -> (Arc<Self>, SessionHandle) {
        Self::build(capacity, SessionState::Handshaking)
    }

    fn build(capacity: usize, initial: SessionState) -> (Arc<Self>, SessionHandle) {
        let capacity = capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (state, _) = watch::channel(initial);

        let session = Arc::new(Self {
            inbound: Mutex::new(Some(inbound_tx)),
            outbound: tokio::sync::Mutex::new(outbound_rx),
            state,
            input_done: AtomicBool::new(false),
            output_done: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            reason: Mutex::new(None),
        });
        let handle = SessionHandle {
            outbound: Some(outbound_tx),
            inbound: inbound_rx,
            session: Arc::clone(&session),
        };
        (session, handle)
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// The reason passed to [`destroy`](ProtocolStream::destroy), if any.
    #[must_use]
    pub fn error(&self) -> Option<BridgeError> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_inbound(&self) -> Option<mpsc::Sender<Bytes>> {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn inbound_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Enters `Closed` once input and output have both finished.
    fn maybe_close(&self) {
        if self.input_done.load(Ordering::Acquire) && self.output_done.load(Ordering::Acquire) {
            self.advance(SessionState::Closed);
        }
    }

    fn advance(&self, next: SessionState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed {
            trace!(state = ?next, "Session state advanced");
        }
        changed
    }

    fn finish_output(&self) {
        self.output_done.store(true, Ordering::Release);
        self.maybe_close();
    }

    fn destroyed_error(&self) -> BridgeError {
        self.error().unwrap_or(BridgeError::Destroyed)
    }
}

impl ProtocolStream for ChannelSession {
    fn write(&self, chunk: Bytes) -> impl Future<Output = Result<(), BridgeError>> + Send + '_ {
        async move {
            if self.destroyed.load(Ordering::Acquire) {
                return Err(self.destroyed_error());
            }
            let Some(inbound) = self.inbound_sender() else {
                trace!(bytes = chunk.len(), "Input already ended, discarding chunk");
                return Ok(());
            };
            let mut state = self.state.subscribe();
            tokio::select! {
                sent = inbound.send(chunk) => {
                    if sent.is_err() {
                        // The application dropped its handle; nobody will read this.
                        trace!("Session input has no reader, discarding chunk");
                    }
                    Ok(())
                }
                _ = state.wait_for(|s| *s == SessionState::Closed) => {
                    Err(self.destroyed_error())
                }
            }
        }
    }

    fn read(&self) -> impl Future<Output = Option<Result<Bytes, BridgeError>>> + Send + '_ {
        async move {
            let mut outbound = self.outbound.lock().await;
            let mut state = self.state.subscribe();
            loop {
                if self.destroyed.load(Ordering::Acquire) {
                    return Some(Err(self.destroyed_error()));
                }
                if self.output_done.load(Ordering::Acquire) {
                    return None;
                }
                if self.state() >= SessionState::Ending {
                    // Drain whatever is already buffered, then finish.
                    return match outbound.try_recv() {
                        Ok(chunk) => Some(Ok(chunk)),
                        Err(_) => {
                            self.finish_output();
                            None
                        }
                    };
                }
                tokio::select! {
                    biased;

                    chunk = outbound.recv() => match chunk {
                        Some(chunk) => return Some(Ok(chunk)),
                        None => {
                            self.finish_output();
                            return None;
                        }
                    },
                    changed = state.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                    }
                }
            }
        }
    }

    fn opened(&self) -> impl Future<Output = bool> + Send + '_ {
        async move {
            let mut state = self.state.subscribe();
            let _ = state.wait_for(|s| *s != SessionState::Handshaking).await;
            !self.destroyed.load(Ordering::Acquire)
        }
    }

    fn end(&self) {
        if self.state() >= SessionState::Ending {
            return;
        }
        debug!("Ending session");
        drop(self.take_inbound());
        self.input_done.store(true, Ordering::Release);
        self.advance(SessionState::Ending);
        self.maybe_close();
    }

    fn destroy(&self, reason: Option<BridgeError>) {
        if self.state() == SessionState::Closed {
            return;
        }
        match &reason {
            Some(err) => debug!(error = %err, "Destroying session"),
            None => debug!("Destroying session"),
        }
        if let Some(err) = reason {
            self.reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_or_insert(err);
        }
        self.destroyed.store(true, Ordering::Release);
        drop(self.take_inbound());
        self.input_done.store(true, Ordering::Release);
        self.output_done.store(true, Ordering::Release);
        self.advance(SessionState::Closed);
    }

    fn closed(&self) -> impl Future<Output = ()> + Send + '_ {
        async move {
            let mut state = self.state.subscribe();
            let _ = state.wait_for(|s| *s == SessionState::Closed).await;
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire) || self.state() == SessionState::Closed
    }
}

/// The application's end of a [`ChannelSession`].
pub struct SessionHandle {
    outbound: Option<mpsc::Sender<Bytes>>,
    inbound: mpsc::Receiver<Bytes>,
    session: Arc<ChannelSession>,
}

impl SessionHandle {
    /// Queues `chunk` for the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the output side was finished or the session
    /// stopped reading.
    pub async fn send(&self, chunk: impl Into<Bytes>) -> anyhow::Result<()> {
        let Some(outbound) = &self.outbound else {
            anyhow::bail!("session output already finished");
        };
        outbound
            .send(chunk.into())
            .await
            .map_err(|_| anyhow::anyhow!("session is no longer reading output"))
    }

    /// Receives the next chunk from the peer; `None` once input has ended.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Ends the application's output.  Already queued chunks are still read.
    pub fn finish(&mut self) {
        self.outbound = None;
    }

    /// Completes the handshake, resolving the session's `opened` signal.
    pub fn mark_opened(&self) {
        self.session.state.send_if_modified(|s| {
            if *s == SessionState::Handshaking {
                *s = SessionState::Opened;
                true
            } else {
                false
            }
        });
    }

    /// Destroys the session from the application side.
    pub fn destroy(&self, reason: Option<BridgeError>) {
        self.session.destroy(reason);
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// The reason the session was destroyed with, if any.
    #[must_use]
    pub fn error(&self) -> Option<BridgeError> {
        self.session.error()
    }

    /// `true` if the session was torn down with [`destroy`](ProtocolStream::destroy)
    /// rather than ended gracefully.
    #[must_use]
    pub fn was_destroyed(&self) -> bool {
        self.session.destroyed.load(Ordering::Acquire)
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.session.closed().await;
    }
}
