use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use bytes::Bytes;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info, warn};

use wirebridge_core::config::BridgeConfig;
use wirebridge_core::error::BridgeError;
use wirebridge_core::lifecycle::ReadyState;
use wirebridge_core::transport::{ProtocolStream, Socket};

use crate::pipe;

// ── Events (bridge → application) ───────────────────────────────────

/// Diagnostic events published by a [`Bridge`].
#[derive(Clone, Debug)]
pub enum BridgeEvent {
    /// A chunk arrived from the socket.
    Message { data: Bytes },
    /// A failure that was forwarded into the protocol stream.  Failures
    /// observed after [`Bridge::close`] was called are not reported.
    Error { error: BridgeError },
}

// ── Pipe assembly stages ────────────────────────────────────────────

const PENDING: u8 = 0;
const PIPED: u8 = 1;
const ABANDONED: u8 = 2;

/// Couples one [`Socket`] to one [`ProtocolStream`] for a single session.
///
/// The pipe between the two is assembled only once the socket is open.
/// Errors on the socket (before or after assembly) destroy the protocol
/// stream, carrying the error unless [`close`](Bridge::close) has already
/// been requested.
///
/// Must be constructed inside a Tokio runtime.
pub struct Bridge<S: Socket, P: ProtocolStream> {
    shared: Arc<Shared<S, P>>,
}

struct Shared<S, P> {
    socket: Arc<S>,
    stream: Arc<P>,
    peer: String,
    /// Shutdown requested.  Set once, before `close` awaits anything.
    closed: AtomicBool,
    stage: AtomicU8,
    shutdown: Notify,
    events: broadcast::Sender<BridgeEvent>,
}

impl<S: Socket, P: ProtocolStream> Bridge<S, P> {
    pub fn new(socket: Arc<S>, stream: Arc<P>) -> Self {
        Self::with_config(socket, stream, &BridgeConfig::default())
    }

    pub fn with_config(socket: Arc<S>, stream: Arc<P>, config: &BridgeConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let shared = Arc::new(Shared {
            peer: socket.peer(),
            socket,
            stream,
            closed: AtomicBool::new(false),
            stage: AtomicU8::new(PENDING),
            shutdown: Notify::new(),
            events,
        });

        let state = shared.socket.ready_state();
        match (state, shared.socket.lifecycle().failure()) {
            (ReadyState::Connecting, _) => {
                debug!("Socket still connecting, deferring pipe assembly");
                tokio::spawn(Arc::clone(&shared).assemble_when_open());
            }
            (ReadyState::Closed, Some(err)) => shared.forward_error(err),
            _ => shared.assemble(),
        }

        Self { shared }
    }

    /// Subscribes to the bridge's [`BridgeEvent`]s.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.shared.events.subscribe()
    }

    /// `true` once [`close`](Bridge::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// `true` if the pipe between socket and stream has been assembled.
    #[must_use]
    pub fn is_piped(&self) -> bool {
        self.shared.stage.load(Ordering::Acquire) == PIPED
    }

    #[must_use]
    pub fn socket(&self) -> &Arc<S> {
        &self.shared.socket
    }

    #[must_use]
    pub fn stream(&self) -> &Arc<P> {
        &self.shared.stream
    }

    /// Shuts both endpoints down and resolves once both are closed.
    ///
    /// - Socket already closed: the stream is destroyed if it is not
    ///   already; the socket is left alone.
    /// - Socket connecting: waits for the socket to open (closing it
    ///   mid-connect is not safe), then destroys the stream.
    /// - Socket open or closing: waits for the stream to be ready, then
    ///   ends it gracefully so buffered output drains.
    ///
    /// In the last two cases the socket is then asked to close, and the call
    /// returns once the socket and the stream have both signalled close.
    /// Calling it again after that returns immediately.
    pub async fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            debug!(peer = %shared.peer, "Bridge close requested again");
        }
        shared.shutdown.notify_one();
        // Whatever happens next, a pipe that was not assembled yet never will be.
        let abandoned = shared
            .stage
            .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        let socket = &shared.socket;
        let stream = &shared.stream;
        match socket.ready_state() {
            ReadyState::Closed => {
                if stream.is_destroyed() {
                    return;
                }
                debug!(peer = %shared.peer, "Socket already closed, destroying protocol stream");
                stream.destroy(None);
                stream.closed().await;
                return;
            }
            ReadyState::Connecting => {
                debug!(peer = %shared.peer, "Closing while connecting, waiting for open");
                if let Err(err) = socket.lifecycle().opened().await {
                    debug!(peer = %shared.peer, error = %err, "Socket never opened");
                }
                stream.destroy(None);
            }
            ReadyState::Open | ReadyState::Closing if abandoned => {
                // Opened, but the pipe was never assembled: nothing to drain.
                stream.destroy(None);
            }
            ReadyState::Open | ReadyState::Closing => {
                if !stream.opened().await {
                    debug!(peer = %shared.peer, "Protocol stream destroyed before it opened");
                }
                stream.end();
            }
        }

        socket.close();
        tokio::join!(socket.lifecycle().closed(), stream.closed());
        info!(peer = %shared.peer, "Bridge closed");
    }
}

impl<S: Socket, P: ProtocolStream> Clone for Bridge<S, P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Socket, P: ProtocolStream> Shared<S, P> {
    async fn assemble_when_open(self: Arc<Self>) {
        let opened = tokio::select! {
            biased;

            () = self.shutdown.notified() => {
                debug!(peer = %self.peer, "Bridge closed while connecting, pipe not assembled");
                return;
            }
            opened = self.socket.lifecycle().opened() => opened,
        };

        match opened {
            Ok(()) => self.assemble(),
            Err(err) => self.forward_error(err),
        }
    }

    /// Starts the pipe, at most once and never after `close`.
    fn assemble(self: &Arc<Self>) {
        if self
            .stage
            .compare_exchange(PENDING, PIPED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let peer = self.socket.peer();
        info!(peer = %peer, "Socket open, assembling pipe");

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            match pipe::run(&*shared.socket, &*shared.stream, &shared.events).await {
                Ok(()) => debug!(peer = %peer, "Pipe finished"),
                Err(err) => {
                    shared.forward_error(err);
                    shared.socket.terminate();
                }
            }
        });
    }

    /// Destroys the protocol stream because of `err`.
    ///
    /// Once shutdown has been requested the error is expected and is
    /// swallowed: the stream is destroyed without a reason and no event is
    /// published.
    fn forward_error(&self, err: BridgeError) {
        if self.closed.load(Ordering::Acquire) {
            debug!(peer = %self.peer, error = %err, "Error during shutdown suppressed");
            self.stream.destroy(None);
            return;
        }
        warn!(peer = %self.peer, error = %err, "Destroying protocol stream");
        self.stream.destroy(Some(err.clone()));
        publish(&self.events, || BridgeEvent::Error { error: err });
    }
}

/// Sends an event if anyone is subscribed; the event is only built then.
pub(crate) fn publish(events: &broadcast::Sender<BridgeEvent>, event: impl FnOnce() -> BridgeEvent) {
    if events.receiver_count() > 0 {
        let _ = events.send(event());
    }
}
