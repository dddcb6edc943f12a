use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::BridgeError;
use crate::lifecycle::{Lifecycle, ReadyState};

/// A duplex network endpoint with a four-state lifecycle.
///
/// The socket is owned by whoever created it; a bridge only borrows it
/// through an [`Arc`].  Its byte view is chunk-oriented: [`send`](Socket::send)
/// queues one chunk for the peer, [`recv`](Socket::recv) yields the next
/// chunk received from it.
///
/// Implementations must keep `send` and the `Open → Closing` transition
/// mutually consistent: once [`ready_state`](Socket::ready_state) reports
/// `Closing`, no further chunk may be accepted.
pub trait Socket: Send + Sync + 'static {
    /// Returns a human-readable identifier for the remote end
    /// (e.g. `"127.0.0.1:54321"`).  Empty while still connecting.
    fn peer(&self) -> String;

    /// The lifecycle cell carrying this socket's state and its
    /// `open` / `close` signals.
    fn lifecycle(&self) -> &Lifecycle;

    /// Queues `chunk` for the peer.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotOpen`] if the socket is not `Open`.
    fn send(&self, chunk: Bytes) -> Result<(), BridgeError>;

    /// Receives the next inbound chunk.
    ///
    /// Returns `None` once the peer has ended its stream or the socket is
    /// closed.
    fn recv(&self) -> impl Future<Output = Option<Result<Bytes, BridgeError>>> + Send + '_;

    /// Requests graceful closure.
    ///
    /// Closing a socket that is still `Connecting` is not well defined for
    /// every transport; callers should wait for [`Lifecycle::opened`] first.
    fn close(&self);

    /// Tears the socket down immediately, whatever its state.
    fn terminate(&self);

    /// Shorthand for `self.lifecycle().state()`.
    fn ready_state(&self) -> ReadyState {
        self.lifecycle().state()
    }
}

/// An opaque application session carried over a socket.
///
/// The stream's framing is never interpreted.  Bytes received from the
/// socket are handed to [`write`](ProtocolStream::write); bytes the session
/// wants to send are pulled with [`read`](ProtocolStream::read).
pub trait ProtocolStream: Send + Sync + 'static {
    /// Feeds one inbound chunk into the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream has been destroyed.
    fn write(&self, chunk: Bytes) -> impl Future<Output = Result<(), BridgeError>> + Send + '_;

    /// Pulls the next outbound chunk.
    ///
    /// Returns `None` once the session has finished its output, and
    /// `Some(Err(..))` if it was destroyed.
    fn read(&self) -> impl Future<Output = Option<Result<Bytes, BridgeError>>> + Send + '_;

    /// Resolves once the session is ready for its first write.
    ///
    /// Yields `false` if the stream was destroyed before it opened.
    fn opened(&self) -> impl Future<Output = bool> + Send + '_;

    /// Graceful half-close: no more input, pending output drains.
    fn end(&self);

    /// Immediate abnormal teardown, optionally carrying the cause.
    fn destroy(&self, reason: Option<BridgeError>);

    /// Resolves once the stream is fully torn down.
    fn closed(&self) -> impl Future<Output = ()> + Send + '_;

    /// `true` after [`destroy`](ProtocolStream::destroy) or once closed.
    fn is_destroyed(&self) -> bool;
}

/// Factory for outbound sockets (client side).
///
/// Unlike a listener, `connect` does not wait for the connection: the
/// returned socket starts in [`ReadyState::Connecting`] and reports the
/// outcome through its lifecycle.
pub trait Connector: Send + Sync + 'static {
    /// The concrete socket type produced by [`connect`](Connector::connect).
    type Socket: Socket;

    /// Starts connecting to `addr`.
    fn connect(&self, addr: &str) -> Arc<Self::Socket>;
}

/// An async listener that accepts incoming sockets.
pub trait Listener: Send + 'static {
    /// The concrete socket type produced by [`accept`](Listener::accept).
    type Socket: Socket;

    /// Returns the local address the listener is bound to
    /// (e.g. `"0.0.0.0:9000"`).
    fn local_addr(&self) -> String;

    /// Waits for and accepts the next inbound connection.
    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Arc<Self::Socket>>> + Send + '_;
}

/// Factory for creating [`Listener`] instances.
///
/// Separating creation from usage lets callers stay generic over the
/// transport: pass a TCP factory in production and an in-memory one in tests.
pub trait ListenerFactory: Send + Sync + 'static {
    /// The concrete listener type produced by [`bind`](ListenerFactory::bind).
    type L: Listener;

    /// Binds a new listener to the given address.
    ///
    /// Use `"<ip>:0"` to let the OS assign an available port.
    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a;
}
