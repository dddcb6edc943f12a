use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use wirebridge_core::config::SocketConfig;
use wirebridge_core::error::BridgeError;
use wirebridge_core::lifecycle::{Lifecycle, ReadyState};
use wirebridge_core::transport::Socket;

/// An established byte transport that a [`StreamSocket`] can drive.
///
/// Implemented for TCP streams, QUIC bidirectional streams and in-memory
/// duplex pipes.
pub trait Transport: Send + 'static {
    type Reader: AsyncRead + Send + Unpin + 'static;
    type Writer: AsyncWrite + Send + Unpin + 'static;

    /// Returns a human-readable identifier for the remote end.
    fn peer(&self) -> String;

    /// Splits the transport into independently owned halves.
    fn into_split(self) -> (Self::Reader, Self::Writer);
}

impl Transport for DuplexStream {
    type Reader = ReadHalf<DuplexStream>;
    type Writer = WriteHalf<DuplexStream>;

    fn peer(&self) -> String {
        "memory".into()
    }

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        tokio::io::split(self)
    }
}

enum Outgoing {
    Data(Bytes),
    Close,
}

/// A [`Socket`] driven over any [`Transport`].
///
/// A background driver owns the transport.  It performs the connect, then
/// runs a reader task (feeding [`recv`](Socket::recv)) and a writer loop
/// (draining [`send`](Socket::send)).  The writer shuts the write half down
/// once a close has been requested, either locally or because the peer
/// ended its stream, and the socket reaches `Closed` when both halves are
/// done.
///
/// Dropping every handle does not close the socket; call
/// [`close`](Socket::close) or [`terminate`](Socket::terminate).
pub struct StreamSocket {
    peer: OnceLock<String>,
    lifecycle: Lifecycle,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Result<Bytes, BridgeError>>>,
    /// Serialises `send` against state transitions so that no chunk is
    /// queued once the socket is `Closing`.
    transition: Mutex<()>,
    close_deferred: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
}

type Channels = (
    mpsc::UnboundedReceiver<Outgoing>,
    mpsc::Sender<Result<Bytes, BridgeError>>,
);

impl StreamSocket {
    fn with_state(initial: ReadyState, config: &SocketConfig) -> (Arc<Self>, Channels) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let socket = Arc::new(Self {
            peer: OnceLock::new(),
            lifecycle: Lifecycle::new(initial),
            outgoing: outgoing_tx,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            transition: Mutex::new(()),
            close_deferred: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        (socket, (outgoing_rx, incoming_tx))
    }

    /// Creates a socket in `Connecting` whose transport is produced by `connect`.
    ///
    /// Returns immediately; the outcome is reported through the lifecycle.
    /// Must be called from within a Tokio runtime.
    pub fn connecting<T, F>(connect: F, config: &SocketConfig) -> Arc<Self>
    where
        T: Transport,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (socket, (outgoing_rx, incoming_tx)) = Self::with_state(ReadyState::Connecting, config);
        let driver = tokio::spawn(drive(
            Arc::clone(&socket),
            connect,
            outgoing_rx,
            incoming_tx,
            config.clone(),
        ));
        socket.track(driver.abort_handle());
        socket
    }

    /// Wraps an already established transport; the socket starts `Open`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open<T: Transport>(transport: T, config: &SocketConfig) -> Arc<Self> {
        let (socket, (outgoing_rx, incoming_tx)) = Self::with_state(ReadyState::Open, config);
        let _ = socket.peer.set(transport.peer());
        let driver = tokio::spawn(run(
            Arc::clone(&socket),
            transport,
            outgoing_rx,
            incoming_tx,
            config.clone(),
        ));
        socket.track(driver.abort_handle());
        socket
    }

    /// Two open sockets connected back to back through memory.
    #[must_use]
    pub fn pair(config: &SocketConfig) -> (Arc<Self>, Arc<Self>) {
        let (a, b) = tokio::io::duplex(config.read_chunk_size.max(1));
        (Self::open(a, config), Self::open(b, config))
    }

    fn lock_transition(&self) -> MutexGuard<'_, ()> {
        self.transition.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, handle: AbortHandle) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Marks the connection established.  A close requested while
    /// connecting takes effect right away.
    fn mark_open(&self, peer: String) {
        let _ = self.peer.set(peer);
        let _guard = self.lock_transition();
        self.lifecycle.advance(ReadyState::Open);
        if self.close_deferred.load(Ordering::Acquire) {
            self.lifecycle.advance(ReadyState::Closing);
        }
    }

    /// Called by the reader once the peer has ended its stream.
    fn peer_ended(&self) {
        let _guard = self.lock_transition();
        if self.lifecycle.state() == ReadyState::Open {
            self.lifecycle.advance(ReadyState::Closing);
            let _ = self.outgoing.send(Outgoing::Close);
        }
    }
}

impl Socket for StreamSocket {
    fn peer(&self) -> String {
        self.peer.get().cloned().unwrap_or_default()
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn send(&self, chunk: Bytes) -> Result<(), BridgeError> {
        let _guard = self.lock_transition();
        match self.lifecycle.state() {
            ReadyState::Open => self
                .outgoing
                .send(Outgoing::Data(chunk))
                .map_err(|_| BridgeError::NotOpen(self.lifecycle.state())),
            state => Err(BridgeError::NotOpen(state)),
        }
    }

    fn recv(&self) -> impl Future<Output = Option<Result<Bytes, BridgeError>>> + Send + '_ {
        async move { self.incoming.lock().await.recv().await }
    }

    fn close(&self) {
        let _guard = self.lock_transition();
        match self.lifecycle.state() {
            ReadyState::Connecting => {
                if !self.close_deferred.swap(true, Ordering::AcqRel) {
                    debug!("Close requested while connecting, deferring until open");
                    let _ = self.outgoing.send(Outgoing::Close);
                }
            }
            ReadyState::Open => {
                debug!(peer = %self.peer(), "Closing socket");
                self.lifecycle.advance(ReadyState::Closing);
                let _ = self.outgoing.send(Outgoing::Close);
            }
            ReadyState::Closing | ReadyState::Closed => {}
        }
    }

    fn terminate(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        let _guard = self.lock_transition();
        if self.lifecycle.advance(ReadyState::Closed) {
            debug!(peer = %self.peer(), "Socket terminated");
        }
    }
}

async fn drive<T, F>(
    socket: Arc<StreamSocket>,
    connect: F,
    outgoing: mpsc::UnboundedReceiver<Outgoing>,
    incoming: mpsc::Sender<Result<Bytes, BridgeError>>,
    config: SocketConfig,
) where
    T: Transport,
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let transport = match tokio::time::timeout(config.connect_timeout(), connect).await {
        Ok(Ok(transport)) => transport,
        Ok(Err(e)) => {
            warn!(error = %format!("{e:#}"), "Failed to connect");
            socket.lifecycle.fail(BridgeError::from_anyhow(&e));
            return;
        }
        Err(_) => {
            warn!(timeout = ?config.connect_timeout(), "Timed out while connecting");
            socket.lifecycle.fail(BridgeError::ConnectTimeout);
            return;
        }
    };

    socket.mark_open(transport.peer());
    info!(peer = %socket.peer(), "Socket open");
    run(socket, transport, outgoing, incoming, config).await;
}

async fn run<T: Transport>(
    socket: Arc<StreamSocket>,
    transport: T,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    incoming: mpsc::Sender<Result<Bytes, BridgeError>>,
    config: SocketConfig,
) {
    let peer = socket.peer();
    let (reader, mut writer) = transport.into_split();

    let mut reading = tokio::spawn(read_loop(
        Arc::clone(&socket),
        reader,
        incoming,
        config.read_chunk_size.max(1),
    ));
    socket.track(reading.abort_handle());

    // `true` once everything queued before the close request was written.
    let graceful = loop {
        tokio::select! {
            cmd = outgoing.recv() => match cmd {
                Some(Outgoing::Data(chunk)) => {
                    if let Err(e) = writer.write_all(&chunk).await {
                        if socket.lifecycle.state().is_closing() {
                            debug!(peer = %peer, error = %e, "Write failed while closing");
                        } else {
                            warn!(peer = %peer, error = %e, "Write failed, closing socket");
                            socket.lifecycle.fail(e.into());
                        }
                        break false;
                    }
                }
                Some(Outgoing::Close) | None => break true,
            },
            () = socket.lifecycle.closed() => break false,
        }
    };

    if graceful {
        socket.lifecycle.advance(ReadyState::Closing);
        if let Err(e) = writer.shutdown().await {
            debug!(peer = %peer, error = %e, "Failed to shut down write half");
        }

        if tokio::time::timeout(config.close_timeout(), &mut reading)
            .await
            .is_err()
        {
            debug!(peer = %peer, timeout = ?config.close_timeout(), "Peer did not end its stream in time");
            reading.abort();
        }
    } else {
        reading.abort();
    }

    if socket.lifecycle.advance(ReadyState::Closed) {
        info!(peer = %peer, "Socket closed");
    }
}

async fn read_loop<R>(
    socket: Arc<StreamSocket>,
    mut reader: R,
    incoming: mpsc::Sender<Result<Bytes, BridgeError>>,
    chunk_size: usize,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut buf = BytesMut::with_capacity(chunk_size);
    loop {
        buf.reserve(chunk_size);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!(peer = %socket.peer(), "Peer ended its stream");
                socket.peer_ended();
                return;
            }
            Ok(n) => {
                trace!(peer = %socket.peer(), bytes = n, "Received chunk");
                let chunk = buf.split().freeze();
                if incoming.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            Err(e) if socket.lifecycle.state().is_closing() => {
                debug!(peer = %socket.peer(), error = %e, "Read failed while closing, treating as end of stream");
                return;
            }
            Err(e) => {
                warn!(peer = %socket.peer(), error = %e, "Read failed");
                let err = BridgeError::from(e);
                // Queued behind the chunks already read, so the consumer
                // sees them first and then the failure.
                let _ = incoming.send(Err(err.clone())).await;
                socket.lifecycle.fail(err);
                return;
            }
        }
    }
}
