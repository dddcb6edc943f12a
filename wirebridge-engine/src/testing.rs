//! Scripted endpoints for ordering-sensitive tests.
//!
//! Both fakes write what happens to them into a shared [`Journal`], so a
//! test can assert on the relative order of socket and stream operations.
//! [`ScriptedTransport`] sits one level lower and feeds a real
//! [`StreamSocket`](crate::socket::StreamSocket).

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, watch};

use wirebridge_core::error::BridgeError;
use wirebridge_core::lifecycle::{Lifecycle, ReadyState};
use wirebridge_core::transport::{ProtocolStream, Socket};

use crate::socket::Transport;

pub(crate) const WAIT: Duration = Duration::from_secs(5);

/// Polls `condition` until it holds, failing the test after [`WAIT`].
pub(crate) async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let polled = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

#[derive(Default)]
pub(crate) struct Journal {
    entries: Mutex<Vec<&'static str>>,
}

impl Journal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn record(&self, entry: &'static str) {
        self.entries.lock().unwrap().push(entry);
    }

    pub(crate) fn entries(&self) -> Vec<&'static str> {
        self.entries.lock().unwrap().clone()
    }

    pub(crate) fn contains(&self, entry: &str) -> bool {
        self.entries().contains(&entry)
    }

    pub(crate) fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| **e == entry).count()
    }

    /// Position of the first occurrence of `entry`.
    pub(crate) fn index_of(&self, entry: &str) -> usize {
        self.entries()
            .iter()
            .position(|e| *e == entry)
            .unwrap_or_else(|| panic!("{entry} not in journal: {:?}", self.entries()))
    }
}

/// A socket whose lifecycle is moved by hand.
pub(crate) struct FakeSocket {
    lifecycle: Lifecycle,
    journal: Arc<Journal>,
    sent: Mutex<Vec<Bytes>>,
    inbound_tx: mpsc::UnboundedSender<Result<Bytes, BridgeError>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Bytes, BridgeError>>>,
    hold_close: AtomicBool,
    race_close: AtomicBool,
    closing_after: AtomicUsize,
}

impl FakeSocket {
    pub(crate) fn new(initial: ReadyState, journal: &Arc<Journal>) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            lifecycle: Lifecycle::new(initial),
            journal: Arc::clone(journal),
            sent: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            hold_close: AtomicBool::new(false),
            race_close: AtomicBool::new(false),
            closing_after: AtomicUsize::new(usize::MAX),
        })
    }

    pub(crate) fn open(&self) {
        self.journal.record("socket.open");
        self.lifecycle.advance(ReadyState::Open);
    }

    /// The peer starts closing, as if its close frame just arrived.
    pub(crate) fn begin_closing(&self) {
        self.lifecycle.advance(ReadyState::Closing);
    }

    /// Keeps the socket in `Closing` after `close()` until [`finish_close`](Self::finish_close).
    pub(crate) fn hold_close(&self) {
        self.hold_close.store(true, Ordering::SeqCst);
    }

    pub(crate) fn finish_close(&self) {
        self.journal.record("socket.closed");
        self.lifecycle.advance(ReadyState::Closed);
    }

    /// Enters `Closing` once `n` chunks have been accepted.
    pub(crate) fn closing_after(&self, n: usize) {
        self.closing_after.store(n, Ordering::SeqCst);
    }

    /// Makes the next `send` lose the race against a concurrent close.
    pub(crate) fn race_close(&self) {
        self.race_close.store(true, Ordering::SeqCst);
    }

    pub(crate) fn push_inbound(&self, chunk: &'static [u8]) {
        self.inbound_tx.send(Ok(Bytes::from_static(chunk))).unwrap();
    }

    /// Queues a read failure, as if the transport broke.
    pub(crate) fn push_error(&self, err: BridgeError) {
        self.inbound_tx.send(Err(err)).unwrap();
    }

    /// Breaks the socket without handing the error to `recv`.
    pub(crate) fn fail(&self, err: BridgeError) {
        self.journal.record("socket.fail");
        self.lifecycle.fail(err);
    }

    pub(crate) fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }
}

impl Socket for FakeSocket {
    fn peer(&self) -> String {
        "fake".to_string()
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn send(&self, chunk: Bytes) -> Result<(), BridgeError> {
        if self.race_close.swap(false, Ordering::SeqCst) {
            self.lifecycle.advance(ReadyState::Closing);
        }
        let state = self.lifecycle.state();
        if state != ReadyState::Open {
            return Err(BridgeError::NotOpen(state));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(chunk);
        if sent.len() >= self.closing_after.load(Ordering::SeqCst) {
            self.lifecycle.advance(ReadyState::Closing);
        }
        Ok(())
    }

    fn recv(&self) -> impl Future<Output = Option<Result<Bytes, BridgeError>>> + Send + '_ {
        async move {
            let mut inbound = self.inbound_rx.lock().await;
            tokio::select! {
                biased;
                chunk = inbound.recv() => chunk,
                () = self.lifecycle.closed() => None,
            }
        }
    }

    fn close(&self) {
        if self.lifecycle.state() == ReadyState::Connecting {
            self.journal.record("socket.close.connecting");
        }
        self.journal.record("socket.close");
        self.lifecycle.advance(ReadyState::Closing);
        if !self.hold_close.load(Ordering::SeqCst) {
            self.finish_close();
        }
    }

    fn terminate(&self) {
        self.journal.record("socket.terminate");
        self.lifecycle.advance(ReadyState::Closed);
    }
}

/// A protocol stream whose readiness and teardown are moved by hand.
pub(crate) struct FakeStream {
    journal: Arc<Journal>,
    written: Mutex<Vec<u8>>,
    output_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    output_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    opened: watch::Sender<Option<bool>>,
    closed: watch::Sender<bool>,
    destroyed: AtomicBool,
    ended: AtomicBool,
    hold_close: AtomicBool,
    reason: Mutex<Option<BridgeError>>,
}

impl FakeStream {
    pub(crate) fn new(opened: bool, journal: &Arc<Journal>) -> Arc<Self> {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (opened, _) = watch::channel(opened.then_some(true));
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            journal: Arc::clone(journal),
            written: Mutex::new(Vec::new()),
            output_tx: Mutex::new(Some(output_tx)),
            output_rx: tokio::sync::Mutex::new(output_rx),
            opened,
            closed,
            destroyed: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            hold_close: AtomicBool::new(false),
            reason: Mutex::new(None),
        })
    }

    pub(crate) fn mark_opened(&self) {
        self.opened.send_if_modified(|o| settle(o, true));
    }

    pub(crate) fn push_output(&self, chunk: &'static [u8]) {
        if let Some(tx) = self.output_tx.lock().unwrap().as_ref() {
            tx.send(Bytes::from_static(chunk)).unwrap();
        }
    }

    pub(crate) fn finish_output(&self) {
        self.output_tx.lock().unwrap().take();
    }

    /// Delays the close signal after `end()` until [`finish_close`](Self::finish_close).
    pub(crate) fn hold_close(&self) {
        self.hold_close.store(true, Ordering::SeqCst);
    }

    pub(crate) fn finish_close(&self) {
        self.journal.record("stream.closed");
        self.closed.send_replace(true);
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub(crate) fn was_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn was_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub(crate) fn reason(&self) -> Option<BridgeError> {
        self.reason.lock().unwrap().clone()
    }
}

fn settle(opened: &mut Option<bool>, value: bool) -> bool {
    if opened.is_some() {
        return false;
    }
    *opened = Some(value);
    true
}

impl ProtocolStream for FakeStream {
    fn write(&self, chunk: Bytes) -> impl Future<Output = Result<(), BridgeError>> + Send + '_ {
        async move {
            if self.was_destroyed() {
                return Err(BridgeError::Destroyed);
            }
            self.written.lock().unwrap().extend_from_slice(&chunk);
            Ok(())
        }
    }

    fn read(&self) -> impl Future<Output = Option<Result<Bytes, BridgeError>>> + Send + '_ {
        async move {
            if self.was_destroyed() {
                return Some(Err(BridgeError::Destroyed));
            }
            let mut output = self.output_rx.lock().await;
            let mut closed = self.closed.subscribe();
            tokio::select! {
                biased;
                chunk = output.recv() => chunk.map(Ok),
                _ = closed.wait_for(|c| *c) => {
                    self.was_destroyed().then_some(Err(BridgeError::Destroyed))
                }
            }
        }
    }

    fn opened(&self) -> impl Future<Output = bool> + Send + '_ {
        async move {
            let mut opened = self.opened.subscribe();
            let result = opened.wait_for(Option::is_some).await.map(|o| *o == Some(true));
            result.unwrap_or(false)
        }
    }

    fn end(&self) {
        self.journal.record("stream.end");
        self.ended.store(true, Ordering::SeqCst);
        self.finish_output();
        if !self.hold_close.load(Ordering::SeqCst) {
            self.finish_close();
        }
    }

    fn destroy(&self, reason: Option<BridgeError>) {
        self.journal.record("stream.destroy");
        if let Some(reason) = reason {
            self.reason.lock().unwrap().get_or_insert(reason);
        }
        self.destroyed.store(true, Ordering::SeqCst);
        self.opened.send_if_modified(|o| settle(o, false));
        self.finish_output();
        self.finish_close();
    }

    fn closed(&self) -> impl Future<Output = ()> + Send + '_ {
        async move {
            let mut closed = self.closed.subscribe();
            let _ = closed.wait_for(|c| *c).await;
        }
    }

    fn is_destroyed(&self) -> bool {
        self.was_destroyed() || *self.closed.borrow()
    }
}

/// A byte transport that plays back a fixed script.
///
/// Reads return the scripted steps in order and then stay pending.  Writes
/// either all succeed or all fail with the configured error.
pub(crate) struct ScriptedTransport {
    reads: VecDeque<io::Result<&'static [u8]>>,
    write_error: Option<io::ErrorKind>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self {
            reads: VecDeque::new(),
            write_error: None,
        }
    }

    pub(crate) fn read(mut self, chunk: &'static [u8]) -> Self {
        self.reads.push_back(Ok(chunk));
        self
    }

    pub(crate) fn read_error(mut self, kind: io::ErrorKind) -> Self {
        self.reads.push_back(Err(kind.into()));
        self
    }

    pub(crate) fn write_error(mut self, kind: io::ErrorKind) -> Self {
        self.write_error = Some(kind);
        self
    }
}

impl Transport for ScriptedTransport {
    type Reader = ScriptedReader;
    type Writer = ScriptedWriter;

    fn peer(&self) -> String {
        "scripted".into()
    }

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        (
            ScriptedReader { steps: self.reads },
            ScriptedWriter {
                error: self.write_error,
            },
        )
    }
}

pub(crate) struct ScriptedReader {
    steps: VecDeque<io::Result<&'static [u8]>>,
}

impl AsyncRead for ScriptedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.steps.pop_front() {
            Some(Ok(chunk)) => {
                assert!(chunk.len() <= buf.remaining(), "scripted chunk larger than read buffer");
                buf.put_slice(chunk);
                Poll::Ready(Ok(()))
            }
            Some(Err(e)) => Poll::Ready(Err(e)),
            None => Poll::Pending,
        }
    }
}

pub(crate) struct ScriptedWriter {
    error: Option<io::ErrorKind>,
}

impl AsyncWrite for ScriptedWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(match self.error {
            Some(kind) => Err(kind.into()),
            None => Ok(buf.len()),
        })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
