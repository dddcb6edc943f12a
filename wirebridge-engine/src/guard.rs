use bytes::Bytes;
use tracing::trace;

use wirebridge_core::error::BridgeError;
use wirebridge_core::transport::Socket;

/// Outcome of offering one chunk to an [`OutboundGuard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    Sent,
    /// The socket was closing; the chunk was consumed without a write.
    Dropped,
}

/// Sits between a protocol stream's output and a socket.
///
/// Each chunk is checked against the socket's state at the moment it is
/// offered: chunks reaching a socket that is `Closing` or `Closed` are
/// discarded instead of failing the pipe.
pub struct OutboundGuard<'a, S> {
    socket: &'a S,
    dropped_chunks: usize,
    dropped_bytes: usize,
}

impl<'a, S: Socket> OutboundGuard<'a, S> {
    #[must_use]
    pub fn new(socket: &'a S) -> Self {
        Self {
            socket,
            dropped_chunks: 0,
            dropped_bytes: 0,
        }
    }

    /// Forwards `chunk` to the socket unless it has begun closing.
    ///
    /// # Errors
    ///
    /// Returns the socket's error for any refusal other than closing,
    /// e.g. a socket that is still `Connecting`.
    pub fn forward(&mut self, chunk: Bytes) -> Result<Forwarded, BridgeError> {
        let len = chunk.len();
        let state = self.socket.ready_state();
        if state.is_closing() {
            return Ok(self.discard(len));
        }
        match self.socket.send(chunk) {
            Ok(()) => Ok(Forwarded::Sent),
            // Closed between the state check and the send.
            Err(BridgeError::NotOpen(state)) if state.is_closing() => Ok(self.discard(len)),
            Err(err) => Err(err),
        }
    }

    fn discard(&mut self, len: usize) -> Forwarded {
        self.dropped_chunks += 1;
        self.dropped_bytes += len;
        trace!(bytes = len, "Socket closing, dropping outbound chunk");
        Forwarded::Dropped
    }

    #[must_use]
    pub fn dropped_chunks(&self) -> usize {
        self.dropped_chunks
    }

    #[must_use]
    pub fn dropped_bytes(&self) -> usize {
        self.dropped_bytes
    }
}
