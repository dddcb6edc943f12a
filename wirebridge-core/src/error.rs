use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::lifecycle::ReadyState;

/// Error carried between the two endpoints of a bridge.
///
/// Unlike the `anyhow` errors returned by setup operations, a `BridgeError`
/// has to be handed to more than one party (the protocol stream it destroys
/// and every event subscriber), so it is cheap to clone and keeps the
/// originating [`io::Error`] intact behind an [`Arc`].
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// The underlying transport failed.
    #[error("socket I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// The socket did not finish connecting within the configured timeout.
    #[error("timed out while connecting")]
    ConnectTimeout,

    /// The socket reached `Closed` without ever being `Open`.
    #[error("socket closed before it was opened")]
    ClosedBeforeOpen,

    /// A chunk was offered to a socket that is not `Open`.
    #[error("socket is not open (state: {0:?})")]
    NotOpen(ReadyState),

    /// The protocol stream was destroyed while data was still moving.
    #[error("protocol stream destroyed")]
    Destroyed,

    /// A transport-level failure that is not an [`io::Error`]
    /// (handshake, TLS, stream negotiation, …).
    #[error("transport error: {0}")]
    Transport(String),
}

impl BridgeError {
    /// Returns the kind of the underlying I/O error, if this is one.
    #[must_use]
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Io(err) => Some(err.kind()),
            _ => None,
        }
    }

    /// Wraps an arbitrary setup error, preserving an inner [`io::Error`]
    /// when the chain contains one.
    #[must_use]
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(io_err) = cause.downcast_ref::<io::Error>() {
                return Self::Io(Arc::new(io::Error::new(io_err.kind(), format!("{err:#}"))));
            }
        }
        Self::Transport(format!("{err:#}"))
    }
}

impl From<io::Error> for BridgeError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}
