use tokio::sync::broadcast;
use tracing::{debug, trace};

use wirebridge_core::error::BridgeError;
use wirebridge_core::lifecycle::ReadyState;
use wirebridge_core::transport::{ProtocolStream, Socket};

use crate::bridge::{self, BridgeEvent};
use crate::guard::OutboundGuard;

/// Runs both directions of an assembled pipe until they finish.
///
/// - socket → stream: every received chunk is written into the stream
///   (and published as [`BridgeEvent::Message`]); end of input ends the
///   stream, unless the socket recorded a failure, which is returned.
/// - stream → guard → socket: every chunk the stream produces goes through
///   an [`OutboundGuard`]; end of output closes the socket.
///
/// The first error from either leg stops the other one and is returned.
///
/// # Errors
///
/// Returns the first socket, stream or send error observed.
pub async fn run<S, P>(
    socket: &S,
    stream: &P,
    events: &broadcast::Sender<BridgeEvent>,
) -> Result<(), BridgeError>
where
    S: Socket,
    P: ProtocolStream,
{
    tokio::try_join!(inbound(socket, stream, events), outbound(socket, stream))?;
    Ok(())
}

async fn inbound<S: Socket, P: ProtocolStream>(
    socket: &S,
    stream: &P,
    events: &broadcast::Sender<BridgeEvent>,
) -> Result<(), BridgeError> {
    while let Some(chunk) = socket.recv().await {
        let chunk = chunk?;
        bridge::publish(events, || BridgeEvent::Message {
            data: chunk.clone(),
        });
        stream.write(chunk).await?;
    }
    // A socket that broke without handing the error to `recv` (a failed
    // write, say) still recorded it.
    if let Some(err) = socket.lifecycle().failure() {
        return Err(err);
    }
    trace!("Socket input ended, ending protocol stream");
    stream.end();
    Ok(())
}

async fn outbound<S: Socket, P: ProtocolStream>(socket: &S, stream: &P) -> Result<(), BridgeError> {
    let mut guard = OutboundGuard::new(socket);
    while let Some(chunk) = stream.read().await {
        guard.forward(chunk?)?;
    }

    if guard.dropped_chunks() > 0 {
        debug!(
            chunks = guard.dropped_chunks(),
            bytes = guard.dropped_bytes(),
            "Dropped output produced after the socket began closing"
        );
    }
    if socket.ready_state() == ReadyState::Open {
        trace!("Protocol output ended, closing socket");
        socket.close();
    }
    Ok(())
}
