use std::sync::Arc;

use anyhow::Context;
use tokio::net::{self, TcpStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info};

use wirebridge_core::config::SocketConfig;
use wirebridge_core::transport::{Connector, Listener, ListenerFactory};

use crate::socket::{StreamSocket, Transport};

impl Transport for TcpStream {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    fn peer(&self) -> String {
        self.peer_addr().map(|a| a.to_string()).unwrap_or_default()
    }

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        TcpStream::into_split(self)
    }
}

/// Opens outbound TCP sockets.
///
/// [`connect`](Connector::connect) returns at once with a socket in
/// `Connecting`; the TCP handshake runs in the socket's driver.
#[derive(Clone, Debug, Default)]
pub struct TcpConnector {
    config: SocketConfig,
}

impl TcpConnector {
    #[must_use]
    pub fn new(config: SocketConfig) -> Self {
        Self { config }
    }
}

impl Connector for TcpConnector {
    type Socket = StreamSocket;

    fn connect(&self, addr: &str) -> Arc<StreamSocket> {
        let addr = addr.to_string();
        debug!(addr = %addr, "Connecting over TCP");
        StreamSocket::connecting(
            async move {
                let stream = TcpStream::connect(&addr)
                    .await
                    .with_context(|| format!("failed to connect to {addr}"))?;
                stream
                    .set_nodelay(true)
                    .context("failed to disable Nagle's algorithm")?;
                Ok(stream)
            },
            &self.config,
        )
    }
}

/// A TCP listener wrapping a [`tokio::net::TcpListener`].
pub struct TcpListener {
    inner: net::TcpListener,
    local_addr: String,
    config: SocketConfig,
}

impl Listener for TcpListener {
    type Socket = StreamSocket;

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Arc<StreamSocket>>> + Send + '_ {
        async move {
            let (stream, addr) = self
                .inner
                .accept()
                .await
                .context("failed to accept TCP connection")?;
            stream
                .set_nodelay(true)
                .context("failed to disable Nagle's algorithm")?;
            debug!(peer = %addr, "Accepted TCP connection");
            Ok(StreamSocket::open(stream, &self.config))
        }
    }
}

/// Factory that binds [`TcpListener`] instances on the given address.
#[derive(Clone, Debug, Default)]
pub struct TcpListenerFactory {
    config: SocketConfig,
}

impl TcpListenerFactory {
    #[must_use]
    pub fn new(config: SocketConfig) -> Self {
        Self { config }
    }
}

impl ListenerFactory for TcpListenerFactory {
    type L = TcpListener;

    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a {
        async move {
            let inner = net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind TCP listener on {addr}"))?;
            let local_addr = inner
                .local_addr()
                .context("failed to retrieve local address")?
                .to_string();
            info!(addr = %local_addr, "TCP listener bound");
            Ok(TcpListener {
                inner,
                local_addr,
                config: self.config.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::time::timeout;

    use wirebridge_core::lifecycle::ReadyState;
    use wirebridge_core::transport::Socket;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn when_binding_invalid_address_expect_error() {
        let factory = TcpListenerFactory::default();
        let result = factory.bind("999.999.999.999:0").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn when_client_connects_expect_accepted_socket_open_with_client_peer() {
        let factory = TcpListenerFactory::default();
        let mut listener = factory.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let client = TcpConnector::default().connect(&addr);
        let server = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        timeout(WAIT, client.lifecycle().opened())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(server.ready_state(), ReadyState::Open);
        assert_eq!(client.peer(), addr);
        assert!(server.peer().starts_with("127.0.0.1:"));
    }

    #[tokio::test]
    async fn when_two_clients_connect_expect_distinct_peers() {
        let factory = TcpListenerFactory::default();
        let mut listener = factory.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        let connector = TcpConnector::default();

        let _c1 = connector.connect(&addr);
        let s1 = listener.accept().await.unwrap();
        let _c2 = connector.connect(&addr);
        let s2 = listener.accept().await.unwrap();

        assert_ne!(
            s1.peer(),
            s2.peer(),
            "each socket should have a distinct peer address"
        );
    }

    #[tokio::test]
    async fn when_connecting_to_closed_port_expect_connection_refused() {
        let socket = TcpConnector::default().connect("127.0.0.1:1");
        let err = timeout(WAIT, socket.lifecycle().opened())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::ConnectionRefused));
        assert_eq!(socket.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn when_client_sends_and_closes_expect_server_reads_then_both_closed() {
        let mut listener = TcpListenerFactory::default()
            .bind("127.0.0.1:0")
            .await
            .unwrap();
        let client = TcpConnector::default().connect(&listener.local_addr());
        let server = listener.accept().await.unwrap();
        client.lifecycle().opened().await.unwrap();

        client.send(Bytes::from_static(b"over tcp")).unwrap();
        client.close();

        let mut received = Vec::new();
        while let Some(chunk) = timeout(WAIT, server.recv()).await.unwrap() {
            received.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(received, b"over tcp");

        timeout(WAIT, client.lifecycle().closed()).await.unwrap();
        timeout(WAIT, server.lifecycle().closed()).await.unwrap();
    }
}
