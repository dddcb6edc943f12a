use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, ensure};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::AsyncWrite;
use tracing::{debug, info};

use wirebridge_core::config::SocketConfig;
use wirebridge_core::transport::{Connector, Listener, ListenerFactory};

use crate::socket::{StreamSocket, Transport};

const ALPN_PROTOCOL: &[u8] = b"wirebridge/1";

/// Name the listener's certificate is issued for and the connector asks for.
const SERVER_NAME: &str = "localhost";

/// First byte on every bridged stream.  QUIC only announces a stream to
/// the peer once data flows on it, so the client writes this right after
/// opening the stream.
const STREAM_PREFACE: u8 = 0x57;

/// How long a finished send stream is kept alive for the peer to
/// acknowledge its final bytes.
const SEND_LINGER: Duration = Duration::from_secs(2);

/// One bidirectional QUIC stream, carrying the bytes of one socket.
pub struct QuicStream {
    peer: String,
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl QuicStream {
    fn new(connection: &quinn::Connection, send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
        Self {
            peer: connection.remote_address().to_string(),
            send,
            recv,
        }
    }
}

impl Transport for QuicStream {
    type Reader = quinn::RecvStream;
    type Writer = QuicWriter;

    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        (self.recv, QuicWriter { send: Some(self.send) })
    }
}

/// Write half of a [`QuicStream`].
///
/// On drop the send stream lingers in the background until the peer has
/// acknowledged everything (or [`SEND_LINGER`] elapses), so the connection
/// is not torn down with the final bytes still in flight.
pub struct QuicWriter {
    send: Option<quinn::SendStream>,
}

impl QuicWriter {
    fn send_mut(&mut self) -> io::Result<&mut quinn::SendStream> {
        self.send
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "QUIC send stream released"))
    }
}

impl AsyncWrite for QuicWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().send_mut() {
            Ok(send) => AsyncWrite::poll_write(Pin::new(send), cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().send_mut() {
            Ok(send) => AsyncWrite::poll_flush(Pin::new(send), cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().send_mut() {
            Ok(send) => AsyncWrite::poll_shutdown(Pin::new(send), cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl Drop for QuicWriter {
    fn drop(&mut self) {
        let Some(mut send) = self.send.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = send.finish();
                let _ = tokio::time::timeout(SEND_LINGER, send.stopped()).await;
            });
        }
    }
}

/// Opens outbound QUIC sockets from a shared client endpoint.
///
/// Server certificates are not verified: authenticating the peer is the
/// protocol session's job, not the transport's.
pub struct QuicConnector {
    endpoint: quinn::Endpoint,
    server_name: String,
    config: SocketConfig,
}

impl QuicConnector {
    /// Creates a client endpoint bound to an ephemeral local port.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be bound or the TLS
    /// configuration fails to build.
    pub fn new(config: SocketConfig) -> anyhow::Result<Self> {
        let bind_addr: SocketAddr = "0.0.0.0:0".parse().context("invalid client bind address")?;
        let mut endpoint =
            quinn::Endpoint::client(bind_addr).context("failed to create QUIC client endpoint")?;
        endpoint.set_default_client_config(insecure_client_config()?);
        Ok(Self {
            endpoint,
            server_name: SERVER_NAME.into(),
            config,
        })
    }
}

impl Connector for QuicConnector {
    type Socket = StreamSocket;

    fn connect(&self, addr: &str) -> Arc<StreamSocket> {
        let endpoint = self.endpoint.clone();
        let server_name = self.server_name.clone();
        let addr = addr.to_string();
        debug!(addr = %addr, "Connecting over QUIC");

        StreamSocket::connecting(
            async move {
                let socket_addr: SocketAddr = addr
                    .parse()
                    .with_context(|| format!("invalid QUIC address: {addr}"))?;
                let connection = endpoint
                    .connect(socket_addr, &server_name)
                    .context("failed to start QUIC connection")?
                    .await
                    .with_context(|| format!("failed to complete QUIC handshake with {addr}"))?;
                let (mut send, recv) = connection
                    .open_bi()
                    .await
                    .context("failed to open QUIC stream")?;
                send.write_all(&[STREAM_PREFACE])
                    .await
                    .context("failed to write stream preface")?;
                Ok(QuicStream::new(&connection, send, recv))
            },
            &self.config,
        )
    }
}

/// A QUIC listener wrapping a [`quinn::Endpoint`].
pub struct QuicListener {
    endpoint: quinn::Endpoint,
    local_addr: String,
    config: SocketConfig,
}

impl Listener for QuicListener {
    type Socket = StreamSocket;

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    /// Completes the QUIC handshake and returns a socket that stays
    /// `Connecting` until the client's stream arrives.
    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Arc<StreamSocket>>> + Send + '_ {
        async move {
            let incoming = self
                .endpoint
                .accept()
                .await
                .context("QUIC endpoint closed")?;

            let connection = incoming
                .await
                .context("failed to complete QUIC handshake")?;
            debug!(peer = %connection.remote_address(), "Accepted QUIC connection");

            Ok(StreamSocket::connecting(
                async move {
                    let (send, mut recv) = connection
                        .accept_bi()
                        .await
                        .context("failed to accept QUIC stream")?;
                    let mut preface = [0u8; 1];
                    recv.read_exact(&mut preface)
                        .await
                        .context("failed to read stream preface")?;
                    ensure!(
                        preface[0] == STREAM_PREFACE,
                        "unexpected stream preface: 0x{:02X}",
                        preface[0]
                    );
                    Ok(QuicStream::new(&connection, send, recv))
                },
                &self.config,
            ))
        }
    }
}

/// Factory that binds [`QuicListener`] instances on the given address.
///
/// A self-signed certificate is generated at construction time and reused
/// for every listener.
pub struct QuicListenerFactory {
    server_config: quinn::ServerConfig,
    config: SocketConfig,
}

impl QuicListenerFactory {
    /// # Errors
    ///
    /// Returns an error if certificate generation or TLS configuration fails.
    pub fn new(config: SocketConfig) -> anyhow::Result<Self> {
        let server_config = build_server_config()?;
        Ok(Self {
            server_config,
            config,
        })
    }
}

impl ListenerFactory for QuicListenerFactory {
    type L = QuicListener;

    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a {
        async move {
            let socket_addr: SocketAddr = addr
                .parse()
                .with_context(|| format!("invalid bind address: {addr}"))?;

            let endpoint = quinn::Endpoint::server(self.server_config.clone(), socket_addr)
                .with_context(|| format!("failed to bind QUIC endpoint on {addr}"))?;

            let local_addr = endpoint
                .local_addr()
                .context("failed to retrieve local address")?
                .to_string();

            info!(addr = %local_addr, "QUIC listener bound");

            Ok(QuicListener {
                endpoint,
                local_addr,
                config: self.config.clone(),
            })
        }
    }
}

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// A throwaway certificate for [`SERVER_NAME`].  Clients skip verification,
/// so nothing outlives the listener factory that made it.
fn self_signed_identity() -> anyhow::Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let certified = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
        .context("failed to generate self-signed certificate")?;
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
    Ok((certified.cert.der().clone(), key.into()))
}

fn build_server_config() -> anyhow::Result<quinn::ServerConfig> {
    let (cert_der, key_der) = self_signed_identity()?;

    let mut tls_config = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS 1.3")?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .context("failed to build rustls server config")?;

    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let quic_config: QuicServerConfig = tls_config
        .try_into()
        .context("failed to build QUIC server config")?;

    Ok(quinn::ServerConfig::with_crypto(Arc::new(quic_config)))
}

/// Builds a QUIC client config that skips server certificate verification.
///
/// # Errors
///
/// Returns an error if the TLS client configuration fails to build.
pub fn insecure_client_config() -> anyhow::Result<quinn::ClientConfig> {
    let mut tls_config = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS 1.3")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();

    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let quic_config: QuicClientConfig = tls_config
        .try_into()
        .context("failed to build QUIC client config")?;

    Ok(quinn::ClientConfig::new(Arc::new(quic_config)))
}

#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
