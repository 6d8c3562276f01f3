//! Forwarding of one inbound Access stream to the local target.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::debug;
use wormhole_shared::protocol::{Header, MessageType};

use crate::transport::{split_host_port, MuxStream, TransportError};

/// Where forwarded bytes go: the local service being exposed.
#[derive(Clone)]
pub struct Target {
    addr: String,
    server_name: Option<ServerName<'static>>,
    connector: Option<TlsConnector>,
}

impl Target {
    /// Parse `host:port`. An empty host means loopback. With `tls`, the
    /// local leg is TLS with certificate verification disabled — the target
    /// is assumed to be a local, self-signed service.
    pub fn new(target_addr: &str, tls: bool) -> Result<Self, TransportError> {
        let (host, port) = split_host_port(target_addr)?;
        let host = if host.is_empty() { "127.0.0.1" } else { host };
        let addr = format!("{host}:{port}");

        if !tls {
            return Ok(Self {
                addr,
                server_name: None,
                connector: None,
            });
        }

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| TransportError::InvalidAddress(target_addr.to_string()))?;
        Ok(Self {
            addr,
            server_name: Some(server_name),
            connector: Some(insecure_connector()),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

/// Forward one Access stream: acknowledge, dial the target, splice until
/// either side finishes, then close both halves.
pub(crate) async fn run(mut stream: MuxStream, target: Target) -> io::Result<()> {
    let result = forward_inner(&mut stream, &target).await;
    let _ = stream.shutdown().await;
    result
}

async fn forward_inner(stream: &mut MuxStream, target: &Target) -> io::Result<()> {
    // The server holds the public connection until it sees the Ack.
    let ack = Header::new(MessageType::Ack, 0)
        .to_bytes()
        .map_err(io::Error::other)?;
    stream.write_all(&ack).await?;
    stream.flush().await?;

    let tcp = TcpStream::connect(target.addr()).await?;
    tcp.set_nodelay(true)?;

    match (&target.connector, &target.server_name) {
        (Some(connector), Some(name)) => {
            let local = connector.connect(name.clone(), tcp).await?;
            splice(stream, local).await
        }
        _ => splice(stream, tcp).await,
    }
}

async fn splice<L>(stream: &mut MuxStream, mut local: L) -> io::Result<()>
where
    L: AsyncRead + AsyncWrite + Unpin,
{
    let result = tokio::io::copy_bidirectional(stream, &mut local).await;
    let _ = local.shutdown().await;
    let (from_public, to_public) = result?;
    debug!(from_public, to_public, "forwarded connection closed");
    Ok(())
}

/// Whether an I/O error just means a peer hung up.
pub(crate) fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

fn insecure_connector() -> TlsConnector {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier::new()))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Accepts any certificate. Only ever used on the local-target leg; the
/// rendezvous leg always verifies.
#[derive(Debug)]
struct InsecureVerifier(CryptoProvider);

impl InsecureVerifier {
    fn new() -> Self {
        Self(tokio_rustls::rustls::crypto::ring::default_provider())
    }
}

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
