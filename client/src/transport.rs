//! TLS + multiplexed transport to the rendezvous server.
//!
//! One TLS connection carries every logical stream of a session. The
//! multiplexer is driven by a single task that pumps peer-opened streams
//! into a bounded accept channel and services outbound open requests; the
//! driver resolving is the session's close (`Ok`) or error (`Err`) event.

use std::future::{poll_fn, Future};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::debug;
use yamux::{Connection, ConnectionError, Mode};

/// Liveness probing interval on the rendezvous connection.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// How many peer-opened streams may sit unaccepted before the transport is
/// torn down.
pub const ACCEPT_BACKLOG: usize = 1000;

/// A logical stream over the multiplexed transport, with tokio I/O traits.
pub type MuxStream = Compat<yamux::Stream>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid address '{0}', expected host:port")]
    InvalidAddress(String),

    #[error("failed to reach {addr}: {source}")]
    Dial { addr: String, source: io::Error },

    #[error("tls configuration: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("transport error: {0}")]
    Mux(#[from] ConnectionError),

    #[error("transport closed")]
    Closed,
}

/// Split `host:port`. The host may be empty; callers decide whether that
/// means loopback or is an error.
pub fn split_host_port(addr: &str) -> Result<(&str, u16), TransportError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| TransportError::InvalidAddress(addr.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| TransportError::InvalidAddress(addr.to_string()))?;
    Ok((host, port))
}

/// Dial the rendezvous server: TCP, then TLS with SNI set to the host.
///
/// Certificate verification uses the bundled web roots plus any
/// `extra_roots` supplied by the caller.
pub async fn dial(
    addr: &str,
    extra_roots: &[CertificateDer<'static>],
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, TransportError> {
    let (host, port) = split_host_port(addr)?;
    if host.is_empty() {
        return Err(TransportError::InvalidAddress(addr.to_string()));
    }

    let dial_err = |source| TransportError::Dial {
        addr: addr.to_string(),
        source,
    };

    let tcp = TcpStream::connect((host, port)).await.map_err(dial_err)?;
    tcp.set_nodelay(true).map_err(dial_err)?;
    let keepalive = TcpKeepalive::new()
        .with_time(KEEP_ALIVE_INTERVAL)
        .with_interval(KEEP_ALIVE_INTERVAL);
    SockRef::from(&tcp)
        .set_tcp_keepalive(&keepalive)
        .map_err(dial_err)?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for root in extra_roots {
        roots.add(root.clone())?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| TransportError::InvalidAddress(addr.to_string()))?;
    let connector = TlsConnector::from(Arc::new(config));
    connector.connect(server_name, tcp).await.map_err(dial_err)
}

/// A yamux connection that has not started processing frames yet.
pub struct Multiplexer<T> {
    connection: Connection<Compat<T>>,
}

impl<T> Multiplexer<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn client(io: T) -> Self {
        Self::new(io, Mode::Client)
    }

    /// Server mode, used by the scripted harness in the integration tests.
    pub fn server(io: T) -> Self {
        Self::new(io, Mode::Server)
    }

    fn new(io: T, mode: Mode) -> Self {
        let mut config = yamux::Config::default();
        config.set_max_num_streams(ACCEPT_BACKLOG);
        Self {
            connection: Connection::new(io.compat(), config, mode),
        }
    }

    /// Spawn the driver task. Returns a handle for opening streams and
    /// observing session close, plus the channel of peer-opened streams.
    pub fn start(self) -> (RunningMux, mpsc::Receiver<MuxStream>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (open_tx, open_rx) = mpsc::channel(1);
        let (close_tx, close_rx) = oneshot::channel();
        let handle = tokio::spawn(drive(self.connection, inbound_tx, open_rx, close_rx));
        (
            RunningMux {
                opener: open_tx,
                closer: Some(close_tx),
                handle,
            },
            inbound_rx,
        )
    }
}

type OpenReply = oneshot::Sender<Result<MuxStream, ConnectionError>>;

/// Handle to a live multiplexed transport.
pub struct RunningMux {
    opener: mpsc::Sender<OpenReply>,
    closer: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), ConnectionError>>,
}

impl RunningMux {
    /// Open a new outbound logical stream.
    pub async fn open_stream(&self) -> Result<MuxStream, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.opener
            .send(tx)
            .await
            .map_err(|_| TransportError::Closed)?;
        rx.await
            .map_err(|_| TransportError::Closed)?
            .map_err(TransportError::Mux)
    }

    /// Wait for the transport to finish. `Ok` means the peer closed the
    /// session cleanly; `Err` carries the transport failure.
    pub async fn closed(&mut self) -> Result<(), TransportError> {
        match (&mut self.handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Mux(e)),
            // Driver was aborted: the socket is already destroyed.
            Err(_) => Ok(()),
        }
    }

    /// Ask the driver to close the session gracefully; observe completion
    /// with [`RunningMux::closed`].
    pub fn close(&mut self) {
        if let Some(closer) = self.closer.take() {
            let _ = closer.send(());
        }
    }

    /// Destroy the transport. Dropping the connection closes the underlying
    /// TLS socket, which errors every open stream.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// Own the connection and pump it until close or error.
///
/// All stream progress in yamux happens inside the connection's poll
/// methods, so this task is the one place the socket is read and written.
async fn drive<T>(
    mut connection: Connection<Compat<T>>,
    inbound: mpsc::Sender<MuxStream>,
    mut opens: mpsc::Receiver<OpenReply>,
    mut close: oneshot::Receiver<()>,
) -> Result<(), ConnectionError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut pending_open: Option<OpenReply> = None;
    let mut opens_done = false;
    let mut closing = false;

    poll_fn(move |cx| {
        loop {
            if !closing {
                match Pin::new(&mut close).poll(cx) {
                    Poll::Ready(Ok(())) => closing = true,
                    // Handle dropped: destroy the transport outright.
                    Poll::Ready(Err(_)) => return Poll::Ready(Ok(())),
                    Poll::Pending => {}
                }
            }
            if closing {
                return connection.poll_close(cx);
            }

            if pending_open.is_none() && !opens_done {
                match opens.poll_recv(cx) {
                    Poll::Ready(Some(reply)) => pending_open = Some(reply),
                    Poll::Ready(None) => opens_done = true,
                    Poll::Pending => {}
                }
            }

            if pending_open.is_some() {
                if let Poll::Ready(res) = connection.poll_new_outbound(cx) {
                    if let Some(reply) = pending_open.take() {
                        let _ = reply.send(res.map(FuturesAsyncReadCompatExt::compat));
                    }
                    continue;
                }
            }

            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => match inbound.try_send(stream.compat()) {
                    Ok(()) => continue,
                    // Accept backlog exhausted: the contract is to give up
                    // on the whole transport rather than stall the peer.
                    Err(TrySendError::Full(_)) => {
                        debug!("inbound stream backlog exceeded {ACCEPT_BACKLOG}");
                        return Poll::Ready(Err(ConnectionError::TooManyStreams));
                    }
                    Err(TrySendError::Closed(_)) => return Poll::Ready(Ok(())),
                },
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("wormhole.dyastin.dev:443").unwrap(),
            ("wormhole.dyastin.dev", 443)
        );
        assert_eq!(split_host_port(":3000").unwrap(), ("", 3000));
        assert!(split_host_port("no-port").is_err());
        assert!(split_host_port("host:notaport").is_err());
    }

    #[tokio::test]
    async fn test_open_and_accept_over_duplex() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (a, b) = tokio::io::duplex(4096);
        let (client, _client_inbound) = Multiplexer::client(a).start();
        let (_server, mut server_inbound) = Multiplexer::server(b).start();

        let mut outbound = client.open_stream().await.unwrap();
        outbound.write_all(b"ping").await.unwrap();
        outbound.flush().await.unwrap();

        let mut accepted = server_inbound.recv().await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
