//! Control session: registration handshake and session lifetime.
//!
//! `Session::run` is single-shot. It dials the rendezvous server, registers
//! the chosen name on the control stream, then parks while server-initiated
//! streams are dispatched, until the transport closes, errors, the server
//! ends the tunnel, or shutdown is signalled.

use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::rustls::pki_types::CertificateDer;
use tracing::{debug, error, info};
use wormhole_shared::error::FrameError;
use wormhole_shared::frame;
use wormhole_shared::protocol::{
    Header, MessageType, Metrics, Proto, Request, Response, Status, FLAG_METRICS,
};

use crate::dashboard;
use crate::dispatch;
use crate::forward::Target;
use crate::transport::{self, Multiplexer, TransportError};

/// Everything needed to open one tunnel.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Rendezvous server, `host:port`.
    pub server_addr: String,
    pub proto: Proto,
    /// Subdomain to register.
    pub name: String,
    /// Local service to forward to, `host:port`; empty host means loopback.
    pub target_addr: String,
    /// Whether the local service speaks TLS (self-signed; not verified).
    pub target_tls: bool,
    /// Ask the server to stream metrics.
    pub with_metrics: bool,
    /// Extra trust roots for the rendezvous leg.
    pub extra_roots: Vec<CertificateDer<'static>>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("malformed frame on control stream: {0}")]
    Handshake(#[from] FrameError),

    #[error("unexpected {0:?} message on control stream")]
    UnexpectedMessage(MessageType),

    #[error("server error: {0}")]
    Server(String),
}

pub struct Session {
    config: SessionConfig,
    metrics_tx: Option<mpsc::Sender<Metrics>>,
    domain: Option<String>,
}

impl Session {
    /// `metrics_tx` is the session's one metrics subscriber; samples from
    /// the server-initiated metrics stream are published into it.
    pub fn new(config: SessionConfig, metrics_tx: Option<mpsc::Sender<Metrics>>) -> Self {
        Self {
            config,
            metrics_tx,
            domain: None,
        }
    }

    /// The domain assigned by the server, once registration succeeded.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// The public endpoint, scheme included.
    pub fn public_url(&self) -> Option<String> {
        self.domain
            .as_deref()
            .map(|domain| format!("{}{}", self.config.proto.scheme(), domain))
    }

    /// Open the tunnel and serve it until it ends.
    ///
    /// Resolves `Ok` on clean close, server-ended tunnel, shutdown, or a
    /// rejected registration (which is reported to the user, not an error).
    pub async fn run(&mut self, mut shutdown: oneshot::Receiver<()>) -> Result<(), SessionError> {
        let target = Target::new(&self.config.target_addr, self.config.target_tls)?;

        let setup = async {
            debug!("connecting to {}", self.config.server_addr);
            let tls = transport::dial(&self.config.server_addr, &self.config.extra_roots).await?;
            let (mux, inbound) = Multiplexer::client(tls).start();
            match self.register(&mux).await {
                Ok(domain) => Ok((mux, inbound, domain)),
                Err(e) => {
                    mux.abort();
                    Err(e)
                }
            }
        };

        // Shutdown aborts the session at any point, handshake included.
        let (mut mux, inbound, domain) = tokio::select! {
            res = setup => res?,
            Ok(()) = &mut shutdown => return Ok(()),
        };

        let Some(domain) = domain else {
            // Registration rejected; already reported at error level.
            mux.abort();
            return Ok(());
        };
        self.domain = Some(domain);

        let (close_tx, mut close_rx) = mpsc::channel::<()>(1);
        let dispatcher = tokio::spawn(dispatch::run(
            inbound,
            target,
            self.metrics_tx.take(),
            close_tx,
        ));

        let result = tokio::select! {
            res = mux.closed() => {
                debug!("transport closed");
                res.map_err(SessionError::from)
            }
            Ok(()) = &mut shutdown => {
                debug!("shutdown signalled, destroying transport");
                Ok(())
            }
            Some(()) = close_rx.recv() => Ok(()),
        };

        mux.abort();
        dispatcher.abort();
        result
    }

    /// Perform the handshake on a fresh control stream. Returns the
    /// assigned domain, or `None` when the server rejected the name.
    async fn register(
        &self,
        mux: &transport::RunningMux,
    ) -> Result<Option<String>, SessionError> {
        let mut control = mux.open_stream().await?;

        let request = Request::new(self.config.proto, self.config.name.clone());
        let body = request.to_bytes().map_err(FrameError::from)?;
        let mut header = Header::new(MessageType::Request, body.len() as u64);
        if self.config.with_metrics {
            header.set_flag(FLAG_METRICS);
        }
        control
            .write_all(&header.to_bytes().map_err(FrameError::from)?)
            .await
            .map_err(FrameError::from)?;
        control.write_all(&body).await.map_err(FrameError::from)?;
        control.flush().await.map_err(FrameError::from)?;

        let reply = frame::read_header(&mut control).await?;
        if reply.kind == MessageType::Error {
            let body = frame::read_payload(&mut control, &reply).await?;
            return Err(SessionError::Server(
                String::from_utf8_lossy(&body).into_owned(),
            ));
        }
        if reply.kind != MessageType::Response {
            return Err(SessionError::UnexpectedMessage(reply.kind));
        }
        let body = frame::read_payload(&mut control, &reply).await?;
        let response = Response::from_bytes(&body).map_err(FrameError::from)?;

        // The control stream's job ends with the handshake reply.
        let _ = control.shutdown().await;
        drop(control);

        match response.status {
            Status::Ok => {
                let url = format!("{}{}", self.config.proto.scheme(), response.domain);
                // The remaining lifetime arrives as nanoseconds.
                let expires_in = Duration::from_nanos(response.ttl_hours);
                info!(
                    "tunnel open at {url} -> {}, expires in {}",
                    self.config.target_addr,
                    dashboard::fmt_duration(expires_in)
                );
                Ok(Some(response.domain))
            }
            Status::NameTaken => {
                error!("'{}' is already in use", self.config.name);
                Ok(None)
            }
            Status::UnsupportedProto => {
                error!(
                    "server does not support {} tunnels",
                    self.config.proto
                );
                Ok(None)
            }
        }
    }
}
