//! End-to-end scenarios against a scripted rendezvous server.
//!
//! The harness runs a real TLS listener with a self-signed certificate and
//! speaks the wire protocol over a server-mode multiplexer, so every byte
//! the client sends and receives crosses the same stack it uses in
//! production.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use wormhole_client::session::{Session, SessionConfig, SessionError};
use wormhole_client::transport::{Multiplexer, MuxStream, RunningMux};
use wormhole_shared::frame;
use wormhole_shared::protocol::{
    Header, MessageType, Metrics, Proto, Request, Response, Status, FLAG_METRICS,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Start a TLS + yamux server for exactly one client connection, then run
/// `script` against it. Returns the dial address, the trust root the client
/// needs, and the script's join handle (so its assertions propagate).
async fn start_server<F, Fut>(script: F) -> (String, CertificateDer<'static>, JoinHandle<()>)
where
    F: FnOnce(RunningMux, mpsc::Receiver<MuxStream>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    let tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.clone()], key)
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("localhost:{}", listener.local_addr().unwrap().port());
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let handle = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let tls = acceptor.accept(tcp).await.unwrap();
        let (mux, inbound) = Multiplexer::server(tls).start();
        script(mux, inbound).await;
    });

    (addr, cert, handle)
}

fn session_config(
    addr: &str,
    cert: &CertificateDer<'static>,
    proto: Proto,
    name: &str,
    target_addr: &str,
    with_metrics: bool,
) -> SessionConfig {
    SessionConfig {
        server_addr: addr.to_string(),
        proto,
        name: name.to_string(),
        target_addr: target_addr.to_string(),
        target_tls: false,
        with_metrics,
        extra_roots: vec![cert.clone()],
    }
}

async fn send_frame(stream: &mut MuxStream, header: Header, body: &[u8]) {
    stream.write_all(&header.to_bytes().unwrap()).await.unwrap();
    if !body.is_empty() {
        stream.write_all(body).await.unwrap();
    }
    stream.flush().await.unwrap();
}

async fn read_request(control: &mut MuxStream) -> (Header, Request) {
    let header = frame::read_header(control).await.unwrap();
    assert_eq!(header.kind, MessageType::Request);
    let body = frame::read_payload(control, &header).await.unwrap();
    (header, Request::from_bytes(&body).unwrap())
}

async fn send_response(control: &mut MuxStream, response: Response) {
    let body = response.to_bytes().unwrap();
    send_frame(
        control,
        Header::new(MessageType::Response, body.len() as u64),
        &body,
    )
    .await;
}

#[tokio::test]
async fn test_happy_http_handshake() {
    let (addr, cert, server) = start_server(|mut mux, mut inbound| async move {
        let mut control = inbound.recv().await.unwrap();
        let (header, request) = read_request(&mut control).await;
        assert!(!header.has_flag(FLAG_METRICS));
        assert_eq!(request.proto, Proto::Http);
        assert_eq!(request.name, "alpha");
        send_response(&mut control, Response::new(Status::Ok, 3_600, "alpha.example")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        mux.close();
        let _ = mux.closed().await;
    })
    .await;

    let (_shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut session = Session::new(
        session_config(&addr, &cert, Proto::Http, "alpha", ":9", false),
        None,
    );
    timeout(TEST_TIMEOUT, session.run(shutdown_rx))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(session.domain(), Some("alpha.example"));
    assert_eq!(session.public_url().as_deref(), Some("https://alpha.example"));
    server.await.unwrap();
}

#[tokio::test]
async fn test_tcp_scheme_in_public_url() {
    let (addr, cert, server) = start_server(|mut mux, mut inbound| async move {
        let mut control = inbound.recv().await.unwrap();
        let (_, request) = read_request(&mut control).await;
        assert_eq!(request.proto, Proto::Tcp);
        send_response(&mut control, Response::new(Status::Ok, 1, "beta.example")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        mux.close();
        let _ = mux.closed().await;
    })
    .await;

    let (_shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut session = Session::new(
        session_config(&addr, &cert, Proto::Tcp, "beta", ":9", false),
        None,
    );
    timeout(TEST_TIMEOUT, session.run(shutdown_rx))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.public_url().as_deref(), Some("tcp:beta.example"));
    server.await.unwrap();
}

#[tokio::test]
async fn test_name_taken_resolves_without_domain() {
    let (addr, cert, server) = start_server(|mut mux, mut inbound| async move {
        let mut control = inbound.recv().await.unwrap();
        let (_, request) = read_request(&mut control).await;
        assert_eq!(request.name, "alpha");
        send_response(&mut control, Response::new(Status::NameTaken, 0, "")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        mux.close();
        let _ = mux.closed().await;
    })
    .await;

    let (_shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut session = Session::new(
        session_config(&addr, &cert, Proto::Http, "alpha", ":9", false),
        None,
    );
    // A rejected registration is reported, not escalated.
    timeout(TEST_TIMEOUT, session.run(shutdown_rx))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.domain(), None);
    server.await.unwrap();
}

#[tokio::test]
async fn test_unsupported_proto_resolves_without_domain() {
    let (addr, cert, server) = start_server(|mut mux, mut inbound| async move {
        let mut control = inbound.recv().await.unwrap();
        let _ = read_request(&mut control).await;
        send_response(&mut control, Response::new(Status::UnsupportedProto, 0, "")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        mux.close();
        let _ = mux.closed().await;
    })
    .await;

    let (_shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut session = Session::new(
        session_config(&addr, &cert, Proto::Tcp, "alpha", ":9", false),
        None,
    );
    timeout(TEST_TIMEOUT, session.run(shutdown_rx))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.domain(), None);
    server.await.unwrap();
}

#[tokio::test]
async fn test_server_error_is_fatal() {
    let (addr, cert, server) = start_server(|mux, mut inbound| async move {
        let mut control = inbound.recv().await.unwrap();
        let _ = read_request(&mut control).await;
        send_frame(&mut control, Header::new(MessageType::Error, 5), b"hello").await;
        // Keep the transport up long enough for the client to read the
        // error body; it tears the session down itself.
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(mux);
    })
    .await;

    let (_shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut session = Session::new(
        session_config(&addr, &cert, Proto::Http, "alpha", ":9", false),
        None,
    );
    let err = timeout(TEST_TIMEOUT, session.run(shutdown_rx))
        .await
        .unwrap()
        .unwrap_err();
    match &err {
        SessionError::Server(message) => assert_eq!(message, "hello"),
        other => panic!("expected server error, got {other:?}"),
    }
    assert!(err.to_string().contains("server error: hello"));
    server.await.unwrap();
}

#[tokio::test]
async fn test_unexpected_handshake_reply_is_fatal() {
    let (addr, cert, server) = start_server(|mux, mut inbound| async move {
        let mut control = inbound.recv().await.unwrap();
        let _ = read_request(&mut control).await;
        send_frame(&mut control, Header::new(MessageType::Ack, 0), b"").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(mux);
    })
    .await;

    let (_shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut session = Session::new(
        session_config(&addr, &cert, Proto::Http, "alpha", ":9", false),
        None,
    );
    let err = timeout(TEST_TIMEOUT, session.run(shutdown_rx))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, SessionError::UnexpectedMessage(MessageType::Ack)));
    server.await.unwrap();
}

#[tokio::test]
async fn test_access_stream_is_forwarded_both_ways() {
    const TO_LOCAL: &[u8] = b"hello from the public side";
    const TO_PUBLIC: &[u8] = b"reply from the local service";

    // The local service being exposed.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    let local = tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; TO_LOCAL.len()];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, TO_LOCAL);
        conn.write_all(TO_PUBLIC).await.unwrap();
        conn.shutdown().await.unwrap();
    });

    let (addr, cert, server) = start_server(|mut mux, mut inbound| async move {
        let mut control = inbound.recv().await.unwrap();
        let _ = read_request(&mut control).await;
        send_response(&mut control, Response::new(Status::Ok, 1, "alpha.example")).await;

        // One public-side connection arrives.
        let mut access = mux.open_stream().await.unwrap();
        send_frame(&mut access, Header::new(MessageType::Access, 0), b"").await;

        // The client acknowledges before any payload flows.
        let mut ack = [0u8; 12];
        access.read_exact(&mut ack).await.unwrap();
        assert_eq!(Header::from_bytes(&ack).unwrap().kind, MessageType::Ack);

        access.write_all(TO_LOCAL).await.unwrap();
        access.flush().await.unwrap();
        // Half-close the public side so the forwarder can finish.
        access.shutdown().await.unwrap();

        let mut reply = Vec::new();
        access.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, TO_PUBLIC);

        mux.close();
        let _ = mux.closed().await;
    })
    .await;

    let (_shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut session = Session::new(
        session_config(&addr, &cert, Proto::Tcp, "alpha", &target_addr, false),
        None,
    );
    timeout(TEST_TIMEOUT, session.run(shutdown_rx))
        .await
        .unwrap()
        .unwrap();

    local.await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_end_message_closes_session() {
    let (addr, cert, server) = start_server(|mut mux, mut inbound| async move {
        let mut control = inbound.recv().await.unwrap();
        let _ = read_request(&mut control).await;
        send_response(&mut control, Response::new(Status::Ok, 1, "alpha.example")).await;

        let mut end = mux.open_stream().await.unwrap();
        send_frame(&mut end, Header::new(MessageType::End, 0), b"").await;
        // The client tears the transport down in response.
        tokio::time::sleep(Duration::from_millis(500)).await;
    })
    .await;

    let (_shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut session = Session::new(
        session_config(&addr, &cert, Proto::Http, "alpha", ":9", false),
        None,
    );
    timeout(TEST_TIMEOUT, session.run(shutdown_rx))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.domain(), Some("alpha.example"));
    server.await.unwrap();
}

#[tokio::test]
async fn test_metrics_stream_publishes_events() {
    let samples = [
        Metrics {
            ingress: 100,
            egress: 200,
            uptime: 1_000_000_000,
            connection_count: 1,
            active_connections: 1,
        },
        Metrics {
            ingress: 1_100,
            egress: 2_200,
            uptime: 2_000_000_000,
            connection_count: 3,
            active_connections: 2,
        },
        Metrics {
            ingress: 9_999,
            egress: 8_888,
            uptime: 3_000_000_000,
            connection_count: 3,
            active_connections: 0,
        },
    ];

    let expected = samples;
    let (addr, cert, server) = start_server(move |mut mux, mut inbound| async move {
        let mut control = inbound.recv().await.unwrap();
        let (header, _) = read_request(&mut control).await;
        // Metrics streaming was requested.
        assert!(header.has_flag(FLAG_METRICS));
        send_response(&mut control, Response::new(Status::Ok, 1, "alpha.example")).await;

        let mut stream = mux.open_stream().await.unwrap();
        for sample in &expected {
            let body = sample.to_bytes();
            send_frame(
                &mut stream,
                Header::new(MessageType::Metrics, body.len() as u64),
                &body,
            )
            .await;
        }
        // Leave the stream and session open; the client shuts down.
        tokio::time::sleep(Duration::from_secs(5)).await;
    })
    .await;

    let (metrics_tx, mut metrics_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let mut session = Session::new(
        session_config(&addr, &cert, Proto::Http, "alpha", ":9", true),
        Some(metrics_tx),
    );
    let running = tokio::spawn(async move { session.run(shutdown_rx).await });

    for sample in &samples {
        let got = timeout(TEST_TIMEOUT, metrics_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got, sample);
    }

    shutdown_tx.send(()).unwrap();
    timeout(TEST_TIMEOUT, running).await.unwrap().unwrap().unwrap();
    server.abort();
}
