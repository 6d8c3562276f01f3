//! Classification of server-initiated streams.
//!
//! Every peer-opened stream starts with one header; its type decides where
//! the stream goes. Streams are independent of each other — no ordering is
//! imposed between them.

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wormhole_shared::frame;
use wormhole_shared::protocol::{MessageType, Metrics};

use crate::forward::{self, Target};
use crate::metrics;
use crate::transport::MuxStream;

pub(crate) async fn run(
    mut inbound: mpsc::Receiver<MuxStream>,
    target: Target,
    mut metrics_tx: Option<mpsc::Sender<Metrics>>,
    close_tx: mpsc::Sender<()>,
) {
    while let Some(mut stream) = inbound.recv().await {
        let header = match frame::read_header(&mut stream).await {
            Ok(header) => header,
            // Peer EOF or transport teardown is normal shutdown noise.
            Err(e) if e.is_disconnect() => continue,
            Err(e) => {
                warn!("dropping inbound stream: {e}");
                let _ = stream.shutdown().await;
                continue;
            }
        };

        match header.kind {
            MessageType::Access => {
                let target = target.clone();
                tokio::spawn(async move {
                    if let Err(e) = forward::run(stream, target).await {
                        if forward::is_disconnect(&e) {
                            debug!("forwarded connection dropped: {e}");
                        } else {
                            warn!("forwarder failed: {e}");
                        }
                    }
                });
            }
            MessageType::Metrics => match metrics_tx.take() {
                Some(tx) => {
                    tokio::spawn(metrics::consume(stream, header, tx));
                }
                None => {
                    debug!("ignoring metrics stream without a subscriber");
                    let _ = stream.shutdown().await;
                }
            },
            MessageType::End => {
                info!("tunnel timed out");
                let _ = stream.shutdown().await;
                let _ = close_tx.send(()).await;
                return;
            }
            other => {
                debug!("ignoring unexpected {other:?} stream");
                let _ = stream.shutdown().await;
            }
        }
    }
}
