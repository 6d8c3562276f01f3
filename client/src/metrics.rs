//! Consumer for the server-initiated metrics stream.
//!
//! The dispatcher hands over the stream together with the first header it
//! already read; from there every frame is one header plus a fixed-size
//! Metrics payload. Samples are published to the channel registered at
//! session construction.

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use wormhole_shared::frame;
use wormhole_shared::protocol::{Header, MessageType, Metrics};

use crate::transport::MuxStream;

pub(crate) async fn consume(mut stream: MuxStream, first: Header, tx: mpsc::Sender<Metrics>) {
    let mut header = first;
    loop {
        let body = match frame::read_payload(&mut stream, &header).await {
            Ok(body) => body,
            Err(e) => {
                if !e.is_disconnect() {
                    warn!("metrics stream: {e}");
                }
                break;
            }
        };
        let sample = match Metrics::from_bytes(&body) {
            Ok(sample) => sample,
            Err(e) => {
                warn!("malformed metrics frame: {e}");
                break;
            }
        };
        // Subscriber gone means the dashboard was torn down; stop reading.
        if tx.send(sample).await.is_err() {
            break;
        }

        header = match frame::read_header(&mut stream).await {
            Ok(h) if h.kind == MessageType::Metrics => h,
            Ok(h) => {
                debug!("unexpected {:?} frame on metrics stream", h.kind);
                break;
            }
            Err(e) => {
                if !e.is_disconnect() {
                    warn!("metrics stream: {e}");
                }
                break;
            }
        };
    }
    let _ = stream.shutdown().await;
}
