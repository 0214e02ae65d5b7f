//! One managed viewer connection.
//!
//! Wraps a TCP stream in [`DisplayCodec`] framing and splits it into
//! background reader/writer tasks bridged by channels, so senders never
//! block on a slow socket. A periodic [`KeepAlive`] task keeps idle
//! connections warm.
//!
//! Frame delivery through [`ViewerSender`] is best-effort by design: a
//! full outbound queue drops the message (the next tick supersedes it),
//! and a closed channel marks the viewer gone.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::protocol::{Clientbound, DisplayCodec, InboundFrame, KeepAlive};

/// Outbound queue depth per viewer; roughly two 10×10-grid frames.
const SEND_QUEUE: usize = 256;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Cloneable handle used to push messages to one viewer.
pub type ViewerSender = mpsc::Sender<Clientbound>;

/// A viewer connection with background I/O tasks.
#[derive(Debug)]
pub struct ViewerConnection {
    tx: ViewerSender,
    rx: mpsc::Receiver<InboundFrame>,
}

impl ViewerConnection {
    /// Take ownership of an accepted stream and spawn its I/O tasks.
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".into());
        let (mut net_writer, mut net_reader) = Framed::new(stream, DisplayCodec).split();

        // User → network.
        let (user_tx, mut network_rx) = mpsc::channel::<Clientbound>(SEND_QUEUE);

        // Network → user.
        let (network_tx, user_rx) = mpsc::channel::<InboundFrame>(SEND_QUEUE);

        // Writer task.
        let writer_peer = peer.clone();
        tokio::spawn(async move {
            while let Some(msg) = network_rx.recv().await {
                if let Err(e) = net_writer.send(msg).await {
                    warn!(peer = %writer_peer, error = %e, "viewer write failed");
                    break;
                }
            }
        });

        // Reader task. Inbound traffic is rare on a display transport;
        // the patched wire id arriving here is a protocol violation and
        // tears the connection down.
        tokio::spawn(async move {
            while let Some(result) = net_reader.next().await {
                match result {
                    Ok(frame) => {
                        if network_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "viewer read failed");
                        break;
                    }
                }
            }
            debug!(peer = %peer, "viewer reader stopped");
        });

        // Keep-alive task.
        let keepalive_tx = user_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            let mut id: u64 = 0;
            loop {
                interval.tick().await;
                id += 1;
                let probe = Clientbound::KeepAlive(KeepAlive { id });
                if keepalive_tx.send(probe).await.is_err() {
                    break;
                }
            }
        });

        Self {
            tx: user_tx,
            rx: user_rx,
        }
    }

    /// A cloneable sender for fan-out snapshots.
    pub fn sender(&self) -> ViewerSender {
        self.tx.clone()
    }

    /// Receive the next raw inbound frame, if any.
    pub async fn recv(&mut self) -> Option<InboundFrame> {
        self.rx.recv().await
    }
}
