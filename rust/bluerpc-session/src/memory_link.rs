use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::{Frame, Link, LinkRx, LinkTx, RecvError};

/// In-process [`Link`] backed by unbounded tokio channels.
///
/// Frames pass through untouched. Like a real WebSocket, the receiving half
/// answers pings with pongs, and a close frame with a close frame of its own
/// unless one was already sent.
#[derive(Debug)]
pub struct MemoryLink {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

/// Create a pair of connected [`MemoryLink`]s.
///
/// Sending on `a` delivers to `b` and vice versa.
pub fn memory_link_pair() -> (MemoryLink, MemoryLink) {
    let (tx_a, rx_b) = mpsc::unbounded_channel();
    let (tx_b, rx_a) = mpsc::unbounded_channel();
    (
        MemoryLink { tx: tx_a, rx: rx_a },
        MemoryLink { tx: tx_b, rx: rx_b },
    )
}

impl MemoryLink {
    /// Send a frame directly. Handy for tests driving one end by hand.
    pub fn send_frame(&self, frame: Frame) -> std::io::Result<()> {
        self.tx.send(frame).map_err(|_| gone())
    }

    /// Receive the next frame, without the automatic pong.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

impl Link for MemoryLink {
    type Tx = MemoryLinkTx;
    type Rx = MemoryLinkRx;

    fn split(self) -> (MemoryLinkTx, MemoryLinkRx) {
        let close_sent = Arc::new(AtomicBool::new(false));
        (
            MemoryLinkTx {
                tx: self.tx.clone(),
                close_sent: Arc::clone(&close_sent),
            },
            MemoryLinkRx {
                rx: self.rx,
                reply: self.tx,
                close_sent,
            },
        )
    }
}

#[derive(Debug)]
pub struct MemoryLinkTx {
    tx: mpsc::UnboundedSender<Frame>,
    close_sent: Arc<AtomicBool>,
}

impl LinkTx for MemoryLinkTx {
    async fn send(&mut self, frame: Frame) -> std::io::Result<()> {
        if matches!(frame, Frame::Close(_)) && self.close_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.tx.send(frame).map_err(|_| gone())
    }

    async fn close(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryLinkRx {
    rx: mpsc::UnboundedReceiver<Frame>,
    reply: mpsc::UnboundedSender<Frame>,
    close_sent: Arc<AtomicBool>,
}

impl LinkRx for MemoryLinkRx {
    async fn recv(&mut self) -> Result<Option<Frame>, RecvError> {
        let frame = self.rx.recv().await;
        match &frame {
            Some(Frame::Ping(payload)) => {
                let _ = self.reply.send(Frame::Pong(payload.clone()));
            }
            Some(Frame::Close(close)) if !self.close_sent.swap(true, Ordering::AcqRel) => {
                let _ = self.reply.send(Frame::Close(close.clone()));
            }
            _ => {}
        }
        Ok(frame)
    }
}

fn gone() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer dropped")
}
