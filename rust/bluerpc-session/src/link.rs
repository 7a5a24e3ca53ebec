use std::future::Future;
use std::net::SocketAddr;

use bytes::Bytes;

use crate::RecvError;

/// Close code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code sent when an endpoint goes away (heartbeat timeout, client
/// cancellation).
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_UNSUPPORTED_DATA: u16 = 1003;
/// Reported when the peer's close frame carried no status.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Reported when the transport dropped without a close handshake.
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_TOO_BIG: u16 = 1009;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// One transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Bytes),
    Text(String),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseFrame>),
}

impl Frame {
    /// Bytes this frame adds to the outbound buffer.
    pub fn payload_len(&self) -> usize {
        match self {
            Frame::Binary(bytes) | Frame::Ping(bytes) | Frame::Pong(bytes) => bytes.len(),
            Frame::Text(text) => text.len(),
            Frame::Close(_) => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

/// A message-oriented, bidirectional transport.
///
/// WebSocket connections implement this, as do the in-process pairs from
/// [`memory_link_pair`](crate::memory_link_pair). The transport answers pings
/// on its own; the connection only sees them to track liveness.
pub trait Link: Send + 'static {
    type Tx: LinkTx;
    type Rx: LinkRx;

    fn split(self) -> (Self::Tx, Self::Rx);
}

/// Sending half of a [`Link`].
pub trait LinkTx: Send + 'static {
    /// Send one frame. Resolves once the transport has accepted it.
    fn send(&mut self, frame: Frame) -> impl Future<Output = std::io::Result<()>> + Send + '_;

    /// Flush and shut down the outbound direction.
    fn close(&mut self) -> impl Future<Output = std::io::Result<()>> + Send + '_;
}

/// Receiving half of a [`Link`].
pub trait LinkRx: Send + 'static {
    /// Receive the next frame. `Ok(None)` means the transport is gone.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Frame>, RecvError>> + Send + '_;
}

/// What the transport knows about the peer, exposed to method handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Whether the transport is encrypted.
    pub secure: bool,
    /// Handshake headers, in arrival order.
    pub headers: Vec<(String, String)>,
    pub peer_addr: Option<SocketAddr>,
}

impl ConnectionInfo {
    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
