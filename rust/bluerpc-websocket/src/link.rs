use std::io;

use bluerpc_session::{CloseFrame, Frame, Link, LinkRx, LinkTx, RecvError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::error::{CapacityError, Error as WsError, ProtocolError};
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

/// A [`Link`] over an established [`WebSocketStream`].
///
/// Tungstenite answers pings and close frames by itself; the connection
/// still sees them.
#[derive(Debug)]
pub struct WsLink<S> {
    stream: WebSocketStream<S>,
}

impl<S> WsLink<S> {
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> WebSocketStream<S> {
        self.stream
    }
}

impl<S> Link for WsLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Tx = WsTx<S>;
    type Rx = WsRx<S>;

    fn split(self) -> (WsTx<S>, WsRx<S>) {
        let (sink, stream) = self.stream.split();
        (WsTx { sink }, WsRx { stream })
    }
}

/// Sending half of a [`WsLink`].
#[derive(Debug)]
pub struct WsTx<S> {
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
}

impl<S> LinkTx for WsTx<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: Frame) -> io::Result<()> {
        match self.sink.send(to_ws(frame)).await {
            Ok(()) => Ok(()),
            // Tungstenite already queued a close, ours or its reply to the peer's.
            Err(WsError::Protocol(ProtocolError::SendAfterClosing) | WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(to_io(err)),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(to_io(err)),
        }
    }
}

/// Receiving half of a [`WsLink`].
#[derive(Debug)]
pub struct WsRx<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

impl<S> LinkRx for WsRx<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Frame>, RecvError> {
        loop {
            let msg = match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(msg)) => msg,
                Some(Err(WsError::Capacity(CapacityError::MessageTooLong { .. }))) => {
                    return Err(RecvError::TooLarge);
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Ok(None);
                }
                Some(Err(err)) => return Err(RecvError::Io(to_io(err))),
            };
            let frame = match msg {
                WsMessage::Binary(data) => Frame::Binary(data),
                WsMessage::Text(text) => Frame::Text(text.as_str().to_owned()),
                WsMessage::Ping(data) => Frame::Ping(data),
                WsMessage::Pong(data) => Frame::Pong(data),
                WsMessage::Close(close) => Frame::Close(close.map(|close| CloseFrame {
                    code: close.code.into(),
                    reason: close.reason.as_str().to_owned(),
                })),
                // Raw frames only show up when writing.
                WsMessage::Frame(_) => continue,
            };
            return Ok(Some(frame));
        }
    }
}

fn to_ws(frame: Frame) -> WsMessage {
    match frame {
        Frame::Binary(data) => WsMessage::Binary(data),
        Frame::Text(text) => WsMessage::Text(text.into()),
        Frame::Ping(data) => WsMessage::Ping(data),
        Frame::Pong(data) => WsMessage::Pong(data),
        Frame::Close(close) => WsMessage::Close(close.map(|close| WsCloseFrame {
            code: close.code.into(),
            reason: close.reason.into(),
        })),
    }
}

fn to_io(err: WsError) -> io::Error {
    match err {
        WsError::Io(err) => err,
        other => io::Error::other(other),
    }
}
