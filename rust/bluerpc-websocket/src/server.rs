use std::io;
use std::net::SocketAddr;

use bluerpc_session::{
    ConnectError, Connection, ConnectionConfig, ConnectionHandle, ConnectionInfo, Methods,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, info, warn};

use crate::{WsLink, websocket_config};

/// Bind `addr` and serve `methods` on every connection accepted there.
pub async fn listen(
    addr: impl ToSocketAddrs,
    methods: Methods,
    config: ConnectionConfig,
) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening at ws://{}", listener.local_addr()?);
    serve(listener, methods, config).await
}

/// Accept connections from `listener` until it fails.
///
/// Each socket gets its own handshake and [`Connection`]; a failed handshake
/// only affects that socket.
pub async fn serve(
    listener: TcpListener,
    methods: Methods,
    config: ConnectionConfig,
) -> io::Result<()> {
    config.validate().map_err(io::Error::other)?;
    loop {
        let (socket, peer_addr) = listener.accept().await?;
        let methods = methods.clone();
        let config = config.clone();
        tokio::spawn(async move {
            match accept(socket, Some(peer_addr), methods, config).await {
                Ok(conn) => debug!(%peer_addr, conn_id = conn.id(), "accepted connection"),
                Err(err) => warn!(%peer_addr, %err, "WebSocket handshake failed"),
            }
        });
    }
}

/// Perform the server side of the WebSocket handshake on `stream` and start
/// a connection on it.
pub async fn accept<S>(
    stream: S,
    peer_addr: Option<SocketAddr>,
    methods: Methods,
    config: ConnectionConfig,
) -> Result<ConnectionHandle, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut headers = Vec::new();
    let capture = |request: &Request, response: Response| {
        headers = request
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                Some((name.as_str().to_owned(), value.to_str().ok()?.to_owned()))
            })
            .collect();
        Ok::<_, ErrorResponse>(response)
    };
    let ws_config = websocket_config(config.max_payload);
    let stream = match accept_hdr_async_with_config(stream, capture, Some(ws_config)).await {
        Ok(stream) => stream,
        Err(WsError::Io(err)) => return Err(err.into()),
        Err(err) => return Err(ConnectError::Handshake(err.to_string())),
    };

    let info = ConnectionInfo {
        secure: false,
        headers,
        peer_addr,
    };
    Ok(Connection::new(WsLink::new(stream))
        .config(config)
        .methods(methods)
        .info(info)
        .spawn())
}
