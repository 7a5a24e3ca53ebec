use std::time::Duration;

use bluerpc_session::{
    ConnectError, Connection, ConnectionConfig, ConnectionHandle, ConnectionInfo, Connector,
    Methods,
};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, connect_async_with_config};
use tracing::debug;

use crate::{WsLink, websocket_config};

/// How long an outbound WebSocket handshake may take.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials a WebSocket URL. Pass it to a [`Client`](bluerpc_session::Client)
/// for pooled, reconnecting access.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    config: ConnectionConfig,
    methods: Methods,
    handshake_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            config: ConnectionConfig::client(),
            methods: Methods::new(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Methods the server may call back on this side.
    pub fn methods(mut self, methods: Methods) -> Self {
        self.methods = methods;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open one connection.
    pub async fn dial(&self) -> Result<ConnectionHandle, ConnectError> {
        self.config.validate_client()?;
        let handshake = connect_async_with_config(
            self.url.as_str(),
            Some(websocket_config(self.config.max_payload)),
            true,
        );
        let (stream, response) = match tokio::time::timeout(self.handshake_timeout, handshake).await
        {
            Err(_) => return Err(ConnectError::Timeout),
            Ok(Err(WsError::Io(err))) => return Err(err.into()),
            Ok(Err(err)) => return Err(ConnectError::Handshake(err.to_string())),
            Ok(Ok(pair)) => pair,
        };

        let peer_addr = match stream.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
            _ => None,
        };
        let info = ConnectionInfo {
            secure: self.url.starts_with("wss:"),
            headers: response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    Some((name.as_str().to_owned(), value.to_str().ok()?.to_owned()))
                })
                .collect(),
            peer_addr,
        };
        let conn = Connection::new(WsLink::new(stream))
            .config(self.config.clone())
            .methods(self.methods.clone())
            .info(info)
            .spawn();
        debug!(url = %self.url, conn_id = conn.id(), "connected");
        Ok(conn)
    }
}

impl Connector for WsConnector {
    async fn connect(&self) -> Result<ConnectionHandle, ConnectError> {
        self.dial().await
    }
}

/// Open a single connection to `url` with client defaults.
pub async fn connect(url: &str) -> Result<ConnectionHandle, ConnectError> {
    WsConnector::new(url).dial().await
}
