#![deny(unsafe_code)]

//! WebSocket transport for BlueRPC.
//!
//! Every protocol message travels as one binary WebSocket message. Text
//! messages are a protocol violation, and pings double as the heartbeat.
//!
//! # Example (serving)
//!
//! ```ignore
//! use bluerpc_session::{ConnectionConfig, Methods};
//!
//! let methods = Methods::new().method("echo", |param, _cx| async move { Ok(param) });
//! bluerpc_websocket::listen("127.0.0.1:9000", methods, ConnectionConfig::server()).await?;
//! ```
//!
//! # Example (calling)
//!
//! ```ignore
//! use bluerpc_session::Client;
//! use bluerpc_websocket::WsConnector;
//!
//! let client = Client::new(WsConnector::new("ws://127.0.0.1:9000"));
//! let answer = client.invoke("echo", "hello".into()).await?;
//! ```

mod client;
pub use client::*;

mod link;
pub use link::*;

mod server;
pub use server::*;

use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// Tungstenite limits matching a connection's maximum payload. 0 means
/// unlimited.
fn websocket_config(max_payload: usize) -> WebSocketConfig {
    let limit = (max_payload != 0).then_some(max_payload);
    let mut config = WebSocketConfig::default();
    config.max_message_size = limit;
    config.max_frame_size = limit;
    config
}
