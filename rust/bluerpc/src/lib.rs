#![deny(unsafe_code)]

//! BlueRPC: request/response RPC over WebSockets, with cancellable calls
//! and flow-controlled streams of bytes or values in either direction.
//!
//! ```ignore
//! use bluerpc::{Client, ConnectionConfig, ErrorValue, MethodContext, Methods, Value, WsConnector};
//!
//! let methods = Methods::new().method("echo", |param: Value, _cx: MethodContext| async move {
//!     Ok::<_, ErrorValue>(param)
//! });
//! tokio::spawn(bluerpc::listen("127.0.0.1:9000", methods, ConnectionConfig::server()));
//!
//! let client = Client::new(WsConnector::new("ws://127.0.0.1:9000"));
//! let answer = client.invoke("echo", Value::from("hi")).await?;
//! ```
//!
//! The pieces live in their own crates and are re-exported here:
//!
//! - [`bluerpc_types`]: values, errors, messages, and the stream primitive.
//! - [`bluerpc_wire`]: the binary codec.
//! - [`bluerpc_session`]: connections, flow control, and the pooling client.
//! - [`bluerpc_websocket`]: the WebSocket transport.

pub use bluerpc_session::*;
pub use bluerpc_types::*;
pub use bluerpc_websocket::*;
pub use bluerpc_wire::{Codec, DecodeError, EncodeError};

pub use bluerpc_session;
pub use bluerpc_types;
pub use bluerpc_websocket;
pub use bluerpc_wire;
