#![deny(unsafe_code)]

//! Connection runtime for BlueRPC.
//!
//! A [`Connection`] runs the protocol over any message-oriented [`Link`]:
//! request/response correlation, cancellation, method dispatch, stream
//! multiplexing with flow control, and a heartbeat. [`Client`] layers
//! connection reuse and reconnection on top.

mod cancel;
pub use cancel::*;

mod client;
pub use client::*;

mod config;
pub use config::*;

mod connection;
pub use connection::*;

mod errors;
pub use errors::*;

mod flow;
mod heartbeat;

mod link;
pub use link::*;

mod memory_link;
pub use memory_link::*;

mod method;
pub use method::*;
