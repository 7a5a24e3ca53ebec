#![deny(unsafe_code)]

//! Core types for BlueRPC.
//!
//! - [`Value`]: the dynamically typed payload of requests, responses, and
//!   object streams.
//! - [`ErrorValue`] and [`KnownError`]: errors that can cross the wire.
//! - [`stream`]: the local stream primitive ([`StreamHandle`],
//!   [`StreamWriter`], [`StreamReader`]).
//! - [`Message`]: the ten wire message kinds, with structural validation.

mod error;
pub use error::*;

mod message;
pub use message::*;

pub mod stream;
pub use stream::{
    Chunk, StreamCancelled, StreamHandle, StreamMode, StreamObserver, StreamReader, StreamWriter,
};

mod value;
pub use value::*;
