#![deny(unsafe_code)]

//! Binary codec for BlueRPC.
//!
//! Values are encoded as CBOR. Two extension types ride on CBOR tags:
//!
//! - [`STREAM_TAG`] wraps an 8-byte payload: a big-endian `u32` stream ID
//!   followed by a flag byte whose low bit marks an octet stream.
//! - [`ERROR_TAG`] wraps a map with a required `message` string; other keys
//!   become the error's fields.

mod codec;
pub use codec::*;

mod error;
pub use error::*;

mod incrementor;
pub use incrementor::*;
