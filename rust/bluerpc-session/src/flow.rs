//! Stream flow control.
//!
//! A [`StreamSender`] turns a local stream into data messages and throttles
//! itself on two signals: the receiver's advertised window, and how many
//! bytes are still queued in the transport. A [`StreamReceiver`] feeds data
//! messages into a local stream and advertises its window as the
//! application consumes.
//!
//! The window is cumulative. A signal `(received, available)` (both in
//! KiB) lets the sender have `(received + available) * 1024` bytes on the
//! wire in total, so signals that cross in flight never grant more than the
//! receiver can hold.

use bluerpc_types::Message;

mod receiver;
pub(crate) use receiver::*;

mod sender;
pub(crate) use sender::*;

/// The part of a connection stream senders and receivers talk through.
pub(crate) trait Outbound {
    /// Bytes handed to the transport but not yet written out.
    fn buffered_amount(&self) -> usize;

    fn send(&mut self, msg: Message);

    /// Ask to hear about it once the transport buffer drains.
    fn want_drain(&mut self);
}
