use bluerpc_types::{Chunk, ErrorValue, Message, StreamMode, StreamWriter};
use bluerpc_wire::{Codec, DecodeError};
use bytes::Bytes;
use tracing::debug;

/// Outcome of feeding one data message to a [`StreamReceiver`].
#[derive(Debug, PartialEq)]
pub(crate) enum Feed {
    /// Accepted; send the signal if there is one.
    Accepted(Option<Message>),
    /// The data could not be decoded. The local stream has been failed and
    /// the peer should be told to stop.
    Rejected,
}

/// Receiving state for one inbound stream.
#[derive(Debug)]
pub(crate) struct StreamReceiver {
    stream_id: u32,
    serial: u64,
    mode: StreamMode,
    writer: Option<StreamWriter>,
    high_water: usize,
    received: u64,
    buffered: usize,
    /// Buffered bytes and window at the last signal.
    last_signal: Option<(usize, u64)>,
}

impl StreamReceiver {
    pub(crate) fn new(
        stream_id: u32,
        serial: u64,
        writer: StreamWriter,
        high_water: usize,
    ) -> Self {
        Self {
            stream_id,
            serial,
            mode: writer.mode(),
            writer: Some(writer),
            high_water,
            received: 0,
            buffered: 0,
            last_signal: None,
        }
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    /// The signal that opens the window.
    pub(crate) fn start(&mut self) -> Option<Message> {
        self.check_signal()
    }

    pub(crate) fn write(&mut self, data: Bytes, codec: &Codec) -> Feed {
        let size = data.len();
        self.received += size as u64;
        let chunk = match self.mode {
            StreamMode::Octets => Chunk::Octets(data),
            StreamMode::Objects => match codec.decode_inert(&data) {
                Ok(value) => Chunk::Object(value),
                Err(err) => {
                    debug!(stream_id = self.stream_id, %err, "rejecting stream chunk");
                    let message = match err {
                        DecodeError::NestedStream => "Received forbidden stream nesting",
                        _ => "Received invalid data",
                    };
                    self.error(ErrorValue::new(message));
                    return Feed::Rejected;
                }
            },
        };
        let Some(writer) = &self.writer else {
            return Feed::Accepted(None);
        };
        if writer.push(chunk, size).is_err() {
            // The reader is gone; its cancellation notice is on its way.
            return Feed::Accepted(None);
        }
        self.buffered += size;
        Feed::Accepted(self.check_signal())
    }

    /// The application took `bytes` off the stream.
    pub(crate) fn consumed(&mut self, bytes: usize) -> Option<Message> {
        self.buffered = self.buffered.saturating_sub(bytes);
        self.check_signal()
    }

    pub(crate) fn end(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.finish();
        }
    }

    pub(crate) fn error(&mut self, err: ErrorValue) {
        if let Some(writer) = self.writer.take() {
            writer.fail(err);
        }
    }

    fn check_signal(&mut self) -> Option<Message> {
        let available = self.high_water.saturating_sub(self.buffered);
        let window = self.received + available as u64;
        let threshold = self.high_water / 8;
        let due = match self.last_signal {
            None => true,
            Some((buffered, last_window)) => {
                self.buffered.abs_diff(buffered) > threshold
                    || window.saturating_sub(last_window) > threshold as u64
            }
        };
        if !due {
            return None;
        }
        self.last_signal = Some((self.buffered, window));
        Some(Message::StreamSignal {
            stream_id: self.stream_id,
            received_kib: self.received / 1024,
            available_kib: available as u64 / 1024,
        })
    }
}
