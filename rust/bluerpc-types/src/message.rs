use bytes::Bytes;

use crate::{ErrorValue, Value};

/// Wire message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    Notification = 1,
    ResponseSuccess = 2,
    ResponseFailure = 3,
    Cancellation = 4,
    StreamChunkData = 5,
    StreamChunkEnd = 6,
    StreamChunkError = 7,
    StreamCancellation = 8,
    StreamSignal = 9,
}

/// First type number that is never valid on the wire.
pub const RESERVED_MESSAGE_TYPE: i64 = 10;

impl TryFrom<i64> for MessageType {
    type Error = i64;

    fn try_from(raw: i64) -> Result<Self, i64> {
        Ok(match raw {
            0 => MessageType::Request,
            1 => MessageType::Notification,
            2 => MessageType::ResponseSuccess,
            3 => MessageType::ResponseFailure,
            4 => MessageType::Cancellation,
            5 => MessageType::StreamChunkData,
            6 => MessageType::StreamChunkEnd,
            7 => MessageType::StreamChunkError,
            8 => MessageType::StreamCancellation,
            9 => MessageType::StreamSignal,
            other => return Err(other),
        })
    }
}

/// A protocol message, in the positional-tuple layout
/// `[type, ...fields]`.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: u32,
        method: String,
        param: Value,
    },
    Notification {
        method: String,
        param: Value,
    },
    ResponseSuccess {
        id: u32,
        result: Value,
    },
    ResponseFailure {
        id: u32,
        error: ErrorValue,
    },
    Cancellation {
        id: u32,
    },
    StreamChunkData {
        stream_id: u32,
        data: Bytes,
    },
    StreamChunkEnd {
        stream_id: u32,
    },
    StreamChunkError {
        stream_id: u32,
        error: ErrorValue,
    },
    StreamCancellation {
        stream_id: u32,
    },
    /// Flow-control feedback, in KiB: everything received so far, and the
    /// receiver's remaining buffer budget.
    StreamSignal {
        stream_id: u32,
        received_kib: u64,
        available_kib: u64,
    },
}

/// Result of validating an inbound message value.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(Message),
    /// A type above the reserved marker, kept for forward compatibility.
    /// Receivers ignore it.
    Reserved(i64),
}

/// The value was not a structurally valid message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid message: {0}")]
pub struct InvalidMessage(pub &'static str);

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Request { .. } => MessageType::Request,
            Message::Notification { .. } => MessageType::Notification,
            Message::ResponseSuccess { .. } => MessageType::ResponseSuccess,
            Message::ResponseFailure { .. } => MessageType::ResponseFailure,
            Message::Cancellation { .. } => MessageType::Cancellation,
            Message::StreamChunkData { .. } => MessageType::StreamChunkData,
            Message::StreamChunkEnd { .. } => MessageType::StreamChunkEnd,
            Message::StreamChunkError { .. } => MessageType::StreamChunkError,
            Message::StreamCancellation { .. } => MessageType::StreamCancellation,
            Message::StreamSignal { .. } => MessageType::StreamSignal,
        }
    }

    /// Lay the message out as its wire tuple.
    pub fn into_value(self) -> Value {
        let tag = Value::Int(self.message_type() as i64);
        let fields = match self {
            Message::Request { id, method, param } => {
                vec![tag, id.into(), method.into(), param]
            }
            Message::Notification { method, param } => vec![tag, method.into(), param],
            Message::ResponseSuccess { id, result } => vec![tag, id.into(), result],
            Message::ResponseFailure { id, error } => vec![tag, id.into(), error.into()],
            Message::Cancellation { id } => vec![tag, id.into()],
            Message::StreamChunkData { stream_id, data } => {
                vec![tag, stream_id.into(), Value::Bytes(data)]
            }
            Message::StreamChunkEnd { stream_id } => vec![tag, stream_id.into()],
            Message::StreamChunkError { stream_id, error } => {
                vec![tag, stream_id.into(), error.into()]
            }
            Message::StreamCancellation { stream_id } => vec![tag, stream_id.into()],
            Message::StreamSignal {
                stream_id,
                received_kib,
                available_kib,
            } => vec![
                tag,
                stream_id.into(),
                counter(received_kib),
                counter(available_kib),
            ],
        };
        Value::Array(fields)
    }

    /// Validate a decoded value and turn it into a message.
    pub fn from_value(value: Value) -> Result<Inbound, InvalidMessage> {
        let Value::Array(fields) = value else {
            return Err(InvalidMessage("not an array"));
        };
        let raw_type = match fields.first() {
            Some(Value::Int(t)) => *t,
            _ => return Err(InvalidMessage("message type is not an integer")),
        };
        if raw_type < 0 || raw_type == RESERVED_MESSAGE_TYPE {
            return Err(InvalidMessage("illegal message type"));
        }
        let Ok(msg_type) = MessageType::try_from(raw_type) else {
            return Ok(Inbound::Reserved(raw_type));
        };

        let arity = match msg_type {
            MessageType::Request | MessageType::StreamSignal => 4,
            MessageType::Cancellation
            | MessageType::StreamChunkEnd
            | MessageType::StreamCancellation => 2,
            _ => 3,
        };
        if fields.len() != arity {
            return Err(InvalidMessage("wrong number of fields"));
        }

        let mut fields = fields.into_iter().skip(1);
        let mut next = move || fields.next().unwrap_or_default();

        let msg = match msg_type {
            MessageType::Request => Message::Request {
                id: id(next())?,
                method: string(next())?,
                param: next(),
            },
            MessageType::Notification => Message::Notification {
                method: string(next())?,
                param: next(),
            },
            MessageType::ResponseSuccess => Message::ResponseSuccess {
                id: id(next())?,
                result: next(),
            },
            MessageType::ResponseFailure => Message::ResponseFailure {
                id: id(next())?,
                error: error(next())?,
            },
            MessageType::Cancellation => Message::Cancellation { id: id(next())? },
            MessageType::StreamChunkData => Message::StreamChunkData {
                stream_id: id(next())?,
                data: match next() {
                    Value::Bytes(data) => data,
                    _ => return Err(InvalidMessage("chunk data is not binary")),
                },
            },
            MessageType::StreamChunkEnd => Message::StreamChunkEnd {
                stream_id: id(next())?,
            },
            MessageType::StreamChunkError => Message::StreamChunkError {
                stream_id: id(next())?,
                error: error(next())?,
            },
            MessageType::StreamCancellation => Message::StreamCancellation {
                stream_id: id(next())?,
            },
            MessageType::StreamSignal => Message::StreamSignal {
                stream_id: id(next())?,
                received_kib: unsigned(next())?,
                available_kib: unsigned(next())?,
            },
        };
        Ok(Inbound::Message(msg))
    }
}

fn counter(n: u64) -> Value {
    Value::Int(i64::try_from(n).unwrap_or(i64::MAX))
}

fn id(value: Value) -> Result<u32, InvalidMessage> {
    match value {
        Value::Int(i) => u32::try_from(i).map_err(|_| InvalidMessage("ID out of range")),
        _ => Err(InvalidMessage("ID is not an integer")),
    }
}

fn unsigned(value: Value) -> Result<u64, InvalidMessage> {
    match value {
        Value::Int(i) => u64::try_from(i).map_err(|_| InvalidMessage("negative counter")),
        _ => Err(InvalidMessage("counter is not an integer")),
    }
}

fn string(value: Value) -> Result<String, InvalidMessage> {
    match value {
        Value::Str(s) => Ok(s),
        _ => Err(InvalidMessage("method name is not a string")),
    }
}

fn error(value: Value) -> Result<ErrorValue, InvalidMessage> {
    match value {
        Value::Error(err) => Ok(*err),
        _ => Err(InvalidMessage("error field is not an Error")),
    }
}
