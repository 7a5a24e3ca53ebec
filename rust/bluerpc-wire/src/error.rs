/// Failure to encode a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// A stream in the value already has a reader, so it cannot be sent.
    #[error("Illegal attempt to send a stream that already has a reader")]
    IllegalDoubleSend,

    /// A stream appeared in a value that may not carry streams.
    #[error("Illegal attempt to nest a stream in a control message or stream chunk")]
    IllegalNestedStream,

    #[error("encoding failed: {0}")]
    Serialize(String),
}

/// Failure to decode received bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The bytes are not well-formed.
    #[error("invalid encoding ({0})")]
    InvalidEncoding(String),

    /// An Error or Stream extension payload is malformed.
    #[error("{0}")]
    InvalidExtension(&'static str),

    /// A stream chunk carried a stream of its own.
    #[error("Stream nesting not allowed")]
    NestedStream,
}

impl DecodeError {
    /// Close reason to report when this error is fatal to a connection.
    pub fn close_reason(&self) -> &'static str {
        match self {
            DecodeError::InvalidEncoding(_) => "Invalid encoding",
            DecodeError::InvalidExtension(reason) => reason,
            DecodeError::NestedStream => "Stream nesting not allowed",
        }
    }
}
