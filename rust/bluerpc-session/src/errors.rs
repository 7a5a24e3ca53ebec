use std::sync::Arc;

use bluerpc_types::ErrorValue;
use bluerpc_wire::EncodeError;

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    /// Local detail about why the connection failed, never sent to the peer.
    pub cause: Option<String>,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// The error value handed to cancelled invocations and broken streams.
    pub fn to_error(&self) -> ErrorValue {
        ErrorValue::new(format!("WebSocket disconnected ({}: {})", self.code, self.reason))
            .with_field("code", u32::from(self.code))
            .with_field("reason", self.reason.clone())
    }
}

/// Error from making an outgoing call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// The arguments were rejected before anything was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The caller's cancellation token fired before a response arrived.
    #[error("{0}")]
    Cancelled(ErrorValue),

    /// The peer answered with a failure response.
    #[error("{0}")]
    Remote(ErrorValue),

    /// The connection closed before a response arrived.
    #[error("WebSocket disconnected ({code}: {reason})")]
    Disconnected {
        code: u16,
        reason: String,
        cause: Option<String>,
    },

    /// The request parameter could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// No connection could be established.
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

impl CallError {
    pub fn disconnected(info: &CloseInfo) -> Self {
        CallError::Disconnected {
            code: info.code,
            reason: info.reason.clone(),
            cause: info.cause.clone(),
        }
    }

    /// The remote failure, if this is one.
    pub fn remote(&self) -> Option<&ErrorValue> {
        match self {
            CallError::Remote(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, CallError::Disconnected { .. })
    }
}

/// Failure to establish a connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    #[error("WebSocket handshake timed out")]
    Timeout,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("connection failed: {0}")]
    Io(Arc<std::io::Error>),

    /// The transport rejected the handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

impl From<std::io::Error> for ConnectError {
    fn from(err: std::io::Error) -> Self {
        ConnectError::Io(Arc::new(err))
    }
}

/// Error surfaced by a link's receive half.
#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    /// The peer sent a frame larger than the configured maximum payload.
    #[error("frame exceeds the maximum payload size")]
    TooLarge,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A configuration value is out of range.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_payload must be 0 or between {min} and {max}, got {got}")]
    MaxPayload { min: usize, max: usize, got: usize },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("heartbeat_tries must be at most 255, got {0}")]
    HeartbeatTries(u32),
}
