use std::collections::BTreeMap;
use std::fmt;

use crate::Value;

/// An error value that can cross the wire.
///
/// Every error carries a `message`. Additional fields are preserved verbatim
/// when the error is exposed. Errors that are not exposed are flattened to
/// their message before transmission, so internal details (paths, SQL, stack
/// context stuffed into fields) never leak to the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    message: String,
    fields: BTreeMap<String, Value>,
    expose: bool,
}

impl ErrorValue {
    /// Create an unexposed error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fields: BTreeMap::new(),
            expose: false,
        }
    }

    /// Build an error from any `std::error::Error`, keeping only its message.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        Self::new(err.to_string())
    }

    /// Attach an extra field. `message` is reserved and ignored here.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != "message" {
            self.fields.insert(key, value.into());
        }
        self
    }

    /// Mark the error as safe to transmit with all its fields.
    pub fn exposed(mut self) -> Self {
        self.expose = true;
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn is_exposed(&self) -> bool {
        self.expose
    }

    /// The form of this error that may be sent to a peer.
    pub fn for_wire(&self) -> Self {
        if self.expose {
            self.clone()
        } else {
            Self::new(self.message.clone())
        }
    }

    /// Rebuild an error from its decoded parts. Used by the codec.
    pub fn from_parts(message: String, mut fields: BTreeMap<String, Value>) -> Self {
        fields.remove("message");
        Self {
            message,
            fields,
            expose: false,
        }
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ErrorValue {}

impl From<&str> for ErrorValue {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for ErrorValue {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// A known failure condition that a method handler reports on purpose.
///
/// Unlike other errors, a `KnownError` keeps its custom fields when it is
/// sent back to the caller.
///
/// ```
/// use bluerpc_types::{ErrorValue, KnownError};
///
/// let err: ErrorValue = KnownError::new("quota exceeded")
///     .field("limit", 10)
///     .into();
/// assert!(err.is_exposed());
/// assert_eq!(err.for_wire().field("limit").and_then(|v| v.as_int()), Some(10));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct KnownError {
    inner: ErrorValue,
}

impl KnownError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            inner: ErrorValue::new(message).exposed(),
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inner = self.inner.with_field(key, value);
        self
    }
}

impl From<KnownError> for ErrorValue {
    fn from(err: KnownError) -> Self {
        err.inner
    }
}

impl fmt::Display for KnownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl std::error::Error for KnownError {}
