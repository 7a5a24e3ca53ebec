use std::collections::BTreeMap;

use bytes::Bytes;

use crate::{ErrorValue, StreamHandle};

/// A dynamically typed value, as carried by requests, responses and object
/// streams.
///
/// Streams compare by identity: two `Value::Stream`s are equal only if they
/// refer to the same underlying stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Error(Box<ErrorValue>),
    Stream(StreamHandle),
}

impl Value {
    /// Build a map from key/value pairs.
    pub fn map<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            Value::Error(err) => Some(&**err),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&StreamHandle> {
        match self {
            Value::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    /// Look up a key, if this is a map.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Every stream handle reachable from this value, each listed once.
    ///
    /// Error fields are searched too, since they are ordinary values.
    pub fn streams(&self) -> Vec<StreamHandle> {
        let mut found: Vec<StreamHandle> = Vec::new();
        self.walk_streams(&mut |stream| {
            if !found.iter().any(|seen| seen.same_stream(stream)) {
                found.push(stream.clone());
            }
        });
        found
    }

    /// Cancel every unlocked stream in this value.
    ///
    /// Call this when a value is abandoned before it could be sent, so the
    /// producers behind its streams are released.
    pub fn cancel_streams(&self) {
        self.walk_streams(&mut |stream| stream.cancel());
    }

    fn walk_streams(&self, visit: &mut impl FnMut(&StreamHandle)) {
        match self {
            Value::Stream(stream) => visit(stream),
            Value::Array(items) => items.iter().for_each(|item| item.walk_streams(visit)),
            Value::Map(map) => map.values().for_each(|item| item.walk_streams(visit)),
            Value::Error(err) => err.fields().values().for_each(|item| item.walk_streams(visit)),
            _ => {}
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(i: $t) -> Self {
                    Value::Int(i64::from(i))
                }
            }
        )*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl From<ErrorValue> for Value {
    fn from(err: ErrorValue) -> Self {
        Value::Error(Box::new(err))
    }
}

impl From<StreamHandle> for Value {
    fn from(stream: StreamHandle) -> Self {
        Value::Stream(stream)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Nil, Into::into)
    }
}
