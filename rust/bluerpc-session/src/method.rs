use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bluerpc_types::{ErrorValue, Value};

use crate::{CancellationToken, ConnectionInfo};

pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Value, ErrorValue>> + Send>>;

/// A callable exposed to the peer.
///
/// Implemented for any `Fn(Value, MethodContext) -> impl Future` that
/// resolves to `Result<Value, ErrorValue>`.
pub trait Method: Send + Sync + 'static {
    fn call(&self, param: Value, cx: MethodContext) -> MethodFuture;
}

impl<F, Fut> Method for F
where
    F: Fn(Value, MethodContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ErrorValue>> + Send + 'static,
{
    fn call(&self, param: Value, cx: MethodContext) -> MethodFuture {
        Box::pin(self(param, cx))
    }
}

/// Method table, keyed by exact name.
///
/// Cheap to clone; one table is usually shared by every connection a
/// server accepts.
#[derive(Clone, Default)]
pub struct Methods {
    table: Arc<HashMap<String, Arc<dyn Method>>>,
}

impl Methods {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `method` under `name`, replacing any previous entry.
    pub fn method(mut self, name: impl Into<String>, method: impl Method) -> Self {
        Arc::make_mut(&mut self.table).insert(name.into(), Arc::new(method));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Method>> {
        self.table.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl fmt::Debug for Methods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.table.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Methods").field("names", &names).finish()
    }
}

/// Per-invocation context handed to a method.
#[derive(Debug, Clone)]
pub struct MethodContext {
    request_id: Option<u32>,
    token: CancellationToken,
    connection: Arc<ConnectionInfo>,
}

impl MethodContext {
    pub(crate) fn new(
        request_id: Option<u32>,
        token: CancellationToken,
        connection: Arc<ConnectionInfo>,
    ) -> Self {
        Self {
            request_id,
            token,
            connection,
        }
    }

    /// Whether the peer expects no response.
    pub fn is_notification(&self) -> bool {
        self.request_id.is_none()
    }

    pub fn request_id(&self) -> Option<u32> {
        self.request_id
    }

    /// Fires when the peer cancels the request or the connection ends.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }
}
