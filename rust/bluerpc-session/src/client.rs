use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bluerpc_types::Value;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tracing::debug;

use crate::{
    CLOSE_GOING_AWAY, CLOSE_NORMAL, CallError, CancellationToken, ConnectError, ConnectionHandle,
};

const CANCELLED_BY_CLIENT: &str = "Cancelled by client";

/// Opens new connections for a [`Client`].
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<ConnectionHandle, ConnectError>> + Send;
}

type Attempt = Shared<BoxFuture<'static, Result<ConnectionHandle, ConnectError>>>;

type Live = Arc<Mutex<HashMap<u64, ConnectionHandle>>>;

/// The cached connection attempt. `epoch` changes whenever the attempt is
/// replaced, so two callers that both saw a dead attempt start only one
/// replacement.
#[derive(Default)]
struct Slot {
    epoch: u64,
    attempt: Option<Attempt>,
}

/// A pooling client that keeps at most one usable connection.
///
/// Each call reuses the current connection if it is open and not stale,
/// otherwise it dials a new one. Concurrent callers share a single dial.
pub struct Client<C> {
    inner: Arc<ClientInner<C>>,
}

struct ClientInner<C> {
    connector: Arc<C>,
    slot: Mutex<Slot>,
    generation: AtomicU64,
    live: Live,
}

impl<C> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("live", &lock(&self.inner.live).len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C: Connector> Client<C> {
    pub fn new(connector: C) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                connector: Arc::new(connector),
                slot: Mutex::new(Slot::default()),
                generation: AtomicU64::new(0),
                live: Live::default(),
            }),
        }
    }

    /// Call `method` on the server.
    pub async fn invoke(&self, method: &str, param: Value) -> Result<Value, CallError> {
        let conn = self.checked(method, &param).await?;
        conn.invoke(method, param).await
    }

    /// Call `method`, abandoning the call when `cancel` fires.
    pub async fn invoke_with(
        &self,
        method: &str,
        param: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, CallError> {
        let conn = self.checked(method, &param).await?;
        conn.invoke_with(method, param, cancel).await
    }

    /// Send a notification to the server.
    pub async fn notify(&self, method: &str, param: Value) -> Result<(), CallError> {
        let conn = self.checked(method, &param).await?;
        conn.notify(method, param).await
    }

    async fn checked(&self, method: &str, param: &Value) -> Result<ConnectionHandle, CallError> {
        if method.is_empty() {
            param.cancel_streams();
            return Err(CallError::InvalidArgument("method name must not be empty"));
        }
        self.connection().await.inspect_err(|_| param.cancel_streams())
    }

    /// The current connection, dialing a new one if needed.
    pub async fn connection(&self) -> Result<ConnectionHandle, CallError> {
        let generation = self.inner.generation.load(Ordering::Acquire);
        let conn = self.current().await?;
        if self.inner.generation.load(Ordering::Acquire) != generation {
            debug!(conn_id = conn.id(), "connection finished after the client was cancelled");
            conn.close(CLOSE_GOING_AWAY, CANCELLED_BY_CLIENT);
            return Err(CallError::Disconnected {
                code: CLOSE_GOING_AWAY,
                reason: CANCELLED_BY_CLIENT.into(),
                cause: None,
            });
        }
        Ok(conn)
    }

    async fn current(&self) -> Result<ConnectionHandle, ConnectError> {
        let (epoch, cached) = {
            let slot = lock(&self.inner.slot);
            (slot.epoch, slot.attempt.clone())
        };
        if let Some(attempt) = cached {
            if let Ok(conn) = attempt.await {
                if conn.is_open() && !conn.is_old() {
                    return Ok(conn);
                }
            }
        }

        let attempt = {
            let mut slot = lock(&self.inner.slot);
            match &slot.attempt {
                Some(attempt) if slot.epoch != epoch => attempt.clone(),
                _ => {
                    let attempt = self.dial();
                    slot.epoch += 1;
                    slot.attempt = Some(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    fn dial(&self) -> Attempt {
        let connector = Arc::clone(&self.inner.connector);
        let live = Arc::clone(&self.inner.live);
        async move {
            let conn = connector.connect().await?;
            debug!(conn_id = conn.id(), "client connected");
            track(&live, &conn);
            Ok(conn)
        }
        .boxed()
        .shared()
    }

    /// Close every connection this client opened, failing the calls in
    /// flight. A dial that is still running is closed when it completes.
    /// Later calls dial afresh.
    pub fn cancel(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        let live: Vec<ConnectionHandle> = lock(&self.inner.live).values().cloned().collect();
        for conn in live {
            conn.close(CLOSE_GOING_AWAY, CANCELLED_BY_CLIENT);
        }
    }
}

/// Remember `conn` until it closes.
fn track(live: &Live, conn: &ConnectionHandle) {
    lock(live).insert(conn.id(), conn.clone());
    let live = Arc::downgrade(live);
    let conn = conn.clone();
    tokio::spawn(async move {
        conn.closed().await;
        if let Some(live) = live.upgrade() {
            lock(&live).remove(&conn.id());
        }
    });
}

impl<C> Drop for ClientInner<C> {
    fn drop(&mut self) {
        for conn in lock(&self.live).values() {
            conn.close(CLOSE_NORMAL, "");
        }
    }
}
