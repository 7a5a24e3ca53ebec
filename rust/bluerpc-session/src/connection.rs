//! One live connection.
//!
//! [`Connection::spawn`] splits a [`Link`] and starts two tasks: a driver
//! that owns all protocol state and reacts to inbound frames, local
//! commands, and stream activity; and a writer that owns the sending half
//! and tracks how many bytes are still queued. Everything else talks to the
//! driver through a cloneable [`ConnectionHandle`].
//!
//! Both sides of a connection can call methods on each other; which end
//! dialed only decides the default configuration.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use bluerpc_types::{ErrorValue, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{Instrument, info_span};

use crate::{
    CLOSE_ABNORMAL, CallError, CancellationToken, CloseInfo, ConnectionConfig, ConnectionInfo,
    Link, Methods,
};

mod driver;
mod outbox;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Opening = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(state: u8) -> Self {
        match state {
            0 => ConnectionState::Opening,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// State visible to handles without going through the driver.
#[derive(Debug)]
pub(crate) struct Shared {
    id: u64,
    state: AtomicU8,
    old: AtomicBool,
    closed: watch::Sender<Option<CloseInfo>>,
    info: Arc<ConnectionInfo>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Call {
        method: String,
        param: Value,
        cancel: Option<CancellationToken>,
        reply: oneshot::Sender<Result<Value, CallError>>,
    },
    Notify {
        method: String,
        param: Value,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    /// A caller's token fired. `streams` are the `(stream ID, serial)`
    /// pairs the request sent, which are aborted too.
    CancelCall {
        id: u32,
        streams: Vec<(u32, u64)>,
        reason: ErrorValue,
    },
    Close {
        code: u16,
        reason: String,
    },
}

/// Builder for a connection over an established [`Link`].
#[derive(Debug)]
pub struct Connection<L> {
    link: L,
    config: ConnectionConfig,
    methods: Methods,
    info: ConnectionInfo,
}

impl<L: Link> Connection<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            config: ConnectionConfig::default(),
            methods: Methods::new(),
            info: ConnectionInfo::default(),
        }
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Methods the peer may call on this side.
    pub fn methods(mut self, methods: Methods) -> Self {
        self.methods = methods;
        self
    }

    pub fn info(mut self, info: ConnectionInfo) -> Self {
        self.info = info;
        self
    }

    /// Start the connection's tasks. Must be called within a tokio runtime.
    pub fn spawn(self) -> ConnectionHandle {
        let Connection {
            link,
            config,
            methods,
            info,
        } = self;
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (closed, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            id,
            state: AtomicU8::new(ConnectionState::Opening as u8),
            old: AtomicBool::new(false),
            closed,
            info: Arc::new(info),
        });

        let span = info_span!("connection", conn_id = id);
        let (tx, rx) = link.split();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (outbox, writer) =
            outbox::Outbox::spawn(tx, config.low_water_mark(), event_tx.clone(), span.clone());
        let driver = driver::Driver::new(driver::Parts {
            shared: Arc::clone(&shared),
            rx,
            config,
            methods,
            commands,
            command_tx: command_tx.clone(),
            events,
            event_tx,
            outbox,
            writer,
        });
        tokio::spawn(driver.run().instrument(span));

        ConnectionHandle {
            commands: command_tx,
            shared,
        }
    }
}

/// Cloneable handle to a running connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    /// Process-unique ID, also recorded as `conn_id` on log events.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Whether the peer's last ping said it had nearly given up on us. A
    /// pooling client replaces such connections instead of reusing them.
    pub fn is_old(&self) -> bool {
        self.shared.old.load(Ordering::Relaxed)
    }

    /// What the transport reported about the peer.
    pub fn info(&self) -> &ConnectionInfo {
        &self.shared.info
    }

    /// Call `method` on the peer and wait for its response.
    pub async fn invoke(&self, method: &str, param: Value) -> Result<Value, CallError> {
        self.call(method, param, None).await
    }

    /// Like [`invoke`](Self::invoke), but abandoned when `cancel` fires: the
    /// call fails with [`CallError::Cancelled`], the peer is told to stop,
    /// and streams sent with the request are aborted.
    pub async fn invoke_with(
        &self,
        method: &str,
        param: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, CallError> {
        self.call(method, param, Some(cancel.clone())).await
    }

    async fn call(
        &self,
        method: &str,
        param: Value,
        cancel: Option<CancellationToken>,
    ) -> Result<Value, CallError> {
        if method.is_empty() {
            param.cancel_streams();
            return Err(CallError::InvalidArgument("method name must not be empty"));
        }
        if let Some(reason) = cancel.as_ref().and_then(CancellationToken::reason) {
            param.cancel_streams();
            return Err(CallError::Cancelled(reason));
        }
        let (reply, response) = oneshot::channel();
        let command = Command::Call {
            method: method.to_string(),
            param,
            cancel,
            reply,
        };
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            if let Command::Call { param, .. } = command {
                param.cancel_streams();
            }
            return Err(self.disconnected());
        }
        response.await.unwrap_or_else(|_| Err(self.disconnected()))
    }

    /// Call `method` on the peer without expecting a response. Resolves once
    /// the notification is queued.
    pub async fn notify(&self, method: &str, param: Value) -> Result<(), CallError> {
        if method.is_empty() {
            param.cancel_streams();
            return Err(CallError::InvalidArgument("method name must not be empty"));
        }
        let (reply, queued) = oneshot::channel();
        let command = Command::Notify {
            method: method.to_string(),
            param,
            reply,
        };
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            if let Command::Notify { param, .. } = command {
                param.cancel_streams();
            }
            return Err(self.disconnected());
        }
        queued.await.unwrap_or_else(|_| Err(self.disconnected()))
    }

    /// Start closing the connection. Calls still in flight fail once the
    /// peer acknowledges.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.commands.send(Command::Close {
            code,
            reason: reason.into(),
        });
    }

    /// Resolves once the connection has ended.
    pub async fn closed(&self) -> CloseInfo {
        let mut closed = self.shared.closed.subscribe();
        let info = closed
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|info| info.clone());
        info.unwrap_or_else(|| CloseInfo::new(CLOSE_ABNORMAL, ""))
    }

    /// How the connection ended, if it has.
    pub fn close_info(&self) -> Option<CloseInfo> {
        self.shared.closed.borrow().clone()
    }

    fn disconnected(&self) -> CallError {
        match self.close_info() {
            Some(info) => CallError::disconnected(&info),
            None => CallError::Disconnected {
                code: CLOSE_ABNORMAL,
                reason: String::new(),
                cause: Some("connection task is gone".into()),
            },
        }
    }
}
