use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use bluerpc_types::{ErrorValue, Inbound, Message, StreamHandle, StreamObserver, Value};
use bluerpc_wire::{Codec, Decoded, Incrementor};
use bytes::Bytes;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, trace, warn};

use super::outbox::Outbox;
use super::{Command, ConnectionState, Shared};
use crate::flow::{
    Feed, Outbound, SourceControl, SourceItem, StreamReceiver, StreamSender, spawn_pump,
};
use crate::heartbeat::{Beat, Heartbeat};
use crate::{
    CLOSE_ABNORMAL, CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_NO_STATUS,
    CLOSE_POLICY_VIOLATION, CLOSE_TOO_BIG, CLOSE_UNSUPPORTED_DATA, CallError, CancelRegistration,
    CancellationToken, CloseFrame, CloseInfo, ConnectionConfig, Frame, LinkRx, MethodContext,
    Methods, RecvError,
};

/// Things that happen off the driver task and need its attention.
#[derive(Debug)]
pub(crate) enum Event {
    /// A pump read from a stream being sent.
    Source {
        stream_id: u32,
        serial: u64,
        item: SourceItem,
    },
    /// The application read from a received stream.
    Consumed {
        stream_id: u32,
        serial: u64,
        bytes: usize,
    },
    /// The application abandoned a received stream.
    ReaderGone { stream_id: u32, serial: u64 },
    /// The writer's buffer fell below the low-water mark.
    Drained,
    WriteFailed(String),
    Completed { slot: Slot, outcome: Outcome },
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Slot {
    Request(u32),
    Notification(u64),
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Returned(Result<Value, ErrorValue>),
    Panicked,
}

/// A call this side made that awaits a response.
#[derive(Debug)]
struct PendingCall {
    reply: oneshot::Sender<Result<Value, CallError>>,
    cancel: Option<(CancellationToken, CancelRegistration)>,
}

impl PendingCall {
    /// Deliver the outcome and stop listening to the caller's token.
    fn settle(self, result: Result<Value, CallError>) {
        if let Some((token, registration)) = &self.cancel {
            token.deregister(*registration);
        }
        let _ = self.reply.send(result);
    }
}

/// A method call the peer made that is still running.
#[derive(Debug)]
struct Invocation {
    method: String,
    token: CancellationToken,
    /// Streams that arrived with the call; any the method did not take are
    /// released when it returns.
    streams: Vec<StreamHandle>,
}

struct Finish {
    info: CloseInfo,
    /// Drop the transport without waiting for queued frames.
    terminate: bool,
}

/// Reports consumption of a received stream back to the driver.
struct ReceiverObserver {
    stream_id: u32,
    serial: u64,
    events: mpsc::UnboundedSender<Event>,
}

impl StreamObserver for ReceiverObserver {
    fn consumed(&self, bytes: usize) {
        let _ = self.events.send(Event::Consumed {
            stream_id: self.stream_id,
            serial: self.serial,
            bytes,
        });
    }

    fn cancelled(&self) {
        let _ = self.events.send(Event::ReaderGone {
            stream_id: self.stream_id,
            serial: self.serial,
        });
    }
}

/// Stream senders and receivers write through this.
struct Out<'a> {
    outbox: &'a Outbox,
    codec: &'a Codec,
}

impl Outbound for Out<'_> {
    fn buffered_amount(&self) -> usize {
        self.outbox.buffered()
    }

    fn send(&mut self, msg: Message) {
        send_inert(self.outbox, self.codec, msg);
    }

    fn want_drain(&mut self) {
        self.outbox.want_drain();
    }
}

/// Queue a message that carries no streams.
fn send_inert(outbox: &Outbox, codec: &Codec, msg: Message) {
    // An exposed error may hold values that cannot go on a stream; fall
    // back to its bare message.
    let fallback = match &msg {
        Message::StreamChunkError { stream_id, error } => Some(Message::StreamChunkError {
            stream_id: *stream_id,
            error: ErrorValue::new(error.message()),
        }),
        _ => None,
    };
    match codec.encode_inert(&msg.into_value()) {
        Ok(bytes) => outbox.send_bytes(bytes),
        Err(err) => {
            warn!(%err, "failed to encode control message");
            if let Some(Ok(bytes)) = fallback.map(|msg| codec.encode_inert(&msg.into_value())) {
                outbox.send_bytes(bytes);
            }
        }
    }
}

pub(crate) struct Parts<Rx> {
    pub(crate) shared: Arc<Shared>,
    pub(crate) rx: Rx,
    pub(crate) config: ConnectionConfig,
    pub(crate) methods: Methods,
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,
    pub(crate) command_tx: mpsc::UnboundedSender<Command>,
    pub(crate) events: mpsc::UnboundedReceiver<Event>,
    pub(crate) event_tx: mpsc::UnboundedSender<Event>,
    pub(crate) outbox: Outbox,
    pub(crate) writer: JoinHandle<()>,
}

pub(crate) struct Driver<Rx> {
    shared: Arc<Shared>,
    rx: Rx,
    config: ConnectionConfig,
    methods: Methods,
    codec: Codec,
    request_ids: Incrementor,
    next_serial: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<Event>,
    event_tx: mpsc::UnboundedSender<Event>,
    outbox: Outbox,
    writer: JoinHandle<()>,
    heartbeat: Heartbeat,

    /// Calls made by this side, by request ID.
    pending: HashMap<u32, PendingCall>,
    /// Requests from the peer, by request ID.
    requests: HashMap<u32, Invocation>,
    /// Notifications from the peer, by serial.
    notifications: HashMap<u64, Invocation>,
    sent: HashMap<u32, StreamSender>,
    received: HashMap<u32, StreamReceiver>,

    /// Set once a close frame went out: how to report the close, and when
    /// to stop waiting for the peer's reply.
    closing: Option<(CloseInfo, Instant)>,
    finished: Option<Finish>,
}

impl<Rx: LinkRx> Driver<Rx> {
    pub(crate) fn new(parts: Parts<Rx>) -> Self {
        let heartbeat = Heartbeat::new(
            parts.config.heartbeat_interval,
            parts.config.heartbeat_tries,
        );
        Self {
            shared: parts.shared,
            rx: parts.rx,
            config: parts.config,
            methods: parts.methods,
            codec: Codec::new(),
            request_ids: Incrementor::new(),
            next_serial: 0,
            commands: parts.commands,
            command_tx: parts.command_tx,
            events: parts.events,
            event_tx: parts.event_tx,
            outbox: parts.outbox,
            writer: parts.writer,
            heartbeat,
            pending: HashMap::new(),
            requests: HashMap::new(),
            notifications: HashMap::new(),
            sent: HashMap::new(),
            received: HashMap::new(),
            closing: None,
            finished: None,
        }
    }

    pub(crate) async fn run(mut self) {
        self.shared.set_state(ConnectionState::Open);
        debug!("connection open");

        let finish = loop {
            let heartbeat_at = self.heartbeat.deadline();
            let close_by = self.closing.as_ref().map(|(_, deadline)| *deadline);
            tokio::select! {
                frame = self.rx.recv() => self.on_frame(frame),
                Some(command) = self.commands.recv() => self.on_command(command),
                Some(event) = self.events.recv() => self.on_event(event),
                _ = sleep_until(heartbeat_at), if close_by.is_none() => self.on_heartbeat(),
                _ = sleep_until(close_by.unwrap_or(heartbeat_at)), if close_by.is_some() => {
                    self.on_close_timeout();
                }
            }
            if let Some(finish) = self.finished.take() {
                break finish;
            }
        };
        self.teardown(finish);
    }

    fn next_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    fn next_request_id(&mut self) -> u32 {
        loop {
            let id = self.request_ids.next_id();
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    fn send_message(&self, msg: Message) {
        send_inert(&self.outbox, &self.codec, msg);
    }

    // ---------------------------------------------------------------------
    // Inbound frames
    // ---------------------------------------------------------------------

    fn on_frame(&mut self, frame: Result<Option<Frame>, RecvError>) {
        match frame {
            Ok(Some(Frame::Binary(bytes))) => {
                self.heartbeat.reset();
                if self.closing.is_some() {
                    return;
                }
                let max = self.config.max_payload;
                if max != 0 && bytes.len() > max {
                    let cause = format!("received {} bytes, limit is {max}", bytes.len());
                    self.violation(CLOSE_TOO_BIG, "Message too big", cause);
                    return;
                }
                self.on_message(bytes);
            }
            Ok(Some(Frame::Text(_))) => {
                self.heartbeat.reset();
                if self.closing.is_none() {
                    self.violation(
                        CLOSE_UNSUPPORTED_DATA,
                        "Text frames not allowed",
                        "received a text frame",
                    );
                }
            }
            Ok(Some(Frame::Ping(payload))) => {
                self.heartbeat.reset();
                let old = payload.first() == Some(&0);
                self.shared.old.store(old, Ordering::Relaxed);
            }
            Ok(Some(Frame::Pong(_))) => self.heartbeat.reset(),
            Ok(Some(Frame::Close(frame))) => {
                let info = match (self.closing.take(), frame) {
                    (Some((info, _)), _) => info,
                    (None, Some(frame)) => CloseInfo::new(frame.code, frame.reason),
                    (None, None) => CloseInfo::new(CLOSE_NO_STATUS, ""),
                };
                self.finish(info, false);
            }
            Ok(None) => {
                let info = match self.closing.take() {
                    Some((info, _)) => info,
                    None => CloseInfo::new(CLOSE_ABNORMAL, "")
                        .with_cause("transport ended without a close frame"),
                };
                self.finish(info, false);
            }
            Err(RecvError::TooLarge) => {
                self.outbox.send_frame(Frame::Close(Some(CloseFrame {
                    code: CLOSE_TOO_BIG,
                    reason: "Message too big".into(),
                })));
                let info = CloseInfo::new(CLOSE_TOO_BIG, "Message too big")
                    .with_cause("transport rejected an oversized frame");
                self.finish(info, false);
            }
            Err(RecvError::Io(err)) => {
                let info = CloseInfo::new(CLOSE_ABNORMAL, "").with_cause(err.to_string());
                self.finish(info, true);
            }
        }
    }

    fn on_message(&mut self, bytes: Bytes) {
        let Decoded { value, streams } = match self.codec.decode(&bytes) {
            Ok(decoded) => decoded,
            Err(err) => {
                let cause = format!("received invalid data: {err}");
                return self.violation(CLOSE_POLICY_VIOLATION, err.close_reason(), cause);
            }
        };
        let msg = match Message::from_value(value) {
            Ok(Inbound::Message(msg)) => msg,
            Ok(Inbound::Reserved(kind)) => {
                debug!(kind, "ignoring message of reserved type");
                return self.discard_streams(streams);
            }
            Err(err) => {
                return self.violation(CLOSE_POLICY_VIOLATION, "Invalid message", err.to_string());
            }
        };

        if let Message::Request { id, .. } = &msg {
            if self.requests.contains_key(id) {
                let cause = format!("request {id} is already running");
                return self.violation(CLOSE_POLICY_VIOLATION, "Illegal duplicate ID", cause);
            }
        }
        if !streams.is_empty() {
            if matches!(msg, Message::StreamChunkError { .. }) {
                return self.violation(
                    CLOSE_POLICY_VIOLATION,
                    "Stream nesting not allowed",
                    "stream error carried a stream",
                );
            }
            if let Some(id) = streams.keys().find(|id| self.received.contains_key(*id)) {
                let cause = format!("stream {id} is already open");
                return self.violation(CLOSE_POLICY_VIOLATION, "Illegal duplicate ID", cause);
            }
        }

        trace!(kind = ?msg.message_type(), "received message");
        match msg {
            Message::Request { id, method, param } => {
                self.on_invocation(Some(id), method, param, streams);
            }
            Message::Notification { method, param } => {
                self.on_invocation(None, method, param, streams);
            }
            Message::ResponseSuccess { id, result } => self.on_response(id, Ok(result), streams),
            Message::ResponseFailure { id, error } => {
                self.on_response(id, Err(CallError::Remote(error)), streams);
            }
            Message::Cancellation { id } => {
                if let Some(invocation) = self.requests.get(&id) {
                    debug!(id, method = %invocation.method, "peer cancelled request");
                    invocation
                        .token
                        .cancel_with(ErrorValue::new("Request cancelled by peer"));
                }
            }
            Message::StreamChunkData { stream_id, data } => {
                let Some(receiver) = self.received.get_mut(&stream_id) else {
                    return;
                };
                match receiver.write(data, &self.codec) {
                    Feed::Accepted(Some(signal)) => self.send_message(signal),
                    Feed::Accepted(None) => {}
                    Feed::Rejected => {
                        self.received.remove(&stream_id);
                        self.send_message(Message::StreamCancellation { stream_id });
                    }
                }
            }
            Message::StreamChunkEnd { stream_id } => {
                if let Some(mut receiver) = self.received.remove(&stream_id) {
                    receiver.end();
                }
            }
            Message::StreamChunkError { stream_id, error } => {
                if let Some(mut receiver) = self.received.remove(&stream_id) {
                    receiver.error(error);
                }
            }
            Message::StreamCancellation { stream_id } => {
                if let Some(mut sender) = self.sent.remove(&stream_id) {
                    debug!(stream_id, "peer cancelled stream");
                    sender.cancel();
                }
            }
            Message::StreamSignal {
                stream_id,
                received_kib,
                available_kib,
            } => {
                let Some(sender) = self.sent.get_mut(&stream_id) else {
                    return;
                };
                let mut out = Out {
                    outbox: &self.outbox,
                    codec: &self.codec,
                };
                if sender.signal(received_kib, available_kib, &mut out) {
                    self.sent.remove(&stream_id);
                }
            }
        }
    }

    fn on_invocation(
        &mut self,
        id: Option<u32>,
        method: String,
        param: Value,
        streams: BTreeMap<u32, StreamHandle>,
    ) {
        let Some(handler) = self.methods.get(&method) else {
            debug!(%method, request_id = id, "method not found");
            self.discard_streams(streams);
            if let Some(id) = id {
                self.send_message(Message::ResponseFailure {
                    id,
                    error: ErrorValue::new("Method not found"),
                });
            }
            return;
        };
        debug!(%method, request_id = id, "method invoked");

        let streams = self.accept_streams(streams);
        let token = CancellationToken::new();
        let cx = MethodContext::new(id, token.clone(), Arc::clone(&self.shared.info));
        let invocation = Invocation {
            method,
            token,
            streams,
        };
        let slot = match id {
            Some(id) => {
                self.requests.insert(id, invocation);
                Slot::Request(id)
            }
            None => {
                let serial = self.next_serial();
                self.notifications.insert(serial, invocation);
                Slot::Notification(serial)
            }
        };

        let events = self.event_tx.clone();
        tokio::spawn(async move {
            let call = async move { handler.call(param, cx).await };
            let outcome = match AssertUnwindSafe(call).catch_unwind().await {
                Ok(result) => Outcome::Returned(result),
                Err(_) => Outcome::Panicked,
            };
            let _ = events.send(Event::Completed { slot, outcome });
        });
    }

    fn on_response(
        &mut self,
        id: u32,
        result: Result<Value, CallError>,
        streams: BTreeMap<u32, StreamHandle>,
    ) {
        match self.pending.remove(&id) {
            Some(call) => {
                self.accept_streams(streams);
                call.settle(result);
            }
            None => {
                debug!(id, "response to unknown request");
                self.discard_streams(streams);
            }
        }
    }

    /// Start receiving the streams that arrived with a message.
    fn accept_streams(&mut self, streams: BTreeMap<u32, StreamHandle>) -> Vec<StreamHandle> {
        let mut accepted = Vec::with_capacity(streams.len());
        for (stream_id, handle) in streams {
            let serial = self.next_serial();
            let observer = Arc::new(ReceiverObserver {
                stream_id,
                serial,
                events: self.event_tx.clone(),
            });
            let Some(writer) = handle.attach(observer) else {
                continue;
            };
            let mut receiver = StreamReceiver::new(
                stream_id,
                serial,
                writer,
                self.config.receive_high_water_mark,
            );
            if let Some(signal) = receiver.start() {
                self.send_message(signal);
            }
            self.received.insert(stream_id, receiver);
            accepted.push(handle);
        }
        accepted
    }

    /// Refuse streams nobody will read.
    fn discard_streams(&mut self, streams: BTreeMap<u32, StreamHandle>) {
        for (stream_id, handle) in streams {
            handle.cancel();
            self.send_message(Message::StreamCancellation { stream_id });
        }
    }

    /// Start sending the streams an outbound message carried. Returns their
    /// `(stream ID, serial)` pairs.
    fn start_senders(&mut self, streams: Vec<(u32, StreamHandle)>) -> Vec<(u32, u64)> {
        let mut started = Vec::with_capacity(streams.len());
        for (stream_id, handle) in streams {
            let Some(reader) = handle.reader() else {
                self.send_message(Message::StreamChunkError {
                    stream_id,
                    error: ErrorValue::new("Stream was read locally before it could be sent"),
                });
                continue;
            };
            let serial = self.next_serial();
            let (control, signals) = SourceControl::new();
            let events = self.event_tx.clone();
            spawn_pump(reader, signals, move |item| {
                let _ = events.send(Event::Source {
                    stream_id,
                    serial,
                    item,
                });
            });
            let sender = StreamSender::new(
                stream_id,
                serial,
                handle.mode(),
                control,
                self.config.ideal_chunk_size,
                self.config.send_high_water_mark,
            );
            self.sent.insert(stream_id, sender);
            started.push((stream_id, serial));
        }
        started
    }

    // ---------------------------------------------------------------------
    // Local commands
    // ---------------------------------------------------------------------

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Call {
                method,
                param,
                cancel,
                reply,
            } => {
                if let Some(err) = self.refuse_new_work(&param) {
                    let _ = reply.send(Err(err));
                    return;
                }
                let id = self.next_request_id();
                let value = Message::Request { id, method, param }.into_value();
                let streams = match self.encode_and_send(&value) {
                    Ok(streams) => streams,
                    Err(err) => {
                        let _ = reply.send(Err(err));
                        return;
                    }
                };
                let cancel = cancel.map(|token| {
                    let commands = self.command_tx.clone();
                    let registration = token.on_cancel(move |reason| {
                        let _ = commands.send(Command::CancelCall {
                            id,
                            streams,
                            reason: reason.clone(),
                        });
                    });
                    (token, registration)
                });
                self.pending.insert(id, PendingCall { reply, cancel });
            }
            Command::Notify {
                method,
                param,
                reply,
            } => {
                if let Some(err) = self.refuse_new_work(&param) {
                    let _ = reply.send(Err(err));
                    return;
                }
                let value = Message::Notification { method, param }.into_value();
                let _ = reply.send(self.encode_and_send(&value).map(|_| ()));
            }
            Command::CancelCall {
                id,
                streams,
                reason,
            } => {
                if let Some(call) = self.pending.remove(&id) {
                    debug!(id, "request cancelled locally");
                    call.settle(Err(CallError::Cancelled(reason.clone())));
                    if self.closing.is_none() {
                        self.send_message(Message::Cancellation { id });
                    }
                }
                for (stream_id, serial) in streams {
                    let Some(sender) = self.sent.get_mut(&stream_id) else {
                        continue;
                    };
                    if sender.serial() != serial {
                        continue;
                    }
                    let mut out = Out {
                        outbox: &self.outbox,
                        codec: &self.codec,
                    };
                    sender.abort(&reason, &mut out);
                    self.sent.remove(&stream_id);
                }
            }
            Command::Close { code, reason } => {
                debug!(code, %reason, "closing on request");
                self.begin_close(CloseInfo::new(code, reason));
            }
        }
    }

    fn refuse_new_work(&self, param: &Value) -> Option<CallError> {
        let info = match (&self.closing, &self.finished) {
            (Some((info, _)), _) => info,
            (None, Some(finish)) => &finish.info,
            (None, None) => return None,
        };
        param.cancel_streams();
        Some(CallError::disconnected(info))
    }

    /// Encode and queue an outbound value, starting senders for its streams.
    fn encode_and_send(&mut self, value: &Value) -> Result<Vec<(u32, u64)>, CallError> {
        let sent = &self.sent;
        match self.codec.encode(value, |id| sent.contains_key(&id)) {
            Ok(encoded) => {
                self.outbox.send_bytes(encoded.bytes);
                Ok(self.start_senders(encoded.streams))
            }
            Err(err) => {
                value.cancel_streams();
                Err(err.into())
            }
        }
    }

    // ---------------------------------------------------------------------
    // Events from other tasks
    // ---------------------------------------------------------------------

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Source {
                stream_id,
                serial,
                item,
            } => {
                let Some(sender) = self.sent.get_mut(&stream_id) else {
                    return;
                };
                if sender.serial() != serial {
                    return;
                }
                let mut out = Out {
                    outbox: &self.outbox,
                    codec: &self.codec,
                };
                if sender.on_item(item, &self.codec, &mut out) {
                    self.sent.remove(&stream_id);
                }
            }
            Event::Consumed {
                stream_id,
                serial,
                bytes,
            } => {
                let signal = match self.received.get_mut(&stream_id) {
                    Some(receiver) if receiver.serial() == serial => receiver.consumed(bytes),
                    _ => None,
                };
                if let Some(signal) = signal {
                    self.send_message(signal);
                }
            }
            Event::ReaderGone { stream_id, serial } => {
                let current = self
                    .received
                    .get(&stream_id)
                    .is_some_and(|receiver| receiver.serial() == serial);
                if current {
                    debug!(stream_id, "stream abandoned locally");
                    self.received.remove(&stream_id);
                    self.send_message(Message::StreamCancellation { stream_id });
                }
            }
            Event::Drained => {
                let mut out = Out {
                    outbox: &self.outbox,
                    codec: &self.codec,
                };
                self.sent
                    .retain(|_, sender| !sender.resume_if_possible(&mut out));
            }
            Event::WriteFailed(cause) => {
                let info = CloseInfo::new(CLOSE_ABNORMAL, "").with_cause(cause);
                self.finish(info, true);
            }
            Event::Completed { slot, outcome } => self.on_completed(slot, outcome),
        }
    }

    fn on_completed(&mut self, slot: Slot, outcome: Outcome) {
        let invocation = match slot {
            Slot::Request(id) => self.requests.remove(&id),
            Slot::Notification(serial) => self.notifications.remove(&serial),
        };
        let Some(invocation) = invocation else {
            return;
        };
        match outcome {
            Outcome::Panicked => {
                error!(method = %invocation.method, "method panicked");
                let cause = format!("method {} panicked", invocation.method);
                self.violation(CLOSE_INTERNAL_ERROR, "Server error", cause);
            }
            Outcome::Returned(result) => self.respond(slot, &invocation, result),
        }
        for handle in &invocation.streams {
            handle.cancel();
        }
    }

    fn respond(&mut self, slot: Slot, invocation: &Invocation, result: Result<Value, ErrorValue>) {
        let method = &invocation.method;
        match &result {
            Ok(_) => debug!(%method, "method succeeded"),
            Err(err) => debug!(%method, %err, "method failed"),
        }
        let id = match slot {
            Slot::Request(id) if !invocation.token.is_cancelled() && self.closing.is_none() => id,
            _ => {
                if let Ok(value) = &result {
                    value.cancel_streams();
                }
                return;
            }
        };
        let msg = match result {
            Ok(value) => Message::ResponseSuccess { id, result: value },
            Err(err) => Message::ResponseFailure {
                id,
                error: err.for_wire(),
            },
        };
        if let Err(err) = self.encode_and_send(&msg.into_value()) {
            error!(%method, %err, "failed to encode response");
            let cause = format!("failed to encode response of {method}: {err}");
            self.violation(CLOSE_INTERNAL_ERROR, "Server error", cause);
        }
    }

    // ---------------------------------------------------------------------
    // Liveness and shutdown
    // ---------------------------------------------------------------------

    fn on_heartbeat(&mut self) {
        match self.heartbeat.expired() {
            Beat::Ping(left) => {
                trace!(left, "heartbeat ping");
                self.outbox.send_frame(Frame::Ping(Bytes::copy_from_slice(&[left])));
            }
            Beat::Failed => {
                warn!("heartbeat failed, dropping connection");
                self.outbox.send_frame(Frame::Close(Some(CloseFrame {
                    code: CLOSE_GOING_AWAY,
                    reason: "Connection timed out".into(),
                })));
                self.finish(CloseInfo::new(CLOSE_ABNORMAL, "heartbeat failure"), true);
            }
        }
    }

    fn on_close_timeout(&mut self) {
        if let Some((info, _)) = self.closing.take() {
            debug!("peer did not acknowledge close");
            self.finish(info, true);
        }
    }

    /// The peer broke the protocol.
    fn violation(&mut self, code: u16, reason: &str, cause: impl Into<String>) {
        let cause = cause.into();
        warn!(code, reason, %cause, "closing connection");
        self.begin_close(CloseInfo::new(code, reason).with_cause(cause));
    }

    fn begin_close(&mut self, info: CloseInfo) {
        if self.closing.is_some() || self.finished.is_some() {
            return;
        }
        self.shared.set_state(ConnectionState::Closing);
        self.outbox.send_frame(Frame::Close(Some(CloseFrame {
            code: info.code,
            reason: info.reason.clone(),
        })));
        let deadline = Instant::now() + self.config.close_timeout;
        self.closing = Some((info, deadline));
    }

    fn finish(&mut self, info: CloseInfo, terminate: bool) {
        if self.finished.is_none() {
            self.finished = Some(Finish { info, terminate });
        }
    }

    fn teardown(mut self, finish: Finish) {
        let Finish { info, terminate } = finish;
        self.shared.set_state(ConnectionState::Closed);
        if terminate {
            self.writer.abort();
        }

        let err = CallError::disconnected(&info);
        for (_, call) in self.pending.drain() {
            call.settle(Err(err.clone()));
        }
        let reason = info.to_error();
        for (_, invocation) in self.requests.drain() {
            invocation.token.cancel_with(reason.clone());
        }
        for (_, invocation) in self.notifications.drain() {
            invocation.token.cancel_with(reason.clone());
        }
        for (_, mut receiver) in self.received.drain() {
            receiver.error(reason.clone());
        }
        for (_, mut sender) in self.sent.drain() {
            sender.cancel();
        }

        debug!(
            code = info.code,
            reason = %info.reason,
            cause = info.cause.as_deref(),
            "connection closed"
        );
        self.shared.closed.send_replace(Some(info));
    }
}
