use std::sync::{Arc, Mutex};
use std::time::Duration;

use bluerpc_session::{
    CallError, CancellationToken, CloseFrame, Connection, ConnectionConfig, ConnectionHandle,
    ConnectionState, Frame, MemoryLink, MethodContext, Methods, memory_link_pair,
};
use bluerpc_types::{
    ErrorValue, Inbound, KnownError, Message, StreamHandle, StreamMode, Value, stream,
};
use bluerpc_wire::Codec;
use bytes::Bytes;
use tokio::sync::oneshot;

async fn echo(param: Value, _cx: MethodContext) -> Result<Value, ErrorValue> {
    Ok(param)
}

async fn measure(param: Value, _cx: MethodContext) -> Result<Value, ErrorValue> {
    let stream = param
        .as_stream()
        .ok_or_else(|| ErrorValue::new("expected a stream"))?;
    let mut reader = stream
        .reader()
        .ok_or_else(|| ErrorValue::new("stream already taken"))?;
    let data = reader.read_to_end().await?;
    Ok(Value::from(data.len() as i64))
}

async fn count_to_three(_param: Value, _cx: MethodContext) -> Result<Value, ErrorValue> {
    let (writer, handle) = stream::objects();
    tokio::spawn(async move {
        for n in 1..=3 {
            if writer.write(Value::from(n)).await.is_err() {
                return;
            }
        }
        writer.finish();
    });
    Ok(Value::from(handle))
}

async fn hang(_param: Value, cx: MethodContext) -> Result<Value, ErrorValue> {
    Err(cx.cancellation().cancelled().await)
}

async fn ignore(_param: Value, _cx: MethodContext) -> Result<Value, ErrorValue> {
    Ok(Value::Nil)
}

async fn refuse(_param: Value, _cx: MethodContext) -> Result<Value, ErrorValue> {
    Err(KnownError::new("quota exceeded").field("limit", 10).into())
}

async fn leak(_param: Value, _cx: MethodContext) -> Result<Value, ErrorValue> {
    Err(ErrorValue::new("db password is hunter2").with_field("query", "SELECT 1"))
}

fn methods() -> Methods {
    Methods::new()
        .method("echo", echo)
        .method("measure", measure)
        .method("count", count_to_three)
        .method("hang", hang)
        .method("ignore", ignore)
        .method("refuse", refuse)
        .method("leak", leak)
}

/// Two connections over an in-memory link. The first serves [`methods`].
fn pair() -> (ConnectionHandle, ConnectionHandle) {
    let (a, b) = memory_link_pair();
    let server = Connection::new(a)
        .config(ConnectionConfig::server())
        .methods(methods())
        .spawn();
    let client = Connection::new(b).spawn();
    (server, client)
}

/// One end of a link driven by hand.
struct RawPeer {
    link: MemoryLink,
    codec: Codec,
}

impl RawPeer {
    fn send(&self, msg: Message) {
        let bytes = self.codec.encode_inert(&msg.into_value()).unwrap();
        self.link.send_frame(Frame::Binary(bytes)).unwrap();
    }

    fn send_with_streams(&mut self, msg: Message) {
        let encoded = self.codec.encode(&msg.into_value(), |_| false).unwrap();
        self.link.send_frame(Frame::Binary(encoded.bytes)).unwrap();
    }

    async fn next_message(&mut self) -> (Message, Vec<u32>) {
        loop {
            match self.link.recv_frame().await.expect("link closed") {
                Frame::Binary(bytes) => {
                    let decoded = self.codec.decode(&bytes).unwrap();
                    let streams = decoded.streams.keys().copied().collect();
                    match Message::from_value(decoded.value).unwrap() {
                        Inbound::Message(msg) => return (msg, streams),
                        Inbound::Reserved(kind) => panic!("unexpected reserved type {kind}"),
                    }
                }
                Frame::Ping(_) | Frame::Pong(_) => continue,
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    /// Wait for a close frame and acknowledge it.
    async fn next_close(&mut self) -> CloseFrame {
        loop {
            match self.link.recv_frame().await.expect("link closed") {
                Frame::Close(Some(frame)) => {
                    let _ = self.link.send_frame(Frame::Close(Some(frame.clone())));
                    return frame;
                }
                Frame::Close(None) => panic!("close without status"),
                _ => continue,
            }
        }
    }

    /// Whether anything but heartbeats arrives within `wait`.
    async fn is_quiet_for(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.next_message()).await.is_err()
    }
}

/// A connection serving [`methods`], and a hand-driven peer.
fn raw(config: ConnectionConfig) -> (ConnectionHandle, RawPeer) {
    let (a, b) = memory_link_pair();
    let conn = Connection::new(a).config(config).methods(methods()).spawn();
    (
        conn,
        RawPeer {
            link: b,
            codec: Codec::new(),
        },
    )
}

#[tokio::test]
async fn echo_call_across_memory_link() {
    let (_server, client) = pair();
    let param = Value::map([("x", 1)]);
    let result = client.invoke("echo", param.clone()).await.unwrap();
    assert_eq!(result, param);
    assert_eq!(client.state(), ConnectionState::Open);
}

#[tokio::test]
async fn both_ends_can_serve() {
    let (a, b) = memory_link_pair();
    let left = Connection::new(a).methods(methods()).spawn();
    let right = Connection::new(b).methods(methods()).spawn();
    assert_eq!(left.invoke("echo", Value::from("l")).await.unwrap(), Value::from("l"));
    assert_eq!(right.invoke("echo", Value::from("r")).await.unwrap(), Value::from("r"));
}

#[tokio::test]
async fn unknown_methods_fail_without_closing() {
    let (_server, client) = pair();
    let err = client.invoke("nope", Value::Nil).await.unwrap_err();
    assert_eq!(err.remote().unwrap().message(), "Method not found");
    assert!(client.is_open());
}

#[tokio::test]
async fn known_errors_keep_their_fields_and_others_do_not() {
    let (_server, client) = pair();

    let err = client.invoke("refuse", Value::Nil).await.unwrap_err();
    let remote = err.remote().unwrap();
    assert_eq!(remote.message(), "quota exceeded");
    assert_eq!(remote.field("limit"), Some(&Value::Int(10)));

    let err = client.invoke("leak", Value::Nil).await.unwrap_err();
    let remote = err.remote().unwrap();
    assert_eq!(remote.message(), "db password is hunter2");
    assert!(remote.fields().is_empty());
}

#[tokio::test]
async fn empty_method_names_are_rejected_locally() {
    let (_server, client) = pair();
    let err = client.invoke("", Value::Nil).await.unwrap_err();
    assert!(matches!(err, CallError::InvalidArgument(_)));
}

#[tokio::test]
async fn octet_stream_uploads() {
    let (_server, client) = pair();
    let (writer, handle) = stream::octets();
    let feed = async move {
        for _ in 0..16 {
            writer.write(Bytes::from(vec![7u8; 64 * 1024])).await.unwrap();
        }
        writer.finish();
    };
    let (result, ()) = tokio::join!(client.invoke("measure", Value::from(handle)), feed);
    assert_eq!(result.unwrap(), Value::from(1024 * 1024));
}

#[tokio::test]
async fn object_stream_downloads() {
    let (_server, client) = pair();
    let result = client.invoke("count", Value::Nil).await.unwrap();
    let mut reader = result.as_stream().unwrap().reader().unwrap();
    let mut seen = Vec::new();
    while let Some(chunk) = reader.next().await {
        match chunk.unwrap() {
            stream::Chunk::Object(value) => seen.push(value),
            other => panic!("unexpected chunk {other:?}"),
        }
    }
    assert_eq!(seen, vec![Value::from(1), Value::from(2), Value::from(3)]);
}

#[tokio::test]
async fn a_failing_upload_reaches_the_reader() {
    let (_server, client) = pair();
    let (writer, handle) = stream::octets();
    let feed = async move {
        writer.write(Bytes::from_static(b"partial")).await.unwrap();
        drop(writer);
    };
    let (result, ()) = tokio::join!(client.invoke("measure", Value::from(handle)), feed);
    let err = result.unwrap_err();
    assert_eq!(err.remote().unwrap().message(), "Stream was closed prematurely");
}

#[tokio::test]
async fn cancelling_a_call_reaches_the_method() {
    let (seen_tx, seen_rx) = oneshot::channel::<String>();
    let seen_tx = Arc::new(Mutex::new(Some(seen_tx)));
    let watcher = Methods::new().method("watch", move |_param: Value, cx: MethodContext| {
        let seen_tx = Arc::clone(&seen_tx);
        async move {
            let reason = cx.cancellation().cancelled().await;
            if let Some(tx) = seen_tx.lock().unwrap().take() {
                let _ = tx.send(reason.message().to_string());
            }
            Ok::<_, ErrorValue>(Value::from("too late"))
        }
    });

    let (a, b) = memory_link_pair();
    let _server = Connection::new(a).methods(watcher).spawn();
    let client = Connection::new(b).spawn();

    let token = CancellationToken::new();
    let call = tokio::spawn({
        let client = client.clone();
        let token = token.clone();
        async move { client.invoke_with("watch", Value::Nil, &token).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel_with("changed my mind");

    match call.await.unwrap() {
        Err(CallError::Cancelled(reason)) => assert_eq!(reason.message(), "changed my mind"),
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(seen_rx.await.unwrap(), "Request cancelled by peer");
    assert!(client.is_open());
}

#[tokio::test]
async fn a_cancelled_token_fails_fast() {
    let (_server, client) = pair();
    let token = CancellationToken::new();
    token.cancel();
    let err = client.invoke_with("echo", Value::Nil, &token).await.unwrap_err();
    assert!(matches!(err, CallError::Cancelled(_)));
}

#[tokio::test]
async fn notifications_run_without_a_response() {
    let (ran_tx, ran_rx) = oneshot::channel::<bool>();
    let ran_tx = Arc::new(Mutex::new(Some(ran_tx)));
    let methods = Methods::new().method("ping", move |_param: Value, cx: MethodContext| {
        let ran_tx = Arc::clone(&ran_tx);
        async move {
            if let Some(tx) = ran_tx.lock().unwrap().take() {
                let _ = tx.send(cx.is_notification());
            }
            Ok::<_, ErrorValue>(Value::Nil)
        }
    });
    let (a, b) = memory_link_pair();
    let _server = Connection::new(a).methods(methods).spawn();
    let client = Connection::new(b).spawn();

    client.notify("ping", Value::Nil).await.unwrap();
    assert!(ran_rx.await.unwrap());
}

#[tokio::test]
async fn closing_fails_calls_in_flight() {
    let (server, client) = pair();
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.invoke("hang", Value::Nil).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    client.close(1000, "done");
    let info = client.closed().await;
    assert_eq!((info.code, info.reason.as_str()), (1000, "done"));
    assert_eq!(client.state(), ConnectionState::Closed);

    match call.await.unwrap() {
        Err(CallError::Disconnected { code, reason, .. }) => {
            assert_eq!(code, 1000);
            assert_eq!(reason, "done");
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(server.closed().await.code, 1000);

    let err = client.invoke("echo", Value::Nil).await.unwrap_err();
    assert!(err.is_disconnected());
}

#[tokio::test]
async fn a_panicking_method_closes_with_server_error() {
    let methods = Methods::new().method("boom", |_param: Value, _cx: MethodContext| async move {
        if true {
            panic!("kaboom");
        }
        Ok::<_, ErrorValue>(Value::Nil)
    });
    let (a, b) = memory_link_pair();
    let _server = Connection::new(a).methods(methods).spawn();
    let client = Connection::new(b).spawn();

    match client.invoke("boom", Value::Nil).await {
        Err(CallError::Disconnected { code, reason, .. }) => {
            assert_eq!(code, 1011);
            assert_eq!(reason, "Server error");
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn duplicate_request_ids_are_a_violation() {
    let (conn, mut peer) = raw(ConnectionConfig::server());
    let request = Message::Request {
        id: 1,
        method: "hang".into(),
        param: Value::Nil,
    };
    peer.send(request.clone());
    peer.send(request);

    let close = peer.next_close().await;
    assert_eq!(close.code, 1008);
    assert_eq!(close.reason, "Illegal duplicate ID");
    assert_eq!(conn.closed().await.reason, "Illegal duplicate ID");
}

#[tokio::test]
async fn duplicate_stream_ids_are_a_violation() {
    let (conn, mut peer) = raw(ConnectionConfig::server());
    for id in 1..=2 {
        peer.send_with_streams(Message::Request {
            id,
            method: "hang".into(),
            param: Value::from(StreamHandle::incoming(StreamMode::Octets, 5)),
        });
    }

    let close = peer.next_close().await;
    assert_eq!((close.code, close.reason.as_str()), (1008, "Illegal duplicate ID"));
    assert_eq!(conn.closed().await.code, 1008);
}

#[tokio::test]
async fn late_responses_to_cancelled_calls_release_their_streams() {
    let (conn, mut peer) = raw(ConnectionConfig::client());
    let token = CancellationToken::new();
    let call = tokio::spawn({
        let conn = conn.clone();
        let token = token.clone();
        async move { conn.invoke_with("slow", Value::Nil, &token).await }
    });

    let (msg, _) = peer.next_message().await;
    let Message::Request { id, .. } = msg else {
        panic!("unexpected message {msg:?}");
    };
    token.cancel_with("gave up");
    assert_eq!(peer.next_message().await.0, Message::Cancellation { id });

    peer.send_with_streams(Message::ResponseSuccess {
        id,
        result: Value::from(StreamHandle::incoming(StreamMode::Octets, 7)),
    });
    assert_eq!(
        peer.next_message().await.0,
        Message::StreamCancellation { stream_id: 7 }
    );
    match call.await.unwrap() {
        Err(CallError::Cancelled(reason)) => assert_eq!(reason.message(), "gave up"),
        other => panic!("unexpected result {other:?}"),
    }
    assert!(conn.is_open());
}

#[tokio::test]
async fn request_ids_free_up_once_answered() {
    let (_conn, mut peer) = raw(ConnectionConfig::server());
    for _ in 0..2 {
        peer.send(Message::Request {
            id: 9,
            method: "echo".into(),
            param: Value::from(1),
        });
        let (msg, _) = peer.next_message().await;
        assert_eq!(
            msg,
            Message::ResponseSuccess {
                id: 9,
                result: Value::from(1)
            }
        );
    }
}

#[tokio::test]
async fn text_frames_are_refused() {
    let (_conn, mut peer) = raw(ConnectionConfig::server());
    peer.link.send_frame(Frame::Text("hello".into())).unwrap();
    let close = peer.next_close().await;
    assert_eq!((close.code, close.reason.as_str()), (1003, "Text frames not allowed"));
}

#[tokio::test]
async fn malformed_input_is_a_violation() {
    let (_conn, mut peer) = raw(ConnectionConfig::server());
    peer.link
        .send_frame(Frame::Binary(Bytes::from_static(&[0xff])))
        .unwrap();
    let close = peer.next_close().await;
    assert_eq!((close.code, close.reason.as_str()), (1008, "Invalid encoding"));

    let (_conn, mut peer) = raw(ConnectionConfig::server());
    let bogus = peer
        .codec
        .encode_inert(&Value::from(vec![Value::from(10), Value::from(1)]))
        .unwrap();
    peer.link.send_frame(Frame::Binary(bogus)).unwrap();
    let close = peer.next_close().await;
    assert_eq!((close.code, close.reason.as_str()), (1008, "Invalid message"));
}

#[tokio::test]
async fn reserved_types_are_ignored() {
    let (conn, mut peer) = raw(ConnectionConfig::server());
    let future = peer
        .codec
        .encode_inert(&Value::from(vec![Value::from(42), Value::from("later")]))
        .unwrap();
    peer.link.send_frame(Frame::Binary(future)).unwrap();

    peer.send(Message::Request {
        id: 1,
        method: "echo".into(),
        param: Value::Nil,
    });
    let (msg, _) = peer.next_message().await;
    assert!(matches!(msg, Message::ResponseSuccess { id: 1, .. }));
    assert!(conn.is_open());
}

#[tokio::test]
async fn streams_may_not_ride_on_stream_errors() {
    let (_conn, mut peer) = raw(ConnectionConfig::server());
    let (_writer, handle) = stream::octets();
    peer.send_with_streams(Message::StreamChunkError {
        stream_id: 1,
        error: ErrorValue::new("x").with_field("s", handle).exposed(),
    });
    let close = peer.next_close().await;
    assert_eq!((close.code, close.reason.as_str()), (1008, "Stream nesting not allowed"));
}

#[tokio::test]
async fn oversized_messages_are_refused() {
    let config = ConnectionConfig::client().with_max_payload(256 * 1024);
    let (_conn, mut peer) = raw(config);
    peer.send(Message::Notification {
        method: "echo".into(),
        param: Value::from(Bytes::from(vec![0u8; 300 * 1024])),
    });
    let close = peer.next_close().await;
    assert_eq!((close.code, close.reason.as_str()), (1009, "Message too big"));
}

#[tokio::test]
async fn streams_for_unknown_methods_are_refused() {
    let (_conn, mut peer) = raw(ConnectionConfig::server());
    let (_writer, handle) = stream::octets();
    peer.send_with_streams(Message::Request {
        id: 4,
        method: "missing".into(),
        param: Value::from(handle),
    });

    let mut saw_cancel = false;
    let mut saw_failure = false;
    while !(saw_cancel && saw_failure) {
        match peer.next_message().await.0 {
            Message::StreamCancellation { stream_id: 1 } => saw_cancel = true,
            Message::ResponseFailure { id: 4, error } => {
                assert_eq!(error.message(), "Method not found");
                saw_failure = true;
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}

#[tokio::test]
async fn senders_wait_for_the_receivers_window() {
    let (conn, mut peer) = raw(ConnectionConfig::client());
    let (writer, handle) = stream::octets();
    tokio::spawn(async move {
        for _ in 0..4 {
            writer.write(Bytes::from(vec![1u8; 64 * 1024])).await.unwrap();
        }
        writer.finish();
    });
    tokio::spawn({
        let conn = conn.clone();
        async move { conn.invoke("upload", Value::from(handle)).await }
    });

    let (request, streams) = peer.next_message().await;
    assert!(matches!(request, Message::Request { .. }));
    let stream_id = streams[0];
    assert!(peer.is_quiet_for(Duration::from_millis(50)).await);

    peer.send(Message::StreamSignal {
        stream_id,
        received_kib: 0,
        available_kib: 64,
    });
    match peer.next_message().await.0 {
        Message::StreamChunkData { data, .. } => assert_eq!(data.len(), 64 * 1024),
        other => panic!("unexpected message {other:?}"),
    }
    assert!(peer.is_quiet_for(Duration::from_millis(50)).await);

    peer.send(Message::StreamSignal {
        stream_id,
        received_kib: 64,
        available_kib: 1024,
    });
    let mut total = 64 * 1024;
    loop {
        match peer.next_message().await.0 {
            Message::StreamChunkData { data, .. } => total += data.len(),
            Message::StreamChunkEnd { stream_id: id } => {
                assert_eq!(id, stream_id);
                break;
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
    assert_eq!(total, 256 * 1024);
}

#[tokio::test]
async fn unread_streams_are_released_when_the_method_returns() {
    let (_conn, mut peer) = raw(ConnectionConfig::server());
    let (_writer, handle) = stream::octets();
    peer.send_with_streams(Message::Request {
        id: 2,
        method: "ignore".into(),
        param: Value::map([("upload", handle)]),
    });

    // The receiver opens its window first, then gives up on the stream once
    // the method returns without reading it.
    let mut saw_signal = false;
    let mut saw_cancel = false;
    let mut saw_response = false;
    while !(saw_signal && saw_cancel && saw_response) {
        match peer.next_message().await.0 {
            Message::StreamSignal {
                stream_id: 1,
                received_kib,
                available_kib,
            } => {
                assert!(!saw_cancel);
                assert_eq!((received_kib, available_kib), (0, 8 * 1024));
                saw_signal = true;
            }
            Message::StreamCancellation { stream_id: 1 } => saw_cancel = true,
            Message::ResponseSuccess { id: 2, result } => {
                assert!(result.is_nil());
                saw_response = true;
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}

#[tokio::test]
async fn peers_close_frames_are_reported() {
    let (conn, peer) = raw(ConnectionConfig::server());
    peer.link
        .send_frame(Frame::Close(Some(CloseFrame {
            code: 4000,
            reason: "bye".into(),
        })))
        .unwrap();
    let info = conn.closed().await;
    assert_eq!((info.code, info.reason.as_str()), (4000, "bye"));
}

#[tokio::test]
async fn stale_pings_mark_the_connection_old() {
    let (conn, mut peer) = raw(ConnectionConfig::server());
    let barrier = |peer: &RawPeer| {
        peer.send(Message::Request {
            id: 1,
            method: "echo".into(),
            param: Value::Nil,
        })
    };

    peer.link.send_frame(Frame::Ping(Bytes::from_static(&[0]))).unwrap();
    barrier(&peer);
    peer.next_message().await;
    assert!(conn.is_old());

    peer.link.send_frame(Frame::Ping(Bytes::from_static(&[2]))).unwrap();
    barrier(&peer);
    peer.next_message().await;
    assert!(!conn.is_old());
}

#[tokio::test(start_paused = true)]
async fn silent_peers_fail_the_heartbeat() {
    let (conn, mut peer) = raw(ConnectionConfig::server());
    let mut pings = Vec::new();
    while pings.len() < 3 {
        match peer.link.recv_frame().await {
            Some(Frame::Ping(payload)) => pings.push(payload[0]),
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert_eq!(pings, vec![2, 1, 0]);

    let info = conn.closed().await;
    assert_eq!((info.code, info.reason.as_str()), (1006, "heartbeat failure"));
}
