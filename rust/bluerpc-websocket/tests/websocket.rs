use std::time::Duration;

use bluerpc_session::{Client, ConnectError, ConnectionConfig, MethodContext, Methods};
use bluerpc_types::{ErrorValue, Value};
use bluerpc_websocket::{WsConnector, serve};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

async fn start(methods: Methods) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, methods, ConnectionConfig::server()));
    format!("ws://{addr}")
}

fn methods() -> Methods {
    Methods::new()
        .method("echo", |param: Value, _cx: MethodContext| async move {
            Ok::<_, ErrorValue>(param)
        })
        .method("host", |_param: Value, cx: MethodContext| async move {
            let host = cx.connection().header("host").map(str::to_owned);
            let peer = cx.connection().peer_addr.is_some();
            Ok::<_, ErrorValue>(Value::map([
                ("host", Value::from(host)),
                ("peer", Value::from(peer)),
            ]))
        })
}

#[tokio::test]
async fn calls_round_trip_over_websocket() {
    let url = start(methods()).await;
    let client = Client::new(WsConnector::new(&url));
    let bytes = Value::from(Bytes::from_static(b"\x00\x01\x02"));
    assert_eq!(client.invoke("echo", bytes.clone()).await.unwrap(), bytes);
}

#[tokio::test]
async fn methods_see_the_handshake() {
    let url = start(methods()).await;
    let client = Client::new(WsConnector::new(&url));
    let seen = client.invoke("host", Value::Nil).await.unwrap();
    let expected_host = url.trim_start_matches("ws://");
    assert_eq!(seen.get("host").and_then(Value::as_str), Some(expected_host));
    assert_eq!(seen.get("peer").and_then(Value::as_bool), Some(true));
}

#[tokio::test]
async fn text_messages_close_the_connection() {
    let url = start(methods()).await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    ws.send(WsMessage::Text("hello".into())).await.unwrap();

    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), 1003);
                assert_eq!(frame.reason.as_str(), "Text frames not allowed");
                break;
            }
            Some(Ok(_)) => continue,
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[tokio::test]
async fn stalled_handshakes_time_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // Accept the socket but never answer the upgrade request.
    let _hold = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(socket);
    });

    let connector =
        WsConnector::new(format!("ws://{addr}")).handshake_timeout(Duration::from_millis(100));
    let err = connector.dial().await.unwrap_err();
    assert!(matches!(err, ConnectError::Timeout));
    assert_eq!(err.to_string(), "WebSocket handshake timed out");
}

#[tokio::test]
async fn client_payload_limits_are_validated() {
    let connector = WsConnector::new("ws://127.0.0.1:1")
        .config(ConnectionConfig::client().with_max_payload(1024));
    let err = connector.dial().await.unwrap_err();
    assert!(matches!(err, ConnectError::Config(_)));
}
