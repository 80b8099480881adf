//! End-to-end tests driving the real router over loopback.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use pairpad::http_server;
use pairpad::state::AppState;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn spawn_server() -> SocketAddr {
    let state = AppState::new(Duration::from_secs(10));
    let app = http_server::router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn create_session(addr: SocketAddr) -> String {
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/sessions"))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    body["session_id"].as_str().unwrap().to_string()
}

async fn join_session(addr: SocketAddr, session_id: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{addr}/sessions/{session_id}"))
        .send()
        .await
        .unwrap()
}

async fn connect_ws(addr: SocketAddr, session_id: &str) -> WsClient {
    let (socket, _) = connect_async(format!("ws://{addr}/ws/{session_id}"))
        .await
        .unwrap();
    socket
}

/// Next text frame as JSON, skipping transport frames.
async fn recv_json(socket: &mut WsClient) -> Value {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream closed unexpectedly")
            .unwrap();
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_json(socket: &mut WsClient, value: Value) {
    socket.send(Message::Text(value.to_string())).await.unwrap();
}

/// Asserts nothing arrives on `socket` for a little while.
async fn assert_silent(socket: &mut WsClient) {
    let outcome = tokio::time::timeout(Duration::from_millis(200), socket.next()).await;
    assert!(outcome.is_err(), "expected silence, got {outcome:?}");
}

#[tokio::test]
async fn create_then_join_returns_session_snapshot() {
    let addr = spawn_server().await;
    let session_id = create_session(addr).await;

    let response = join_session(addr, &session_id).await;
    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["session_id"], session_id.as_str());
    assert_eq!(body["language"], "python");
    assert_eq!(body["code"], "");

    let missing = join_session(addr, "does-not-exist").await;
    assert_eq!(missing.status().as_u16(), 404);
}

#[tokio::test]
async fn ws_attach_rejects_unknown_session() {
    let addr = spawn_server().await;
    let result = connect_async(format!("ws://{addr}/ws/does-not-exist")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn edit_reaches_other_participants_but_not_the_sender() {
    let addr = spawn_server().await;
    let session_id = create_session(addr).await;
    let mut alice = connect_ws(addr, &session_id).await;
    let mut bob = connect_ws(addr, &session_id).await;
    assert_eq!(recv_json(&mut alice).await["type"], "init");
    assert_eq!(recv_json(&mut bob).await["type"], "init");

    send_json(&mut alice, json!({"type": "edit", "code": "x = 1"})).await;

    let seen = recv_json(&mut bob).await;
    assert_eq!(seen["type"], "edit");
    assert_eq!(seen["code"], "x = 1");
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn language_change_propagates_and_is_visible_to_later_joins() {
    let addr = spawn_server().await;
    let session_id = create_session(addr).await;
    let mut alice = connect_ws(addr, &session_id).await;
    let mut bob = connect_ws(addr, &session_id).await;
    assert_eq!(recv_json(&mut alice).await["type"], "init");
    assert_eq!(recv_json(&mut bob).await["type"], "init");

    send_json(&mut alice, json!({"type": "language", "language": "javascript"})).await;

    let seen = recv_json(&mut bob).await;
    assert_eq!(seen["type"], "language");
    assert_eq!(seen["language"], "javascript");

    let body: Value = join_session(addr, &session_id).await.json().await.unwrap();
    assert_eq!(body["language"], "javascript");

    // A third participant is primed with the new language.
    let mut carol = connect_ws(addr, &session_id).await;
    let init = recv_json(&mut carol).await;
    assert_eq!(init["type"], "init");
    assert_eq!(init["language"], "javascript");
}

#[tokio::test]
async fn run_result_is_broadcast_to_everyone_including_the_sender() {
    let addr = spawn_server().await;
    let session_id = create_session(addr).await;
    let mut alice = connect_ws(addr, &session_id).await;
    let mut bob = connect_ws(addr, &session_id).await;
    assert_eq!(recv_json(&mut alice).await["type"], "init");
    assert_eq!(recv_json(&mut bob).await["type"], "init");

    send_json(&mut alice, json!({"type": "edit", "code": "print(\"hello\")"})).await;
    assert_eq!(recv_json(&mut bob).await["type"], "edit");

    send_json(&mut alice, json!({"type": "run"})).await;

    for socket in [&mut alice, &mut bob] {
        let result = recv_json(socket).await;
        assert_eq!(result["type"], "run_result");
        assert_eq!(result["language"], "python");
        assert!(result["stdout"].as_str().unwrap().contains("hello"));
        assert_eq!(result["stderr"], "");
    }
}

#[tokio::test]
async fn run_with_unsupported_language_keeps_the_session_alive() {
    let addr = spawn_server().await;
    let session_id = create_session(addr).await;
    let mut alice = connect_ws(addr, &session_id).await;
    assert_eq!(recv_json(&mut alice).await["type"], "init");

    send_json(&mut alice, json!({"type": "language", "language": "cobol"})).await;
    send_json(&mut alice, json!({"type": "run"})).await;

    let result = recv_json(&mut alice).await;
    assert_eq!(result["type"], "run_result");
    assert_eq!(result["stderr"], "Unsupported language: cobol");

    // Still attached and usable afterwards.
    send_json(&mut alice, json!({"type": "language", "language": "python"})).await;
    assert!(join_session(addr, &session_id).await.status().is_success());
}

#[tokio::test]
async fn malformed_and_unknown_messages_error_only_the_sender() {
    let addr = spawn_server().await;
    let session_id = create_session(addr).await;
    let mut alice = connect_ws(addr, &session_id).await;
    let mut bob = connect_ws(addr, &session_id).await;
    assert_eq!(recv_json(&mut alice).await["type"], "init");
    assert_eq!(recv_json(&mut bob).await["type"], "init");

    alice.send(Message::Text("not json".into())).await.unwrap();
    let error = recv_json(&mut alice).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["message"], "Invalid message");

    send_json(&mut alice, json!({"type": "shout", "volume": 11})).await;
    let error = recv_json(&mut alice).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["message"], "Unknown message type");

    assert_silent(&mut bob).await;

    // The connection survives protocol errors.
    send_json(&mut alice, json!({"type": "edit", "code": "ok"})).await;
    assert_eq!(recv_json(&mut bob).await["type"], "edit");
}

#[tokio::test]
async fn end_notifies_every_participant_then_closes() {
    let addr = spawn_server().await;
    let session_id = create_session(addr).await;
    let mut alice = connect_ws(addr, &session_id).await;
    let mut bob = connect_ws(addr, &session_id).await;
    assert_eq!(recv_json(&mut alice).await["type"], "init");
    assert_eq!(recv_json(&mut bob).await["type"], "init");

    send_json(&mut alice, json!({"type": "end"})).await;

    for socket in [&mut alice, &mut bob] {
        let notice = recv_json(socket).await;
        assert_eq!(notice["type"], "ended");
        assert_eq!(notice["reason"], "ended by user");
        // The transport closes right after the notice.
        let next = tokio::time::timeout(RECV_TIMEOUT, socket.next()).await.unwrap();
        assert!(
            matches!(next, None | Some(Ok(Message::Close(_)))),
            "expected close, got {next:?}"
        );
    }

    assert_eq!(join_session(addr, &session_id).await.status().as_u16(), 404);
}
