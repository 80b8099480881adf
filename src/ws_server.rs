//! Per-connection websocket handling and session fan-out.

use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{self, ClientMessage, ServerMessage};
use crate::sandbox;
use crate::state::{AppState, ConnId, ConnectionTx, SessionRegistry};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Drive one attached participant: register with the session, push the
/// `init` snapshot, then loop until the client disconnects or the session
/// ends. Messages from this connection are processed strictly in order;
/// frames queued by other connections' broadcasts are forwarded between
/// them.
pub async fn handle_socket(socket: WebSocket, state: AppState, session_id: String) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let snapshot = match state.registry.attach(&session_id, conn_id, tx.clone()).await {
        Ok(snapshot) => snapshot,
        Err(_) => {
            // Ended between the upgrade check and the attach.
            let mut socket = socket;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = socket.split();

    let init = ServerMessage::Init {
        language: snapshot.language,
        code: snapshot.code,
    };
    if ws_tx.send(Message::Text(init.to_payload())).await.is_err() {
        state.registry.detach(&session_id, conn_id).await;
        return;
    }
    debug!(session_id = %session_id, conn_id, "participant attached");

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Message::Close(frame)) => {
                    let _ = ws_tx.send(Message::Close(frame)).await;
                    break;
                }
                Some(message) => {
                    if ws_tx.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    dispatch(&state, &session_id, conn_id, &tx, &text).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong handled by the transport
                Some(Err(err)) => {
                    debug!(session_id = %session_id, conn_id, %err, "receive failed");
                    break;
                }
            },
        }
    }

    state.registry.detach(&session_id, conn_id).await;
    debug!(session_id = %session_id, conn_id, "participant detached");
}

/// Handle one inbound frame. Any registry miss means the session ended
/// under us; the queued close will terminate the caller's loop.
async fn dispatch(
    state: &AppState,
    session_id: &str,
    conn_id: ConnId,
    tx: &ConnectionTx,
    text: &str,
) {
    if state.registry.touch(session_id).await.is_err() {
        debug!(session_id, conn_id, "dropping message for ended session");
        return;
    }

    let message = match protocol::parse_client_message(text) {
        Ok(message) => message,
        Err(err) => {
            send_error(tx, &err.to_string());
            return;
        }
    };

    match message {
        ClientMessage::Edit { code } => {
            if state.registry.set_code(session_id, code.clone()).await.is_ok() {
                let notice = ServerMessage::Edit { code };
                broadcast(&state.registry, session_id, &notice, Some(conn_id)).await;
            }
        }
        ClientMessage::Language { language } => {
            if state
                .registry
                .set_language(session_id, language.clone())
                .await
                .is_ok()
            {
                let notice = ServerMessage::Language { language };
                broadcast(&state.registry, session_id, &notice, Some(conn_id)).await;
            }
        }
        ClientMessage::Run => {
            let Ok((language, code)) = state.registry.run_context(session_id).await else {
                return;
            };
            let result = sandbox::execute(&language, &code, state.run_timeout).await;
            let notice = ServerMessage::RunResult {
                stdout: result.stdout,
                stderr: result.stderr,
                language: result.language,
            };
            // Everyone sees the result, the requester included.
            broadcast(&state.registry, session_id, &notice, None).await;
        }
        ClientMessage::End => {
            state.registry.end(session_id, "ended by user").await;
        }
    }
}

fn send_error(tx: &ConnectionTx, message: &str) {
    let notice = ServerMessage::Error {
        message: message.to_string(),
    };
    let _ = tx.send(Message::Text(notice.to_payload()));
}

/// Fan one message out to a snapshot of the session's connections,
/// skipping `skip` when given. A peer whose channel is gone is pruned
/// after the iteration; one bad peer never aborts the fan-out.
pub async fn broadcast(
    registry: &SessionRegistry,
    session_id: &str,
    message: &ServerMessage,
    skip: Option<ConnId>,
) {
    let payload = message.to_payload();
    if payload.is_empty() {
        warn!(session_id, "dropping unserializable broadcast");
        return;
    }

    let peers = registry.peers(session_id).await;
    let mut dead = Vec::new();
    for (conn_id, tx) in peers {
        if skip == Some(conn_id) {
            continue;
        }
        if tx.send(Message::Text(payload.clone())).is_err() {
            dead.push(conn_id);
        }
    }
    if !dead.is_empty() {
        debug!(session_id, pruned = dead.len(), "pruned unreachable connections");
        registry.prune(session_id, &dead).await;
    }
}
