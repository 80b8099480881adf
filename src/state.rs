//! Shared application state: sessions and the registry that owns them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{close_code, CloseFrame, Message};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::error::SessionError;
use crate::protocol::ServerMessage;

/// Language a fresh session starts with.
pub const DEFAULT_LANGUAGE: &str = "python";

/// Identifies one attached connection within a session.
pub type ConnId = u64;

/// Outbound channel to one attached connection. The connection's select
/// loop forwards queued frames to the socket; a `Close` frame terminates
/// the loop.
pub type ConnectionTx = mpsc::UnboundedSender<Message>;

/// A shared editing room.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub language: String,
    pub code: String,
    connections: HashMap<ConnId, ConnectionTx>,
    last_active: Instant,
    ended: bool,
}

/// Immutable view of a session handed to join responses and `init` frames.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub language: String,
    pub code: String,
}

fn snapshot_of(session: &Session) -> SessionSnapshot {
    SessionSnapshot {
        session_id: session.id.clone(),
        language: session.language.clone(),
        code: session.code.clone(),
    }
}

/// Looks up a live session for mutation. An entry that is absent or
/// already ended is indistinguishable to callers.
fn live_mut<'a>(
    sessions: &'a mut HashMap<String, Session>,
    id: &str,
) -> Result<&'a mut Session, SessionError> {
    match sessions.get_mut(id) {
        Some(session) if !session.ended => Ok(session),
        _ => Err(SessionError::NotFound),
    }
}

/// Owns the id → session map. Create, end, and sweep are serialized by the
/// write lock; lookups share the read lock.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh empty session and return its id.
    pub async fn create(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let session = Session {
            id: id.clone(),
            language: DEFAULT_LANGUAGE.to_string(),
            code: String::new(),
            connections: HashMap::new(),
            last_active: Instant::now(),
            ended: false,
        };
        self.sessions.write().await.insert(id.clone(), session);
        info!(session_id = %id, "created session");
        id
    }

    /// Snapshot for a join request. Refreshes the idle clock.
    pub async fn join(&self, id: &str) -> Result<SessionSnapshot, SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = live_mut(&mut sessions, id)?;
        session.last_active = Instant::now();
        Ok(snapshot_of(session))
    }

    /// Cheap existence check used before accepting a websocket upgrade.
    pub async fn exists(&self, id: &str) -> Result<(), SessionError> {
        let sessions = self.sessions.read().await;
        match sessions.get(id) {
            Some(session) if !session.ended => Ok(()),
            _ => Err(SessionError::NotFound),
        }
    }

    /// Register a connection and return the snapshot for its `init` frame.
    pub async fn attach(
        &self,
        id: &str,
        conn_id: ConnId,
        tx: ConnectionTx,
    ) -> Result<SessionSnapshot, SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = live_mut(&mut sessions, id)?;
        session.connections.insert(conn_id, tx);
        session.last_active = Instant::now();
        Ok(snapshot_of(session))
    }

    /// Remove a connection. When the last one leaves, the idle clock is
    /// restarted from this moment. No-op once the session is gone.
    pub async fn detach(&self, id: &str, conn_id: ConnId) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(id) {
            session.connections.remove(&conn_id);
            if session.connections.is_empty() {
                session.last_active = Instant::now();
            }
        }
    }

    /// Refresh the idle clock for an inbound message.
    pub async fn touch(&self, id: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = live_mut(&mut sessions, id)?;
        session.last_active = Instant::now();
        Ok(())
    }

    /// Replace the whole buffer (last writer wins).
    pub async fn set_code(&self, id: &str, code: String) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = live_mut(&mut sessions, id)?;
        session.code = code;
        Ok(())
    }

    /// Replace the selected language. Unsupported values are only rejected
    /// when a run is attempted.
    pub async fn set_language(&self, id: &str, language: String) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = live_mut(&mut sessions, id)?;
        session.language = language;
        Ok(())
    }

    /// Current (language, code) pair for a run request.
    pub async fn run_context(&self, id: &str) -> Result<(String, String), SessionError> {
        let sessions = self.sessions.read().await;
        match sessions.get(id) {
            Some(session) if !session.ended => {
                Ok((session.language.clone(), session.code.clone()))
            }
            _ => Err(SessionError::NotFound),
        }
    }

    /// Snapshot of the connection set for a fan-out. Empty when the
    /// session is gone.
    pub async fn peers(&self, id: &str) -> Vec<(ConnId, ConnectionTx)> {
        let sessions = self.sessions.read().await;
        match sessions.get(id) {
            Some(session) => session
                .connections
                .iter()
                .map(|(conn_id, tx)| (*conn_id, tx.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Drop connections whose channel went away during a fan-out.
    pub async fn prune(&self, id: &str, dead: &[ConnId]) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(id) {
            for conn_id in dead {
                session.connections.remove(conn_id);
            }
        }
    }

    /// Terminate a session. Idempotent: a second call finds nothing to do.
    /// The connection set is captured and detached under the lock; the
    /// `ended` notice and close are delivered outside it, swallowing
    /// individual send failures.
    pub async fn end(&self, id: &str, reason: &str) {
        let peers: Vec<ConnectionTx> = {
            let mut sessions = self.sessions.write().await;
            let Some(mut session) = sessions.remove(id) else {
                return;
            };
            session.ended = true;
            session.connections.drain().map(|(_, tx)| tx).collect()
        };

        let payload = ServerMessage::Ended {
            reason: reason.to_string(),
        }
        .to_payload();
        for tx in peers {
            let _ = tx.send(Message::Text(payload.clone()));
            let _ = tx.send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "session ended".into(),
            })));
        }
        info!(session_id = %id, reason, "ended session");
    }

    /// Retire sessions with no connections that have been idle at least
    /// `threshold` as of `now`. Sessions with an attached connection are
    /// never retired here, regardless of elapsed time.
    pub async fn sweep_idle(&self, now: Instant, threshold: Duration) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let stale: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| {
                session.connections.is_empty()
                    && now.duration_since(session.last_active) >= threshold
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            if let Some(mut session) = sessions.remove(id) {
                session.ended = true;
                debug!(session_id = %id, "retired idle session");
            }
        }
        stale
    }
}

/// State shared with every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub run_timeout: Duration,
}

impl AppState {
    pub fn new(run_timeout: Duration) -> Self {
        Self {
            registry: SessionRegistry::new(),
            run_timeout,
        }
    }
}
