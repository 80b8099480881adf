//! HTTP server implementation using Axum.

use std::net::SocketAddr;

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::error::SessionError;
use crate::state::AppState;
use crate::ws_server;

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: String,
}

#[derive(Serialize)]
struct JoinSessionResponse {
    session_id: String,
    language: String,
    code: String,
}

/// Build the application router over the shared state.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Session management
        .route("/sessions", post(create_session))
        .route("/sessions/:id", post(join_session))
        // Persistent connection endpoint
        .route("/ws/:id", get(ws_attach))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
/// Returns after a ctrl-c once in-flight requests have drained.
pub async fn run_server(port: u16, state: AppState) {
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}

async fn health() -> &'static str {
    "OK"
}

async fn create_session(State(state): State<AppState>) -> Json<CreateSessionResponse> {
    let session_id = state.registry.create().await;
    Json(CreateSessionResponse { session_id })
}

async fn join_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JoinSessionResponse>, SessionError> {
    let snapshot = state.registry.join(&id).await?;
    Ok(Json(JoinSessionResponse {
        session_id: snapshot.session_id,
        language: snapshot.language,
        code: snapshot.code,
    }))
}

/// Reject unknown/ended sessions before upgrading the connection.
async fn ws_attach(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, SessionError> {
    state.registry.exists(&id).await?;
    Ok(ws.on_upgrade(move |socket| ws_server::handle_socket(socket, state, id)))
}
