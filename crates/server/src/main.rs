use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::ApiContext;
use shared::{
    domain::SessionId,
    error::{ApiError, ErrorCode},
    protocol::ServerEvent,
};
use storage::Storage;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

mod api;
mod app_state;
mod config;

use api::{
    http_error, http_get_session, http_start_session, http_submit_action,
    http_tournament_session, HttpError,
};
use app_state::AppState;
use config::{load_settings, normalize_database_url};

#[derive(Debug, Deserialize)]
struct WsQuery {
    session_id: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = normalize_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext::new(storage, settings.draw_policy());
    let state = AppState::new(api, settings.broadcast_capacity);
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "draw server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions", post(http_start_session))
        .route("/sessions/:session_id", get(http_get_session))
        .route("/sessions/:session_id/actions", post(http_submit_action))
        .route("/tournaments/:tournament_id/session", get(http_tournament_session))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Internal, format!("{e:#}"))),
        )
    })?;
    Ok("ok")
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Result<impl IntoResponse, HttpError> {
    let session_id = SessionId(q.session_id);
    // Reject unknown sessions before upgrading so the client gets a 404.
    server_api::load_snapshot(&state.api, session_id)
        .await
        .map_err(http_error)?;
    // Subscribe before the handshake completes so nothing published after
    // the client sees the upgrade is missed.
    let events_rx = state.events.subscribe();
    Ok(ws.on_upgrade(move |socket| ws_connection(socket, events_rx, session_id)))
}

async fn ws_connection(
    socket: WebSocket,
    mut events_rx: broadcast::Receiver<ServerEvent>,
    session_id: SessionId,
) {
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    info!(%session_id, "websocket subscribed");

    let send_task = tokio::spawn(async move {
        loop {
            let event = match events_rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%session_id, skipped, "websocket subscriber lagged");
                    ServerEvent::Error(ApiError::conflict(format!(
                        "missed {skipped} events; refetch the session snapshot"
                    )))
                }
                Err(RecvError::Closed) => break,
            };
            if event.session_id().is_some_and(|id| id != session_id) {
                continue;
            }
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(error) => {
                    warn!(%error, "failed to encode server event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
    debug!(%session_id, "websocket closed");
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
