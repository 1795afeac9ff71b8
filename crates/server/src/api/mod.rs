//! HTTP handlers for the draw routes. Domain rules live in `server_api`;
//! this layer maps them onto status codes and fans appended events out to
//! websocket subscribers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use server_api::{latest_snapshot, load_snapshot, start_session, submit_action};
use shared::{
    domain::{SessionId, TournamentId},
    error::{ApiError, ErrorCode},
    protocol::{DrawAction, DrawEventRecord, DrawSnapshot, ServerEvent, StartSessionRequest},
};
use tracing::{info, warn};

use crate::app_state::AppState;

pub(crate) type HttpError = (StatusCode, Json<ApiError>);

pub(crate) fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn http_error(err: ApiError) -> HttpError {
    let status = status_for(err.code);
    if status.is_server_error() {
        warn!(message = %err.message, "request failed");
    }
    (status, Json(err))
}

pub(crate) async fn http_start_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartSessionRequest>,
) -> Result<Json<DrawSnapshot>, HttpError> {
    let snapshot = start_session(&state.api, req).await.map_err(http_error)?;
    state.publish(ServerEvent::SessionUpdated {
        session: snapshot.session.clone(),
    });
    for event in &snapshot.events {
        state.publish(ServerEvent::DrawEventAppended {
            event: event.clone(),
        });
    }
    Ok(Json(snapshot))
}

pub(crate) async fn http_get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i64>,
) -> Result<Json<DrawSnapshot>, HttpError> {
    let snapshot = load_snapshot(&state.api, SessionId(session_id))
        .await
        .map_err(http_error)?;
    Ok(Json(snapshot))
}

pub(crate) async fn http_tournament_session(
    State(state): State<Arc<AppState>>,
    Path(tournament_id): Path<i64>,
) -> Result<Json<DrawSnapshot>, HttpError> {
    let snapshot = latest_snapshot(&state.api, TournamentId(tournament_id))
        .await
        .map_err(http_error)?;
    Ok(Json(snapshot))
}

pub(crate) async fn http_submit_action(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i64>,
    Json(action): Json<DrawAction>,
) -> Result<Json<DrawEventRecord>, HttpError> {
    let session_id = SessionId(session_id);
    let outcome = submit_action(&state.api, session_id, action)
        .await
        .map_err(http_error)?;
    state.publish(ServerEvent::DrawEventAppended {
        event: outcome.record.clone(),
    });
    if let Some(session) = outcome.session {
        info!(%session_id, status = session.status.as_str(), "broadcasting session status");
        state.publish(ServerEvent::SessionUpdated { session });
    }
    Ok(Json(outcome.record))
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
