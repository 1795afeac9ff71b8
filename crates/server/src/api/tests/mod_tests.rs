use super::*;
use server_api::{ApiContext, DrawPolicy};
use shared::{domain::PlayerId, protocol::ServerEvent};
use storage::Storage;

async fn state() -> Arc<AppState> {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    Arc::new(AppState::new(
        ApiContext::new(storage, DrawPolicy::default()),
        16,
    ))
}

#[test]
fn error_codes_map_to_http_statuses() {
    assert_eq!(status_for(ErrorCode::NotFound), StatusCode::NOT_FOUND);
    assert_eq!(status_for(ErrorCode::Validation), StatusCode::BAD_REQUEST);
    assert_eq!(status_for(ErrorCode::Conflict), StatusCode::CONFLICT);
    assert_eq!(
        status_for(ErrorCode::Internal),
        StatusCode::INTERNAL_SERVER_ERROR
    );

    let (status, Json(body)) = http_error(ApiError::conflict("busy"));
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body.message, "busy");
}

#[tokio::test]
async fn starting_a_session_broadcasts_status_and_first_event() {
    let state = state().await;
    let mut rx = state.events.subscribe();

    let Json(snapshot) = http_start_session(
        State(state.clone()),
        Json(StartSessionRequest {
            tournament_id: TournamentId(3),
            group_count: 1,
            group_size: 2,
            player_ids: vec![PlayerId(1), PlayerId(2)],
        }),
    )
    .await
    .expect("start");

    match rx.recv().await.expect("session event") {
        ServerEvent::SessionUpdated { session } => assert_eq!(session, snapshot.session),
        other => panic!("unexpected {other:?}"),
    }
    match rx.recv().await.expect("draw event") {
        ServerEvent::DrawEventAppended { event } => assert_eq!(event, snapshot.events[0]),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn finishing_the_draw_broadcasts_session_update() {
    let state = state().await;
    let Json(snapshot) = http_start_session(
        State(state.clone()),
        Json(StartSessionRequest {
            tournament_id: TournamentId(4),
            group_count: 1,
            group_size: 1,
            player_ids: vec![PlayerId(9)],
        }),
    )
    .await
    .expect("start");
    let session_id = snapshot.session.session_id.0;

    for action in [
        DrawAction::StartStep {
            mode: shared::domain::DrawMode::RoundRobin,
            target_group_no: None,
            duration_ms: None,
            pattern: None,
            tempo: None,
        },
        DrawAction::PickResult,
    ] {
        http_submit_action(State(state.clone()), Path(session_id), Json(action))
            .await
            .expect("action");
    }

    let mut rx = state.events.subscribe();
    let Json(record) = http_submit_action(
        State(state.clone()),
        Path(session_id),
        Json(DrawAction::AssignConfirm { group_no: None }),
    )
    .await
    .expect("confirm");

    assert!(matches!(
        rx.recv().await.expect("appended"),
        ServerEvent::DrawEventAppended { event } if event == record
    ));
    match rx.recv().await.expect("session update") {
        ServerEvent::SessionUpdated { session } => {
            assert_eq!(session.status, shared::domain::SessionStatus::Finished)
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn unknown_tournament_is_not_found() {
    let state = state().await;
    let (status, _) = http_tournament_session(State(state), Path(77))
        .await
        .expect_err("no session");
    assert_eq!(status, StatusCode::NOT_FOUND);
}
