use super::*;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{load_snapshot, start_session, submit_action, ApiContext, DrawPolicy};
use shared::{
    domain::{DrawMode, PlayerId, SessionStatus, TournamentId},
    error::ErrorCode,
    protocol::{DrawEvent, DrawSessionSeed, StartSessionRequest},
};
use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::{Duration, Instant},
};
use storage::Storage;
use tokio::net::TcpListener;

#[derive(Clone)]
struct TestServer {
    api: ApiContext,
    events: broadcast::Sender<ServerEvent>,
}

#[derive(Deserialize)]
struct WsQuery {
    session_id: i64,
}

type HttpError = (StatusCode, Json<ApiError>);

fn http_error(err: ApiError) -> HttpError {
    let status = match err.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

async fn get_session(
    State(server): State<TestServer>,
    Path(session_id): Path<i64>,
) -> Result<Json<DrawSnapshot>, HttpError> {
    load_snapshot(&server.api, SessionId(session_id))
        .await
        .map(Json)
        .map_err(http_error)
}

async fn post_action_route(
    State(server): State<TestServer>,
    Path(session_id): Path<i64>,
    Json(action): Json<DrawAction>,
) -> Result<Json<DrawEventRecord>, HttpError> {
    let outcome = submit_action(&server.api, SessionId(session_id), action)
        .await
        .map_err(http_error)?;
    let _ = server.events.send(ServerEvent::DrawEventAppended {
        event: outcome.record.clone(),
    });
    Ok(Json(outcome.record))
}

async fn ws_route(
    ws: WebSocketUpgrade,
    State(server): State<TestServer>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    let rx = server.events.subscribe();
    ws.on_upgrade(move |socket| forward(socket, rx, SessionId(q.session_id)))
}

async fn forward(mut socket: WebSocket, mut rx: broadcast::Receiver<ServerEvent>, id: SessionId) {
    while let Ok(event) = rx.recv().await {
        if event.session_id() != Some(id) {
            continue;
        }
        let Ok(text) = serde_json::to_string(&event) else {
            continue;
        };
        if socket.send(WsMessage::Text(text)).await.is_err() {
            break;
        }
    }
}

async fn spawn_server(policy: DrawPolicy, players: usize) -> (String, TestServer, SessionId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let api = ApiContext::new(storage, policy);
    let snapshot = start_session(
        &api,
        StartSessionRequest {
            tournament_id: TournamentId(1),
            group_count: 2,
            group_size: 4,
            player_ids: (1..=players as i64).map(PlayerId).collect(),
        },
    )
    .await
    .expect("session");
    let (events, _) = broadcast::channel(64);
    let server = TestServer { api, events };

    let app = Router::new()
        .route("/sessions/:session_id", get(get_session))
        .route("/sessions/:session_id/actions", post(post_action_route))
        .route("/ws", get(ws_route))
        .with_state(server.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("http://{addr}"), server, snapshot.session.session_id)
}

fn start_step(duration_ms: u64) -> DrawAction {
    DrawAction::StartStep {
        mode: DrawMode::RoundRobin,
        target_group_no: None,
        duration_ms: Some(duration_ms),
        pattern: None,
        tempo: None,
    }
}

fn fast_policy() -> DrawPolicy {
    DrawPolicy {
        min_duration_ms: 50,
        ..DrawPolicy::default()
    }
}

async fn wait_for(client: &DrawClient, pred: impl Fn(&DrawState) -> bool) -> DrawState {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let state = client.state().await;
        if pred(&state) {
            return state;
        }
        assert!(Instant::now() < deadline, "timed out; last state {state:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn rejects_non_http_server_url() {
    let err = DrawClient::connect("ftp://example.com", SessionId(1))
        .await
        .err()
        .expect("should fail");
    assert!(matches!(err, DrawClientError::InvalidServerUrl));
}

#[tokio::test]
async fn unknown_session_surfaces_api_error() {
    let (url, _server, _) = spawn_server(DrawPolicy::default(), 3).await;
    let err = DrawClient::connect(url, SessionId(999))
        .await
        .err()
        .expect("should fail");
    match err {
        DrawClientError::Api(exception) => assert_eq!(exception.code, ErrorCode::NotFound),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn ws_url_tracks_http_scheme() {
    assert_eq!(
        ws_url_for("http://127.0.0.1:8443", SessionId(4)).expect("url"),
        "ws://127.0.0.1:8443/ws?session_id=4"
    );
    assert_eq!(
        ws_url_for("https://draws.example", SessionId(9)).expect("url"),
        "wss://draws.example/ws?session_id=9"
    );
}

#[tokio::test]
async fn submit_folds_records_and_reports_rejections() {
    let (url, _server, session_id) = spawn_server(DrawPolicy::default(), 3).await;
    let client = DrawClient::connect(url, session_id).await.expect("connect");
    assert_eq!(client.state().await.phase, DrawPhase::Idle);
    assert_eq!(client.events().await.len(), 1);

    let record = client.submit(start_step(2_000)).await.expect("start step");
    assert!(matches!(record.event, DrawEvent::StepConfigured(_)));
    assert_eq!(client.state().await.phase, DrawPhase::Configured);
    assert!(client.frame_at(Utc::now()).await.is_some());

    client.submit(DrawAction::PickResult).await.expect("pick");
    let state = client.state().await;
    assert_eq!(state.phase, DrawPhase::Picked);
    assert!(state.current_pick_player_id.is_some());

    let err = client
        .submit(DrawAction::UndoLast)
        .await
        .expect_err("nothing confirmed yet");
    match err {
        DrawClientError::Api(exception) => assert_eq!(exception.code, ErrorCode::Conflict),
        other => panic!("unexpected error {other:?}"),
    }
    client.disconnect().await;
}

#[tokio::test]
async fn followers_converge_through_the_websocket() {
    let (url, _server, session_id) = spawn_server(DrawPolicy::default(), 4).await;
    let operator = DrawClient::connect(url.clone(), session_id)
        .await
        .expect("operator");
    let viewer = DrawClient::connect(url, session_id).await.expect("viewer");
    let mut viewer_events = viewer.subscribe_events();

    operator.submit(start_step(1_500)).await.expect("step");
    operator.submit(DrawAction::PickResult).await.expect("pick");
    operator
        .submit(DrawAction::AssignConfirm { group_no: None })
        .await
        .expect("confirm");

    let expected = operator.state().await;
    let seen = wait_for(&viewer, |state| state == &expected).await;
    assert_eq!(seen.members(1).len(), 1);

    let first = tokio::time::timeout(Duration::from_secs(5), viewer_events.recv())
        .await
        .expect("event in time")
        .expect("event");
    assert!(matches!(
        first,
        ClientEvent::Server(ServerEvent::DrawEventAppended { .. })
            | ClientEvent::StateChanged { .. }
            | ClientEvent::Resynced { .. }
    ));

    operator.disconnect().await;
    viewer.disconnect().await;
}

#[tokio::test]
async fn auto_pick_fires_after_the_spin() {
    let (url, _server, session_id) = spawn_server(fast_policy(), 3).await;
    let client = DrawClient::connect(url, session_id).await.expect("connect");
    client.set_auto_pick(true).await;

    client.submit(start_step(150)).await.expect("step");
    assert_eq!(client.auto_pick_armed_step().await, Some(0));

    let state = wait_for(&client, |state| state.phase == DrawPhase::Picked).await;
    assert_eq!(state.current_step, 0);
    let picks = client
        .events()
        .await
        .iter()
        .filter(|record| matches!(record.event, DrawEvent::PickResult(_)))
        .count();
    assert_eq!(picks, 1);
    client.disconnect().await;
}

#[tokio::test]
async fn disabled_auto_pick_never_submits() {
    let (url, server, session_id) = spawn_server(fast_policy(), 3).await;
    let client = DrawClient::connect(url, session_id).await.expect("connect");
    client.set_auto_pick(true).await;
    client.submit(start_step(200)).await.expect("step");
    client.set_auto_pick(false).await;
    assert_eq!(client.auto_pick_armed_step().await, None);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let snapshot = load_snapshot(&server.api, session_id)
        .await
        .expect("snapshot");
    assert!(snapshot
        .events
        .iter()
        .all(|record| !matches!(record.event, DrawEvent::PickResult(_))));
    client.disconnect().await;
}

/// Serves one good snapshot, then fails every later fetch, and records when
/// the websocket peer goes away.
#[derive(Clone)]
struct FlakyServer {
    snapshot: DrawSnapshot,
    fetches: Arc<AtomicUsize>,
    ws_closed: Arc<AtomicBool>,
}

async fn flaky_snapshot(
    State(server): State<FlakyServer>,
) -> Result<Json<DrawSnapshot>, HttpError> {
    if server.fetches.fetch_add(1, Ordering::SeqCst) == 0 {
        Ok(Json(server.snapshot.clone()))
    } else {
        Err(http_error(ApiError::new(
            ErrorCode::Internal,
            "database unavailable",
        )))
    }
}

async fn watched_ws(ws: WebSocketUpgrade, State(server): State<FlakyServer>) -> impl IntoResponse {
    ws.on_upgrade(move |mut socket| async move {
        while let Some(Ok(_)) = socket.recv().await {}
        server.ws_closed.store(true, Ordering::SeqCst);
    })
}

#[tokio::test]
async fn failed_connect_closes_the_websocket() {
    let server = FlakyServer {
        snapshot: DrawSnapshot {
            session: DrawSessionSeed {
                session_id: SessionId(7),
                tournament_id: TournamentId(1),
                status: SessionStatus::Live,
                group_count: 1,
                group_size: 2,
                total_players: 2,
                player_ids: vec![PlayerId(1), PlayerId(2)],
                created_at: None,
            },
            events: Vec::new(),
        },
        fetches: Arc::new(AtomicUsize::new(0)),
        ws_closed: Arc::new(AtomicBool::new(false)),
    };
    let app = Router::new()
        .route("/sessions/:session_id", get(flaky_snapshot))
        .route("/ws", get(watched_ws))
        .with_state(server.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let err = DrawClient::connect(format!("http://{addr}"), SessionId(7))
        .await
        .err()
        .expect("second fetch fails");
    match err {
        DrawClientError::Api(exception) => assert_eq!(exception.code, ErrorCode::Internal),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(server.fetches.load(Ordering::SeqCst), 2);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !server.ws_closed.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "websocket left open");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn dropping_the_client_cancels_its_auto_pick() {
    let (url, server, session_id) = spawn_server(fast_policy(), 3).await;
    let client = DrawClient::connect(url, session_id).await.expect("connect");
    client.set_auto_pick(true).await;
    client.submit(start_step(200)).await.expect("step");
    assert_eq!(client.auto_pick_armed_step().await, Some(0));
    drop(client);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let snapshot = load_snapshot(&server.api, session_id)
        .await
        .expect("snapshot");
    assert!(snapshot
        .events
        .iter()
        .all(|record| !matches!(record.event, DrawEvent::PickResult(_))));
}
