use super::*;
use shared::{
    domain::DrawMode,
    protocol::{GroupAssignment, PickResult, SessionStarted, StepConfigured},
};

fn roster(ids: &[i64]) -> Vec<PlayerId> {
    ids.iter().copied().map(PlayerId).collect()
}

fn step_configured() -> DrawEvent {
    DrawEvent::StepConfigured(StepConfigured {
        mode: DrawMode::RoundRobin,
        target_group_no: None,
        started_at: Utc::now(),
        duration_ms: 3_600,
        seed: Some(77),
        pattern: Some("classic".into()),
        tempo: None,
        deck_order: Some(roster(&[3, 1, 2])),
    })
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("draws.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[test]
fn memory_urls_have_no_file_path() {
    assert_eq!(sqlite_path("sqlite::memory:"), None);
    assert_eq!(sqlite_path("sqlite://file:draws?mode=memory&cache=shared"), None);
    assert_eq!(sqlite_path("postgres://localhost/draws"), None);
    assert_eq!(
        sqlite_path("sqlite://./data/draws.db?mode=rwc"),
        Some(PathBuf::from("./data/draws.db"))
    );
}

#[tokio::test]
async fn creates_and_loads_session() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let players = roster(&[11, 12, 13, 14]);
    let created = storage
        .create_session(TournamentId(9), 2, 2, &players)
        .await
        .expect("session");
    assert_eq!(created.status, SessionStatus::Live);
    assert_eq!(created.total_players, 4);

    let loaded = storage
        .load_session(created.session_id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(loaded.player_ids, players);
    assert_eq!(loaded.group_count, 2);
    assert_eq!(loaded.tournament_id, TournamentId(9));

    assert!(storage
        .load_session(SessionId(9_999))
        .await
        .expect("load missing")
        .is_none());
}

#[tokio::test]
async fn new_session_cancels_previous_live_session() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let first = storage
        .create_session(TournamentId(1), 1, 2, &roster(&[1, 2]))
        .await
        .expect("first");
    let other = storage
        .create_session(TournamentId(2), 1, 2, &roster(&[5, 6]))
        .await
        .expect("other tournament");
    let second = storage
        .create_session(TournamentId(1), 1, 3, &roster(&[1, 2, 3]))
        .await
        .expect("second");

    let first = storage
        .load_session(first.session_id)
        .await
        .expect("load")
        .expect("first present");
    assert_eq!(first.status, SessionStatus::Canceled);

    let other = storage
        .load_session(other.session_id)
        .await
        .expect("load")
        .expect("other present");
    assert_eq!(other.status, SessionStatus::Live);

    let latest = storage
        .latest_session_for_tournament(TournamentId(1))
        .await
        .expect("latest")
        .expect("has latest");
    assert_eq!(latest.session_id, second.session_id);
}

#[tokio::test]
async fn appends_and_lists_events_in_fold_order() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let session = storage
        .create_session(TournamentId(3), 2, 2, &roster(&[1, 2, 3, 4]))
        .await
        .expect("session");
    let sid = session.session_id;

    let started = storage
        .append_event(
            sid,
            0,
            &DrawEvent::SessionStarted(SessionStarted {
                started_at: Utc::now(),
                player_ids: None,
            }),
        )
        .await
        .expect("started");
    let configured = storage
        .append_event(sid, 0, &step_configured())
        .await
        .expect("configured");
    // Step 1 written before a late step-0 row still folds after it.
    let confirmed = storage
        .append_event(
            sid,
            1,
            &DrawEvent::AssignConfirmed(GroupAssignment {
                player_id: PlayerId(3),
                group_no: 1,
            }),
        )
        .await
        .expect("confirmed");
    let picked = storage
        .append_event(sid, 0, &DrawEvent::PickResult(PickResult { player_id: PlayerId(3) }))
        .await
        .expect("picked");
    assert!(started.id < configured.id);

    let events = storage.list_events(sid).await.expect("events");
    let ids: Vec<EventId> = events.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![started.id, configured.id, picked.id, confirmed.id]);
    assert_eq!(events[1].event, configured.event);
    assert_eq!(events[3].step, 1);
}

#[tokio::test]
async fn snapshot_combines_session_and_log() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let session = storage
        .create_session(TournamentId(4), 1, 2, &roster(&[7, 8]))
        .await
        .expect("session");
    storage
        .append_event(session.session_id, 0, &step_configured())
        .await
        .expect("append");
    storage
        .set_session_status(session.session_id, SessionStatus::Finished)
        .await
        .expect("finish");

    let snapshot = storage
        .load_snapshot(session.session_id)
        .await
        .expect("snapshot")
        .expect("present");
    assert_eq!(snapshot.session.status, SessionStatus::Finished);
    assert_eq!(snapshot.events.len(), 1);
    assert!(storage
        .load_snapshot(SessionId(404))
        .await
        .expect("missing snapshot")
        .is_none());
}

#[tokio::test]
async fn corrupt_payload_surfaces_as_error() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let session = storage
        .create_session(TournamentId(5), 1, 1, &roster(&[1]))
        .await
        .expect("session");
    sqlx::query(
        "INSERT INTO draw_events (session_id, step, event_type, payload, created_at)
         VALUES (?, 0, 'PICK_RESULT', '{\"nope\":1}', ?)",
    )
    .bind(session.session_id.0)
    .bind(Utc::now())
    .execute(storage.pool())
    .await
    .expect("raw insert");

    let err = storage
        .list_events(session.session_id)
        .await
        .expect_err("schema mismatch");
    assert!(err.to_string().contains("PICK_RESULT"));
}
