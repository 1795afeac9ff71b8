use chrono::{Duration, Utc};
use shared::{
    domain::{DrawMode, DrawPhase, PlayerId, SessionStatus, TournamentId},
    protocol::{DrawEvent, GroupAssignment, PickResult, SessionStarted, StepConfigured},
    reducer::replay,
};
use storage::Storage;

#[tokio::test]
async fn persisted_draw_replays_to_finished_groups() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let players: Vec<PlayerId> = (201..=206).map(PlayerId).collect();
    let session = storage
        .create_session(TournamentId(77), 3, 2, &players)
        .await
        .expect("session");
    let sid = session.session_id;
    let t0 = Utc::now();

    storage
        .append_event(
            sid,
            0,
            &DrawEvent::SessionStarted(SessionStarted {
                started_at: t0,
                player_ids: None,
            }),
        )
        .await
        .expect("started");

    for (step, player) in players.iter().enumerate() {
        let step = step as u32;
        storage
            .append_event(
                sid,
                step,
                &DrawEvent::StepConfigured(StepConfigured {
                    mode: DrawMode::RoundRobin,
                    target_group_no: None,
                    started_at: t0 + Duration::seconds(i64::from(step) * 5),
                    duration_ms: 3_000,
                    seed: Some(step * 31),
                    pattern: None,
                    tempo: None,
                    deck_order: None,
                }),
            )
            .await
            .expect("configured");
        storage
            .append_event(sid, step, &DrawEvent::PickResult(PickResult { player_id: *player }))
            .await
            .expect("pick");
        let confirm = DrawEvent::AssignConfirmed(GroupAssignment {
            player_id: *player,
            group_no: i64::from(step % 3 + 1),
        });
        storage
            .append_event(sid, step, &confirm)
            .await
            .expect("confirm");
        // A retried write lands as a second row and must not double-place.
        storage
            .append_event(sid, step, &confirm)
            .await
            .expect("retried confirm");
    }

    let snapshot = storage
        .load_snapshot(sid)
        .await
        .expect("snapshot")
        .expect("present");
    assert_eq!(snapshot.events.len(), 1 + players.len() * 4);

    let state = replay(&snapshot.session, &snapshot.events);
    state.verify().expect("invariants hold");
    assert_eq!(state.phase, DrawPhase::Finished);
    assert_eq!(state.status, SessionStatus::Finished);
    assert!(state.remaining_player_ids.is_empty());
    assert_eq!(state.members(1), &[PlayerId(201), PlayerId(204)]);
    assert_eq!(state.members(2), &[PlayerId(202), PlayerId(205)]);
    assert_eq!(state.members(3), &[PlayerId(203), PlayerId(206)]);
}
