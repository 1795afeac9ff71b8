use super::*;
use shared::{
    create_initial_state,
    domain::{PlayerId, SessionStatus, TournamentId},
    protocol::DrawSessionSeed,
};

fn seed() -> DrawSessionSeed {
    DrawSessionSeed {
        session_id: SessionId(3),
        tournament_id: TournamentId(1),
        status: SessionStatus::Live,
        group_count: 2,
        group_size: 2,
        total_players: 3,
        player_ids: vec![PlayerId(7), PlayerId(8), PlayerId(9)],
        created_at: None,
    }
}

#[test]
fn renders_every_group_with_capacity() {
    let mut state = create_initial_state(&seed());
    state.groups.insert(1, vec![PlayerId(8)]);
    state.remaining_player_ids = vec![PlayerId(7), PlayerId(9)];

    let text = render_state(&state);
    assert!(text.starts_with("session=3 status=live step=0 phase=Idle"));
    assert!(text.contains("group 1 [1/2]: 8\n"));
    assert!(text.contains("group 2 [0/2]: \n"));
    assert!(text.ends_with("remaining: 2\n"));
}

#[test]
fn timeline_pairs_offsets_with_indices() {
    let text = render_timeline(&[4, 5, 0], &[0, 80, 160]);
    assert_eq!(text, "     0ms  4\n    80ms  5\n   160ms  0\n");
}

#[test]
fn cli_parses_reveal_flags() {
    let cli = Cli::try_parse_from([
        "tools",
        "reveal",
        "--start",
        "3",
        "--winner",
        "11",
        "--candidates",
        "17",
        "--near-miss",
    ])
    .expect("parse");
    match cli.command {
        Command::Reveal {
            start,
            winner,
            candidates,
            duration_ms,
            near_miss,
        } => {
            assert_eq!((start, winner, candidates), (3, 11, 17));
            assert_eq!(duration_ms, None);
            assert!(near_miss);
        }
        other => panic!("unexpected command {other:?}"),
    }
}
