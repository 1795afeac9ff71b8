use std::{collections::HashSet, sync::Arc};

use chrono::Utc;
use rand::{rngs::StdRng, seq::IndexedRandom, seq::SliceRandom, Rng, SeedableRng};
use shared::{
    domain::{DrawMode, DrawPhase, GroupNo, PlayerId, SessionId, SessionStatus, TournamentId},
    error::{ApiError, ErrorCode},
    protocol::{
        DrawAction, DrawEvent, DrawEventRecord, DrawSessionSeed, DrawSnapshot, GroupAssignment,
        MemberMoved, PickResult, SessionStarted, StartSessionRequest, StepConfigured, Tempo,
        UndoLast,
    },
    reducer::{replay, DrawState},
};
use storage::Storage;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Limits applied to operator input before anything reaches the log.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawPolicy {
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub default_duration_ms: u64,
    /// Filled into `tempo.baseHz` when an action leaves it out.
    pub default_base_hz: Option<f64>,
}

impl Default for DrawPolicy {
    fn default() -> Self {
        Self {
            min_duration_ms: 1_000,
            max_duration_ms: 15_000,
            default_duration_ms: 3_600,
            default_base_hz: None,
        }
    }
}

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub policy: DrawPolicy,
    append_lock: Arc<Mutex<()>>,
}

impl ApiContext {
    pub fn new(storage: Storage, policy: DrawPolicy) -> Self {
        Self {
            storage,
            policy,
            append_lock: Arc::new(Mutex::new(())),
        }
    }
}

/// Result of one accepted action.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub record: DrawEventRecord,
    pub state: DrawState,
    /// Present when the append moved the session to a new status.
    pub session: Option<DrawSessionSeed>,
}

pub async fn start_session(
    ctx: &ApiContext,
    request: StartSessionRequest,
) -> Result<DrawSnapshot, ApiError> {
    if request.group_count == 0 || request.group_size == 0 {
        return Err(ApiError::validation(
            "groupCount and groupSize must be at least 1",
        ));
    }
    if request.player_ids.is_empty() {
        return Err(ApiError::validation("playerIds must not be empty"));
    }
    let mut seen = HashSet::with_capacity(request.player_ids.len());
    if let Some(dup) = request.player_ids.iter().find(|id| !seen.insert(**id)) {
        return Err(ApiError::validation(format!(
            "player {dup} is listed more than once"
        )));
    }
    if (request.player_ids.len() as u64) > request.capacity() {
        return Err(ApiError::validation(format!(
            "{} players do not fit into {} groups of {}",
            request.player_ids.len(),
            request.group_count,
            request.group_size
        )));
    }

    let _guard = ctx.append_lock.lock().await;
    let session = ctx
        .storage
        .create_session(
            request.tournament_id,
            request.group_count,
            request.group_size,
            &request.player_ids,
        )
        .await
        .map_err(internal)?;
    let started = ctx
        .storage
        .append_event(
            session.session_id,
            0,
            &DrawEvent::SessionStarted(SessionStarted {
                started_at: Utc::now(),
                player_ids: Some(request.player_ids),
            }),
        )
        .await
        .map_err(internal)?;
    info!(
        session_id = %session.session_id,
        tournament_id = %session.tournament_id,
        players = session.total_players,
        "draw session started"
    );
    Ok(DrawSnapshot {
        session,
        events: vec![started],
    })
}

pub async fn load_snapshot(
    ctx: &ApiContext,
    session_id: SessionId,
) -> Result<DrawSnapshot, ApiError> {
    ctx.storage
        .load_snapshot(session_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("session {session_id} not found")))
}

pub async fn latest_snapshot(
    ctx: &ApiContext,
    tournament_id: TournamentId,
) -> Result<DrawSnapshot, ApiError> {
    let session = ctx
        .storage
        .latest_session_for_tournament(tournament_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            ApiError::not_found(format!("tournament {tournament_id} has no draw session"))
        })?;
    load_snapshot(ctx, session.session_id).await
}

pub async fn submit_action(
    ctx: &ApiContext,
    session_id: SessionId,
    action: DrawAction,
) -> Result<ActionOutcome, ApiError> {
    let mut rng = StdRng::from_rng(&mut rand::rng());
    submit_action_with_rng(ctx, session_id, action, &mut rng).await
}

/// Validates `action` against the folded log and appends exactly one event.
/// Nothing is written when validation fails.
pub async fn submit_action_with_rng<R: Rng + ?Sized + Send>(
    ctx: &ApiContext,
    session_id: SessionId,
    action: DrawAction,
    rng: &mut R,
) -> Result<ActionOutcome, ApiError> {
    let _guard = ctx.append_lock.lock().await;
    let snapshot = load_snapshot(ctx, session_id).await?;
    if snapshot.session.status == SessionStatus::Canceled {
        return Err(ApiError::conflict(format!(
            "session {session_id} was canceled"
        )));
    }
    let state = replay(&snapshot.session, &snapshot.events);
    let (step, event) = plan_event(&ctx.policy, &state, &snapshot.events, action, rng)?;

    let record = ctx
        .storage
        .append_event(session_id, step, &event)
        .await
        .map_err(internal)?;
    info!(
        session_id = %session_id,
        step,
        event_type = event.event_type(),
        event_id = %record.id,
        "draw event appended"
    );

    let mut next = state;
    next.apply(&record);
    if let Err(violation) = next.verify() {
        warn!(session_id = %session_id, %violation, "draw state invariant broken");
    }

    let session = if next.status != snapshot.session.status {
        ctx.storage
            .set_session_status(session_id, next.status)
            .await
            .map_err(internal)?;
        info!(session_id = %session_id, status = next.status.as_str(), "session status changed");
        Some(DrawSessionSeed {
            status: next.status,
            ..snapshot.session
        })
    } else {
        None
    };

    Ok(ActionOutcome {
        record,
        state: next,
        session,
    })
}

fn plan_event<R: Rng + ?Sized>(
    policy: &DrawPolicy,
    state: &DrawState,
    events: &[DrawEventRecord],
    action: DrawAction,
    rng: &mut R,
) -> Result<(u32, DrawEvent), ApiError> {
    match action {
        DrawAction::StartStep {
            mode,
            target_group_no,
            duration_ms,
            pattern,
            tempo,
        } => {
            match state.phase {
                DrawPhase::Finished => return Err(ApiError::conflict("the draw is finished")),
                DrawPhase::Picked => {
                    return Err(ApiError::conflict(
                        "confirm or undo the current pick before starting a new step",
                    ))
                }
                _ => {}
            }
            if state.remaining_player_ids.is_empty() {
                return Err(ApiError::conflict("no players remain to be drawn"));
            }
            let target_group_no = match mode {
                DrawMode::TargetGroup => {
                    let group_no = target_group_no.ok_or_else(|| {
                        ApiError::validation("targetGroupNo is required for TARGET_GROUP")
                    })?;
                    let group_no = valid_group(state, group_no)?;
                    ensure_has_room(state, group_no)?;
                    Some(i64::from(group_no))
                }
                DrawMode::RoundRobin => None,
            };
            let duration_ms = duration_ms.unwrap_or(policy.default_duration_ms);
            if !(policy.min_duration_ms..=policy.max_duration_ms).contains(&duration_ms) {
                return Err(ApiError::validation(format!(
                    "durationMs must be between {} and {}",
                    policy.min_duration_ms, policy.max_duration_ms
                )));
            }
            let mut tempo = tempo.unwrap_or_default();
            if tempo.base_hz.is_none() {
                tempo.base_hz = policy.default_base_hz;
            }
            let mut deck_order = state.remaining_player_ids.clone();
            deck_order.shuffle(rng);

            let event = DrawEvent::StepConfigured(StepConfigured {
                mode,
                target_group_no,
                started_at: Utc::now(),
                duration_ms,
                seed: Some(rng.random()),
                pattern,
                tempo: (tempo != Tempo::default()).then_some(tempo),
                deck_order: Some(deck_order),
            });
            Ok((next_step(events), event))
        }
        DrawAction::PickResult => {
            if !state.phase.accepts_pick() {
                return Err(ApiError::conflict("no step is waiting for a pick"));
            }
            draw_pick(state, rng)
        }
        DrawAction::AutoPick { step } => {
            if state.current_step != step || state.phase != DrawPhase::Configured {
                return Err(ApiError::conflict(format!(
                    "step {step} is no longer waiting for an automatic pick"
                )));
            }
            draw_pick(state, rng)
        }
        DrawAction::AssignUpdate { group_no } => {
            let player_id = current_pick(state)?;
            let group_no = valid_group(state, group_no)?;
            ensure_has_room(state, group_no)?;
            Ok((
                state.current_step,
                DrawEvent::AssignUpdated(GroupAssignment {
                    player_id,
                    group_no: i64::from(group_no),
                }),
            ))
        }
        DrawAction::AssignConfirm { group_no } => {
            let player_id = current_pick(state)?;
            let explicit = group_no.map(|g| valid_group(state, g)).transpose()?;
            let group_no = state
                .resolved_group(explicit.map(i64::from))
                .ok_or_else(|| ApiError::validation("no group selected for the pick"))?;
            ensure_has_room(state, group_no)?;
            Ok((
                state.current_step,
                DrawEvent::AssignConfirmed(GroupAssignment {
                    player_id,
                    group_no: i64::from(group_no),
                }),
            ))
        }
        DrawAction::MoveMember {
            player_id,
            to_group_no,
        } => {
            let from_group_no = state.group_of(player_id).ok_or_else(|| {
                ApiError::validation(format!("player {player_id} is not placed in a group"))
            })?;
            let to_group_no = valid_group(state, to_group_no)?;
            if from_group_no != to_group_no {
                ensure_has_room(state, to_group_no)?;
            }
            Ok((
                state.current_step,
                DrawEvent::MemberMoved(MemberMoved {
                    player_id,
                    from_group_no: Some(i64::from(from_group_no)),
                    to_group_no: i64::from(to_group_no),
                }),
            ))
        }
        DrawAction::UndoLast => {
            let (player_id, group_no) = last_undoable(state, events)
                .ok_or_else(|| ApiError::conflict("nothing to undo"))?;
            Ok((
                state.current_step,
                DrawEvent::UndoLast(UndoLast {
                    player_id,
                    group_no: Some(i64::from(group_no)),
                }),
            ))
        }
    }
}

/// Steps are numbered by configuration order, starting at 0.
fn next_step(events: &[DrawEventRecord]) -> u32 {
    events
        .iter()
        .filter(|record| matches!(record.event, DrawEvent::StepConfigured(_)))
        .map(|record| record.step + 1)
        .max()
        .unwrap_or(0)
}

fn current_pick(state: &DrawState) -> Result<PlayerId, ApiError> {
    match (state.phase, state.current_pick_player_id) {
        (DrawPhase::Picked, Some(player_id)) => Ok(player_id),
        _ => Err(ApiError::conflict("there is no pending pick to assign")),
    }
}

/// Winner from the step deck, falling back to the whole remaining pool.
fn draw_pick<R: Rng + ?Sized>(
    state: &DrawState,
    rng: &mut R,
) -> Result<(u32, DrawEvent), ApiError> {
    let candidates: Vec<PlayerId> = state
        .step_deck_player_ids
        .iter()
        .copied()
        .filter(|id| state.is_remaining(*id))
        .collect();
    let winner = candidates
        .choose(rng)
        .or_else(|| state.remaining_player_ids.choose(rng))
        .copied()
        .ok_or_else(|| ApiError::conflict("no players remain to be drawn"))?;
    Ok((
        state.current_step,
        DrawEvent::PickResult(PickResult { player_id: winner }),
    ))
}

fn valid_group(state: &DrawState, group_no: GroupNo) -> Result<GroupNo, ApiError> {
    state.group_no(i64::from(group_no)).ok_or_else(|| {
        ApiError::validation(format!(
            "group {group_no} is outside 1..={}",
            state.group_count
        ))
    })
}

fn ensure_has_room(state: &DrawState, group_no: GroupNo) -> Result<(), ApiError> {
    if state.is_full(group_no) {
        return Err(ApiError::validation(format!("group {group_no} is full")));
    }
    Ok(())
}

/// Most recent confirmation whose player still sits in a group.
fn last_undoable(state: &DrawState, events: &[DrawEventRecord]) -> Option<(PlayerId, GroupNo)> {
    let mut ordered: Vec<&DrawEventRecord> = events.iter().collect();
    ordered.sort_by_key(|record| record.order_key());
    ordered.into_iter().rev().find_map(|record| match &record.event {
        DrawEvent::AssignConfirmed(payload) => state
            .group_of(payload.player_id)
            .map(|group_no| (payload.player_id, group_no)),
        _ => None,
    })
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, format!("{err:#}"))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
