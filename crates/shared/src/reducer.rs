//! Pure fold from the draw event log to the derived `DrawState`.
//!
//! Application is total: an event whose preconditions do not hold leaves the
//! state untouched. Duplicate, stale or out-of-order deliveries therefore
//! converge to the same state once the log is sorted and folded.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    domain::{DrawMode, DrawPhase, EventId, GroupNo, PlayerId, SessionId, SessionStatus},
    path::{clamp_scan_ms, derive_step_seed},
    protocol::{
        sort_events, DrawEvent, DrawEventRecord, DrawSessionSeed, GroupAssignment, MemberMoved,
        PickResult, SessionStarted, StepConfigured, Tempo, UndoLast,
    },
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawState {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub group_count: u32,
    pub group_size: u32,
    pub total_players: u32,
    /// Roster in registration order; used to put undone players back in place.
    pub roster: Vec<PlayerId>,
    pub current_step: u32,
    pub current_mode: DrawMode,
    pub target_group_no: Option<GroupNo>,
    pub current_pick_player_id: Option<PlayerId>,
    pub pending_group_no: Option<GroupNo>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub picked_at: Option<DateTime<Utc>>,
    pub step_seed: u32,
    pub step_pattern: Option<String>,
    pub step_tempo: Option<Tempo>,
    pub step_deck_player_ids: Vec<PlayerId>,
    pub phase: DrawPhase,
    pub remaining_player_ids: Vec<PlayerId>,
    pub groups: BTreeMap<GroupNo, Vec<PlayerId>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateViolation {
    #[error("player {0} appears more than once")]
    DuplicatePlayer(PlayerId),
    #[error("group {group_no} holds {len} players but the limit is {limit}")]
    GroupOverflow {
        group_no: GroupNo,
        len: usize,
        limit: u32,
    },
    #[error("{placed} players placed but the session has {total}")]
    Conservation { placed: usize, total: u32 },
}

fn dedup_preserving_order(ids: &[PlayerId]) -> Vec<PlayerId> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

fn empty_groups(group_count: u32) -> BTreeMap<GroupNo, Vec<PlayerId>> {
    (1..=group_count.max(1)).map(|g| (g, Vec::new())).collect()
}

pub fn create_initial_state(seed: &DrawSessionSeed) -> DrawState {
    let roster = dedup_preserving_order(&seed.player_ids);
    let group_count = seed.group_count.max(1);
    DrawState {
        session_id: seed.session_id,
        status: seed.status,
        group_count,
        group_size: seed.group_size.max(1),
        total_players: u32::try_from(roster.len()).unwrap_or(u32::MAX),
        remaining_player_ids: roster.clone(),
        roster,
        current_step: 0,
        current_mode: DrawMode::default(),
        target_group_no: None,
        current_pick_player_id: None,
        pending_group_no: None,
        started_at: None,
        duration_ms: 0,
        picked_at: None,
        step_seed: 0,
        step_pattern: None,
        step_tempo: None,
        step_deck_player_ids: Vec::new(),
        phase: DrawPhase::Idle,
        groups: empty_groups(group_count),
    }
}

pub fn apply_event(mut state: DrawState, record: &DrawEventRecord) -> DrawState {
    state.apply(record);
    state
}

/// Folds a snapshot from scratch. The input may be unsorted and may contain
/// the same record more than once.
pub fn replay(seed: &DrawSessionSeed, events: &[DrawEventRecord]) -> DrawState {
    let mut ordered = events.to_vec();
    sort_events(&mut ordered);
    let mut seen: HashSet<EventId> = HashSet::with_capacity(ordered.len());
    ordered
        .iter()
        .filter(|record| seen.insert(record.id))
        .fold(create_initial_state(seed), apply_event)
}

impl DrawState {
    /// Applies one record in place. Returns `false` when the record was a no-op.
    pub fn apply(&mut self, record: &DrawEventRecord) -> bool {
        if record.session_id != self.session_id {
            return false;
        }
        match &record.event {
            DrawEvent::SessionStarted(payload) => self.on_session_started(payload),
            DrawEvent::StepConfigured(payload) => self.on_step_configured(record.step, payload),
            DrawEvent::PickResult(payload) => {
                self.on_pick_result(record.step, record.created_at, payload)
            }
            DrawEvent::AssignUpdated(payload) => self.on_assign_updated(payload),
            DrawEvent::AssignConfirmed(payload) => self.on_assign_confirmed(payload),
            DrawEvent::MemberMoved(payload) => self.on_member_moved(payload),
            DrawEvent::UndoLast(payload) => self.on_undo_last(payload),
        }
    }

    pub fn group_no(&self, raw: i64) -> Option<GroupNo> {
        GroupNo::try_from(raw)
            .ok()
            .filter(|g| (1..=self.group_count).contains(g))
    }

    pub fn members(&self, group_no: GroupNo) -> &[PlayerId] {
        self.groups.get(&group_no).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_full(&self, group_no: GroupNo) -> bool {
        self.members(group_no).len() >= self.group_size as usize
    }

    pub fn group_of(&self, player_id: PlayerId) -> Option<GroupNo> {
        self.groups
            .iter()
            .find(|(_, members)| members.contains(&player_id))
            .map(|(group_no, _)| *group_no)
    }

    pub fn is_remaining(&self, player_id: PlayerId) -> bool {
        self.remaining_player_ids.contains(&player_id)
    }

    /// End of the animated spin; durations past [`MAX_SCAN_MS`](crate::path::MAX_SCAN_MS) are cut there.
    pub fn spin_ends_at(&self) -> Option<DateTime<Utc>> {
        let duration = chrono::Duration::milliseconds(
            i64::try_from(clamp_scan_ms(self.duration_ms)).ok()?,
        );
        self.started_at?.checked_add_signed(duration)
    }

    /// Phase as a viewer should show it: a configured step inside its spin
    /// window reads as `Spinning`.
    pub fn display_phase(&self, now: DateTime<Utc>) -> DrawPhase {
        if self.phase != DrawPhase::Configured {
            return self.phase;
        }
        match (self.started_at, self.spin_ends_at()) {
            (Some(start), Some(end)) if start <= now && now < end => DrawPhase::Spinning,
            _ => self.phase,
        }
    }

    /// Group a confirmation lands in: the explicit group, else the pending
    /// one, else the step target. `0` reads as "no explicit group"; any
    /// other out-of-range value resolves to nothing.
    pub fn resolved_group(&self, explicit: Option<i64>) -> Option<GroupNo> {
        match explicit.filter(|raw| *raw != 0) {
            Some(raw) => self.group_no(raw),
            None => self.pending_group_no.or(self.target_group_no),
        }
    }

    pub fn verify(&self) -> Result<(), StateViolation> {
        let mut seen = HashSet::new();
        let mut placed = 0_usize;
        for (group_no, members) in &self.groups {
            if members.len() > self.group_size as usize {
                return Err(StateViolation::GroupOverflow {
                    group_no: *group_no,
                    len: members.len(),
                    limit: self.group_size,
                });
            }
            for member in members {
                if !seen.insert(*member) {
                    return Err(StateViolation::DuplicatePlayer(*member));
                }
            }
            placed += members.len();
        }
        for player in &self.remaining_player_ids {
            if !seen.insert(*player) {
                return Err(StateViolation::DuplicatePlayer(*player));
            }
        }
        placed += self.remaining_player_ids.len();
        if placed != self.total_players as usize {
            return Err(StateViolation::Conservation {
                placed,
                total: self.total_players,
            });
        }
        Ok(())
    }

    fn on_session_started(&mut self, payload: &SessionStarted) -> bool {
        self.status = SessionStatus::Live;
        self.phase = DrawPhase::Idle;
        self.current_pick_player_id = None;
        self.pending_group_no = None;
        self.picked_at = None;
        if let Some(player_ids) = &payload.player_ids {
            let roster = dedup_preserving_order(player_ids);
            self.total_players = u32::try_from(roster.len()).unwrap_or(u32::MAX);
            self.remaining_player_ids = roster.clone();
            self.roster = roster;
            self.groups = empty_groups(self.group_count);
        }
        true
    }

    fn on_step_configured(&mut self, step: u32, payload: &StepConfigured) -> bool {
        let target = match payload.mode {
            DrawMode::TargetGroup => payload
                .target_group_no
                .and_then(|raw| self.group_no(raw))
                .unwrap_or(1),
            DrawMode::RoundRobin => step % self.group_count.max(1) + 1,
        };

        let deck = self.deck_for(payload.deck_order.as_deref());
        self.step_seed = derive_step_seed(
            self.session_id,
            step,
            payload.started_at.timestamp_millis(),
            payload.duration_ms,
            payload.seed,
            &deck,
        );
        self.step_deck_player_ids = deck;
        self.current_step = step;
        self.current_mode = payload.mode;
        self.target_group_no = Some(target);
        self.started_at = Some(payload.started_at);
        self.duration_ms = payload.duration_ms;
        self.step_pattern = payload.pattern.clone();
        self.step_tempo = payload.tempo;
        self.current_pick_player_id = None;
        self.pending_group_no = None;
        self.picked_at = None;
        self.phase = DrawPhase::Configured;
        true
    }

    fn deck_for(&self, deck_order: Option<&[PlayerId]>) -> Vec<PlayerId> {
        let deck: Vec<PlayerId> = deck_order
            .map(dedup_preserving_order)
            .unwrap_or_default()
            .into_iter()
            .filter(|id| self.is_remaining(*id))
            .collect();
        if deck.is_empty() {
            self.remaining_player_ids.clone()
        } else {
            deck
        }
    }

    fn on_pick_result(
        &mut self,
        step: u32,
        created_at: DateTime<Utc>,
        payload: &PickResult,
    ) -> bool {
        if step != self.current_step
            || !self.phase.accepts_pick()
            || !self.is_remaining(payload.player_id)
        {
            return false;
        }
        self.current_pick_player_id = Some(payload.player_id);
        self.picked_at = Some(created_at);
        self.phase = DrawPhase::Picked;
        true
    }

    fn on_assign_updated(&mut self, payload: &GroupAssignment) -> bool {
        if self.phase != DrawPhase::Picked
            || self.current_pick_player_id != Some(payload.player_id)
        {
            return false;
        }
        let Some(group_no) = self.group_no(payload.group_no) else {
            return false;
        };
        if self.is_full(group_no) {
            return false;
        }
        self.pending_group_no = Some(group_no);
        true
    }

    fn on_assign_confirmed(&mut self, payload: &GroupAssignment) -> bool {
        let player_id = payload.player_id;
        if self.phase != DrawPhase::Picked
            || self.current_pick_player_id != Some(player_id)
            || !self.is_remaining(player_id)
            || self.group_of(player_id).is_some()
        {
            return false;
        }
        let Some(group_no) = self.resolved_group(Some(payload.group_no)) else {
            return false;
        };
        if self.is_full(group_no) {
            return false;
        }

        let members = self.groups.entry(group_no).or_default();
        if !members.contains(&player_id) {
            members.push(player_id);
        }
        self.remaining_player_ids.retain(|id| *id != player_id);
        self.pending_group_no = None;
        if self.remaining_player_ids.is_empty() {
            self.phase = DrawPhase::Finished;
            self.status = SessionStatus::Finished;
        } else {
            self.phase = DrawPhase::Confirmed;
        }
        true
    }

    fn on_member_moved(&mut self, payload: &MemberMoved) -> bool {
        let player_id = payload.player_id;
        if self.is_remaining(player_id) || self.group_of(player_id).is_none() {
            return false;
        }
        let Some(to_group_no) = self.group_no(payload.to_group_no) else {
            return false;
        };
        if self.is_full(to_group_no) && !self.members(to_group_no).contains(&player_id) {
            return false;
        }
        for members in self.groups.values_mut() {
            members.retain(|id| *id != player_id);
        }
        self.groups.entry(to_group_no).or_default().push(player_id);
        true
    }

    fn on_undo_last(&mut self, payload: &UndoLast) -> bool {
        let player_id = payload.player_id;
        if !self.roster.contains(&player_id) {
            return false;
        }
        for members in self.groups.values_mut() {
            members.retain(|id| *id != player_id);
        }
        self.restore_remaining(player_id);
        self.current_pick_player_id = Some(player_id);
        self.pending_group_no = None;
        self.phase = DrawPhase::Picked;
        self.status = SessionStatus::Live;
        true
    }

    fn restore_remaining(&mut self, player_id: PlayerId) {
        if self.is_remaining(player_id) {
            return;
        }
        let rank = |id: PlayerId| {
            self.roster
                .iter()
                .position(|r| *r == id)
                .unwrap_or(usize::MAX)
        };
        let own_rank = rank(player_id);
        let at = self
            .remaining_player_ids
            .iter()
            .position(|id| rank(*id) > own_rank)
            .unwrap_or(self.remaining_player_ids.len());
        self.remaining_player_ids.insert(at, player_id);
    }
}

#[cfg(test)]
#[path = "tests/reducer_tests.rs"]
mod tests;
