//! Pull-model frame computation: what a viewer should display at `now`,
//! derived only from the folded state and the wall clock.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{DrawPhase, PlayerId},
    path::{build_reveal_path, build_scan_path, ResolvedTempo, RevealPath, ScanPath},
    reducer::DrawState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStage {
    Waiting,
    Scanning,
    Revealing,
    Settled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub stage: FrameStage,
    pub candidate_index: Option<usize>,
    pub player_id: Option<PlayerId>,
}

#[derive(Debug, Clone)]
struct Reveal {
    starts_at: DateTime<Utc>,
    path: RevealPath,
}

#[derive(Debug, Clone)]
pub struct FrameScheduler {
    started_at: DateTime<Utc>,
    scan_ends_at: DateTime<Utc>,
    candidates: Vec<PlayerId>,
    scan: ScanPath,
    winner: Option<PlayerId>,
    reveal: Option<Reveal>,
}

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX / 2))
}

impl FrameScheduler {
    /// `None` until a step has been configured.
    pub fn for_state(state: &DrawState) -> Option<Self> {
        let started_at = state.started_at?;
        let winner = match state.phase {
            DrawPhase::Idle => return None,
            DrawPhase::Configured | DrawPhase::Spinning => None,
            DrawPhase::Picked | DrawPhase::Confirmed | DrawPhase::Finished => {
                state.current_pick_player_id
            }
        };

        let candidates = state.step_deck_player_ids.clone();
        let scan = build_scan_path(
            state.step_seed,
            candidates.len(),
            state.duration_ms,
            state.step_tempo.as_ref(),
        );
        let scan_ends_at = started_at
            .checked_add_signed(millis(scan.duration_ms))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let reveal = winner.and_then(|winner| {
            let winner_index = candidates.iter().position(|id| *id == winner)?;
            let from = scan.last_index()?;
            let tempo = ResolvedTempo::resolve(state.step_tempo.as_ref());
            let starts_at = state
                .picked_at
                .map_or(scan_ends_at, |picked_at| picked_at.max(scan_ends_at));
            Some(Reveal {
                starts_at,
                path: build_reveal_path(
                    from,
                    winner_index,
                    candidates.len(),
                    None,
                    tempo.near_miss,
                ),
            })
        });

        Some(Self {
            started_at,
            scan_ends_at,
            candidates,
            scan,
            winner,
            reveal,
        })
    }

    pub fn scan(&self) -> &ScanPath {
        &self.scan
    }

    pub fn scan_ends_at(&self) -> DateTime<Utc> {
        self.scan_ends_at
    }

    /// When the frame stops changing, if a winner is known.
    pub fn settles_at(&self) -> Option<DateTime<Utc>> {
        self.winner?;
        Some(match &self.reveal {
            Some(reveal) => reveal.starts_at + millis(reveal.path.duration_ms),
            None => self.scan_ends_at,
        })
    }

    pub fn frame_at(&self, now: DateTime<Utc>) -> Frame {
        if now < self.started_at {
            return self.frame(FrameStage::Waiting, self.scan.index_at_elapsed(0));
        }

        if let Some(reveal) = &self.reveal {
            if now >= reveal.starts_at {
                let elapsed = (now - reveal.starts_at).num_milliseconds();
                if elapsed >= i64::try_from(reveal.path.duration_ms).unwrap_or(i64::MAX) {
                    return self.frame(FrameStage::Settled, Some(reveal.path.winner_index));
                }
                return self.frame(FrameStage::Revealing, reveal.path.index_at_elapsed(elapsed));
            }
        } else if let Some(winner) = self.winner {
            // Winner outside the deck: nothing to animate towards.
            if now >= self.scan_ends_at {
                return Frame {
                    stage: FrameStage::Settled,
                    candidate_index: None,
                    player_id: Some(winner),
                };
            }
        }

        let elapsed = (now - self.started_at).num_milliseconds();
        self.frame(FrameStage::Scanning, self.scan.index_at_elapsed(elapsed))
    }

    fn frame(&self, stage: FrameStage, candidate_index: Option<usize>) -> Frame {
        Frame {
            stage,
            candidate_index,
            player_id: candidate_index.and_then(|index| self.candidates.get(index).copied()),
        }
    }
}

#[cfg(test)]
#[path = "tests/frame_tests.rs"]
mod tests;
