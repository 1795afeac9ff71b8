//! Local replica of one draw session, updated only by folding ordered events.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use shared::{
    domain::EventId,
    frame::{Frame, FrameScheduler},
    protocol::{sort_events, DrawEventRecord, DrawSessionSeed, DrawSnapshot},
    reducer::{apply_event, create_initial_state, DrawState},
};

/// What `DrawReplica::ingest` did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Sorted last; folded onto the existing state.
    Appended,
    /// Arrived out of order; the whole log was folded again.
    Refolded,
    Duplicate,
    ForeignSession,
}

impl IngestOutcome {
    pub fn changed(self) -> bool {
        matches!(self, Self::Appended | Self::Refolded)
    }
}

#[derive(Debug, Clone)]
pub struct DrawReplica {
    session: DrawSessionSeed,
    events: Vec<DrawEventRecord>,
    seen: HashSet<EventId>,
    state: DrawState,
    scheduler: Option<FrameScheduler>,
}

impl DrawReplica {
    pub fn from_snapshot(snapshot: DrawSnapshot) -> Self {
        let DrawSnapshot { session, mut events } = snapshot;
        events.retain(|record| record.session_id == session.session_id);
        sort_events(&mut events);
        let mut seen = HashSet::with_capacity(events.len());
        events.retain(|record| seen.insert(record.id));

        let mut replica = Self {
            state: create_initial_state(&session),
            session,
            events,
            seen,
            scheduler: None,
        };
        replica.refold();
        replica
    }

    pub fn state(&self) -> &DrawState {
        &self.state
    }

    /// Records in fold order, without duplicates.
    pub fn events(&self) -> &[DrawEventRecord] {
        &self.events
    }

    pub fn ingest(&mut self, record: DrawEventRecord) -> IngestOutcome {
        if record.session_id != self.session.session_id {
            return IngestOutcome::ForeignSession;
        }
        if !self.seen.insert(record.id) {
            return IngestOutcome::Duplicate;
        }

        let sorts_last = self
            .events
            .last()
            .map_or(true, |last| last.order_key() < record.order_key());
        if sorts_last {
            self.state.apply(&record);
            self.events.push(record);
            self.refresh_scheduler();
            IngestOutcome::Appended
        } else {
            let at = self
                .events
                .partition_point(|existing| existing.order_key() < record.order_key());
            self.events.insert(at, record);
            self.refold();
            IngestOutcome::Refolded
        }
    }

    /// Applies a session row pushed by the server. Returns `true` when it
    /// changed anything.
    pub fn update_session(&mut self, session: DrawSessionSeed) -> bool {
        if session.session_id != self.session.session_id || session == self.session {
            return false;
        }
        self.session = session;
        self.refold();
        true
    }

    /// Replaces everything with a fresh snapshot, keeping records that the
    /// snapshot does not know about yet.
    pub fn reset(&mut self, snapshot: DrawSnapshot) {
        let mut next = Self::from_snapshot(snapshot);
        if next.session.session_id == self.session.session_id {
            for record in std::mem::take(&mut self.events) {
                next.ingest(record);
            }
        }
        *self = next;
    }

    pub fn frame_at(&self, now: DateTime<Utc>) -> Option<Frame> {
        self.scheduler.as_ref().map(|scheduler| scheduler.frame_at(now))
    }

    fn refold(&mut self) {
        self.state = self
            .events
            .iter()
            .fold(create_initial_state(&self.session), apply_event);
        self.refresh_scheduler();
    }

    fn refresh_scheduler(&mut self) {
        self.scheduler = FrameScheduler::for_state(&self.state);
    }
}

#[cfg(test)]
#[path = "tests/replica_tests.rs"]
mod tests;
