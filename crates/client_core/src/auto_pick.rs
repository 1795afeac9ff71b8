use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{DrawPhase, SessionId},
    reducer::DrawState,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[async_trait]
pub trait PickSubmitter: Send + Sync {
    async fn submit_pick(&self, session_id: SessionId, step: u32) -> Result<()>;
}

struct ArmedPick {
    step: u32,
    started_at: DateTime<Utc>,
    task: JoinHandle<()>,
}

/// Submits `pick_result` once the spin of the configured step has run out.
///
/// At most one pick is armed. `sync` re-evaluates against the latest state:
/// any phase other than `configured`, or a different step, cancels it.
pub struct AutoPickTimer {
    submitter: Arc<dyn PickSubmitter>,
    armed: Option<ArmedPick>,
}

impl AutoPickTimer {
    pub fn new(submitter: Arc<dyn PickSubmitter>) -> Self {
        Self {
            submitter,
            armed: None,
        }
    }

    pub fn armed_step(&self) -> Option<u32> {
        self.armed
            .as_ref()
            .filter(|armed| !armed.task.is_finished())
            .map(|armed| armed.step)
    }

    pub fn sync(&mut self, state: &DrawState) {
        let wanted = match (state.phase, state.started_at, state.spin_ends_at()) {
            (DrawPhase::Configured, Some(started_at), Some(deadline)) => {
                Some((state.current_step, started_at, deadline))
            }
            _ => None,
        };
        let Some((step, started_at, deadline)) = wanted else {
            self.cancel();
            return;
        };
        if self
            .armed
            .as_ref()
            .is_some_and(|armed| armed.step == step && armed.started_at == started_at)
        {
            return;
        }
        self.arm(state.session_id, step, started_at, deadline);
    }

    pub fn arm(
        &mut self,
        session_id: SessionId,
        step: u32,
        started_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) {
        self.cancel();
        let wait = (deadline - Utc::now()).to_std().unwrap_or_default();
        let submitter = Arc::clone(&self.submitter);
        debug!(%session_id, step, wait_ms = wait.as_millis() as u64, "auto-pick armed");
        let task = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            match submitter.submit_pick(session_id, step).await {
                Ok(()) => info!(%session_id, step, "auto-pick submitted"),
                Err(error) => warn!(%session_id, step, %error, "auto-pick failed"),
            }
        });
        self.armed = Some(ArmedPick {
            step,
            started_at,
            task,
        });
    }

    pub fn cancel(&mut self) {
        if let Some(armed) = self.armed.take() {
            armed.task.abort();
        }
    }
}

impl Drop for AutoPickTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
#[path = "tests/auto_pick_tests.rs"]
mod tests;
