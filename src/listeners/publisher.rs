use std::sync::{Arc, Mutex};

use tracing::debug;

use super::JobExecutionListener;
use crate::error::AgentError;
use crate::events::AgentEventsService;
use crate::state_machine::{ExecutionContext, JobStatus, State};

/// Turns state machine callbacks into events for the server.
///
/// Every entered state yields a state change and every action attempt an
/// action execution event. Job status updates follow a fixed mapping,
/// evaluated once for each state whose action actually runs:
///
/// | entered state  | previous status   | update          |
/// |----------------|-------------------|-----------------|
/// | `SetupJob`     | none              | `Init`          |
/// | `MonitorJob`   | `Init`            | `Running`       |
/// | `HandleError`  | `Init`, `Running` | `Failed` (held) |
/// | `CleanupJob`   | any               | final status    |
///
/// The `Failed` derived on error handling is not sent by itself; the final
/// status goes out once, on cleanup. Status updates need a known job id, so
/// a job request that failed before an id was reserved reports none.
pub struct EventPublishingListener {
    context: Arc<ExecutionContext>,
    events: AgentEventsService,
    progress: Mutex<Progress>,
}

#[derive(Default)]
struct Progress {
    last_state: Option<State>,
    /// Entered state whose status has not been evaluated yet.
    pending: Option<State>,
    derived: Option<JobStatus>,
}

impl EventPublishingListener {
    pub fn new(context: Arc<ExecutionContext>, events: AgentEventsService) -> Self {
        Self {
            context,
            events,
            progress: Mutex::new(Progress::default()),
        }
    }

    fn derive_status(&self, state: State, previous: Option<JobStatus>) -> Option<(JobStatus, bool)> {
        match (state, previous) {
            (State::SetupJob, None) => Some((JobStatus::Init, true)),
            (State::MonitorJob, Some(JobStatus::Init)) => Some((JobStatus::Running, true)),
            (State::HandleError, Some(JobStatus::Init | JobStatus::Running)) => {
                Some((JobStatus::Failed, false))
            }
            (State::CleanupJob, _) => self
                .context
                .final_job_status()
                .map(|status| (status, true)),
            _ => None,
        }
    }

    fn emit_status(&self, status: JobStatus) {
        match self.context.reporting_job_id() {
            Some(job_id) => self.events.emit_job_status_update(job_id, status),
            None => debug!(%status, "No job id known, status update not sent"),
        }
    }
}

impl JobExecutionListener for EventPublishingListener {
    fn state_entered(&self, state: State) {
        let Ok(mut progress) = self.progress.lock() else {
            return;
        };
        self.events.emit_state_change(progress.last_state, state);
        progress.last_state = Some(state);
        progress.pending = Some(state);
    }

    fn state_skipped(&self, state: State) {
        if let Ok(mut progress) = self.progress.lock() {
            if progress.pending == Some(state) {
                progress.pending = None;
            }
        }
    }

    fn before_state_action_attempt(&self, state: State, _action: &str) {
        let Ok(mut progress) = self.progress.lock() else {
            return;
        };
        if progress.pending.take() != Some(state) {
            return;
        }
        if let Some((status, send)) = self.derive_status(state, progress.derived) {
            progress.derived = Some(status);
            if send {
                self.emit_status(status);
            }
        }
    }

    fn after_state_action_attempt(&self, state: State, action: &str, error: Option<&AgentError>) {
        self.events.emit_state_action_execution(state, action, error);
    }
}
