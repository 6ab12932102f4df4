use std::time::Duration;

use tracing::{Dispatch, debug, dispatcher, error, info, warn};

use super::JobExecutionListener;
use crate::error::{AgentError, exception_trace};
use crate::state_machine::State;

/// Structured log of every state machine callback.
///
/// Logs into the injected [`Dispatch`] rather than the global subscriber.
pub struct LoggingListener {
    dispatch: Dispatch,
}

impl LoggingListener {
    pub fn new(dispatch: Dispatch) -> Self {
        Self { dispatch }
    }

    /// Log into whatever subscriber is current for the calling thread.
    pub fn with_current_dispatch() -> Self {
        Self::new(dispatcher::get_default(Dispatch::clone))
    }

    fn log(&self, f: impl FnOnce()) {
        dispatcher::with_default(&self.dispatch, f);
    }
}

impl JobExecutionListener for LoggingListener {
    fn state_entered(&self, state: State) {
        self.log(|| debug!(%state, "Entered state"));
    }

    fn state_exited(&self, state: State) {
        self.log(|| debug!(%state, "Exited state"));
    }

    fn before_state_action_attempt(&self, state: State, action: &str) {
        self.log(|| debug!(%state, action, "Executing state action"));
    }

    fn after_state_action_attempt(&self, state: State, action: &str, error: Option<&AgentError>) {
        self.log(|| match error {
            None => debug!(%state, action, "State action succeeded"),
            Some(e) => warn!(%state, action, kind = e.kind_name(), "State action failed: {e}"),
        });
    }

    fn state_machine_started(&self) {
        self.log(|| info!("Job execution state machine started"));
    }

    fn state_machine_stopped(&self) {
        self.log(|| info!("Job execution state machine stopped"));
    }

    fn state_skipped(&self, state: State) {
        self.log(|| info!(%state, "Skipping state, execution was aborted"));
    }

    fn fatal_error(&self, state: State, error: &AgentError) {
        self.log(|| {
            error!(
                %state,
                kind = error.kind_name(),
                trace = ?exception_trace(error),
                "Fatal error: {error}"
            )
        });
    }

    fn execution_aborted(&self, state: State, error: &AgentError) {
        self.log(|| {
            error!(
                %state,
                kind = error.kind_name(),
                trace = ?exception_trace(error),
                "Job execution aborted: {error}"
            )
        });
    }

    fn delayed_state_action_retry(&self, state: State, delay: Duration) {
        self.log(|| info!(%state, ?delay, "Retrying state action after delay"));
    }
}
