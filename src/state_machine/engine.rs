use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::actions::StateAction;
use super::context::ExecutionContext;
use super::job::JobStatus;
use super::retry::{Disposition, RetryPolicy};
use super::state::{Event, State, StateMachine, Transition};
use crate::error::AgentError;
use crate::listeners::{JobExecutionListener, ListenerSet};

/// Drives a job through the state machine, exactly once.
///
/// For each state the engine notifies the listeners, then either skips the
/// state (abort requested and the state is skippable) or runs its action,
/// retrying transient failures and routing fatal ones to `HandleError`.
/// `CleanupJob` and `Shutdown` always run.
pub struct JobExecutionEngine {
    actions: BTreeMap<State, Arc<dyn StateAction>>,
    listeners: ListenerSet,
    retry_policy: RetryPolicy,
}

#[derive(Default)]
pub struct EngineBuilder {
    actions: BTreeMap<State, Arc<dyn StateAction>>,
    listeners: ListenerSet,
    retry_policy: RetryPolicy,
}

impl EngineBuilder {
    /// Bind an action to its state, replacing any previous one.
    pub fn action(mut self, action: Arc<dyn StateAction>) -> Self {
        self.actions.insert(action.state(), action);
        self
    }

    pub fn actions(self, actions: impl IntoIterator<Item = Arc<dyn StateAction>>) -> Self {
        actions.into_iter().fold(self, Self::action)
    }

    pub fn listener(mut self, listener: Arc<dyn JobExecutionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn build(self) -> Result<JobExecutionEngine, AgentError> {
        let missing: Vec<String> = State::ALL
            .iter()
            .filter(|state| !self.actions.contains_key(state))
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(AgentError::Config(format!(
                "no action bound to {}",
                missing.join(", ")
            )));
        }
        Ok(JobExecutionEngine {
            actions: self.actions,
            listeners: self.listeners,
            retry_policy: self.retry_policy,
        })
    }
}

impl JobExecutionEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Run the state machine to completion and return the final job status.
    pub async fn run(&self, ctx: &ExecutionContext) -> JobStatus {
        self.listeners.state_machine_started();

        let mut history: Vec<State> = Vec::with_capacity(State::ALL.len());
        let mut next = Some(State::InitializeAgent);

        while let Some(state) = next {
            if state == State::CleanupJob {
                let status = ctx.seal_final_job_status();
                debug!(%status, "Final job status sealed");
            }
            ctx.begin_state();
            history.push(state);
            self.listeners.state_entered(state);

            let transition = if ctx.is_abort_requested() && state.is_skippable_on_abort() {
                self.listeners.state_skipped(state);
                StateMachine::next(state, Event::AbortRequested, &history)
            } else {
                self.execute_state(state, ctx, &history).await
            };

            next = next_state(transition);
        }

        self.listeners.state_machine_stopped();
        let status = ctx.final_job_status().unwrap_or(JobStatus::Failed);
        info!(%status, states = history.len(), "Job execution finished");
        status
    }

    /// Attempt the state's action until it succeeds, fails fatally, or the
    /// run is aborted.
    async fn execute_state(
        &self,
        state: State,
        ctx: &ExecutionContext,
        history: &[State],
    ) -> Transition {
        let Some(action) = self.actions.get(&state) else {
            let err = AgentError::Config(format!("no action bound to {state}"));
            return self.fail(state, ctx, history, &err);
        };

        loop {
            self.listeners
                .before_state_action_attempt(state, action.name());
            let attempt = ctx.record_attempt();

            let err = match action.execute(ctx).await {
                Ok(()) => {
                    self.listeners
                        .after_state_action_attempt(state, action.name(), None);
                    self.listeners.state_exited(state);
                    return StateMachine::next(state, Event::ActionSucceeded, history);
                }
                Err(err) => err,
            };

            self.listeners
                .after_state_action_attempt(state, action.name(), Some(&err));
            ctx.record_failure(state, &err);

            // A kill is never an error of its own, whatever the action failed with.
            let disposition = if ctx.kill_source().is_some() {
                Disposition::Abandon
            } else {
                self.retry_policy.classify(state, &err, attempt)
            };

            match disposition {
                Disposition::Retry(delay) => {
                    match StateMachine::next(state, Event::ActionFailedRetryable, history) {
                        Transition::Retry(_) => {}
                        other => return other,
                    }
                    self.listeners.delayed_state_action_retry(state, delay);
                    let abort = ctx.abort_token();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = abort.cancelled() => {
                            info!(%state, "Abort requested while waiting to retry");
                            return StateMachine::next(state, Event::AbortRequested, history);
                        }
                    }
                }
                Disposition::Abandon => {
                    info!(%state, "State action interrupted by abort");
                    return StateMachine::next(state, Event::AbortRequested, history);
                }
                Disposition::Fatal => return self.fail(state, ctx, history, &err),
            }
        }
    }

    fn fail(
        &self,
        state: State,
        ctx: &ExecutionContext,
        history: &[State],
        err: &AgentError,
    ) -> Transition {
        self.listeners.fatal_error(state, err);
        let transition = StateMachine::next(state, Event::ActionFailedFatal, history);
        if let Transition::Abort { .. } = transition {
            self.listeners.execution_aborted(state, err);
            ctx.abort_execution();
        }
        transition
    }
}

/// Where the run goes after `transition`. Retries are resolved inside
/// `execute_state`; one escaping it ends the run.
fn next_state(transition: Transition) -> Option<State> {
    match transition {
        Transition::Advance(state) => Some(state),
        Transition::Abort { resume } => resume,
        Transition::Stop => None,
        Transition::Retry(state) => {
            warn!(%state, "Retry transition outside of action execution, stopping");
            None
        }
    }
}
