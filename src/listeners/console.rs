use std::sync::Arc;
use std::time::Duration;

use super::JobExecutionListener;
use crate::error::AgentError;
use crate::state_machine::{JobSource, ProgressStep, State};

/// Operator-facing output.
pub trait ConsoleSink: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
    fn finish(&self);
}

/// Console progress lines, relied on verbatim by operator tooling.
const PROGRESS_MESSAGES: [(ProgressStep, &str); 12] = [
    (ProgressStep::InitializeAgent, "Initializing agent..."),
    (ProgressStep::Handshake, "Connecting to server..."),
    (ProgressStep::ReserveJobId, "Obtaining job id..."),
    (ProgressStep::ObtainJobSpecification, "Obtaining job specification..."),
    (ProgressStep::ClaimJob, "Claiming job for execution..."),
    (ProgressStep::CreateJobDirectory, "Creating job directory..."),
    (ProgressStep::DownloadDependencies, "Downloading job dependencies..."),
    (ProgressStep::LaunchJob, "Launching job..."),
    (ProgressStep::WaitJobCompletion, "Waiting for job completion..."),
    (ProgressStep::Archive, "Archiving job files..."),
    (ProgressStep::Clean, "Cleaning job directory..."),
    (ProgressStep::Shutdown, "Shutting down..."),
];

pub fn progress_message(step: ProgressStep) -> Option<&'static str> {
    PROGRESS_MESSAGES
        .iter()
        .find(|(s, _)| *s == step)
        .map(|(_, message)| *message)
}

/// Prints short progress lines for the operator.
pub struct ConsoleListener {
    sink: Arc<dyn ConsoleSink>,
    reserves_job_id: bool,
}

impl ConsoleListener {
    pub fn new(sink: Arc<dyn ConsoleSink>) -> Self {
        Self {
            sink,
            reserves_job_id: true,
        }
    }

    /// Only jobs submitted as a request reserve an id; a preresolved job
    /// already has one.
    pub fn with_job_source(mut self, source: &JobSource) -> Self {
        self.reserves_job_id = matches!(source, JobSource::Request(_));
        self
    }
}

impl JobExecutionListener for ConsoleListener {
    fn before_state_action_attempt(&self, state: State, _action: &str) {
        for step in state.progress_steps() {
            if *step == ProgressStep::ReserveJobId && !self.reserves_job_id {
                continue;
            }
            if let Some(message) = progress_message(*step) {
                self.sink.info(message);
            }
        }
    }

    fn after_state_action_attempt(&self, state: State, _action: &str, error: Option<&AgentError>) {
        if let Some(error) = error {
            self.sink.warn(&format!("{state} failed: {error}"));
        }
    }

    fn delayed_state_action_retry(&self, state: State, delay: Duration) {
        self.sink
            .warn(&format!("Retrying {state} in {}ms...", delay.as_millis()));
    }

    fn fatal_error(&self, state: State, error: &AgentError) {
        self.sink.error(&format!("Fatal error in {state}: {error}"));
    }

    fn execution_aborted(&self, state: State, error: &AgentError) {
        self.sink
            .error(&format!("Job execution aborted in {state}: {error}"));
    }

    fn state_machine_stopped(&self) {
        self.sink.finish();
    }
}
