//! Run-wide mutable record shared by the engine, the state actions, the
//! listeners and the kill path.
//!
//! Every slot is either set-once ([`OnceLock`]) or atomic, so the kill thread
//! can flag an abort while the engine thread is mid-action without locks
//! around the engine itself.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};

use tokio_util::sync::CancellationToken;

use super::job::{CleanupStrategy, JobProcessResult, JobRequest, JobSpecification, JobStatus, KillSource};
use super::state::State;
use crate::error::AgentError;

/// Where the job to execute comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSource {
    /// A job submitted through the server API and already resolved there.
    Preresolved(String),
    /// A new job described on the command line.
    Request(JobRequest),
}

/// A failed action attempt, fatal or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionFailure {
    pub state: State,
    pub kind: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ExecutionContext {
    agent_id: String,
    job_source: JobSource,
    job_directory_root: PathBuf,
    cleanup_strategy: CleanupStrategy,

    abort: CancellationToken,
    kill_source: OnceLock<KillSource>,

    job_id: OnceLock<String>,
    claimed_job_id: OnceLock<String>,
    job_specification: OnceLock<JobSpecification>,
    job_directory: OnceLock<PathBuf>,
    job_script: OnceLock<PathBuf>,
    job_launched: AtomicBool,
    process_result: OnceLock<JobProcessResult>,
    final_job_status: OnceLock<JobStatus>,

    attempts: AtomicU32,
    failures: Mutex<Vec<TransitionFailure>>,
}

fn set_once<T>(cell: &OnceLock<T>, value: T, what: &str) -> Result<(), AgentError> {
    cell.set(value)
        .map_err(|_| AgentError::InvalidState(format!("{what} is already set")))
}

impl ExecutionContext {
    pub fn new(agent_id: impl Into<String>, job_source: JobSource) -> Self {
        Self {
            agent_id: agent_id.into(),
            job_source,
            job_directory_root: std::env::temp_dir().join("jobs"),
            cleanup_strategy: CleanupStrategy::default(),
            abort: CancellationToken::new(),
            kill_source: OnceLock::new(),
            job_id: OnceLock::new(),
            claimed_job_id: OnceLock::new(),
            job_specification: OnceLock::new(),
            job_directory: OnceLock::new(),
            job_script: OnceLock::new(),
            job_launched: AtomicBool::new(false),
            process_result: OnceLock::new(),
            final_job_status: OnceLock::new(),
            attempts: AtomicU32::new(0),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn with_job_directory_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.job_directory_root = root.into();
        self
    }

    pub fn with_cleanup_strategy(mut self, strategy: CleanupStrategy) -> Self {
        self.cleanup_strategy = strategy;
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn job_source(&self) -> &JobSource {
        &self.job_source
    }

    pub fn job_directory_root(&self) -> &Path {
        &self.job_directory_root
    }

    pub fn cleanup_strategy(&self) -> CleanupStrategy {
        self.cleanup_strategy
    }

    // --- abort / kill ---

    /// A token cancelled when the execution is aborted. Long-running actions
    /// select on it to bound kill latency.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Flag a kill. Returns `false` if a kill was already requested.
    pub fn request_kill(&self, source: KillSource) -> bool {
        let first = self.kill_source.set(source).is_ok();
        self.abort.cancel();
        first
    }

    pub fn kill_source(&self) -> Option<KillSource> {
        self.kill_source.get().copied()
    }

    /// Abort without a kill request (the error handler itself failed).
    pub fn abort_execution(&self) {
        self.abort.cancel();
    }

    // --- job identity and specification ---

    pub fn set_job_id(&self, job_id: impl Into<String>) -> Result<(), AgentError> {
        let job_id = job_id.into();
        if job_id.trim().is_empty() {
            return Err(AgentError::InvalidState("job id is blank".into()));
        }
        set_once(&self.job_id, job_id, "job id")
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job_id.get().map(String::as_str)
    }

    /// Record that this agent owns `job_id`. Must match the resolved job id.
    pub fn set_claimed_job_id(&self, job_id: &str) -> Result<(), AgentError> {
        match self.job_id() {
            Some(known) if known == job_id => {
                set_once(&self.claimed_job_id, job_id.to_string(), "claimed job id")
            }
            Some(known) => Err(AgentError::InvalidState(format!(
                "claimed job {job_id} does not match resolved job {known}"
            ))),
            None => Err(AgentError::InvalidState(
                "cannot claim a job before its id is known".into(),
            )),
        }
    }

    pub fn claimed_job_id(&self) -> Option<&str> {
        self.claimed_job_id.get().map(String::as_str)
    }

    /// The id status updates are reported under: the resolved id, else the id
    /// the job was submitted with. `None` for a request that never got one.
    pub fn reporting_job_id(&self) -> Option<&str> {
        self.job_id().or(match &self.job_source {
            JobSource::Preresolved(job_id) => Some(job_id.as_str()),
            JobSource::Request(_) => None,
        })
    }

    pub fn set_job_specification(&self, spec: JobSpecification) -> Result<(), AgentError> {
        set_once(&self.job_specification, spec, "job specification")
    }

    pub fn job_specification(&self) -> Option<&JobSpecification> {
        self.job_specification.get()
    }

    // --- local job files ---

    pub fn set_job_directory(&self, dir: PathBuf) -> Result<(), AgentError> {
        set_once(&self.job_directory, dir, "job directory")
    }

    pub fn job_directory(&self) -> Option<&Path> {
        self.job_directory.get().map(PathBuf::as_path)
    }

    pub fn set_job_script(&self, script: PathBuf) -> Result<(), AgentError> {
        set_once(&self.job_script, script, "job script")
    }

    pub fn job_script(&self) -> Option<&Path> {
        self.job_script.get().map(PathBuf::as_path)
    }

    // --- process ---

    pub fn mark_job_launched(&self) {
        self.job_launched.store(true, Ordering::SeqCst);
    }

    pub fn is_job_launched(&self) -> bool {
        self.job_launched.load(Ordering::SeqCst)
    }

    pub fn set_process_result(&self, result: JobProcessResult) -> Result<(), AgentError> {
        set_once(&self.process_result, result, "process result")
    }

    pub fn process_result(&self) -> Option<&JobProcessResult> {
        self.process_result.get()
    }

    // --- final status ---

    /// Set the final status unless one was already set. Returns whether this
    /// call set it.
    pub fn set_final_job_status(&self, status: JobStatus) -> bool {
        debug_assert!(status.is_final());
        self.final_job_status.set(status).is_ok()
    }

    pub fn final_job_status(&self) -> Option<JobStatus> {
        self.final_job_status.get().copied()
    }

    /// Fix the final status: keep the existing one, else `Killed` if a kill was
    /// requested, else `Failed`.
    pub fn seal_final_job_status(&self) -> JobStatus {
        *self.final_job_status.get_or_init(|| {
            if self.kill_source.get().is_some() {
                JobStatus::Killed
            } else {
                JobStatus::Failed
            }
        })
    }

    // --- per-state bookkeeping ---

    /// Reset the attempt counter on entry into a new state.
    pub fn begin_state(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }

    /// Count one more attempt of the current state's action, returning the new total.
    pub fn record_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn record_failure(&self, state: State, error: &AgentError) {
        let failure = TransitionFailure {
            state,
            kind: error.kind_name().to_string(),
            message: error.to_string(),
        };
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(failure);
        }
    }

    pub fn failures(&self) -> Vec<TransitionFailure> {
        self.failures
            .lock()
            .map(|failures| failures.clone())
            .unwrap_or_default()
    }
}
