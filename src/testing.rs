//! Test doubles for the collaborator traits, listeners and sinks.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::MakeWriter;

use crate::error::AgentError;
use crate::events::{AgentEvent, EventSink};
use crate::listeners::{ConsoleSink, JobExecutionListener};
use crate::server::{AgentMetadata, ServerError};
use crate::services::{AgentJobService, HeartbeatService, JobProcessManager, JobSetupService};
use crate::state_machine::{
    CleanupStrategy, ExecutionContext, JobProcessResult, JobRequest, JobSpecification,
    KillSource, State, StateAction,
};

/// Event sink that records what it accepts, optionally failing the first
/// `n` deliveries with a transient error.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<AgentEvent>>,
    attempts: AtomicU32,
    fail_first: u32,
}

impl RecordingSink {
    pub fn failing_first(n: u32) -> Self {
        Self {
            fail_first: n,
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<AgentEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: &AgentEvent) -> Result<(), ServerError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first {
            return Err(ServerError::ApiError {
                status: 503,
                message: "unavailable".into(),
            });
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub struct FakeJobService {
    job_id: String,
    calls: Mutex<Vec<String>>,
    handshake_failures: Mutex<VecDeque<ServerError>>,
    claim_failure: Mutex<Option<ServerError>>,
}

impl FakeJobService {
    pub fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            calls: Mutex::new(Vec::new()),
            handshake_failures: Mutex::new(VecDeque::new()),
            claim_failure: Mutex::new(None),
        }
    }

    pub fn fail_handshakes(&self, errors: Vec<ServerError>) {
        self.handshake_failures.lock().unwrap().extend(errors);
    }

    pub fn fail_claim(&self, error: ServerError) {
        *self.claim_failure.lock().unwrap() = Some(error);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn specification(&self) -> JobSpecification {
        JobSpecification {
            job_id: self.job_id.clone(),
            job_name: "test-job".into(),
            executable_args: vec!["true".into()],
            ..Default::default()
        }
    }
}

#[async_trait]
impl AgentJobService for FakeJobService {
    async fn handshake(&self, _metadata: &AgentMetadata) -> Result<(), ServerError> {
        self.record("handshake".into());
        match self.handshake_failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn reserve_job_id(&self, _request: &JobRequest) -> Result<String, ServerError> {
        self.record("reserve_job_id".into());
        Ok(self.job_id.clone())
    }

    async fn resolve_job_specification(
        &self,
        job_id: &str,
    ) -> Result<JobSpecification, ServerError> {
        self.record(format!("resolve_job_specification:{job_id}"));
        Ok(self.specification())
    }

    async fn get_job_specification(&self, job_id: &str) -> Result<JobSpecification, ServerError> {
        self.record(format!("get_job_specification:{job_id}"));
        Ok(self.specification())
    }

    async fn resolve_job_specification_dry_run(
        &self,
        _request: &JobRequest,
    ) -> Result<JobSpecification, ServerError> {
        self.record("resolve_job_specification_dry_run".into());
        Ok(self.specification())
    }

    async fn claim_job(&self, job_id: &str, _metadata: &AgentMetadata) -> Result<(), ServerError> {
        self.record(format!("claim_job:{job_id}"));
        match self.claim_failure.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Setup service that only records calls; nothing touches the filesystem.
#[derive(Default)]
pub struct FakeSetup {
    calls: Mutex<Vec<String>>,
    fail_download: AtomicBool,
    fail_archive: AtomicBool,
}

impl FakeSetup {
    pub fn fail_download(&self) {
        self.fail_download.store(true, Ordering::SeqCst);
    }

    pub fn fail_archive(&self) {
        self.fail_archive.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl JobSetupService for FakeSetup {
    async fn create_job_directory(
        &self,
        root: &Path,
        spec: &JobSpecification,
    ) -> Result<PathBuf, AgentError> {
        self.record("create_job_directory");
        Ok(root.join(&spec.job_id))
    }

    async fn download_job_resources(
        &self,
        _spec: &JobSpecification,
        _job_dir: &Path,
    ) -> Result<Vec<PathBuf>, AgentError> {
        self.record("download_job_resources");
        if self.fail_download.load(Ordering::SeqCst) {
            let cause = io::Error::new(io::ErrorKind::PermissionDenied, "permission denied");
            return Err(AgentError::io("failed to write dependency", cause));
        }
        Ok(Vec::new())
    }

    async fn create_job_script(
        &self,
        _spec: &JobSpecification,
        job_dir: &Path,
    ) -> Result<PathBuf, AgentError> {
        self.record("create_job_script");
        Ok(job_dir.join("run"))
    }

    async fn archive_job_directory(
        &self,
        job_dir: &Path,
        location: &Path,
    ) -> Result<PathBuf, AgentError> {
        self.record("archive_job_directory");
        if self.fail_archive.load(Ordering::SeqCst) {
            return Err(AgentError::io(
                "failed to archive",
                io::Error::new(io::ErrorKind::StorageFull, "disk full"),
            ));
        }
        Ok(location.join(job_dir.file_name().unwrap_or_default()))
    }

    async fn cleanup_job_directory(
        &self,
        _job_dir: &Path,
        _strategy: CleanupStrategy,
    ) -> Result<(), AgentError> {
        self.record("cleanup_job_directory");
        Ok(())
    }
}

/// Process manager that exits with a fixed code, or blocks until killed.
pub struct FakeProcess {
    exit_code: i32,
    until_killed: bool,
    kill_source: OnceLock<KillSource>,
    kill_token: CancellationToken,
    launched: AtomicBool,
    waiting: Notify,
}

impl FakeProcess {
    pub fn exiting_with(exit_code: i32) -> Self {
        Self {
            exit_code,
            until_killed: false,
            kill_source: OnceLock::new(),
            kill_token: CancellationToken::new(),
            launched: AtomicBool::new(false),
            waiting: Notify::new(),
        }
    }

    pub fn running_until_killed() -> Self {
        Self {
            until_killed: true,
            ..Self::exiting_with(0)
        }
    }

    pub fn kill_source(&self) -> Option<KillSource> {
        self.kill_source.get().copied()
    }

    pub fn launched(&self) -> bool {
        self.launched.load(Ordering::SeqCst)
    }

    /// Resolves once someone waits for the process.
    pub async fn wait_started(&self) {
        self.waiting.notified().await;
    }
}

#[async_trait]
impl JobProcessManager for FakeProcess {
    async fn launch_process(
        &self,
        _job_dir: &Path,
        _env: &BTreeMap<String, String>,
        _command_line: &[String],
        _interactive: bool,
        _timeout: Option<Duration>,
    ) -> Result<(), AgentError> {
        if self.kill_token.is_cancelled() {
            return Err(AgentError::Aborted);
        }
        self.launched.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn kill(&self, source: KillSource) {
        let _ = self.kill_source.set(source);
        self.kill_token.cancel();
    }

    async fn wait_for(&self) -> Result<JobProcessResult, AgentError> {
        if !self.launched() {
            return Err(AgentError::InvalidState("no job process was launched".into()));
        }
        self.waiting.notify_one();
        if self.until_killed {
            self.kill_token.cancelled().await;
        }
        Ok(JobProcessResult::from_exit(
            Some(self.exit_code),
            self.kill_source(),
        ))
    }
}

type StartHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct FakeHeartbeat {
    started: Mutex<Option<String>>,
    stopped: AtomicBool,
    on_start: Mutex<Option<StartHook>>,
}

impl FakeHeartbeat {
    /// Run `hook` when the heartbeat starts (right after the claim).
    pub fn on_start(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_start.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn started(&self) -> Option<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl HeartbeatService for FakeHeartbeat {
    fn start(&self, job_id: &str) {
        *self.started.lock().unwrap() = Some(job_id.to_string());
        if let Some(hook) = self.on_start.lock().unwrap().as_ref() {
            hook();
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.started().is_some() && !self.stopped()
    }
}

/// Action that always fails with a non-transient error.
pub struct FailingAction {
    state: State,
}

impl FailingAction {
    pub fn new(state: State) -> Self {
        Self { state }
    }
}

#[async_trait]
impl StateAction for FailingAction {
    fn state(&self) -> State {
        self.state
    }

    fn name(&self) -> &'static str {
        "FailingAction"
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> Result<(), AgentError> {
        Err(AgentError::InvalidState(format!("{} is broken", self.state)))
    }
}

/// Listener recording every callback as a short string.
#[derive(Default)]
pub struct RecordingListener {
    calls: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl JobExecutionListener for RecordingListener {
    fn state_entered(&self, state: State) {
        self.record(format!("state_entered:{state}"));
    }

    fn state_exited(&self, state: State) {
        self.record(format!("state_exited:{state}"));
    }

    fn before_state_action_attempt(&self, state: State, _action: &str) {
        self.record(format!("before_attempt:{state}"));
    }

    fn after_state_action_attempt(&self, state: State, _action: &str, error: Option<&AgentError>) {
        let outcome = if error.is_some() { "err" } else { "ok" };
        self.record(format!("after_attempt:{state}:{outcome}"));
    }

    fn state_machine_started(&self) {
        self.record("started".into());
    }

    fn state_machine_stopped(&self) {
        self.record("stopped".into());
    }

    fn state_skipped(&self, state: State) {
        self.record(format!("state_skipped:{state}"));
    }

    fn fatal_error(&self, state: State, _error: &AgentError) {
        self.record(format!("fatal_error:{state}"));
    }

    fn execution_aborted(&self, state: State, _error: &AgentError) {
        self.record(format!("execution_aborted:{state}"));
    }

    fn delayed_state_action_retry(&self, state: State, delay: Duration) {
        self.record(format!("delayed_retry:{state}:{}ms", delay.as_millis()));
    }
}

#[derive(Default)]
pub struct BufferConsole {
    lines: Mutex<Vec<String>>,
}

impl BufferConsole {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl ConsoleSink for BufferConsole {
    fn info(&self, message: &str) {
        self.lines.lock().unwrap().push(format!("info: {message}"));
    }

    fn warn(&self, message: &str) {
        self.lines.lock().unwrap().push(format!("warn: {message}"));
    }

    fn error(&self, message: &str) {
        self.lines.lock().unwrap().push(format!("error: {message}"));
    }

    fn finish(&self) {
        self.lines.lock().unwrap().push("finish".into());
    }
}

/// In-memory writer for `tracing_subscriber::fmt`.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
