//! One unit of work per state, each a thin adapter over the collaborator
//! services.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::context::{ExecutionContext, JobSource};
use super::job::{JobSpecification, JobStatus, KillSource};
use super::state::State;
use crate::error::AgentError;
use crate::server::AgentMetadata;
use crate::services::{AgentJobService, HeartbeatService, JobProcessManager, JobSetupService};

/// The work bound to a state.
#[async_trait]
pub trait StateAction: Send + Sync {
    fn state(&self) -> State;

    /// Name reported in action execution events.
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), AgentError>;
}

/// The services the actions call into.
#[derive(Clone)]
pub struct Collaborators {
    pub jobs: Arc<dyn AgentJobService>,
    pub setup: Arc<dyn JobSetupService>,
    pub process: Arc<dyn JobProcessManager>,
    pub heartbeat: Arc<dyn HeartbeatService>,
}

impl Collaborators {
    /// One action per [`State`].
    pub fn actions(&self) -> Vec<Arc<dyn StateAction>> {
        vec![
            Arc::new(InitializeAgentAction),
            Arc::new(HandshakeAction {
                jobs: Arc::clone(&self.jobs),
            }),
            Arc::new(ResolveJobSpecificationAction {
                jobs: Arc::clone(&self.jobs),
            }),
            Arc::new(ClaimJobAction {
                jobs: Arc::clone(&self.jobs),
                heartbeat: Arc::clone(&self.heartbeat),
            }),
            Arc::new(SetupJobAction {
                setup: Arc::clone(&self.setup),
            }),
            Arc::new(LaunchJobAction {
                process: Arc::clone(&self.process),
            }),
            Arc::new(MonitorJobAction {
                process: Arc::clone(&self.process),
            }),
            Arc::new(CleanupJobAction {
                setup: Arc::clone(&self.setup),
                process: Arc::clone(&self.process),
            }),
            Arc::new(ShutdownAction {
                heartbeat: Arc::clone(&self.heartbeat),
            }),
            Arc::new(HandleErrorAction),
        ]
    }
}

fn require_job_id(ctx: &ExecutionContext) -> Result<&str, AgentError> {
    ctx.job_id()
        .ok_or_else(|| AgentError::InvalidState("job id is not known yet".into()))
}

fn require_specification(ctx: &ExecutionContext) -> Result<&JobSpecification, AgentError> {
    ctx.job_specification()
        .ok_or_else(|| AgentError::InvalidState("job specification is not resolved".into()))
}

fn require_job_directory(ctx: &ExecutionContext) -> Result<&Path, AgentError> {
    ctx.job_directory()
        .ok_or_else(|| AgentError::InvalidState("job directory was not created".into()))
}

fn check_abort(ctx: &ExecutionContext) -> Result<(), AgentError> {
    if ctx.is_abort_requested() {
        Err(AgentError::Aborted)
    } else {
        Ok(())
    }
}

pub struct InitializeAgentAction;

#[async_trait]
impl StateAction for InitializeAgentAction {
    fn state(&self) -> State {
        State::InitializeAgent
    }

    fn name(&self) -> &'static str {
        "InitializeAgentAction"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), AgentError> {
        let root = ctx.job_directory_root();
        tokio::fs::create_dir_all(root).await.map_err(|e| {
            AgentError::io(
                format!("failed to create job directory root {}", root.display()),
                e,
            )
        })?;
        info!(agent_id = ctx.agent_id(), root = %root.display(), "Agent initialized");
        Ok(())
    }
}

pub struct HandshakeAction {
    jobs: Arc<dyn AgentJobService>,
}

#[async_trait]
impl StateAction for HandshakeAction {
    fn state(&self) -> State {
        State::Handshake
    }

    fn name(&self) -> &'static str {
        "HandshakeAction"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), AgentError> {
        let metadata = AgentMetadata::current(ctx.agent_id());
        self.jobs.handshake(&metadata).await?;
        Ok(())
    }
}

pub struct ResolveJobSpecificationAction {
    jobs: Arc<dyn AgentJobService>,
}

#[async_trait]
impl StateAction for ResolveJobSpecificationAction {
    fn state(&self) -> State {
        State::ResolveJobSpecification
    }

    fn name(&self) -> &'static str {
        "ResolveJobSpecificationAction"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), AgentError> {
        let spec = match ctx.job_source() {
            JobSource::Preresolved(job_id) => {
                if ctx.job_id().is_none() {
                    ctx.set_job_id(job_id.as_str())?;
                }
                self.jobs.get_job_specification(job_id).await?
            }
            JobSource::Request(request) => {
                // A retry after a failed resolution reuses the reserved id.
                let job_id = match ctx.job_id() {
                    Some(id) => id.to_string(),
                    None => {
                        let id = self.jobs.reserve_job_id(request).await?;
                        ctx.set_job_id(id.as_str())?;
                        id
                    }
                };
                self.jobs.resolve_job_specification(&job_id).await?
            }
        };

        let job_id = require_job_id(ctx)?;
        if spec.job_id != job_id {
            return Err(AgentError::InvalidState(format!(
                "server resolved job {} instead of {job_id}",
                spec.job_id
            )));
        }
        debug!(job_id, command_line = ?spec.command_line(), "Job specification resolved");
        ctx.set_job_specification(spec)
    }
}

pub struct ClaimJobAction {
    jobs: Arc<dyn AgentJobService>,
    heartbeat: Arc<dyn HeartbeatService>,
}

#[async_trait]
impl StateAction for ClaimJobAction {
    fn state(&self) -> State {
        State::ClaimJob
    }

    fn name(&self) -> &'static str {
        "ClaimJobAction"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), AgentError> {
        let job_id = require_job_id(ctx)?;
        let metadata = AgentMetadata::current(ctx.agent_id());
        self.jobs.claim_job(job_id, &metadata).await?;
        ctx.set_claimed_job_id(job_id)?;
        self.heartbeat.start(job_id);
        info!(job_id, "Job claimed");
        Ok(())
    }
}

pub struct SetupJobAction {
    setup: Arc<dyn JobSetupService>,
}

#[async_trait]
impl StateAction for SetupJobAction {
    fn state(&self) -> State {
        State::SetupJob
    }

    fn name(&self) -> &'static str {
        "SetupJobAction"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), AgentError> {
        let spec = require_specification(ctx)?;

        let job_dir = self
            .setup
            .create_job_directory(ctx.job_directory_root(), spec)
            .await?;
        ctx.set_job_directory(job_dir.clone())?;
        check_abort(ctx)?;

        let files = self.setup.download_job_resources(spec, &job_dir).await?;
        debug!(count = files.len(), "Job dependencies downloaded");
        check_abort(ctx)?;

        let script = self.setup.create_job_script(spec, &job_dir).await?;
        ctx.set_job_script(script)
    }
}

pub struct LaunchJobAction {
    process: Arc<dyn JobProcessManager>,
}

#[async_trait]
impl StateAction for LaunchJobAction {
    fn state(&self) -> State {
        State::LaunchJob
    }

    fn name(&self) -> &'static str {
        "LaunchJobAction"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), AgentError> {
        let spec = require_specification(ctx)?;
        let job_dir = require_job_directory(ctx)?;
        let script = ctx
            .job_script()
            .ok_or_else(|| AgentError::InvalidState("job script was not created".into()))?;

        let env = BTreeMap::from([
            ("AGENT_JOB_ID".to_string(), spec.job_id.clone()),
            (
                "AGENT_JOB_DIRECTORY".to_string(),
                job_dir.display().to_string(),
            ),
        ]);
        let command_line = vec!["bash".to_string(), script.display().to_string()];
        let timeout = spec.timeout_secs.map(Duration::from_secs);

        self.process
            .launch_process(job_dir, &env, &command_line, spec.interactive, timeout)
            .await?;
        ctx.mark_job_launched();
        Ok(())
    }
}

pub struct MonitorJobAction {
    process: Arc<dyn JobProcessManager>,
}

#[async_trait]
impl StateAction for MonitorJobAction {
    fn state(&self) -> State {
        State::MonitorJob
    }

    fn name(&self) -> &'static str {
        "MonitorJobAction"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), AgentError> {
        let result = self.process.wait_for().await?;
        let status = result.status;
        ctx.set_process_result(result)?;
        ctx.set_final_job_status(status);
        Ok(())
    }
}

pub struct CleanupJobAction {
    setup: Arc<dyn JobSetupService>,
    process: Arc<dyn JobProcessManager>,
}

impl CleanupJobAction {
    async fn archive(&self, ctx: &ExecutionContext, job_dir: &Path) -> Result<(), AgentError> {
        let location = ctx
            .job_specification()
            .and_then(|spec| spec.archive_location.as_deref());
        match location {
            Some(location) => {
                self.setup
                    .archive_job_directory(job_dir, Path::new(location))
                    .await?;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StateAction for CleanupJobAction {
    fn state(&self) -> State {
        State::CleanupJob
    }

    fn name(&self) -> &'static str {
        "CleanupJobAction"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), AgentError> {
        // Launched but never waited on: monitoring was skipped or failed.
        if ctx.is_job_launched() && ctx.process_result().is_none() {
            warn!("Job process still running at cleanup, killing it");
            self.process
                .kill(ctx.kill_source().unwrap_or(KillSource::ApiKillRequest));
            let result = self.process.wait_for().await?;
            ctx.set_process_result(result)?;
        }

        let Some(job_dir) = ctx.job_directory() else {
            debug!("No job directory to clean");
            return Ok(());
        };

        let archived = self.archive(ctx, job_dir).await;
        if let Err(e) = &archived {
            warn!(error = %e, "Failed to archive job directory");
        }
        self.setup
            .cleanup_job_directory(job_dir, ctx.cleanup_strategy())
            .await?;
        archived
    }
}

pub struct ShutdownAction {
    heartbeat: Arc<dyn HeartbeatService>,
}

#[async_trait]
impl StateAction for ShutdownAction {
    fn state(&self) -> State {
        State::Shutdown
    }

    fn name(&self) -> &'static str {
        "ShutdownAction"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), AgentError> {
        let connected = self.heartbeat.is_connected();
        self.heartbeat.stop();
        info!(
            job_id = ctx.job_id().unwrap_or("-"),
            final_status = ?ctx.final_job_status(),
            heartbeat_connected = connected,
            "Agent shutting down"
        );
        Ok(())
    }
}

pub struct HandleErrorAction;

#[async_trait]
impl StateAction for HandleErrorAction {
    fn state(&self) -> State {
        State::HandleError
    }

    fn name(&self) -> &'static str {
        "HandleErrorAction"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<(), AgentError> {
        for failure in ctx.failures() {
            warn!(
                state = %failure.state,
                kind = %failure.kind,
                "{}", failure.message
            );
        }
        if !ctx.set_final_job_status(JobStatus::Failed) {
            debug!(status = ?ctx.final_job_status(), "Final job status already set");
        }
        Ok(())
    }
}
