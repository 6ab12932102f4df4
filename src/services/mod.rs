//! Collaborators the state actions call into, behind traits so the engine can
//! run against fakes in tests.

mod heartbeat;
mod kill;
mod process;
mod setup;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

pub use heartbeat::HttpHeartbeat;
pub use kill::KillService;
pub use process::LocalProcessManager;
pub use setup::LocalJobSetup;

use crate::error::AgentError;
use crate::server::{AgentMetadata, ServerError};
use crate::state_machine::{CleanupStrategy, JobProcessResult, JobRequest, JobSpecification, KillSource};

/// Server-side job bookkeeping.
#[async_trait]
pub trait AgentJobService: Send + Sync {
    async fn handshake(&self, metadata: &AgentMetadata) -> Result<(), ServerError>;

    async fn reserve_job_id(&self, request: &JobRequest) -> Result<String, ServerError>;

    async fn resolve_job_specification(&self, job_id: &str)
    -> Result<JobSpecification, ServerError>;

    async fn get_job_specification(&self, job_id: &str) -> Result<JobSpecification, ServerError>;

    async fn resolve_job_specification_dry_run(
        &self,
        request: &JobRequest,
    ) -> Result<JobSpecification, ServerError>;

    /// Take ownership of the job. Fails with [`ServerError::Rejected`] when
    /// another agent already claimed it.
    async fn claim_job(&self, job_id: &str, metadata: &AgentMetadata) -> Result<(), ServerError>;
}

/// Local preparation and teardown of the job directory.
#[async_trait]
pub trait JobSetupService: Send + Sync {
    /// Create `<root>/<job_id>/` and return its path.
    async fn create_job_directory(
        &self,
        root: &Path,
        spec: &JobSpecification,
    ) -> Result<PathBuf, AgentError>;

    async fn download_job_resources(
        &self,
        spec: &JobSpecification,
        job_dir: &Path,
    ) -> Result<Vec<PathBuf>, AgentError>;

    async fn create_job_script(
        &self,
        spec: &JobSpecification,
        job_dir: &Path,
    ) -> Result<PathBuf, AgentError>;

    /// Copy the job directory into `<location>/<job dir name>/`.
    async fn archive_job_directory(
        &self,
        job_dir: &Path,
        location: &Path,
    ) -> Result<PathBuf, AgentError>;

    async fn cleanup_job_directory(
        &self,
        job_dir: &Path,
        strategy: CleanupStrategy,
    ) -> Result<(), AgentError>;
}

/// Launches and supervises the single job process of this agent.
#[async_trait]
pub trait JobProcessManager: Send + Sync {
    /// Spawn the job. Fails with [`AgentError::Aborted`] when a kill was
    /// already requested.
    async fn launch_process(
        &self,
        job_dir: &Path,
        env: &BTreeMap<String, String>,
        command_line: &[String],
        interactive: bool,
        timeout: Option<Duration>,
    ) -> Result<(), AgentError>;

    /// Request termination. Callable from any thread, any number of times.
    fn kill(&self, source: KillSource);

    /// Wait for the launched process to exit.
    async fn wait_for(&self) -> Result<JobProcessResult, AgentError>;
}

pub trait HeartbeatService: Send + Sync {
    fn start(&self, job_id: &str);
    fn stop(&self);
    fn is_connected(&self) -> bool;
}
