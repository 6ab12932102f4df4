use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Job statuses persisted by the server.
///
/// `Init` and `Running` are transient; exactly one of the final statuses is
/// reported before the agent shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Init,
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl JobStatus {
    pub fn is_final(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Killed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Init => write!(f, "INIT"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Succeeded => write!(f, "SUCCEEDED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Killed => write!(f, "KILLED"),
        }
    }
}

/// Origin of a kill request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KillSource {
    /// The agent process received SIGINT/SIGTERM.
    SystemSignal,
    /// The server forwarded a kill request issued through its API.
    ApiKillRequest,
    /// The job ran past its configured timeout.
    Timeout,
}

impl fmt::Display for KillSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KillSource::SystemSignal => write!(f, "SYSTEM_SIGNAL"),
            KillSource::ApiKillRequest => write!(f, "API_KILL_REQUEST"),
            KillSource::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

pub const JOB_FINISHED_SUCCESSFULLY: &str = "Job finished successfully";
pub const JOB_FAILED: &str = "Job failed";
pub const JOB_KILLED_BY_USER: &str = "Job was killed by user";
pub const JOB_EXCEEDED_TIMEOUT: &str = "Job exceeded timeout";

/// Outcome of waiting for the job process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProcessResult {
    pub status: JobStatus,
    pub status_message: String,
    /// `None` when the process never started.
    pub exit_code: Option<i32>,
}

impl JobProcessResult {
    /// Derive the result from the exit code and the kill source, if any.
    /// A kill wins over the exit code.
    pub fn from_exit(exit_code: Option<i32>, killed_by: Option<KillSource>) -> Self {
        let (status, message) = match (killed_by, exit_code) {
            (Some(KillSource::Timeout), _) => (JobStatus::Killed, JOB_EXCEEDED_TIMEOUT),
            (Some(_), _) => (JobStatus::Killed, JOB_KILLED_BY_USER),
            (None, Some(0)) => (JobStatus::Succeeded, JOB_FINISHED_SUCCESSFULLY),
            (None, _) => (JobStatus::Failed, JOB_FAILED),
        };
        Self {
            status,
            status_message: message.to_string(),
            exit_code,
        }
    }
}

/// What to remove from the job directory once the job is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStrategy {
    NoCleanup,
    #[default]
    Dependencies,
    Full,
}

impl fmt::Display for CleanupStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupStrategy::NoCleanup => write!(f, "NO_CLEANUP"),
            CleanupStrategy::Dependencies => write!(f, "DEPENDENCIES_CLEANUP"),
            CleanupStrategy::Full => write!(f, "FULL_CLEANUP"),
        }
    }
}

/// A job request built from command-line arguments, resolved by the server
/// into a [`JobSpecification`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_id: Option<String>,
    pub name: String,
    pub user: String,
    #[serde(default)]
    pub command_tags: Vec<String>,
    #[serde(default)]
    pub cluster_tags: Vec<String>,
    #[serde(default)]
    pub job_args: Vec<String>,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Everything the agent needs to run a job, as resolved by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpecification {
    pub job_id: String,
    #[serde(default)]
    pub job_name: String,
    pub executable_args: Vec<String>,
    #[serde(default)]
    pub job_args: Vec<String>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    /// URIs of files to place under the job's `dependencies/` directory.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Local directory the job directory is copied into before cleanup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_location: Option<String>,
}

impl JobSpecification {
    /// Executable arguments followed by job arguments.
    pub fn command_line(&self) -> Vec<String> {
        self.executable_args
            .iter()
            .chain(self.job_args.iter())
            .cloned()
            .collect()
    }
}
