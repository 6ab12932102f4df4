use std::collections::BTreeMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::JobProcessManager;
use crate::error::AgentError;
use crate::state_machine::{JobProcessResult, KillSource};

/// Time given to a kill request to be recorded when the process exits on its
/// own with a failure (a Ctrl-C reaches the job and the agent together).
const KILL_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Runs the job as a child process of the agent.
pub struct LocalProcessManager {
    inner: Arc<Inner>,
}

struct Inner {
    grace_period: Duration,
    kill_source: OnceLock<KillSource>,
    kill_token: CancellationToken,
    child: tokio::sync::Mutex<Option<Child>>,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn kill(&self, source: KillSource) {
        if self.kill_source.set(source).is_ok() {
            info!(%source, "Job process kill requested");
        }
        self.kill_token.cancel();
    }

    fn cancel_timeout(&self) {
        if let Ok(mut task) = self.timeout_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }

    /// Interrupt the child, then force-kill it once the grace period is over.
    async fn terminate(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        // A system signal already reached the whole process group.
        if self.kill_source.get() != Some(&KillSource::SystemSignal) {
            interrupt(child);
        }
        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(grace_period = ?self.grace_period, "Job process ignored interrupt, killing it");
                child.kill().await?;
                child.wait().await
            }
        }
    }
}

#[cfg(unix)]
fn interrupt(child: &Child) {
    if let Some(pid) = child.id() {
        debug!(pid, "Sending SIGINT to job process");
        unsafe {
            if libc::kill(pid as i32, libc::SIGINT) != 0 {
                warn!(pid, "Failed to send SIGINT to job process");
            }
        }
    }
}

#[cfg(not(unix))]
fn interrupt(_child: &Child) {}

impl LocalProcessManager {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                grace_period,
                kill_source: OnceLock::new(),
                kill_token: CancellationToken::new(),
                child: tokio::sync::Mutex::new(None),
                timeout_task: Mutex::new(None),
            }),
        }
    }

    fn schedule_timeout(&self, timeout: Duration) {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!(?timeout, "Job exceeded its timeout");
            inner.kill(KillSource::Timeout);
        });
        if let Ok(mut slot) = self.inner.timeout_task.lock() {
            *slot = Some(task);
        }
    }
}

#[async_trait]
impl JobProcessManager for LocalProcessManager {
    async fn launch_process(
        &self,
        job_dir: &Path,
        env: &BTreeMap<String, String>,
        command_line: &[String],
        interactive: bool,
        timeout: Option<Duration>,
    ) -> Result<(), AgentError> {
        let (program, args) = command_line
            .split_first()
            .ok_or_else(|| AgentError::Launch("empty command line".into()))?;

        let mut slot = self.inner.child.lock().await;
        if slot.is_some() {
            return Err(AgentError::InvalidState("job process already launched".into()));
        }
        if self.inner.kill_token.is_cancelled() {
            info!("Kill requested before launch, not starting job process");
            return Err(AgentError::Aborted);
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(job_dir)
            .envs(env)
            .kill_on_drop(true);
        if interactive {
            command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            let stdout = std::fs::File::create(job_dir.join("stdout"))
                .map_err(|e| AgentError::io("failed to create stdout file", e))?;
            let stderr = std::fs::File::create(job_dir.join("stderr"))
                .map_err(|e| AgentError::io("failed to create stderr file", e))?;
            command
                .stdin(Stdio::null())
                .stdout(Stdio::from(stdout))
                .stderr(Stdio::from(stderr));
        }

        let child = command
            .spawn()
            .map_err(|e| AgentError::io(format!("failed to spawn {program}"), e))?;
        info!(pid = child.id(), %program, "Job process launched");
        *slot = Some(child);

        if let Some(timeout) = timeout {
            self.schedule_timeout(timeout);
        }
        Ok(())
    }

    fn kill(&self, source: KillSource) {
        self.inner.kill(source);
    }

    async fn wait_for(&self) -> Result<JobProcessResult, AgentError> {
        let mut slot = self.inner.child.lock().await;
        let child = slot
            .as_mut()
            .ok_or_else(|| AgentError::InvalidState("no job process was launched".into()))?;

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = self.inner.kill_token.cancelled() => None,
        };
        let status = match exited {
            Some(status) => status,
            None => self.inner.terminate(child).await,
        }
        .map_err(|e| AgentError::io("failed to wait for job process", e))?;
        self.inner.cancel_timeout();

        if !status.success() && self.inner.kill_source.get().is_none() {
            tokio::time::sleep(KILL_SETTLE_DELAY).await;
        }
        let result = JobProcessResult::from_exit(status.code(), self.inner.kill_source.get().copied());
        info!(
            exit_code = ?result.exit_code,
            status = %result.status,
            "{}", result.status_message
        );
        Ok(result)
    }
}
