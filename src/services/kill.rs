use std::sync::Arc;

use tracing::{debug, info};

use super::JobProcessManager;
use crate::state_machine::{ExecutionContext, KillSource};

/// Entry point for kill requests, from signal handlers or the heartbeat.
///
/// Flags the abort on the execution context first, so the engine skips
/// every remaining skippable state, then forwards the request to the
/// process manager. A kill before launch keeps the process from starting.
pub struct KillService {
    context: Arc<ExecutionContext>,
    process: Arc<dyn JobProcessManager>,
}

impl KillService {
    pub fn new(context: Arc<ExecutionContext>, process: Arc<dyn JobProcessManager>) -> Self {
        Self { context, process }
    }

    pub fn kill(&self, source: KillSource) {
        if self.context.request_kill(source) {
            info!(%source, "Kill requested, aborting job execution");
        } else {
            debug!(%source, "Kill already requested");
        }
        self.process.kill(source);
    }
}
