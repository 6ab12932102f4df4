use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::model::{AgentEvent, EventError, JobStatusUpdate, StateActionExecution, StateChange};
use super::EventSink;
use crate::error::AgentError;
use crate::state_machine::{JobStatus, State};

/// Turns lifecycle occurrences into [`AgentEvent`]s and queues them for
/// delivery.
///
/// Emitting never blocks: events go onto an in-process queue drained by a
/// background task ([`EventDelivery`]), so server latency does not slow the
/// state machine. Delivery preserves emission order.
pub struct AgentEventsService {
    agent_id: String,
    queue: mpsc::UnboundedSender<AgentEvent>,
}

impl AgentEventsService {
    /// Create the service and spawn its delivery task. Must be called from
    /// within a tokio runtime.
    pub fn start(
        agent_id: &str,
        sink: Arc<dyn EventSink>,
        retry_backoff: Duration,
    ) -> (Self, EventDelivery) {
        let (queue, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(deliver(rx, sink, retry_backoff));
        (
            Self {
                agent_id: agent_id.to_string(),
                queue,
            },
            EventDelivery { handle },
        )
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn emit_job_status_update(&self, job_id: &str, status: JobStatus) {
        self.enqueue(JobStatusUpdate::new(&self.agent_id, job_id, status, None));
    }

    pub fn emit_state_change(&self, from: Option<State>, to: State) {
        self.enqueue(StateChange::new(&self.agent_id, from, to, None));
    }

    pub fn emit_state_action_execution(
        &self,
        state: State,
        action: &str,
        error: Option<&AgentError>,
    ) {
        let event = match error {
            Some(err) => {
                StateActionExecution::with_exception(&self.agent_id, state, action, err, None)
            }
            None => StateActionExecution::new(&self.agent_id, state, action, None),
        };
        self.enqueue(event);
    }

    fn enqueue<E: Into<AgentEvent>>(&self, event: Result<E, EventError>) {
        let event = match event {
            Ok(event) => event.into(),
            Err(e) => {
                warn!(error = %e, "Dropping invalid agent event");
                return;
            }
        };
        if self.queue.send(event).is_err() {
            warn!("Event delivery has stopped, dropping agent event");
        }
    }
}

/// Handle on the background task delivering queued events.
pub struct EventDelivery {
    handle: JoinHandle<usize>,
}

impl EventDelivery {
    /// Wait up to `timeout` for the queue to drain. Only completes once every
    /// [`AgentEventsService`] has been dropped. Returns whether the queue was
    /// fully drained.
    pub async fn drain(mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(Ok(delivered)) => {
                info!(delivered, "Event queue drained");
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Event delivery task failed");
                false
            }
            Err(_) => {
                warn!(?timeout, "Event queue not drained within the allocated time");
                self.handle.abort();
                false
            }
        }
    }
}

async fn deliver(
    mut rx: mpsc::UnboundedReceiver<AgentEvent>,
    sink: Arc<dyn EventSink>,
    retry_backoff: Duration,
) -> usize {
    let mut delivered = 0;
    while let Some(event) = rx.recv().await {
        loop {
            match sink.publish(&event).await {
                Ok(()) => {
                    delivered += 1;
                    debug!(queued = rx.len(), "Event acknowledged");
                    break;
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "Failed to deliver event to server, will retry later");
                    tokio::time::sleep(retry_backoff).await;
                }
                Err(e) => {
                    warn!(error = %e, "Server refused event, dropping it");
                    break;
                }
            }
        }
    }
    delivered
}
