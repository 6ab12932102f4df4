mod model;
mod service;

use async_trait::async_trait;

pub use model::{AgentEvent, EventError, JobStatusUpdate, StateActionExecution, StateChange};
pub use service::{AgentEventsService, EventDelivery};

use crate::server::ServerError;

/// Destination of published agent events (the server, in production).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &AgentEvent) -> Result<(), ServerError>;
}
