use tracing::{Span, field, info, info_span};

use super::JobExecutionListener;
use crate::state_machine::State;

/// Annotates the `job_execution` span with the current state.
pub struct SpanListener {
    span: Span,
}

impl SpanListener {
    pub fn new(agent_id: &str) -> Self {
        Self {
            span: info_span!("job_execution", agent_id, state = field::Empty),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl JobExecutionListener for SpanListener {
    fn state_entered(&self, state: State) {
        self.span.record("state", field::display(state));
        info!(parent: &self.span, %state, "state entered");
    }

    fn state_exited(&self, state: State) {
        info!(parent: &self.span, %state, "state exited");
    }
}
