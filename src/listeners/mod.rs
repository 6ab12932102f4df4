//! Observers of the job execution state machine.
//!
//! Every callback has a no-op default, so a listener implements only what it
//! cares about. The engine notifies listeners synchronously, in registration
//! order, through a [`ListenerSet`].

mod console;
mod logging;
mod publisher;
mod span;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

pub use console::{ConsoleListener, ConsoleSink, progress_message};
pub use logging::LoggingListener;
pub use publisher::EventPublishingListener;
pub use span::SpanListener;

use crate::error::AgentError;
use crate::state_machine::State;

#[allow(unused_variables)]
pub trait JobExecutionListener: Send + Sync {
    fn state_entered(&self, state: State) {}

    fn state_exited(&self, state: State) {}

    fn before_state_action_attempt(&self, state: State, action: &str) {}

    /// `error` is `None` when the attempt succeeded.
    fn after_state_action_attempt(&self, state: State, action: &str, error: Option<&AgentError>) {}

    fn state_machine_started(&self) {}

    fn state_machine_stopped(&self) {}

    fn state_skipped(&self, state: State) {}

    fn fatal_error(&self, state: State, error: &AgentError) {}

    fn execution_aborted(&self, state: State, error: &AgentError) {}

    fn delayed_state_action_retry(&self, state: State, delay: Duration) {}
}

/// Ordered listener collection.
///
/// A panicking listener is logged and skipped; the listeners after it are
/// still notified and the engine never sees the panic.
#[derive(Default, Clone)]
pub struct ListenerSet {
    listeners: Vec<Arc<dyn JobExecutionListener>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, listener: Arc<dyn JobExecutionListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn notify(&self, callback: &str, f: impl Fn(&dyn JobExecutionListener)) {
        for (index, listener) in self.listeners.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                warn!(callback, index, "Listener panicked");
            }
        }
    }
}

impl JobExecutionListener for ListenerSet {
    fn state_entered(&self, state: State) {
        self.notify("state_entered", |l| l.state_entered(state));
    }

    fn state_exited(&self, state: State) {
        self.notify("state_exited", |l| l.state_exited(state));
    }

    fn before_state_action_attempt(&self, state: State, action: &str) {
        self.notify("before_state_action_attempt", |l| {
            l.before_state_action_attempt(state, action)
        });
    }

    fn after_state_action_attempt(&self, state: State, action: &str, error: Option<&AgentError>) {
        self.notify("after_state_action_attempt", |l| {
            l.after_state_action_attempt(state, action, error)
        });
    }

    fn state_machine_started(&self) {
        self.notify("state_machine_started", |l| l.state_machine_started());
    }

    fn state_machine_stopped(&self) {
        self.notify("state_machine_stopped", |l| l.state_machine_stopped());
    }

    fn state_skipped(&self, state: State) {
        self.notify("state_skipped", |l| l.state_skipped(state));
    }

    fn fatal_error(&self, state: State, error: &AgentError) {
        self.notify("fatal_error", |l| l.fatal_error(state, error));
    }

    fn execution_aborted(&self, state: State, error: &AgentError) {
        self.notify("execution_aborted", |l| l.execution_aborted(state, error));
    }

    fn delayed_state_action_retry(&self, state: State, delay: Duration) {
        self.notify("delayed_state_action_retry", |l| {
            l.delayed_state_action_retry(state, delay)
        });
    }
}
