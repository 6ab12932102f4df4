mod actions;
mod context;
mod engine;
mod job;
mod retry;
mod state;

pub use actions::{Collaborators, StateAction};
pub use context::{ExecutionContext, JobSource, TransitionFailure};
pub use engine::{EngineBuilder, JobExecutionEngine};
pub use job::{
    CleanupStrategy, JOB_EXCEEDED_TIMEOUT, JOB_FAILED, JOB_FINISHED_SUCCESSFULLY,
    JOB_KILLED_BY_USER, JobProcessResult, JobRequest, JobSpecification, JobStatus, KillSource,
};
pub use retry::{Disposition, RetryConfig, RetryPolicy};
pub use state::{EXECUTION_ORDER, Event, ProgressStep, State, StateMachine, Transition};
