use std::fmt;

use serde::{Deserialize, Serialize};

/// The states of the job execution state machine.
///
/// A job flows through: INITIALIZE_AGENT → HANDSHAKE → RESOLVE_JOB_SPECIFICATION →
/// CLAIM_JOB → SETUP_JOB → LAUNCH_JOB → MONITOR_JOB → CLEANUP_JOB → SHUTDOWN,
/// with HANDLE_ERROR as a sink reachable from any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    InitializeAgent,
    Handshake,
    ResolveJobSpecification,
    ClaimJob,
    SetupJob,
    LaunchJob,
    MonitorJob,
    CleanupJob,
    Shutdown,
    HandleError,
}

/// The linear order of execution. `HandleError` is not part of it.
pub const EXECUTION_ORDER: [State; 9] = [
    State::InitializeAgent,
    State::Handshake,
    State::ResolveJobSpecification,
    State::ClaimJob,
    State::SetupJob,
    State::LaunchJob,
    State::MonitorJob,
    State::CleanupJob,
    State::Shutdown,
];

/// States the machine resumes at once an error was handled, in order.
const RECOVERY_ORDER: [State; 2] = [State::CleanupJob, State::Shutdown];

impl State {
    pub const ALL: [State; 10] = [
        State::InitializeAgent,
        State::Handshake,
        State::ResolveJobSpecification,
        State::ClaimJob,
        State::SetupJob,
        State::LaunchJob,
        State::MonitorJob,
        State::CleanupJob,
        State::Shutdown,
        State::HandleError,
    ];

    /// Whether transient failures of this state's action are retried.
    /// Only the states talking to the server qualify.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            State::Handshake | State::ResolveJobSpecification | State::ClaimJob
        )
    }

    /// Whether the state is bypassed once an abort was requested.
    pub fn is_skippable_on_abort(self) -> bool {
        !matches!(
            self,
            State::CleanupJob | State::Shutdown | State::HandleError
        )
    }

    pub fn is_terminal(self) -> bool {
        self == State::Shutdown
    }

    /// The state following this one in [`EXECUTION_ORDER`].
    pub fn next_in_order(self) -> Option<State> {
        let idx = EXECUTION_ORDER.iter().position(|s| *s == self)?;
        EXECUTION_ORDER.get(idx + 1).copied()
    }

    /// Fine-grained progress steps performed while in this state.
    pub fn progress_steps(self) -> &'static [ProgressStep] {
        match self {
            State::InitializeAgent => &[ProgressStep::InitializeAgent],
            State::Handshake => &[ProgressStep::Handshake],
            State::ResolveJobSpecification => &[
                ProgressStep::ReserveJobId,
                ProgressStep::ObtainJobSpecification,
            ],
            State::ClaimJob => &[ProgressStep::ClaimJob],
            State::SetupJob => &[
                ProgressStep::CreateJobDirectory,
                ProgressStep::DownloadDependencies,
            ],
            State::LaunchJob => &[ProgressStep::LaunchJob],
            State::MonitorJob => &[ProgressStep::WaitJobCompletion],
            State::CleanupJob => &[ProgressStep::Archive, ProgressStep::Clean],
            State::Shutdown => &[ProgressStep::Shutdown],
            State::HandleError => &[],
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::InitializeAgent => "INITIALIZE_AGENT",
            State::Handshake => "HANDSHAKE",
            State::ResolveJobSpecification => "RESOLVE_JOB_SPECIFICATION",
            State::ClaimJob => "CLAIM_JOB",
            State::SetupJob => "SETUP_JOB",
            State::LaunchJob => "LAUNCH_JOB",
            State::MonitorJob => "MONITOR_JOB",
            State::CleanupJob => "CLEANUP_JOB",
            State::Shutdown => "SHUTDOWN",
            State::HandleError => "HANDLE_ERROR",
        };
        f.write_str(name)
    }
}

/// Operator-visible steps, finer than [`State`]. Used for console progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressStep {
    InitializeAgent,
    Handshake,
    ReserveJobId,
    ObtainJobSpecification,
    ClaimJob,
    CreateJobDirectory,
    DownloadDependencies,
    LaunchJob,
    WaitJobCompletion,
    Archive,
    Clean,
    Shutdown,
}

impl ProgressStep {
    pub const ALL: [ProgressStep; 12] = [
        ProgressStep::InitializeAgent,
        ProgressStep::Handshake,
        ProgressStep::ReserveJobId,
        ProgressStep::ObtainJobSpecification,
        ProgressStep::ClaimJob,
        ProgressStep::CreateJobDirectory,
        ProgressStep::DownloadDependencies,
        ProgressStep::LaunchJob,
        ProgressStep::WaitJobCompletion,
        ProgressStep::Archive,
        ProgressStep::Clean,
        ProgressStep::Shutdown,
    ];
}

/// Triggers the engine reacts to once a state's action has been attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    ActionSucceeded,
    ActionFailedRetryable,
    ActionFailedFatal,
    AbortRequested,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::ActionSucceeded => write!(f, "ACTION_SUCCEEDED"),
            Event::ActionFailedRetryable => write!(f, "ACTION_FAILED_RETRYABLE"),
            Event::ActionFailedFatal => write!(f, "ACTION_FAILED_FATAL"),
            Event::AbortRequested => write!(f, "ABORT_REQUESTED"),
        }
    }
}

/// The result of evaluating a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move on to the given state.
    Advance(State),
    /// Attempt the current state's action again.
    Retry(State),
    /// The error handler failed (or an error arrived after it already ran):
    /// set the abort flag and jump to `resume`, or stop when nothing is left.
    Abort { resume: Option<State> },
    /// The machine is done.
    Stop,
}

/// Pure transition function of the job execution state machine.
pub struct StateMachine;

impl StateMachine {
    /// Compute the next transition from `current` given the triggering event and
    /// the states entered so far (including `current`).
    ///
    /// - Success and abort-skips advance in [`EXECUTION_ORDER`]; after
    ///   `HandleError` the machine resumes at the first of `CleanupJob`,
    ///   `Shutdown` not yet entered.
    /// - A fatal failure routes to `HandleError` unless it was already entered,
    ///   in which case the execution is aborted.
    pub fn next(current: State, event: Event, history: &[State]) -> Transition {
        match event {
            Event::ActionSucceeded | Event::AbortRequested => match Self::successor(current, history) {
                Some(next) => Transition::Advance(next),
                None => Transition::Stop,
            },
            Event::ActionFailedRetryable => Transition::Retry(current),
            Event::ActionFailedFatal => {
                if current != State::HandleError && !history.contains(&State::HandleError) {
                    Transition::Advance(State::HandleError)
                } else {
                    Transition::Abort {
                        resume: Self::recovery_target(history),
                    }
                }
            }
        }
    }

    fn successor(current: State, history: &[State]) -> Option<State> {
        if current == State::HandleError {
            return Self::recovery_target(history);
        }
        if current.is_terminal() {
            return None;
        }
        current.next_in_order()
    }

    fn recovery_target(history: &[State]) -> Option<State> {
        RECOVERY_ORDER
            .iter()
            .copied()
            .find(|state| !history.contains(state))
    }
}
