//! The telemetry records an agent publishes to the server.

use std::error::Error as StdError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{error_kind, exception_trace};
use crate::state_machine::{JobStatus, State};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("agent id must not be blank")]
    BlankAgentId,
    #[error("job id must not be blank")]
    BlankJobId,
    #[error("action name must not be blank")]
    BlankAction,
}

fn require(value: &str, err: EventError) -> Result<String, EventError> {
    if value.trim().is_empty() {
        Err(err)
    } else {
        Ok(value.to_string())
    }
}

/// The job moved to a new server-visible status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusUpdate {
    pub agent_id: String,
    pub job_id: String,
    pub job_status: JobStatus,
    pub timestamp: DateTime<Utc>,
}

impl JobStatusUpdate {
    pub fn new(
        agent_id: &str,
        job_id: &str,
        job_status: JobStatus,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            agent_id: require(agent_id, EventError::BlankAgentId)?,
            job_id: require(job_id, EventError::BlankJobId)?,
            job_status,
            timestamp: timestamp.unwrap_or_else(Utc::now),
        })
    }
}

/// The state machine entered `to_state`. `from_state` is `None` only for the
/// first transition of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub agent_id: String,
    pub from_state: Option<State>,
    pub to_state: State,
    pub timestamp: DateTime<Utc>,
}

impl StateChange {
    pub fn new(
        agent_id: &str,
        from_state: Option<State>,
        to_state: State,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            agent_id: require(agent_id, EventError::BlankAgentId)?,
            from_state,
            to_state,
            timestamp: timestamp.unwrap_or_else(Utc::now),
        })
    }
}

/// Outcome of one state action attempt.
///
/// When `action_exception` is true, `exception_trace` holds one
/// `"<kind> : <message>"` entry per link of the error's cause chain and is
/// never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateActionExecution {
    pub agent_id: String,
    pub state: State,
    pub action: String,
    pub action_exception: bool,
    pub exception_class: Option<String>,
    pub exception_message: Option<String>,
    #[serde(default)]
    pub exception_trace: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl StateActionExecution {
    pub fn new(
        agent_id: &str,
        state: State,
        action: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            agent_id: require(agent_id, EventError::BlankAgentId)?,
            state,
            action: require(action, EventError::BlankAction)?,
            action_exception: false,
            exception_class: None,
            exception_message: None,
            exception_trace: Vec::new(),
            timestamp: timestamp.unwrap_or_else(Utc::now),
        })
    }

    pub fn with_exception(
        agent_id: &str,
        state: State,
        action: &str,
        error: &(dyn StdError + 'static),
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Self, EventError> {
        let mut event = Self::new(agent_id, state, action, timestamp)?;
        event.action_exception = true;
        event.exception_class = Some(error_kind(error));
        event.exception_message = Some(error.to_string());
        event.exception_trace = exception_trace(error);
        Ok(event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    JobStatusUpdate(JobStatusUpdate),
    StateChange(StateChange),
    StateActionExecution(StateActionExecution),
}

impl AgentEvent {
    pub fn agent_id(&self) -> &str {
        match self {
            AgentEvent::JobStatusUpdate(e) => &e.agent_id,
            AgentEvent::StateChange(e) => &e.agent_id,
            AgentEvent::StateActionExecution(e) => &e.agent_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AgentEvent::JobStatusUpdate(e) => e.timestamp,
            AgentEvent::StateChange(e) => e.timestamp,
            AgentEvent::StateActionExecution(e) => e.timestamp,
        }
    }
}

impl From<JobStatusUpdate> for AgentEvent {
    fn from(event: JobStatusUpdate) -> Self {
        AgentEvent::JobStatusUpdate(event)
    }
}

impl From<StateChange> for AgentEvent {
    fn from(event: StateChange) -> Self {
        AgentEvent::StateChange(event)
    }
}

impl From<StateActionExecution> for AgentEvent {
    fn from(event: StateActionExecution) -> Self {
        AgentEvent::StateActionExecution(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use crate::server::ServerError;

    #[test]
    fn blank_ids_are_rejected() {
        assert_eq!(
            JobStatusUpdate::new(" ", "job", JobStatus::Init, None),
            Err(EventError::BlankAgentId)
        );
        assert_eq!(
            JobStatusUpdate::new("agent", "", JobStatus::Init, None),
            Err(EventError::BlankJobId)
        );
        assert_eq!(
            StateChange::new("", None, State::Handshake, None),
            Err(EventError::BlankAgentId)
        );
        assert_eq!(
            StateActionExecution::new("agent", State::Handshake, "", None),
            Err(EventError::BlankAction)
        );
    }

    #[test]
    fn timestamp_defaults_to_now() {
        let before = Utc::now();
        let event = StateChange::new("agent", None, State::InitializeAgent, None).unwrap();
        assert!(event.timestamp >= before);
        assert!(event.timestamp <= Utc::now());
    }

    #[test]
    fn explicit_timestamp_is_kept() {
        let ts = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = JobStatusUpdate::new("agent", "job", JobStatus::Running, Some(ts)).unwrap();
        assert_eq!(event.timestamp, ts);
    }

    #[test]
    fn successful_execution_has_no_exception_fields() {
        let event = StateActionExecution::new("agent", State::ClaimJob, "ClaimJob", None).unwrap();
        assert!(!event.action_exception);
        assert!(event.exception_class.is_none());
        assert!(event.exception_message.is_none());
        assert!(event.exception_trace.is_empty());
    }

    #[test]
    fn failed_execution_trace_matches_cause_depth() {
        let err = AgentError::Download {
            uri: "https://deps/lib.jar".into(),
            source: ServerError::ApiError {
                status: 404,
                message: "missing".into(),
            },
        };
        let event =
            StateActionExecution::with_exception("agent", State::SetupJob, "SetupJob", &err, None)
                .unwrap();
        assert!(event.action_exception);
        assert_eq!(event.exception_class.as_deref(), Some("AgentError::Download"));
        assert_eq!(
            event.exception_message.as_deref(),
            Some("failed to download https://deps/lib.jar")
        );
        assert_eq!(event.exception_trace.len(), 2);
        assert_eq!(
            event.exception_trace[1],
            "ServerError::ApiError : API error (status 404): missing"
        );
    }

    #[test]
    fn wire_shape_is_tagged_camel_case() {
        let event: AgentEvent = StateChange::new("agent", None, State::InitializeAgent, None)
            .unwrap()
            .into();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "state_change");
        assert_eq!(json["agentId"], "agent");
        assert!(json["fromState"].is_null());
        assert_eq!(json["toState"], "INITIALIZE_AGENT");
    }
}
