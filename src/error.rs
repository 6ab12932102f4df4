use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;

use crate::server::ServerError;

/// Errors raised by state actions and the collaborator services they call.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("server request failed: {0}")]
    Server(#[from] ServerError),

    #[error("{message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to download {uri}")]
    Download {
        uri: String,
        #[source]
        source: ServerError,
    },

    #[error("job launch failed: {0}")]
    Launch(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid execution state: {0}")]
    InvalidState(String),

    #[error("execution aborted")]
    Aborted,
}

impl AgentError {
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        AgentError::Io {
            message: message.into(),
            source,
        }
    }

    /// Short, stable name of the variant, used as the "class" of the error in
    /// telemetry.
    pub fn kind_name(&self) -> &'static str {
        match self {
            AgentError::Server(_) => "Server",
            AgentError::Io { .. } => "Io",
            AgentError::Download { .. } => "Download",
            AgentError::Launch(_) => "Launch",
            AgentError::Config(_) => "Config",
            AgentError::InvalidState(_) => "InvalidState",
            AgentError::Aborted => "Aborted",
        }
    }

    /// Whether the failure is expected to go away on its own (network blips,
    /// server overload). Local resource errors and rejections are not.
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Server(e) => e.is_transient(),
            AgentError::Download { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Minimum wait the server asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AgentError::Server(e) | AgentError::Download { source: e, .. } => e.retry_after(),
            _ => None,
        }
    }
}

/// Qualified kind of a link in an error chain.
pub fn error_kind(error: &(dyn StdError + 'static)) -> String {
    if let Some(e) = error.downcast_ref::<AgentError>() {
        format!("AgentError::{}", e.kind_name())
    } else if let Some(e) = error.downcast_ref::<ServerError>() {
        format!("ServerError::{}", e.kind_name())
    } else if let Some(e) = error.downcast_ref::<std::io::Error>() {
        format!("std::io::Error({:?})", e.kind())
    } else if error.is::<reqwest::Error>() {
        "reqwest::Error".to_string()
    } else {
        "Error".to_string()
    }
}

/// Walk the full cause chain, one `"<kind> : <message>"` entry per link,
/// outermost first.
pub fn exception_trace(error: &(dyn StdError + 'static)) -> Vec<String> {
    std::iter::successors(Some(error), |e| (*e).source())
        .map(|e| format!("{} : {}", error_kind(e), e))
        .collect()
}
