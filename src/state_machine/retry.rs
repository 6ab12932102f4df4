use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::state::State;
use crate::error::AgentError;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries per state before the failure turns fatal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given retry attempt using capped exponential backoff.
    /// delay = min(base_delay_ms * 2^(attempt - 1), max_delay_ms)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }
}

/// What to do with a failed action attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Try again after the delay, without leaving the state.
    Retry(Duration),
    /// Route to error handling.
    Fatal,
    /// The failure was caused by a kill request; let the abort path take over.
    Abandon,
}

/// Decides whether a failed attempt is retried, fatal, or abandoned due to an abort.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Classify the `failures`-th consecutive failure (1-based) of `state`'s action.
    ///
    /// Transient errors in retryable states are retried until `max_retries` is
    /// exhausted. A server-provided `retry-after` raises the delay, but never
    /// past `max_delay_ms`.
    pub fn classify(&self, state: State, error: &AgentError, failures: u32) -> Disposition {
        if matches!(error, AgentError::Aborted) {
            return Disposition::Abandon;
        }
        if !state.is_retryable() || !error.is_transient() || failures > self.config.max_retries {
            return Disposition::Fatal;
        }
        let backoff = Duration::from_millis(self.config.delay_for_attempt(failures));
        let cap = Duration::from_millis(self.config.max_delay_ms);
        let delay = error
            .retry_after()
            .map_or(backoff, |requested| requested.max(backoff).min(cap));
        Disposition::Retry(delay)
    }
}
