use std::fmt;
use std::time::Duration;
use thiserror::Error;

use super::circuit_breaker::CircuitState;
use crate::config::ConfigError;
use crate::error::Retryable;

/// Failure of a single attempt inside the retry loop.
#[derive(Debug, Error)]
pub enum AttemptError<E> {
    #[error("operation {operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error(transparent)]
    Operation(E),
}

impl<E: Retryable> AttemptError<E> {
    pub(crate) fn is_retryable(&self, retry_on_timeout: bool) -> bool {
        match self {
            AttemptError::Timeout { .. } => retry_on_timeout,
            AttemptError::Operation(error) => error.is_retryable(),
        }
    }
}

/// Terminal failure of a guarded call.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    #[error("circuit for {operation} is {state}")]
    CircuitOpen {
        operation: String,
        state: CircuitState,
    },

    #[error("bulkhead for {operation} is full ({max_concurrent} in flight)")]
    BulkheadRejected {
        operation: String,
        max_concurrent: usize,
    },

    #[error("rate limit for {operation} exceeded ({limit} per {window:?})")]
    RateLimited {
        operation: String,
        limit: usize,
        window: Duration,
    },

    #[error("operation {operation} timed out after {timeout:?}")]
    TimeoutExceeded {
        operation: String,
        timeout: Duration,
    },

    #[error("operation {operation} failed after {attempts} attempts: {last}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        last: AttemptError<E>,
    },

    #[error("invalid policy set for {operation}: {source}")]
    InvalidPolicy {
        operation: String,
        #[source]
        source: ConfigError,
    },

    #[error(transparent)]
    Operation(E),
}

/// Label for a [`ResilienceError`] variant, used in telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    CircuitOpen,
    BulkheadRejected,
    RateLimited,
    TimeoutExceeded,
    RetryExhausted,
    InvalidPolicy,
    Operation,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::BulkheadRejected => "bulkhead_rejected",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::TimeoutExceeded => "timeout_exceeded",
            FailureKind::RetryExhausted => "retry_exhausted",
            FailureKind::InvalidPolicy => "invalid_policy",
            FailureKind::Operation => "operation",
        }
    }

    /// Whether the guarded dependency was actually called and failed.
    pub fn counts_against_circuit(&self) -> bool {
        matches!(
            self,
            FailureKind::TimeoutExceeded | FailureKind::RetryExhausted | FailureKind::Operation
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<E> ResilienceError<E> {
    pub fn kind(&self) -> FailureKind {
        match self {
            ResilienceError::CircuitOpen { .. } => FailureKind::CircuitOpen,
            ResilienceError::BulkheadRejected { .. } => FailureKind::BulkheadRejected,
            ResilienceError::RateLimited { .. } => FailureKind::RateLimited,
            ResilienceError::TimeoutExceeded { .. } => FailureKind::TimeoutExceeded,
            ResilienceError::RetryExhausted { .. } => FailureKind::RetryExhausted,
            ResilienceError::InvalidPolicy { .. } => FailureKind::InvalidPolicy,
            ResilienceError::Operation(_) => FailureKind::Operation,
        }
    }

    /// The operation's own error, wherever it ended up.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            ResilienceError::Operation(error)
            | ResilienceError::RetryExhausted {
                last: AttemptError::Operation(error),
                ..
            } => Some(error),
            _ => None,
        }
    }

    pub(crate) fn from_attempt(error: AttemptError<E>) -> Self {
        match error {
            AttemptError::Timeout { operation, timeout } => {
                ResilienceError::TimeoutExceeded { operation, timeout }
            }
            AttemptError::Operation(error) => ResilienceError::Operation(error),
        }
    }
}

impl<E: Retryable> Retryable for ResilienceError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            ResilienceError::CircuitOpen { .. }
            | ResilienceError::BulkheadRejected { .. }
            | ResilienceError::RateLimited { .. }
            | ResilienceError::TimeoutExceeded { .. } => true,
            ResilienceError::RetryExhausted { .. } | ResilienceError::InvalidPolicy { .. } => false,
            ResilienceError::Operation(error) => error.is_retryable(),
        }
    }
}
