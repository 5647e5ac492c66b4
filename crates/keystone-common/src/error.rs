//! Error types for keystone
//!
//! Errors are classified by how the phase executor must react to them:
//! configuration errors and unrecoverable action errors abort immediately,
//! transient errors are retried, and timeouts depend on the phase severity.

use std::time::Duration;

use thiserror::Error;

use crate::polling::VerifyError;

/// Main error type for keystone operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bad topology input, missing precondition, unusable settings
    #[error("configuration error: {message} (input: {input:?})")]
    Configuration {
        /// Description of what is wrong
        message: String,
        /// The offending input, echoed back verbatim
        input: String,
    },

    /// Network fetch failure, API not yet accepting connections, etc.
    #[error("transient error [{context}]: {message}")]
    Transient {
        /// Operation or query that failed
        context: String,
        /// Description of what failed
        message: String,
    },

    /// A verification condition never became true
    #[error("timed out after {timeout:?} waiting for {waiting_for}{}", last_error_suffix(.last_error))]
    Timeout {
        /// What was being waited for
        waiting_for: String,
        /// How long we waited
        timeout: Duration,
        /// The last probe error observed, if the final probe errored
        last_error: Option<String>,
    },

    /// The action itself reported a non-retryable failure
    #[error("unrecoverable action error [{operation}]: {message}")]
    UnrecoverableAction {
        /// Operation that failed
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// The next retry sleep would overrun the supplied deadline
    #[error("deadline exceeded [{context}]: {message}")]
    DeadlineExceeded {
        /// Operation that was being retried
        context: String,
        /// The last underlying error
        message: String,
    },

    /// The external backend could not be driven (bad backend config, spawn failure)
    #[error("backend error [{context}]: {message}")]
    Backend {
        /// Where the failure occurred
        context: String,
        /// Description of what failed
        message: String,
    },

    /// A phase state transition the tracker refuses (unknown phase, terminal state rewritten)
    #[error("state error [{phase}]: {message}")]
    State {
        /// Phase whose state was being recorded
        phase: String,
        /// Description of the rejected transition
        message: String,
    },

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(" (last error: {})", e))
        .unwrap_or_default()
}

impl Error {
    /// Create a configuration error echoing the offending input
    pub fn configuration(msg: impl Into<String>, input: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
            input: input.into(),
        }
    }

    /// Create a transient error for the given operation or query
    pub fn transient(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transient {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create an unrecoverable action error
    pub fn unrecoverable(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::UnrecoverableAction {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a backend error
    pub fn backend(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Backend {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a state error for the given phase
    pub fn state(phase: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::State {
            phase: phase.into(),
            message: msg.into(),
        }
    }

    /// Whether the retry controller may attempt the operation again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    /// Whether this error aborts the run regardless of phase severity
    ///
    /// Timeouts are the only severity-dependent class; everything else that
    /// reaches the executor is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Timeout { .. })
    }
}

impl From<VerifyError> for Error {
    fn from(e: VerifyError) -> Self {
        Error::Timeout {
            waiting_for: e.description,
            timeout: e.timeout,
            last_error: e.last_error,
        }
    }
}
