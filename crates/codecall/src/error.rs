//! Error types for code execution calls

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::worker::WorkerState;

/// Which deadline fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// A user call (or the warm-up ping)
    Call,
    /// Waiting for the zygote to confirm a restart
    Restart,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::Call => f.write_str("call"),
            TimeoutPhase::Restart => f.write_str("restart"),
        }
    }
}

/// Errors returned by workers, the pool and the dispatcher
#[derive(Debug, Error)]
pub enum CallError {
    /// The child reported that the requested function does not exist.
    /// The worker stays usable.
    #[error("function not found in module")]
    FunctionMissing,

    /// A deadline fired; the child has been killed
    #[error("{phase} timeout of {limit:?} exceeded, killing child")]
    Timeout { phase: TimeoutPhase, limit: Duration },

    /// The child sent something that does not follow the protocol
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The child exited, failed to start, or its streams failed
    #[error("child crashed: {0}")]
    ChildCrashed(String),

    /// No worker became available in time (fail-fast pools only)
    #[error("no worker available after {waited:?}")]
    Overload { waited: Duration },

    /// The call could not be resolved into a request
    #[error("invalid call: {0}")]
    InvalidCall(String),

    /// The worker is not in a state that accepts the operation
    #[error("invalid worker state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: WorkerState,
    },

    /// The pool was shut down or never initialised
    #[error("worker pool is closed")]
    PoolClosed,

    /// Docker or host mount failure
    #[error("backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CallError {
    pub fn is_function_missing(&self) -> bool {
        matches!(self, CallError::FunctionMissing)
    }

    /// Whether the failure took the child down with it
    pub fn is_fatal_to_worker(&self) -> bool {
        matches!(
            self,
            CallError::Timeout { .. } | CallError::ProtocolViolation(_) | CallError::ChildCrashed(_)
        )
    }

    pub(crate) fn backend(err: impl fmt::Display) -> Self {
        CallError::Backend(err.to_string())
    }
}

impl From<bollard::errors::Error> for CallError {
    fn from(err: bollard::errors::Error) -> Self {
        CallError::Backend(err.to_string())
    }
}

impl From<nix::errno::Errno> for CallError {
    fn from(err: nix::errno::Errno) -> Self {
        CallError::Io(err.into())
    }
}

pub type Result<T> = std::result::Result<T, CallError>;
