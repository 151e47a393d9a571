use std::io;

use thiserror::Error;

use super::diagnostics::DiagnosticsError;
use super::engine::SessionState;

/// Errors raised by a remux session.
#[derive(Debug, Error)]
pub enum RemuxError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("remux process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("remux input is closed")]
    InputClosed,

    #[error("remux process exited with code {code:?}: {stderr_tail}")]
    ProcessFailed {
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("remux process was killed")]
    ProcessKilled,

    #[error("failed to wait for remux process: {reason}")]
    Wait { reason: String },

    #[error("failed to parse remux output: {0}")]
    Parse(#[from] DiagnosticsError),

    #[error("remux cancelled")]
    Cancelled,

    #[error("remux session is {state:?}")]
    InvalidState { state: SessionState },
}

impl RemuxError {
    pub fn io(context: &'static str, source: io::Error) -> Self {
        Self::Io { context, source }
    }

    /// Whether the error is the result of cancellation rather than a fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::ProcessKilled)
    }
}
