//! The uniform command result contract.
//!
//! Every command execution, success or failure, is reported through
//! [`CommandResult`]. Expected failures are values of [`CommandError`];
//! nothing in the pipeline panics or propagates raw storage errors to the
//! caller.

use thiserror::Error;

/// Why a command failed.
///
/// The `Display` form of each variant is the caller-facing message. Internal
/// detail (stack context, storage errors) is logged server-side only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The command requires a session and none was supplied.
    #[error("SessionId is missing")]
    MissingSessionId,
    /// The supplied session id does not resolve to any session.
    #[error("Invalid SessionId")]
    InvalidSessionId,
    /// The session resolved but has been closed.
    #[error("Session is closed")]
    SessionClosed,
    /// A business precondition failed; the message names the rule.
    #[error("{0}")]
    Validation(String),
    /// Storage rejected the commit because of a concurrent duplicate.
    /// Retryable with fresh input.
    #[error("Race condition: unique constraint violated")]
    RaceCondition,
    /// Anything unexpected. Full detail is logged, never surfaced.
    #[error("An error occurred processing your request")]
    Internal,
}

/// Outcome of executing a command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// The command succeeded, optionally carrying an opaque payload such as
    /// a newly created identifier.
    Success { data: Option<serde_json::Value> },
    /// The command failed; no events were persisted on its behalf.
    Failure { error: CommandError },
}

impl CommandResult {
    /// Successful result with no payload.
    #[must_use]
    pub const fn success() -> Self {
        Self::Success { data: None }
    }

    /// Successful result carrying a payload.
    #[must_use]
    pub const fn success_with(data: serde_json::Value) -> Self {
        Self::Success { data: Some(data) }
    }

    /// Failed result.
    #[must_use]
    pub const fn failure(error: CommandError) -> Self {
        Self::Failure { error }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Payload of a successful result, if any.
    #[must_use]
    pub const fn data(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Success { data } => data.as_ref(),
            Self::Failure { .. } => None,
        }
    }

    /// Error of a failed result.
    #[must_use]
    pub const fn error(&self) -> Option<&CommandError> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error } => Some(error),
        }
    }

    /// Human-readable error message of a failed result.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        self.error().map(ToString::to_string)
    }
}
