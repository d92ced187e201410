/*!
 * Error Types
 * Centralized error handling with thiserror, miette, and serde support
 */

use super::types::{SignalNumber, SignalRole};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for ordinary-context engine operations
pub type SuspendResult<T> = Result<T, SuspendError>;

/// Suspend engine errors
///
/// Only raised from ordinary thread context. Violations detected inside a
/// signal handler never become values; they go through [`super::fatal`].
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum SuspendError {
    #[error("Suspend signals are not initialized")]
    #[diagnostic(
        code(suspend::not_initialized),
        help("Call init_signals() during process bootstrap before suspending threads.")
    )]
    NotInitialized,

    #[error("Suspend signals are already initialized")]
    #[diagnostic(
        code(suspend::already_initialized),
        help("Use reload_signal_handlers() to re-install handlers after a reload.")
    )]
    AlreadyInitialized,

    #[error("No available signal number for the {0} role")]
    #[diagnostic(
        code(suspend::no_available_signal),
        help("Every real-time signal already has a handler. Free one or configure explicit numbers.")
    )]
    NoAvailableSignal(SignalRole),

    #[error("Platform has no real-time signal range and no fixed {0} signal")]
    #[diagnostic(code(suspend::unsupported_platform))]
    UnsupportedPlatform(SignalRole),

    #[error("Signal {signo} for the {role} role is out of range (limit {limit})")]
    #[diagnostic(
        code(suspend::signal_out_of_range),
        help("On Android only signal numbers below 32 are usable.")
    )]
    SignalOutOfRange {
        role: SignalRole,
        signo: SignalNumber,
        limit: SignalNumber,
    },

    #[error("Signal {0} was assigned to more than one role")]
    #[diagnostic(
        code(suspend::duplicate_signal),
        help("Suspend, restart and abort signals must be pairwise distinct.")
    )]
    DuplicateSignal(SignalNumber),

    #[error("sigaction({signo}) failed: {reason}")]
    #[diagnostic(code(suspend::sigaction_failed))]
    SigactionFailed { signo: SignalNumber, reason: String },

    #[error("Failed to send signal {signo} to thread {thread}: {reason}")]
    #[diagnostic(
        code(suspend::send_failed),
        help("The target thread may have exited. Detach threads before they terminate.")
    )]
    SendFailed {
        signo: SignalNumber,
        thread: String,
        reason: String,
    },

    #[error("Thread {0} is not attached to the suspend engine")]
    #[diagnostic(code(suspend::thread_not_attached))]
    ThreadNotAttached(String),

    #[error("Thread is already attached to the suspend engine")]
    #[diagnostic(code(suspend::thread_already_attached))]
    ThreadAlreadyAttached,

    #[error("Invalid suspend state: expected {expected}, found {actual}")]
    #[diagnostic(
        code(suspend::invalid_state),
        help("Suspend and resume requests must alternate for a given thread.")
    )]
    InvalidState { expected: String, actual: String },

    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(suspend::invalid_config))]
    InvalidConfig(String),
}

impl SuspendError {
    pub(crate) fn invalid_state(expected: impl ToString, actual: impl ToString) -> Self {
        SuspendError::InvalidState {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

impl From<serde_json::Error> for SuspendError {
    fn from(err: serde_json::Error) -> Self {
        SuspendError::InvalidConfig(err.to_string())
    }
}
