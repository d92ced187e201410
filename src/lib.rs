/*!
 * Signal Suspend Library
 * Cross-thread suspend/resume driven by POSIX signals, with handler chaining
 * for processes that host a second runtime on the same signal numbers
 */

pub mod core;
pub mod monitoring;
pub mod runtime;
pub mod signals;
pub mod suspend;
pub mod thread;

// Re-exports
pub use crate::core::{
    NativeThreadId, SignalNumber, SignalRole, SignalSelection, SmallId, SuspendConfig,
    SuspendError, SuspendMode, SuspendResult,
};
pub use monitoring::{init_tracing, SuspendStats};
pub use runtime::{
    get_abort_signal, get_restart_signal, get_suspend_signal, init_signals,
    is_owned_by_foreign_runtime, register_thread_checker, reload_signal_handlers, SignalRuntime,
    SignalRuntimeBuilder,
};
pub use suspend::{SuspendCoordinator, SuspendKind, SuspendOutcome, SuspendRoute};
pub use thread::{AsyncCall, SuspendState, ThreadRecord, ThreadRegistry};
