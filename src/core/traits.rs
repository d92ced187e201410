/*!
 * Collaborator Traits
 *
 * Seams between the suspend engine and the runtime embedding it. Methods
 * documented as running in signal context must be async-signal-safe:
 * no allocation, no locks, no logging.
 */

use super::types::{NativeThreadId, SmallId};
use crate::thread::{AsyncCall, ThreadRecord};
use nix::libc;
use std::sync::Arc;

/// Foreign-runtime ownership predicate installed by embedders
pub type ThreadChecker = dyn Fn(NativeThreadId) -> bool + Send + Sync;

/// Thread registry lookups
pub trait ThreadDirectory: Send + Sync {
    /// Record of the calling thread
    ///
    /// Runs in signal context.
    fn current(&self) -> Option<&ThreadRecord>;

    /// Record for an arbitrary thread (initiator side)
    fn lookup(&self, tid: NativeThreadId) -> Option<Arc<ThreadRecord>>;

    /// Small id for a thread, `None` when the thread is unknown
    fn small_id(&self, tid: NativeThreadId) -> Option<SmallId>;
}

/// Platform-specific execution state capture
#[cfg_attr(test, mockall::automock)]
pub trait ContextCapture: Send + Sync {
    /// Save the interrupted context into the thread's slot
    ///
    /// Runs in signal context. Returns false when the thread cannot be
    /// captured yet (still attaching, or detaching).
    fn capture(&self, thread: &ThreadRecord, ucontext: *mut libc::c_void) -> bool;

    /// Rewrite the interrupted context so the thread enters `call` on return
    ///
    /// Runs in signal context.
    fn install_async_call(
        &self,
        thread: &ThreadRecord,
        call: AsyncCall,
        ucontext: *mut libc::c_void,
    ) -> bool;
}

/// Safe-memory-reclamation reservations held across handler execution
#[cfg_attr(test, mockall::automock)]
pub trait ReclamationSlots: Send + Sync {
    /// Runs in signal context
    fn acquire_slot(&self) -> Option<usize>;

    /// Runs in signal context
    fn release_slot(&self, index: usize);
}

/// Handshake between the suspend initiator and the target thread
///
/// `notify_*` run on the target thread in signal context; `wait_*` run on the
/// initiator in ordinary context.
#[cfg_attr(test, mockall::automock)]
pub trait InitiatorNotifier: Send + Sync {
    fn notify_suspend(&self, thread: &ThreadRecord);
    fn notify_resume(&self, thread: &ThreadRecord);
    fn notify_abort(&self, thread: &ThreadRecord);

    fn wait_suspend(&self, thread: &ThreadRecord);
    fn wait_resume(&self, thread: &ThreadRecord);
    fn wait_abort(&self, thread: &ThreadRecord);
}
