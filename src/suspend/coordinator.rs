/*!
 * Suspend Coordinator
 *
 * The suspend and restart signal handlers plus the initiator-side API that
 * drives them. A suspend episode runs:
 *
 *   initiator                        target (in its suspend handler)
 *   request_suspend  --suspend-->    capture context, block restart
 *   wait_for_suspend <--notify--     acknowledge, sigsuspend(all but restart)
 *   request_resume   --restart-->    restart handler records the signal
 *   wait_for_resume  <--notify--     splice pending async call, acknowledge
 *
 * Handler-side methods run in asynchronous-signal context: atomics, sem_post
 * and sigprocmask only.
 */

use super::foreign::ForeignThreadOracle;
use crate::core::config::SuspendMode;
use crate::core::errors::{SuspendError, SuspendResult};
use crate::core::fatal::{fatal, handler_assert};
use crate::core::traits::{ContextCapture, InitiatorNotifier, ThreadDirectory};
use crate::core::types::{NativeThreadId, SignalNumber};
use crate::monitoring::AtomicSuspendStats;
use crate::signals::os;
use crate::signals::SignalSet;
use crate::thread::{AsyncCall, SuspendSource, SuspendState, ThreadRecord};
use nix::libc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Signal carrying a suspend request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendKind {
    /// Suspend signal; interrupted syscalls restart
    Signal,
    /// Abort signal; interrupted syscalls fail with EINTR
    Abort,
}

/// Which runtime a suspend request was routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendRoute {
    /// This runtime's episode; follow with `wait_for_suspend`
    Runtime,
    /// Claimed by the foreign runtime; its handler gets the signal and no
    /// acknowledgement will come from this engine
    Foreign,
}

/// What the initiator learns once suspension is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendOutcome {
    /// Parked with a valid saved context
    Captured,
    /// Parked, but the thread could not be captured (attaching or detaching)
    CaptureFailed,
    /// The thread parked itself at a safepoint first
    SelfSuspended,
}

/// Where a suspend delivery ended up before the restart wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SuspendEntry {
    /// Delivery was a syscall interruption
    SyscallBreak,
    /// Thread self-suspended first; nothing to park
    LostRace,
    /// Acknowledged; the restart wait must follow
    Parked,
}

/// Suspend/restart handlers and the initiator API
pub struct SuspendCoordinator {
    directory: Arc<dyn ThreadDirectory>,
    capture: Arc<dyn ContextCapture>,
    notifier: Arc<dyn InitiatorNotifier>,
    foreign: &'static ForeignThreadOracle,
    mode: SuspendMode,
    signals: SignalSet,
    stats: Arc<AtomicSuspendStats>,
}

impl SuspendCoordinator {
    pub fn new(
        directory: Arc<dyn ThreadDirectory>,
        capture: Arc<dyn ContextCapture>,
        notifier: Arc<dyn InitiatorNotifier>,
        foreign: &'static ForeignThreadOracle,
        mode: SuspendMode,
        signals: SignalSet,
        stats: Arc<AtomicSuspendStats>,
    ) -> Self {
        Self {
            directory,
            capture,
            notifier,
            foreign,
            mode,
            signals,
            stats,
        }
    }

    #[inline]
    pub fn signals(&self) -> &SignalSet {
        &self.signals
    }

    #[inline]
    pub fn mode(&self) -> SuspendMode {
        self.mode
    }

    // =========================================================================
    // Signal context
    // =========================================================================

    /// Suspend (and abort) signal body
    pub fn on_suspend_signal(&self, ucontext: *mut libc::c_void) {
        // Not attached: only reachable while a handler is being installed
        let Some(thread) = self.directory.current() else {
            return;
        };

        if self.enter_suspend(thread, ucontext) == SuspendEntry::Parked {
            self.await_restart(thread);
            self.leave_suspend(thread, ucontext);
        }
    }

    /// Restart signal body: record the delivery for the wait loop
    pub fn on_restart_signal(&self, signo: SignalNumber) {
        if let Some(thread) = self.directory.current() {
            thread.set_last_signal(signo);
        }
    }

    /// Everything up to and including the suspend acknowledgement
    pub(crate) fn enter_suspend(
        &self,
        thread: &ThreadRecord,
        ucontext: *mut libc::c_void,
    ) -> SuspendEntry {
        if thread.take_syscall_break() {
            self.stats.inc_syscall_aborts();
            self.notifier.notify_abort(thread);
            return SuspendEntry::SyscallBreak;
        }

        if !thread.finish_async_suspend() {
            // The thread parked itself at a safepoint before this delivery ran;
            // it waits for its resume on the self-suspend path.
            handler_assert!(
                self.mode == SuspendMode::Hybrid,
                "suspend signal raced self-suspension outside hybrid mode"
            );
            thread.set_suspend_can_continue(true);
            self.stats.inc_self_suspend_races();
            self.notifier.notify_suspend(thread);
            return SuspendEntry::LostRace;
        }

        let captured = self.capture.capture(thread, ucontext);
        thread.set_suspend_can_continue(captured);
        if !captured {
            self.stats.inc_capture_failures();
        }

        // Restart must stay blocked between the acknowledgement and the
        // sigsuspend below or an early restart would be lost.
        os::block_signals(self.signals.ack_mask());
        self.notifier.notify_suspend(thread);
        self.stats.inc_suspend_acks();
        SuspendEntry::Parked
    }

    /// Sleep until the restart handler has run on this thread
    pub(crate) fn await_restart(&self, thread: &ThreadRecord) {
        let restart = self.signals.restart();
        loop {
            thread.set_last_signal(0);
            os::suspend_until_signal(self.signals.suspend_mask());
            if thread.last_signal() == restart {
                break;
            }
        }
    }

    /// Everything after the restart has been observed
    pub(crate) fn leave_suspend(&self, thread: &ThreadRecord, ucontext: *mut libc::c_void) {
        os::unblock_signals(self.signals.ack_mask());

        handler_assert!(
            thread.begin_resuming(),
            "restart observed outside the Suspended state"
        );

        if let Some(call) = thread.take_async_call() {
            if !self.capture.install_async_call(thread, call, ucontext) {
                fatal("asynchronous calls are not supported on this platform");
            }
            self.stats.inc_async_calls();
        }

        thread.saved_context().invalidate();
        handler_assert!(thread.finish_resuming(), "resume raced another transition");

        self.notifier.notify_resume(thread);
        self.stats.inc_resume_acks();
    }

    // =========================================================================
    // Initiator side
    // =========================================================================

    /// Record of an attached thread
    pub fn thread(&self, tid: NativeThreadId) -> SuspendResult<Arc<ThreadRecord>> {
        self.directory
            .lookup(tid)
            .filter(|thread| thread.is_known())
            .ok_or_else(|| SuspendError::ThreadNotAttached(tid.to_string()))
    }

    /// Ask `thread` to suspend
    ///
    /// Threads claimed by the foreign runtime get an external episode: the
    /// signal is forwarded to the chained handler and the state machine is
    /// left alone.
    pub fn request_suspend(
        &self,
        thread: &ThreadRecord,
        kind: SuspendKind,
    ) -> SuspendResult<SuspendRoute> {
        if !thread.is_known() {
            return Err(SuspendError::ThreadNotAttached(thread.tid().to_string()));
        }

        let signo = match kind {
            SuspendKind::Signal => self.signals.suspend(),
            SuspendKind::Abort => self.signals.abort(),
        };

        if self.foreign.is_owned(thread.tid()) {
            self.mark_external_suspend(thread);
            if let Err(err) = os::send_signal(thread.tid(), signo) {
                // No delivery will run to reset the episode
                thread.set_suspend_source(SuspendSource::Default);
                warn!(tid = %thread.tid(), error = %err, "Forwarded suspend signal not delivered");
                return Err(err);
            }
            debug!(tid = %thread.tid(), signo, "Suspend forwarded to foreign runtime");
            return Ok(SuspendRoute::Foreign);
        }

        thread.begin_async_suspend()?;
        if let Err(err) = os::send_signal(thread.tid(), signo) {
            thread.cancel_async_suspend();
            warn!(tid = %thread.tid(), error = %err, "Suspend signal not delivered");
            return Err(err);
        }

        self.stats.inc_suspend_requests();
        debug!(tid = %thread.tid(), signo, ?kind, "Suspend requested");
        Ok(SuspendRoute::Runtime)
    }

    /// Block until the target acknowledges a `Runtime` suspend request
    pub fn wait_for_suspend(&self, thread: &ThreadRecord) -> SuspendOutcome {
        self.notifier.wait_suspend(thread);

        if thread.state() == SuspendState::SelfSuspended {
            SuspendOutcome::SelfSuspended
        } else if thread.suspend_can_continue() {
            SuspendOutcome::Captured
        } else {
            SuspendOutcome::CaptureFailed
        }
    }

    /// Queue a call for a signal-suspended thread to enter on resume
    pub fn set_async_call(&self, thread: &ThreadRecord, call: AsyncCall) -> SuspendResult<()> {
        match thread.state() {
            SuspendState::Suspended => {
                thread.set_async_call(call);
                Ok(())
            }
            actual => Err(SuspendError::invalid_state(SuspendState::Suspended, actual)),
        }
    }

    /// Resume a suspended thread
    ///
    /// Every successful call produces exactly one resume acknowledgement,
    /// which must be consumed with `wait_for_resume`.
    pub fn request_resume(&self, thread: &ThreadRecord) -> SuspendResult<()> {
        match thread.state() {
            SuspendState::Suspended => {
                os::send_signal(thread.tid(), self.signals.restart())?;
                debug!(tid = %thread.tid(), "Restart sent");
                Ok(())
            }
            SuspendState::SelfSuspended if thread.release_self_suspend() => {
                thread.handshake().self_resume.post();
                debug!(tid = %thread.tid(), "Self-suspended thread released");
                Ok(())
            }
            actual => Err(SuspendError::invalid_state(SuspendState::Suspended, actual)),
        }
    }

    pub fn wait_for_resume(&self, thread: &ThreadRecord) {
        self.notifier.wait_resume(thread);
    }

    /// Kick `thread` out of a blocking system call without suspending it
    ///
    /// Only attached threads acknowledge the abort, so anything else is
    /// rejected up front.
    pub fn interrupt_syscall(&self, thread: &ThreadRecord) -> SuspendResult<()> {
        if !thread.is_known() {
            return Err(SuspendError::ThreadNotAttached(thread.tid().to_string()));
        }

        thread.request_syscall_break();
        if let Err(err) = os::send_signal(thread.tid(), self.signals.abort()) {
            thread.take_syscall_break();
            return Err(err);
        }
        self.notifier.wait_abort(thread);
        debug!(tid = %thread.tid(), "Syscall interrupted");
        Ok(())
    }

    /// Route the next delivery on `thread` to the chained handler
    pub fn mark_external_suspend(&self, thread: &ThreadRecord) {
        thread.set_suspend_source(SuspendSource::External);
    }

    /// Park the calling thread at a safepoint until `request_resume`
    pub fn self_suspend(&self) -> SuspendResult<()> {
        if self.mode != SuspendMode::Hybrid {
            return Err(SuspendError::InvalidConfig(
                "self-suspension requires hybrid mode".into(),
            ));
        }

        let thread = self
            .directory
            .current()
            .ok_or_else(|| SuspendError::ThreadNotAttached(NativeThreadId::current().to_string()))?;

        let replaced = thread.begin_self_suspend()?;
        debug!(tid = %thread.tid(), %replaced, "Self-suspending");

        thread.handshake().self_resume.wait();
        self.notifier.notify_resume(thread);
        self.stats.inc_resume_acks();
        Ok(())
    }

    pub fn stats(&self) -> &AtomicSuspendStats {
        &self.stats
    }
}

/// Runtime handler bound to the suspend and abort signals
pub extern "C" fn suspend_signal_handler(
    _signo: libc::c_int,
    _info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    if let Some(runtime) = crate::runtime::installed() {
        runtime.coordinator().on_suspend_signal(context);
    }
}

/// Runtime handler bound to the restart signal
pub extern "C" fn restart_signal_handler(
    signo: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    if let Some(runtime) = crate::runtime::installed() {
        runtime.coordinator().on_restart_signal(signo);
    }
}
