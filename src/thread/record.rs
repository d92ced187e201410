/*!
 * Thread Record
 *
 * Per-thread suspend bookkeeping. Every field touched from signal context is
 * either an atomic or written only by the thread that owns the record, so
 * handlers never take locks.
 */

use super::context::SavedContext;
use crate::core::errors::{SuspendError, SuspendResult};
use crate::core::types::{NativeThreadId, SignalNumber, SmallId, UNKNOWN_SMALL_ID};
use crate::suspend::notify::Handshake;
use nix::libc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU8, AtomicUsize, Ordering};

/// Entry point for an asynchronous call spliced into a resumed thread
///
/// Targets never return to the interrupted code; they unwind or switch
/// context on their own.
pub type AsyncCallTarget = unsafe extern "C" fn(*mut libc::c_void) -> !;

/// Pending asynchronous call: target plus opaque argument
#[derive(Debug, Clone, Copy)]
pub struct AsyncCall {
    pub target: AsyncCallTarget,
    pub arg: *mut libc::c_void,
}

// SAFETY: the argument is an opaque token handed back to `target` on the
// owning thread; the engine never dereferences it.
unsafe impl Send for AsyncCall {}

/// Suspend state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SuspendState {
    Running = 0,
    /// Suspend signal sent, not yet acknowledged
    AsyncSuspendRequested = 1,
    /// Context captured, acknowledged, blocked awaiting restart
    Suspended = 2,
    /// Restart received, running the pending call and acknowledging
    Resuming = 3,
    /// Parked voluntarily at a safepoint (hybrid mode only)
    SelfSuspended = 4,
}

impl SuspendState {
    #[inline]
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => SuspendState::Running,
            1 => SuspendState::AsyncSuspendRequested,
            2 => SuspendState::Suspended,
            3 => SuspendState::Resuming,
            _ => SuspendState::SelfSuspended,
        }
    }
}

impl fmt::Display for SuspendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Who asked for the current suspension episode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SuspendSource {
    /// This runtime's own suspend protocol
    Default = 0,
    /// A caller that wants the foreign runtime's handler instead
    External = 1,
}

/// Attach/detach lifecycle as seen by context capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Lifecycle {
    Attaching = 0,
    Attached = 1,
    Detaching = 2,
}

/// One live thread known to the runtime
pub struct ThreadRecord {
    tid: NativeThreadId,
    small_id: AtomicI32,
    state: AtomicU8,
    lifecycle: AtomicU8,

    /// Written by the restart handler, read by the restart-wait loop, both
    /// on the owning thread.
    last_signal: AtomicI32,

    suspend_source: AtomicU8,
    suspend_source_locked: AtomicBool,

    /// Outcome of the last capture, surfaced to the initiator
    suspend_can_continue: AtomicBool,

    /// Suspend signal doubles as a syscall interruption when set
    syscall_break: AtomicBool,

    saved: SavedContext,

    /// Initiator-owned until consumed by the suspend handler
    async_target: AtomicUsize,
    async_arg: AtomicPtr<libc::c_void>,

    handshake: Handshake,
}

impl ThreadRecord {
    /// Create a record for `tid`; the registry assigns the small id on attach
    pub fn new(tid: NativeThreadId) -> Self {
        Self {
            tid,
            small_id: AtomicI32::new(UNKNOWN_SMALL_ID),
            state: AtomicU8::new(SuspendState::Running as u8),
            lifecycle: AtomicU8::new(Lifecycle::Attaching as u8),
            last_signal: AtomicI32::new(0),
            suspend_source: AtomicU8::new(SuspendSource::Default as u8),
            suspend_source_locked: AtomicBool::new(false),
            suspend_can_continue: AtomicBool::new(false),
            syscall_break: AtomicBool::new(false),
            saved: SavedContext::new(),
            async_target: AtomicUsize::new(0),
            async_arg: AtomicPtr::new(std::ptr::null_mut()),
            handshake: Handshake::new(),
        }
    }

    #[inline]
    pub fn tid(&self) -> NativeThreadId {
        self.tid
    }

    #[inline]
    pub fn small_id(&self) -> SmallId {
        self.small_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_small_id(&self, id: SmallId) {
        self.small_id.store(id, Ordering::Release);
    }

    /// Attached to this runtime with a valid small id
    #[inline]
    pub fn is_known(&self) -> bool {
        self.small_id() != UNKNOWN_SMALL_ID
    }

    #[inline]
    pub fn state(&self) -> SuspendState {
        SuspendState::from_raw(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn lifecycle(&self) -> Lifecycle {
        match self.lifecycle.load(Ordering::Acquire) {
            0 => Lifecycle::Attaching,
            1 => Lifecycle::Attached,
            _ => Lifecycle::Detaching,
        }
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.lifecycle.store(lifecycle as u8, Ordering::Release);
    }

    #[inline]
    pub fn saved_context(&self) -> &SavedContext {
        &self.saved
    }

    #[inline]
    pub(crate) fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    fn transition(&self, from: SuspendState, to: SuspendState) -> Result<(), SuspendState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(SuspendState::from_raw)
    }

    // =========================================================================
    // State transitions
    // =========================================================================

    /// Initiator: Running -> AsyncSuspendRequested
    pub(crate) fn begin_async_suspend(&self) -> SuspendResult<()> {
        self.transition(SuspendState::Running, SuspendState::AsyncSuspendRequested)
            .map_err(|actual| SuspendError::invalid_state(SuspendState::Running, actual))
    }

    /// Initiator: AsyncSuspendRequested -> Running, when the signal could not
    /// be sent
    pub(crate) fn cancel_async_suspend(&self) -> bool {
        self.transition(SuspendState::AsyncSuspendRequested, SuspendState::Running)
            .is_ok()
    }

    /// Handler: AsyncSuspendRequested -> Suspended
    ///
    /// Fails when the thread already parked itself.
    pub(crate) fn finish_async_suspend(&self) -> bool {
        self.transition(SuspendState::AsyncSuspendRequested, SuspendState::Suspended)
            .is_ok()
    }

    /// Owning thread: Running | AsyncSuspendRequested -> SelfSuspended
    ///
    /// Returns the state that was replaced.
    pub(crate) fn begin_self_suspend(&self) -> SuspendResult<SuspendState> {
        for from in [SuspendState::Running, SuspendState::AsyncSuspendRequested] {
            if self.transition(from, SuspendState::SelfSuspended).is_ok() {
                return Ok(from);
            }
        }
        Err(SuspendError::invalid_state("Running", self.state()))
    }

    /// Handler: Suspended -> Resuming
    pub(crate) fn begin_resuming(&self) -> bool {
        self.transition(SuspendState::Suspended, SuspendState::Resuming)
            .is_ok()
    }

    /// Handler: Resuming -> Running
    pub(crate) fn finish_resuming(&self) -> bool {
        self.transition(SuspendState::Resuming, SuspendState::Running)
            .is_ok()
    }

    /// Initiator: SelfSuspended -> Running
    pub(crate) fn release_self_suspend(&self) -> bool {
        self.transition(SuspendState::SelfSuspended, SuspendState::Running)
            .is_ok()
    }

    // =========================================================================
    // Restart-wait slot
    // =========================================================================

    #[inline]
    pub(crate) fn last_signal(&self) -> SignalNumber {
        self.last_signal.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_last_signal(&self, signo: SignalNumber) {
        self.last_signal.store(signo, Ordering::Relaxed);
    }

    // =========================================================================
    // Signal authority
    // =========================================================================

    #[inline]
    pub fn suspend_source(&self) -> SuspendSource {
        match self.suspend_source.load(Ordering::Acquire) {
            0 => SuspendSource::Default,
            _ => SuspendSource::External,
        }
    }

    #[inline]
    pub(crate) fn set_suspend_source(&self, source: SuspendSource) {
        self.suspend_source.store(source as u8, Ordering::Release);
    }

    #[inline]
    pub fn is_suspend_source_locked(&self) -> bool {
        self.suspend_source_locked.load(Ordering::Acquire)
    }

    /// CAS false -> true; true when the caller became the authority
    #[inline]
    pub(crate) fn try_lock_suspend_source(&self) -> bool {
        self.suspend_source_locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub(crate) fn unlock_suspend_source(&self) {
        self.suspend_source_locked.store(false, Ordering::Release);
    }

    // =========================================================================
    // Episode outcome flags
    // =========================================================================

    #[inline]
    pub fn suspend_can_continue(&self) -> bool {
        self.suspend_can_continue.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_suspend_can_continue(&self, value: bool) {
        self.suspend_can_continue.store(value, Ordering::Release);
    }

    #[inline]
    pub(crate) fn request_syscall_break(&self) {
        self.syscall_break.store(true, Ordering::Release);
    }

    /// Consume a pending syscall-break request
    #[inline]
    pub(crate) fn take_syscall_break(&self) -> bool {
        self.syscall_break.swap(false, Ordering::AcqRel)
    }

    // =========================================================================
    // Pending asynchronous call
    // =========================================================================

    pub(crate) fn set_async_call(&self, call: AsyncCall) {
        self.async_arg.store(call.arg, Ordering::Relaxed);
        self.async_target
            .store(call.target as usize, Ordering::Release);
    }

    /// Pending call, without consuming it
    pub fn pending_async_call(&self) -> Option<AsyncCall> {
        let target = self.async_target.load(Ordering::Acquire);
        (target != 0).then(|| AsyncCall {
            // SAFETY: only ever stored from a valid AsyncCallTarget
            target: unsafe { std::mem::transmute::<usize, AsyncCallTarget>(target) },
            arg: self.async_arg.load(Ordering::Relaxed),
        })
    }

    /// Consume the pending call exactly once
    pub(crate) fn take_async_call(&self) -> Option<AsyncCall> {
        let target = self.async_target.swap(0, Ordering::AcqRel);
        if target == 0 {
            return None;
        }
        let arg = self.async_arg.swap(std::ptr::null_mut(), Ordering::Relaxed);
        Some(AsyncCall {
            // SAFETY: only ever stored from a valid AsyncCallTarget
            target: unsafe { std::mem::transmute::<usize, AsyncCallTarget>(target) },
            arg,
        })
    }
}

impl fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("tid", &self.tid)
            .field("small_id", &self.small_id())
            .field("state", &self.state())
            .field("lifecycle", &self.lifecycle())
            .field("suspend_source", &self.suspend_source())
            .field("suspend_source_locked", &self.is_suspend_source_locked())
            .finish()
    }
}
