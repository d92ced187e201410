/*!
 * Signal Chain Registry
 *
 * Per-signal-number table of merged handler records. Each intercepted number
 * keeps the handler this runtime wants plus whatever was installed before it,
 * and the OS only ever sees the shared dispatch trampoline.
 *
 * Records are leaked on first insertion: the OS signal table is process-wide
 * and a trampoline may be running on any thread at any time, so records live
 * for the rest of the process. Signal-context lookups are a single atomic load.
 */

use super::os;
use crate::core::errors::SuspendResult;
use crate::core::limits::MAX_SIGNALS;
use crate::core::types::{signal_name, PlainHandler, SigInfoHandler, SignalNumber};
use nix::libc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Flags from a displaced handler that must not leak into the trampoline:
/// one-shot reset would drop the trampoline, no-defer would allow nesting.
const UNMERGEABLE_FLAGS: libc::c_int = libc::SA_RESETHAND | libc::SA_NODEFER;

/// Runtime handler merged with the handler it displaced
pub struct ChainedHandlerRecord {
    signo: SignalNumber,
    /// Rebound on every re-installation
    runtime_handler: AtomicUsize,
    runtime_flags: AtomicI32,
    /// Disposition found on first interception; never replaced
    original: libc::sigaction,
}

impl ChainedHandlerRecord {
    fn new(
        signo: SignalNumber,
        handler: SigInfoHandler,
        flags: libc::c_int,
        original: libc::sigaction,
    ) -> Self {
        Self {
            signo,
            runtime_handler: AtomicUsize::new(handler as usize),
            runtime_flags: AtomicI32::new(flags),
            original,
        }
    }

    #[inline]
    pub fn signo(&self) -> SignalNumber {
        self.signo
    }

    /// Handler this runtime currently wants for the number
    #[inline]
    pub fn runtime_handler(&self) -> SigInfoHandler {
        let raw = self.runtime_handler.load(Ordering::Acquire);
        // SAFETY: only ever stored from a SigInfoHandler
        unsafe { std::mem::transmute::<usize, SigInfoHandler>(raw) }
    }

    /// True when `handler` is the runtime handler currently bound
    #[inline]
    pub fn is_bound_to(&self, handler: SigInfoHandler) -> bool {
        self.runtime_handler.load(Ordering::Acquire) == handler as usize
    }

    #[inline]
    pub fn runtime_flags(&self) -> libc::c_int {
        self.runtime_flags.load(Ordering::Acquire)
    }

    /// Disposition that was installed before this runtime intervened
    #[inline]
    pub fn original(&self) -> &libc::sigaction {
        &self.original
    }

    /// Address of the original handler (`SIG_DFL`/`SIG_IGN` included)
    #[inline]
    pub fn original_handler(&self) -> libc::sighandler_t {
        self.original.sa_sigaction
    }

    fn rebind(&self, handler: SigInfoHandler, flags: libc::c_int) {
        self.runtime_flags.store(flags, Ordering::Release);
        self.runtime_handler
            .store(handler as usize, Ordering::Release);
    }

    /// Run this runtime's handler; signal context
    #[inline]
    pub fn invoke_runtime(
        &self,
        signo: libc::c_int,
        info: *mut libc::siginfo_t,
        context: *mut libc::c_void,
    ) {
        (self.runtime_handler())(signo, info, context);
    }

    /// Run the displaced handler; signal context
    ///
    /// `SIG_DFL` and `SIG_IGN` are table sentinels, not code, and are skipped.
    /// Returns whether a handler actually ran.
    pub fn invoke_original(
        &self,
        signo: libc::c_int,
        info: *mut libc::siginfo_t,
        context: *mut libc::c_void,
    ) -> bool {
        let handler = self.original.sa_sigaction;
        if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
            return false;
        }

        if self.original.sa_flags & libc::SA_SIGINFO != 0 {
            // SAFETY: SA_SIGINFO dispositions carry a three-argument handler
            let handler = unsafe { std::mem::transmute::<usize, SigInfoHandler>(handler) };
            handler(signo, info, context);
        } else {
            // SAFETY: plain dispositions carry a one-argument handler
            let handler = unsafe { std::mem::transmute::<usize, PlainHandler>(handler) };
            handler(signo);
        }
        true
    }
}

/// Insert-only registry of chained handler records
pub struct ChainRegistry {
    slots: [AtomicPtr<ChainedHandlerRecord>; MAX_SIGNALS],
    /// Serializes every install, including re-binding an existing record
    install_lock: Mutex<()>,
    trampoline: SigInfoHandler,
}

impl ChainRegistry {
    /// Registry whose OS-visible entry point is `trampoline`
    pub fn new(trampoline: SigInfoHandler) -> Self {
        Self {
            slots: [const { AtomicPtr::new(std::ptr::null_mut()) }; MAX_SIGNALS],
            install_lock: Mutex::new(()),
            trampoline,
        }
    }

    /// Record for `signo`; lock-free, usable from signal context
    #[inline]
    pub fn lookup(&self, signo: SignalNumber) -> Option<&ChainedHandlerRecord> {
        let slot = self.slots.get(usize::try_from(signo).ok()?)?;
        let ptr = slot.load(Ordering::Acquire);
        // SAFETY: non-null pointers come from Box::leak and are never freed
        (!ptr.is_null()).then(|| unsafe { &*ptr })
    }

    /// Numbers intercepted so far
    pub fn intercepted(&self) -> Vec<SignalNumber> {
        (0..MAX_SIGNALS as SignalNumber)
            .filter(|signo| self.lookup(*signo).is_some())
            .collect()
    }

    /// Install `handler` for `signo`, chaining whatever was there before
    ///
    /// Re-installing an already intercepted number only re-binds the runtime
    /// handler; the original disposition from the first interception is kept.
    pub fn install(
        &self,
        signo: SignalNumber,
        handler: SigInfoHandler,
        extra_flags: libc::c_int,
    ) -> SuspendResult<&ChainedHandlerRecord> {
        let _guard = self.install_lock.lock();

        // The OS table goes from the current disposition straight to the
        // trampoline; the runtime handler itself is never installed bare.
        let managed = os::siginfo_action(handler, extra_flags);
        let current = os::query_disposition(signo)?;
        let record = self.merge_locked(signo, handler, managed.sa_flags, current);

        let mut trampoline = os::siginfo_action(self.trampoline, 0);
        trampoline.sa_flags =
            managed.sa_flags | (current.sa_flags & !UNMERGEABLE_FLAGS) | libc::SA_SIGINFO;
        let displaced = os::swap_disposition(signo, &trampoline)?;
        if displaced.sa_sigaction != current.sa_sigaction {
            warn!(
                signo,
                "Disposition replaced concurrently with install; the newer handler is not chained"
            );
        }

        info!(
            signal = %signal_name(signo),
            signo,
            chained = record.original_handler() != libc::SIG_DFL,
            "Installed chained signal handler"
        );
        Ok(record)
    }

    /// Record-table half of `install`, without touching the OS
    pub fn merge(
        &self,
        signo: SignalNumber,
        handler: SigInfoHandler,
        flags: libc::c_int,
        displaced: libc::sigaction,
    ) -> &ChainedHandlerRecord {
        let _guard = self.install_lock.lock();
        self.merge_locked(signo, handler, flags, displaced)
    }

    fn merge_locked(
        &self,
        signo: SignalNumber,
        handler: SigInfoHandler,
        flags: libc::c_int,
        displaced: libc::sigaction,
    ) -> &ChainedHandlerRecord {
        let index = usize::try_from(signo)
            .ok()
            .filter(|index| *index < MAX_SIGNALS)
            .unwrap_or_else(|| crate::core::fatal::fatal("signal number outside chain table"));

        if let Some(existing) = self.lookup(signo) {
            debug!(signo, "Handler already chained, re-binding runtime handler");
            existing.rebind(handler, flags);
            return existing;
        }

        let record: &'static ChainedHandlerRecord =
            Box::leak(Box::new(ChainedHandlerRecord::new(signo, handler, flags, displaced)));
        self.slots[index].store(record as *const _ as *mut _, Ordering::Release);
        record
    }
}
