/*!
 * OS Signal Primitives
 *
 * Thin wrappers over sigaction, pthread_sigmask, sigsuspend and pthread_kill.
 * nix's typed `Signal` cannot name real-time signals, so these stay on the
 * raw libc surface and report failures through `Errno`.
 */

use crate::core::errors::{SuspendError, SuspendResult};
use crate::core::types::{NativeThreadId, SigInfoHandler, SignalNumber};
use nix::errno::Errno;
use nix::libc;
use std::mem::MaybeUninit;

/// Read the installed disposition without changing it
pub fn query_disposition(signo: SignalNumber) -> SuspendResult<libc::sigaction> {
    let mut old = MaybeUninit::<libc::sigaction>::zeroed();
    // SAFETY: null `act` only reads the current disposition into `old`
    let rc = unsafe { libc::sigaction(signo, std::ptr::null(), old.as_mut_ptr()) };
    if rc == -1 {
        return Err(sigaction_error(signo));
    }
    // SAFETY: sigaction filled `old` on success
    Ok(unsafe { old.assume_init() })
}

/// Install `new` and return the disposition it displaced
pub fn swap_disposition(
    signo: SignalNumber,
    new: &libc::sigaction,
) -> SuspendResult<libc::sigaction> {
    let mut old = MaybeUninit::<libc::sigaction>::zeroed();
    // SAFETY: both pointers reference valid sigaction storage
    let rc = unsafe { libc::sigaction(signo, new, old.as_mut_ptr()) };
    if rc == -1 {
        return Err(sigaction_error(signo));
    }
    // SAFETY: sigaction filled `old` on success
    Ok(unsafe { old.assume_init() })
}

/// Build a disposition for an `SA_SIGINFO` handler that blocks every signal
/// while it runs
pub fn siginfo_action(handler: SigInfoHandler, flags: libc::c_int) -> libc::sigaction {
    // SAFETY: an all-zero sigaction is a valid starting point
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handler as libc::sighandler_t;
    action.sa_mask = full_set();
    action.sa_flags = libc::SA_SIGINFO | flags;
    action
}

/// True when the disposition is the OS default
#[inline]
pub fn is_default(action: &libc::sigaction) -> bool {
    action.sa_sigaction == libc::SIG_DFL
}

fn sigaction_error(signo: SignalNumber) -> SuspendError {
    SuspendError::SigactionFailed {
        signo,
        reason: Errno::last().desc().to_string(),
    }
}

// =============================================================================
// Signal sets and masks
// =============================================================================

pub fn empty_set() -> libc::sigset_t {
    let mut set = MaybeUninit::<libc::sigset_t>::zeroed();
    // SAFETY: sigemptyset initializes the set
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        set.assume_init()
    }
}

pub fn full_set() -> libc::sigset_t {
    let mut set = MaybeUninit::<libc::sigset_t>::zeroed();
    // SAFETY: sigfillset initializes the set
    unsafe {
        libc::sigfillset(set.as_mut_ptr());
        set.assume_init()
    }
}

pub fn add_signal(set: &mut libc::sigset_t, signo: SignalNumber) {
    // SAFETY: `set` is initialized
    unsafe {
        libc::sigaddset(set, signo);
    }
}

pub fn remove_signal(set: &mut libc::sigset_t, signo: SignalNumber) {
    // SAFETY: `set` is initialized
    unsafe {
        libc::sigdelset(set, signo);
    }
}

pub fn contains_signal(set: &libc::sigset_t, signo: SignalNumber) -> bool {
    // SAFETY: `set` is initialized
    unsafe { libc::sigismember(set, signo) == 1 }
}

/// Block `set` on the calling thread; async-signal-safe
#[inline]
pub fn block_signals(set: &libc::sigset_t) {
    // SAFETY: valid set, old mask not requested
    unsafe {
        libc::pthread_sigmask(libc::SIG_BLOCK, set, std::ptr::null_mut());
    }
}

/// Unblock `set` on the calling thread; async-signal-safe
#[inline]
pub fn unblock_signals(set: &libc::sigset_t) {
    // SAFETY: valid set, old mask not requested
    unsafe {
        libc::pthread_sigmask(libc::SIG_UNBLOCK, set, std::ptr::null_mut());
    }
}

/// Block everything, returning the previous mask
pub fn block_all_signals() -> libc::sigset_t {
    let full = full_set();
    let mut previous = empty_set();
    // SAFETY: valid sets
    unsafe {
        libc::pthread_sigmask(libc::SIG_BLOCK, &full, &mut previous);
    }
    previous
}

pub fn restore_signal_mask(previous: &libc::sigset_t) {
    // SAFETY: valid set
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, previous, std::ptr::null_mut());
    }
}

/// Current mask of the calling thread
pub fn current_mask() -> libc::sigset_t {
    let mut current = empty_set();
    // SAFETY: null `set` only reads the mask
    unsafe {
        libc::pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), &mut current);
    }
    current
}

/// Replace the mask with `mask` and sleep until a handler runs
///
/// Always returns after a handler completes; async-signal-safe.
#[inline]
pub fn suspend_until_signal(mask: &libc::sigset_t) {
    // SAFETY: valid mask
    unsafe {
        libc::sigsuspend(mask);
    }
}

/// Direct a signal at one thread
pub fn send_signal(tid: NativeThreadId, signo: SignalNumber) -> SuspendResult<()> {
    // SAFETY: pthread_kill validates the thread handle and signal number
    let rc = unsafe { libc::pthread_kill(tid.as_raw(), signo) };
    if rc != 0 {
        return Err(SuspendError::SendFailed {
            signo,
            thread: tid.to_string(),
            reason: Errno::from_raw(rc).desc().to_string(),
        });
    }
    Ok(())
}
