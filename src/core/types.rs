/*!
 * Core Types
 * Common types used across the suspend engine
 */

use nix::libc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw signal number as understood by the OS
pub type SignalNumber = libc::c_int;

/// Dense per-thread identifier handed out by the thread registry
pub type SmallId = i32;

/// Sentinel small id for threads that are not attached to this runtime
pub const UNKNOWN_SMALL_ID: SmallId = -1;

/// Raw handler entry point with the `SA_SIGINFO` signature
pub type SigInfoHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Handler signature without `SA_SIGINFO`
pub type PlainHandler = extern "C" fn(libc::c_int);

/// Native (pthread) thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeThreadId(pub libc::pthread_t);

impl NativeThreadId {
    /// Identifier of the calling thread
    #[inline]
    pub fn current() -> Self {
        // SAFETY: pthread_self has no preconditions and is async-signal-safe
        Self(unsafe { libc::pthread_self() })
    }

    #[inline]
    pub fn as_raw(self) -> libc::pthread_t {
        self.0
    }
}

impl fmt::Display for NativeThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0 as u64)
    }
}

/// Which of the three engine signals a number plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalRole {
    Suspend,
    Restart,
    Abort,
}

impl SignalRole {
    pub const ALL: [SignalRole; 3] = [SignalRole::Suspend, SignalRole::Restart, SignalRole::Abort];

    #[inline]
    pub const fn index(self) -> usize {
        match self {
            SignalRole::Suspend => 0,
            SignalRole::Restart => 1,
            SignalRole::Abort => 2,
        }
    }
}

impl fmt::Display for SignalRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalRole::Suspend => "suspend",
            SignalRole::Restart => "restart",
            SignalRole::Abort => "abort",
        };
        f.write_str(name)
    }
}

/// Human readable name for log lines ("SIGXCPU", "SIGRT+3", ...)
pub fn signal_name(signo: SignalNumber) -> String {
    if let Ok(sig) = nix::sys::signal::Signal::try_from(signo) {
        return sig.as_str().to_string();
    }
    #[cfg(target_os = "linux")]
    {
        let base = libc::SIGRTMIN();
        if signo >= base && signo <= libc::SIGRTMAX() {
            return format!("SIGRTMIN+{}", signo - base);
        }
    }
    format!("signal {}", signo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_indices_are_dense() {
        let indices: Vec<usize> = SignalRole::ALL.iter().map(|r| r.index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_signal_name() {
        assert_eq!(signal_name(libc::SIGXCPU), "SIGXCPU");
        #[cfg(target_os = "linux")]
        assert_eq!(signal_name(libc::SIGRTMIN() + 2), "SIGRTMIN+2");
    }
}
