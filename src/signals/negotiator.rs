/*!
 * Signal Number Negotiator
 *
 * Picks the suspend, restart and abort signal numbers from a per-platform
 * policy table. Where the platform exposes a real-time range the numbers are
 * found by scanning for a disposition that is still the OS default.
 */

use super::os;
use crate::core::errors::{SuspendError, SuspendResult};
use crate::core::types::{SignalNumber, SignalRole};
use nix::libc;
use std::sync::OnceLock;
use tracing::debug;

/// How one role gets its number on a platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalChoice {
    /// Always this number
    Fixed(SignalNumber),
    /// First default-disposition number above the real-time base
    ScanRealtime,
}

/// Platform policy table row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformPolicy {
    pub suspend: SignalChoice,
    pub restart: SignalChoice,
    pub abort: SignalChoice,
    /// Resolved numbers must stay strictly below this, when set
    pub limit: Option<SignalNumber>,
}

impl PlatformPolicy {
    /// Policy for the compilation target
    ///
    /// Any target with a real-time range scans it, except where the range is
    /// unusable (Android) or the platform pins the numbers (OpenBSD).
    pub fn current() -> Self {
        #[cfg(target_os = "android")]
        {
            Self::fixed(libc::SIGPWR, libc::SIGXCPU, libc::SIGTTIN)
                .with_limit(crate::core::limits::ANDROID_SIGNAL_LIMIT)
        }
        #[cfg(target_os = "openbsd")]
        {
            Self::fixed(libc::SIGXFSZ, libc::SIGXCPU, libc::SIGUSR1)
        }
        #[cfg(not(any(target_os = "android", target_os = "openbsd")))]
        {
            match realtime_range() {
                Some(_) => Self::scan_realtime(),
                None => Self::fixed(libc::SIGXFSZ, libc::SIGXCPU, libc::SIGTTIN),
            }
        }
    }

    pub const fn fixed(suspend: SignalNumber, restart: SignalNumber, abort: SignalNumber) -> Self {
        Self {
            suspend: SignalChoice::Fixed(suspend),
            restart: SignalChoice::Fixed(restart),
            abort: SignalChoice::Fixed(abort),
            limit: None,
        }
    }

    pub const fn scan_realtime() -> Self {
        Self {
            suspend: SignalChoice::ScanRealtime,
            restart: SignalChoice::ScanRealtime,
            abort: SignalChoice::ScanRealtime,
            limit: None,
        }
    }

    pub const fn with_limit(mut self, limit: SignalNumber) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn choice(&self, role: SignalRole) -> SignalChoice {
        match role {
            SignalRole::Suspend => self.suspend,
            SignalRole::Restart => self.restart,
            SignalRole::Abort => self.abort,
        }
    }
}

/// Inclusive real-time range, when the platform has one
pub fn realtime_range() -> Option<(SignalNumber, SignalNumber)> {
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "illumos",
        target_os = "solaris",
        target_os = "hurd"
    ))]
    {
        Some((libc::SIGRTMIN(), libc::SIGRTMAX()))
    }
    #[cfg(target_os = "aix")]
    {
        Some((libc::SIGRTMIN, libc::SIGRTMAX))
    }
    // <sys/signal.h>; not exported by libc
    #[cfg(target_os = "freebsd")]
    {
        Some((65, 126))
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "illumos",
        target_os = "solaris",
        target_os = "hurd",
        target_os = "aix",
        target_os = "freebsd"
    )))]
    {
        None
    }
}

/// Answers "is this number still at its OS default disposition?"
pub trait DispositionProbe {
    fn is_default(&self, signo: SignalNumber) -> bool;
}

/// Probe backed by `sigaction` queries
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProbe;

impl DispositionProbe for OsProbe {
    fn is_default(&self, signo: SignalNumber) -> bool {
        os::query_disposition(signo)
            .map(|action| os::is_default(&action))
            .unwrap_or(false)
    }
}

impl<F: Fn(SignalNumber) -> bool> DispositionProbe for F {
    fn is_default(&self, signo: SignalNumber) -> bool {
        self(signo)
    }
}

/// First default-disposition number in `(base, max)`, skipping `taken`
///
/// The base number itself is skipped: some C libraries reserve it.
pub fn scan_for_unused<P: DispositionProbe + ?Sized>(
    probe: &P,
    range: (SignalNumber, SignalNumber),
    taken: &[SignalNumber],
) -> Option<SignalNumber> {
    let (base, max) = range;
    ((base + 1)..max).find(|signo| !taken.contains(signo) && probe.is_default(*signo))
}

/// Memoizing per-role resolver
pub struct SignalNegotiator<P: DispositionProbe = OsProbe> {
    policy: PlatformPolicy,
    range: Option<(SignalNumber, SignalNumber)>,
    probe: P,
    resolved: [OnceLock<SignalNumber>; 3],
}

impl SignalNegotiator<OsProbe> {
    pub fn new() -> Self {
        Self::with_probe(PlatformPolicy::current(), realtime_range(), OsProbe)
    }
}

impl Default for SignalNegotiator<OsProbe> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: DispositionProbe> SignalNegotiator<P> {
    pub fn with_probe(
        policy: PlatformPolicy,
        range: Option<(SignalNumber, SignalNumber)>,
        probe: P,
    ) -> Self {
        Self {
            policy,
            range,
            probe,
            resolved: [OnceLock::new(), OnceLock::new(), OnceLock::new()],
        }
    }

    /// Number for `role`; computed once, then cached
    ///
    /// Scans skip numbers already resolved for other roles so the three
    /// stay pairwise distinct.
    pub fn resolve(&self, role: SignalRole) -> SuspendResult<SignalNumber> {
        if let Some(signo) = self.resolved[role.index()].get() {
            return Ok(*signo);
        }

        let taken: Vec<SignalNumber> = SignalRole::ALL
            .iter()
            .filter(|other| **other != role)
            .filter_map(|other| self.resolved[other.index()].get().copied())
            .collect();

        let signo = match self.policy.choice(role) {
            SignalChoice::Fixed(signo) => signo,
            SignalChoice::ScanRealtime => {
                let range = self.range.ok_or(SuspendError::UnsupportedPlatform(role))?;
                scan_for_unused(&self.probe, range, &taken)
                    .ok_or(SuspendError::NoAvailableSignal(role))?
            }
        };

        if taken.contains(&signo) {
            return Err(SuspendError::DuplicateSignal(signo));
        }
        check_limit(role, signo, self.policy.limit)?;

        debug!(%role, signo, "Resolved signal number");
        Ok(*self.resolved[role.index()].get_or_init(|| signo))
    }

    /// Resolve all three roles in suspend, restart, abort order
    pub fn resolve_all(&self) -> SuspendResult<[SignalNumber; 3]> {
        Ok([
            self.resolve(SignalRole::Suspend)?,
            self.resolve(SignalRole::Restart)?,
            self.resolve(SignalRole::Abort)?,
        ])
    }
}

/// Validate embedder-chosen numbers against the same rules
pub fn validate_explicit(
    numbers: [SignalNumber; 3],
    limit: Option<SignalNumber>,
) -> SuspendResult<[SignalNumber; 3]> {
    for (i, role) in SignalRole::ALL.iter().enumerate() {
        check_limit(*role, numbers[i], limit)?;
        if numbers[..i].contains(&numbers[i]) {
            return Err(SuspendError::DuplicateSignal(numbers[i]));
        }
    }
    Ok(numbers)
}

fn check_limit(
    role: SignalRole,
    signo: SignalNumber,
    limit: Option<SignalNumber>,
) -> SuspendResult<()> {
    match limit {
        Some(limit) if signo >= limit => Err(SuspendError::SignalOutOfRange { role, signo, limit }),
        _ => Ok(()),
    }
}
