/*!
 * Lock-Free Suspend Statistics
 * Atomic counters bumped from signal handlers, snapshotted from ordinary code
 */

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendStats {
    /// Deliveries to threads not attached to this runtime
    pub unknown_thread_deliveries: u64,
    /// Deliveries routed to the chained handler by an external episode
    pub external_deliveries: u64,
    /// Deliveries handled by this runtime's own handlers
    pub runtime_deliveries: u64,
    pub suspend_requests: u64,
    pub suspend_acks: u64,
    pub resume_acks: u64,
    pub capture_failures: u64,
    pub self_suspend_races: u64,
    pub syscall_aborts: u64,
    pub async_calls_installed: u64,
    /// Suspend deliveries that found every reclamation slot taken
    pub reclamation_exhausted: u64,
    pub reloads: u64,
}

/// Atomic suspend statistics for lock-free updates
///
/// # Performance
/// - Cache-line aligned to prevent false sharing
/// - All operations use relaxed ordering; increments are async-signal-safe
#[repr(C, align(64))]
pub struct AtomicSuspendStats {
    unknown_thread_deliveries: AtomicU64,
    external_deliveries: AtomicU64,
    runtime_deliveries: AtomicU64,
    suspend_requests: AtomicU64,
    suspend_acks: AtomicU64,
    resume_acks: AtomicU64,
    capture_failures: AtomicU64,
    self_suspend_races: AtomicU64,
    syscall_aborts: AtomicU64,
    async_calls_installed: AtomicU64,
    reclamation_exhausted: AtomicU64,
    reloads: AtomicU64,
}

macro_rules! counters {
    ($($inc:ident => $field:ident),* $(,)?) => {
        $(
            #[inline(always)]
            pub fn $inc(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl AtomicSuspendStats {
    #[inline]
    pub const fn new() -> Self {
        Self {
            unknown_thread_deliveries: AtomicU64::new(0),
            external_deliveries: AtomicU64::new(0),
            runtime_deliveries: AtomicU64::new(0),
            suspend_requests: AtomicU64::new(0),
            suspend_acks: AtomicU64::new(0),
            resume_acks: AtomicU64::new(0),
            capture_failures: AtomicU64::new(0),
            self_suspend_races: AtomicU64::new(0),
            syscall_aborts: AtomicU64::new(0),
            async_calls_installed: AtomicU64::new(0),
            reclamation_exhausted: AtomicU64::new(0),
            reloads: AtomicU64::new(0),
        }
    }

    counters! {
        inc_unknown_thread => unknown_thread_deliveries,
        inc_external => external_deliveries,
        inc_runtime => runtime_deliveries,
        inc_suspend_requests => suspend_requests,
        inc_suspend_acks => suspend_acks,
        inc_resume_acks => resume_acks,
        inc_capture_failures => capture_failures,
        inc_self_suspend_races => self_suspend_races,
        inc_syscall_aborts => syscall_aborts,
        inc_async_calls => async_calls_installed,
        inc_reclamation_exhausted => reclamation_exhausted,
        inc_reloads => reloads,
    }

    /// Get snapshot of current stats (no locks required)
    ///
    /// # Note
    /// Counters are read one at a time and may be mutually inconsistent
    /// while deliveries are in flight.
    pub fn snapshot(&self) -> SuspendStats {
        SuspendStats {
            unknown_thread_deliveries: self.unknown_thread_deliveries.load(Ordering::Relaxed),
            external_deliveries: self.external_deliveries.load(Ordering::Relaxed),
            runtime_deliveries: self.runtime_deliveries.load(Ordering::Relaxed),
            suspend_requests: self.suspend_requests.load(Ordering::Relaxed),
            suspend_acks: self.suspend_acks.load(Ordering::Relaxed),
            resume_acks: self.resume_acks.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            self_suspend_races: self.self_suspend_races.load(Ordering::Relaxed),
            syscall_aborts: self.syscall_aborts.load(Ordering::Relaxed),
            async_calls_installed: self.async_calls_installed.load(Ordering::Relaxed),
            reclamation_exhausted: self.reclamation_exhausted.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
        }
    }
}

impl Default for AtomicSuspendStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_snapshot_reflects_increments() {
        let stats = AtomicSuspendStats::new();
        stats.inc_suspend_acks();
        stats.inc_suspend_acks();
        stats.inc_resume_acks();
        stats.inc_unknown_thread();

        assert_eq!(
            stats.snapshot(),
            SuspendStats {
                suspend_acks: 2,
                resume_acks: 1,
                unknown_thread_deliveries: 1,
                ..SuspendStats::default()
            }
        );
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = AtomicSuspendStats::new();
        stats.inc_reloads();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["reloads"], 1);
        assert_eq!(json["capture_failures"], 0);
    }
}
