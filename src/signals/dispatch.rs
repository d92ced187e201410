/*!
 * Dispatch Policy
 *
 * The one handler the OS sees for every intercepted signal number. Each
 * delivery is classified as belonging to an unknown thread, to an episode
 * claimed by the foreign runtime, or to this runtime, and routed to the
 * chained original or to the runtime handler accordingly.
 *
 * Everything here runs in asynchronous-signal context.
 */

use super::chain::ChainRegistry;
use super::set::SignalSet;
use crate::core::fatal::{fatal, handler_assert};
use crate::core::traits::{ReclamationSlots, ThreadDirectory};
use crate::core::types::{SigInfoHandler, SignalNumber, SignalRole};
use crate::monitoring::AtomicSuspendStats;
use crate::thread::{SuspendSource, ThreadRecord};
use nix::errno::Errno;
use nix::libc;

/// Who a delivery belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Thread not attached to this runtime; only the original handler runs
    UnknownThread,
    /// Attached thread, episode claimed for the foreign runtime
    External,
    /// Attached thread, this runtime's episode
    Normal,
}

impl Delivery {
    /// Classify a delivery on the calling thread
    ///
    /// `suspend_source` is published by the initiator before the signal is
    /// sent, so it is stable for the duration of the delivery.
    pub fn classify(thread: Option<&ThreadRecord>) -> Self {
        match thread {
            Some(thread) if thread.is_known() => match thread.suspend_source() {
                SuspendSource::External => Delivery::External,
                SuspendSource::Default => Delivery::Normal,
            },
            _ => Delivery::UnknownThread,
        }
    }
}

/// Saves errno on entry and puts it back on every exit path
pub struct ErrnoGuard {
    saved: i32,
}

impl ErrnoGuard {
    #[inline]
    pub fn save() -> Self {
        Self {
            saved: Errno::last_raw(),
        }
    }
}

impl Drop for ErrnoGuard {
    #[inline]
    fn drop(&mut self) {
        Errno::set_raw(self.saved);
    }
}

/// Reclamation slot held for the duration of a suspend delivery
pub struct SmrGuard<'a> {
    slots: &'a dyn ReclamationSlots,
    index: Option<usize>,
}

impl<'a> SmrGuard<'a> {
    #[inline]
    pub fn acquire(slots: &'a dyn ReclamationSlots) -> Self {
        Self {
            slots,
            index: slots.acquire_slot(),
        }
    }

    #[inline]
    pub fn index(&self) -> Option<usize> {
        self.index
    }
}

impl Drop for SmrGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        if let Some(index) = self.index {
            self.slots.release_slot(index);
        }
    }
}

/// Per-episode signal authority on one thread
///
/// The first invocation to lock `suspend_source` owns the episode's
/// bookkeeping and resets it on drop. Nested invocations on the same thread
/// leave it alone.
pub struct SignalAuthority<'a> {
    thread: &'a ThreadRecord,
    owner: bool,
}

impl<'a> SignalAuthority<'a> {
    #[inline]
    pub fn acquire(thread: &'a ThreadRecord) -> Self {
        Self {
            owner: thread.try_lock_suspend_source(),
            thread,
        }
    }

    #[inline]
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for SignalAuthority<'_> {
    #[inline]
    fn drop(&mut self) {
        if self.owner {
            self.thread.set_suspend_source(SuspendSource::Default);
            self.thread.unlock_suspend_source();
        }
    }
}

/// Runtime handlers each engine role must be bound to
#[derive(Clone, Copy)]
pub struct RoleHandlers {
    pub suspend: SigInfoHandler,
    pub restart: SigInfoHandler,
}

impl RoleHandlers {
    /// The abort signal shares the suspend handler
    #[inline]
    pub fn for_role(&self, role: SignalRole) -> SigInfoHandler {
        match role {
            SignalRole::Suspend | SignalRole::Abort => self.suspend,
            SignalRole::Restart => self.restart,
        }
    }
}

/// Borrowed view of the runtime pieces a delivery needs
pub struct DispatchPolicy<'a> {
    pub chain: &'a ChainRegistry,
    pub handlers: RoleHandlers,
    pub directory: &'a dyn ThreadDirectory,
    pub reclamation: &'a dyn ReclamationSlots,
    pub signals: &'a SignalSet,
    pub stats: &'a AtomicSuspendStats,
}

impl DispatchPolicy<'_> {
    /// Route one delivery
    pub fn deliver(
        &self,
        signo: libc::c_int,
        info: *mut libc::siginfo_t,
        context: *mut libc::c_void,
    ) {
        let _errno = ErrnoGuard::save();

        let Some(record) = self.chain.lookup(signo) else {
            fatal("signal delivered for a number that was never intercepted");
        };

        let thread = self.directory.current();
        let delivery = Delivery::classify(thread);
        let thread = match (delivery, thread) {
            (Delivery::UnknownThread, _) | (_, None) => {
                self.stats.inc_unknown_thread();
                record.invoke_original(signo, info, context);
                return;
            }
            (_, Some(thread)) => thread,
        };

        let _smr = self.reclamation_guard(signo);
        let _authority = SignalAuthority::acquire(thread);

        match delivery {
            Delivery::External | Delivery::UnknownThread => {
                self.stats.inc_external();
                record.invoke_original(signo, info, context);
            }
            Delivery::Normal => {
                handler_assert!(
                    self.signals
                        .role_of(signo)
                        .is_some_and(|role| record.is_bound_to(self.handlers.for_role(role))),
                    "wrong runtime handler bound to an engine signal"
                );
                self.stats.inc_runtime();
                record.invoke_runtime(signo, info, context);
            }
        }
    }

    fn reclamation_guard(&self, signo: SignalNumber) -> Option<SmrGuard<'_>> {
        if signo != self.signals.suspend() {
            return None;
        }
        let guard = SmrGuard::acquire(self.reclamation);
        if guard.index().is_none() {
            self.stats.inc_reclamation_exhausted();
        }
        Some(guard)
    }
}

/// OS-visible entry point for every intercepted signal number
pub extern "C" fn dispatch_trampoline(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    match crate::runtime::installed() {
        Some(runtime) => runtime.dispatch_policy().deliver(signo, info, context),
        None => fatal("signal trampoline entered before the runtime was installed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::MockReclamationSlots;
    use crate::core::types::NativeThreadId;
    use crate::suspend::HazardSlots;
    use crate::thread::ThreadRegistry;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    extern "C" fn trampoline(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {}

    // Each test uses its own signal numbers so the counters stay independent
    static RUNTIME_HITS: [AtomicUsize; 65] = [const { AtomicUsize::new(0) }; 65];
    static ORIGINAL_HITS: [AtomicUsize; 65] = [const { AtomicUsize::new(0) }; 65];

    extern "C" fn runtime_handler(signo: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
        RUNTIME_HITS[signo as usize].fetch_add(1, Ordering::SeqCst);
    }

    extern "C" fn original_handler(signo: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
        ORIGINAL_HITS[signo as usize].fetch_add(1, Ordering::SeqCst);
    }

    const HANDLERS: RoleHandlers = RoleHandlers {
        suspend: runtime_handler,
        restart: runtime_handler,
    };

    fn original() -> libc::sigaction {
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = original_handler as usize;
        action.sa_flags = libc::SA_SIGINFO;
        action
    }

    fn hits(signo: SignalNumber) -> (usize, usize) {
        (
            RUNTIME_HITS[signo as usize].load(Ordering::SeqCst),
            ORIGINAL_HITS[signo as usize].load(Ordering::SeqCst),
        )
    }

    struct Fixture {
        chain: ChainRegistry,
        registry: ThreadRegistry,
        slots: HazardSlots,
        signals: SignalSet,
        stats: AtomicSuspendStats,
    }

    impl Fixture {
        fn new(numbers: [SignalNumber; 3]) -> Self {
            let chain = ChainRegistry::new(trampoline);
            for signo in numbers {
                chain.merge(signo, runtime_handler, libc::SA_SIGINFO, original());
            }
            Self {
                chain,
                registry: ThreadRegistry::new(),
                slots: HazardSlots::new(4),
                signals: SignalSet::new(numbers),
                stats: AtomicSuspendStats::new(),
            }
        }

        fn policy_with<'a>(&'a self, reclamation: &'a dyn ReclamationSlots) -> DispatchPolicy<'a> {
            DispatchPolicy {
                chain: &self.chain,
                handlers: HANDLERS,
                directory: &self.registry,
                reclamation,
                signals: &self.signals,
                stats: &self.stats,
            }
        }

        fn deliver(&self, signo: SignalNumber) {
            self.deliver_with(&self.slots, signo);
        }

        fn deliver_with(&self, reclamation: &dyn ReclamationSlots, signo: SignalNumber) {
            self.policy_with(reclamation)
                .deliver(signo, std::ptr::null_mut(), std::ptr::null_mut());
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(Delivery::classify(None), Delivery::UnknownThread);

        let record = ThreadRecord::new(NativeThreadId::current());
        assert_eq!(Delivery::classify(Some(&record)), Delivery::UnknownThread);

        record.set_small_id(0);
        assert_eq!(Delivery::classify(Some(&record)), Delivery::Normal);

        record.set_suspend_source(SuspendSource::External);
        assert_eq!(Delivery::classify(Some(&record)), Delivery::External);
    }

    #[test]
    fn test_errno_restored() {
        Errno::set_raw(libc::EAGAIN);
        {
            let _guard = ErrnoGuard::save();
            Errno::set_raw(libc::EINTR);
        }
        assert_eq!(Errno::last_raw(), libc::EAGAIN);
    }

    #[test]
    fn test_smr_guard_releases() {
        let mut slots = MockReclamationSlots::new();
        slots.expect_acquire_slot().times(1).returning(|| Some(3));
        slots
            .expect_release_slot()
            .withf(|index| *index == 3)
            .times(1)
            .return_const(());

        let guard = SmrGuard::acquire(&slots);
        assert_eq!(guard.index(), Some(3));
    }

    #[test]
    fn test_smr_guard_without_slot() {
        let mut slots = MockReclamationSlots::new();
        slots.expect_acquire_slot().times(1).returning(|| None);
        slots.expect_release_slot().never();

        let _guard = SmrGuard::acquire(&slots);
    }

    #[test]
    fn test_unknown_thread_gets_original_only() {
        let fixture = Fixture::new([42, 43, 44]);
        let before = hits(42);

        fixture.deliver(42);

        assert_eq!(hits(42), (before.0, before.1 + 1));
        assert_eq!(fixture.stats.snapshot().unknown_thread_deliveries, 1);
        assert_eq!(fixture.slots.in_use(), 0);
    }

    #[test]
    fn test_attached_thread_routing() {
        let fixture = Arc::new(Fixture::new([45, 46, 47]));
        let fx = fixture.clone();

        thread::spawn(move || {
            let record = fx.registry.attach().unwrap();

            let before = hits(46);
            fx.deliver(46);
            assert_eq!(hits(46), (before.0 + 1, before.1));

            record.set_suspend_source(SuspendSource::External);
            let before = hits(46);
            fx.deliver(46);
            assert_eq!(hits(46), (before.0, before.1 + 1));

            // The authority reset the episode on exit
            assert_eq!(record.suspend_source(), SuspendSource::Default);
            assert!(!record.is_suspend_source_locked());

            fx.registry.detach().unwrap();
        })
        .join()
        .unwrap();

        let stats = fixture.stats.snapshot();
        assert_eq!(stats.runtime_deliveries, 1);
        assert_eq!(stats.external_deliveries, 1);
    }

    #[test]
    fn test_nested_delivery_keeps_episode() {
        let fixture = Arc::new(Fixture::new([48, 49, 50]));
        let fx = fixture.clone();

        thread::spawn(move || {
            let record = fx.registry.attach().unwrap();
            record.set_suspend_source(SuspendSource::External);

            let outer = SignalAuthority::acquire(&record);
            assert!(outer.is_owner());

            fx.deliver(49);
            assert_eq!(record.suspend_source(), SuspendSource::External);
            assert!(record.is_suspend_source_locked());

            drop(outer);
            assert_eq!(record.suspend_source(), SuspendSource::Default);
            assert!(!record.is_suspend_source_locked());

            fx.registry.detach().unwrap();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_only_suspend_delivery_takes_reclamation_slot() {
        let fixture = Arc::new(Fixture::new([51, 52, 53]));
        let fx = fixture.clone();

        thread::spawn(move || {
            fx.registry.attach().unwrap();

            let mut suspend_slots = MockReclamationSlots::new();
            suspend_slots.expect_acquire_slot().times(1).returning(|| Some(2));
            suspend_slots
                .expect_release_slot()
                .withf(|index| *index == 2)
                .times(1)
                .return_const(());
            fx.deliver_with(&suspend_slots, 51);
            suspend_slots.checkpoint();

            let mut other_slots = MockReclamationSlots::new();
            other_slots.expect_acquire_slot().never();
            other_slots.expect_release_slot().never();
            fx.deliver_with(&other_slots, 52);
            fx.deliver_with(&other_slots, 53);

            fx.registry.detach().unwrap();
        })
        .join()
        .unwrap();

        let stats = fixture.stats.snapshot();
        assert_eq!(stats.runtime_deliveries, 3);
        assert_eq!(stats.reclamation_exhausted, 0);
    }

    #[test]
    fn test_exhausted_reclamation_is_counted() {
        let fixture = Arc::new(Fixture::new([54, 55, 56]));
        let fx = fixture.clone();

        thread::spawn(move || {
            fx.registry.attach().unwrap();

            let mut slots = MockReclamationSlots::new();
            slots.expect_acquire_slot().times(1).returning(|| None);
            slots.expect_release_slot().never();
            let before = hits(54);
            fx.deliver_with(&slots, 54);
            assert_eq!(hits(54), (before.0 + 1, before.1));

            fx.registry.detach().unwrap();
        })
        .join()
        .unwrap();

        assert_eq!(fixture.stats.snapshot().reclamation_exhausted, 1);
    }

    #[test]
    fn test_role_handlers_match_bound_records() {
        extern "C" fn restart_only(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {}

        let handlers = RoleHandlers {
            suspend: runtime_handler,
            restart: restart_only,
        };
        assert_eq!(handlers.for_role(SignalRole::Abort) as usize, runtime_handler as usize);
        assert_eq!(handlers.for_role(SignalRole::Restart) as usize, restart_only as usize);

        let fixture = Fixture::new([57, 58, 59]);
        let suspend = fixture.chain.lookup(57).unwrap();
        assert!(suspend.is_bound_to(handlers.for_role(SignalRole::Suspend)));

        // A restart number still carrying the suspend handler is misbound
        let restart = fixture.chain.lookup(58).unwrap();
        assert!(!restart.is_bound_to(handlers.for_role(SignalRole::Restart)));
        fixture.chain.merge(58, restart_only, libc::SA_SIGINFO, original());
        assert!(restart.is_bound_to(handlers.for_role(SignalRole::Restart)));
    }

    proptest! {
        #[test]
        fn prop_only_outermost_authority_resets(depth in 1usize..8, external in any::<bool>()) {
            let record = ThreadRecord::new(NativeThreadId::current());
            record.set_small_id(0);
            let source = if external { SuspendSource::External } else { SuspendSource::Default };
            record.set_suspend_source(source);

            let mut stack = Vec::with_capacity(depth);
            for level in 0..depth {
                let authority = SignalAuthority::acquire(&record);
                prop_assert_eq!(authority.is_owner(), level == 0);
                stack.push(authority);
            }

            // Unwind every nested invocation; the episode survives each one
            while stack.len() > 1 {
                drop(stack.pop());
                prop_assert!(record.is_suspend_source_locked());
                prop_assert_eq!(record.suspend_source(), source);
            }

            drop(stack.pop());
            prop_assert!(!record.is_suspend_source_locked());
            prop_assert_eq!(record.suspend_source(), SuspendSource::Default);
        }
    }
}
