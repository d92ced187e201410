/*!
 * Handler Chaining Tests
 * Displaced handlers keep receiving signals the runtime does not own
 */

#![cfg(target_os = "linux")]

mod common;

use common::runtime_with;
use nix::libc;
use pretty_assertions::assert_eq;
use serial_test::serial;
use signal_suspend::signals::{dispatch_trampoline, os};
use signal_suspend::thread::SuspendSource;
use signal_suspend::{reload_signal_handlers, NativeThreadId, SignalRuntime, SuspendConfig};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Once};
use std::thread;

static FOREIGN_HITS: AtomicUsize = AtomicUsize::new(0);
static INTRUDER_HITS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn foreign_handler(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    FOREIGN_HITS.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn intruder_handler(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    INTRUDER_HITS.fetch_add(1, Ordering::SeqCst);
}

fn numbers() -> [libc::c_int; 3] {
    let base = libc::SIGRTMIN();
    [base + 5, base + 6, base + 7]
}

fn install_raw(signo: libc::c_int, handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void)) {
    let action = os::siginfo_action(handler, 0);
    let rc = unsafe { libc::sigaction(signo, &action, ptr::null_mut()) };
    assert_eq!(rc, 0);
}

/// Foreign runtime claims the restart number before the engine starts
fn fixture() -> &'static SignalRuntime {
    static FOREIGN_FIRST: Once = Once::new();
    let [suspend, restart, abort] = numbers();
    FOREIGN_FIRST.call_once(|| install_raw(restart, foreign_handler));
    runtime_with(SuspendConfig::hybrid().with_signals(suspend, restart, abort))
}

fn raise_here(signo: libc::c_int) {
    os::send_signal(NativeThreadId::current(), signo).unwrap();
}

fn on_fresh_thread<R: Send + 'static>(f: impl FnOnce() -> R + Send + 'static) -> R {
    thread::spawn(f).join().unwrap()
}

#[test]
#[serial]
fn test_trampoline_installed_over_foreign_handler() {
    let runtime = fixture();
    let [suspend, restart, abort] = numbers();

    assert_eq!(runtime.chain().intercepted(), vec![suspend, restart, abort]);
    for signo in numbers() {
        let action = os::query_disposition(signo).unwrap();
        assert_eq!(action.sa_sigaction, dispatch_trampoline as usize);
    }

    let record = runtime.chain().lookup(restart).unwrap();
    assert_eq!(record.original_handler(), foreign_handler as usize);
    assert_eq!(
        runtime.chain().lookup(suspend).unwrap().original_handler(),
        libc::SIG_DFL
    );
}

#[test]
#[serial]
fn test_unattached_thread_reaches_foreign_handler() {
    let runtime = fixture();
    let restart = numbers()[1];
    let hits = FOREIGN_HITS.load(Ordering::SeqCst);
    let unknown = runtime.stats().unknown_thread_deliveries;

    on_fresh_thread(move || raise_here(restart));

    assert_eq!(FOREIGN_HITS.load(Ordering::SeqCst), hits + 1);
    assert_eq!(runtime.stats().unknown_thread_deliveries, unknown + 1);
}

#[test]
#[serial]
fn test_attached_thread_stays_with_runtime() {
    let runtime = fixture();
    let restart = numbers()[1];
    let hits = FOREIGN_HITS.load(Ordering::SeqCst);
    let delivered = runtime.stats().runtime_deliveries;

    on_fresh_thread(move || {
        runtime.attach_current_thread().unwrap();
        raise_here(restart);
        runtime.detach_current_thread().unwrap();
    });

    assert_eq!(FOREIGN_HITS.load(Ordering::SeqCst), hits);
    assert_eq!(runtime.stats().runtime_deliveries, delivered + 1);
}

#[test]
#[serial]
fn test_external_episode_forwarded_then_reset() {
    let runtime = fixture();
    let restart = numbers()[1];
    let hits = FOREIGN_HITS.load(Ordering::SeqCst);
    let external = runtime.stats().external_deliveries;

    let source_after = on_fresh_thread(move || {
        let record = runtime.attach_current_thread().unwrap();
        runtime.coordinator().mark_external_suspend(&record);
        raise_here(restart);
        let source = record.suspend_source();
        let locked = record.is_suspend_source_locked();
        runtime.detach_current_thread().unwrap();
        (source, locked)
    });

    assert_eq!(FOREIGN_HITS.load(Ordering::SeqCst), hits + 1);
    assert_eq!(runtime.stats().external_deliveries, external + 1);
    assert_eq!(source_after, (SuspendSource::Default, false));
}

#[test]
#[serial]
fn test_reload_after_overwrite_keeps_first_original() {
    let runtime = fixture();
    let restart = numbers()[1];

    install_raw(restart, intruder_handler);
    assert_eq!(
        os::query_disposition(restart).unwrap().sa_sigaction,
        intruder_handler as usize
    );

    reload_signal_handlers().unwrap();

    assert_eq!(
        os::query_disposition(restart).unwrap().sa_sigaction,
        dispatch_trampoline as usize
    );
    assert_eq!(
        runtime.chain().lookup(restart).unwrap().original_handler(),
        foreign_handler as usize
    );
    assert_eq!(runtime.chain().intercepted().len(), 3);

    let hits = FOREIGN_HITS.load(Ordering::SeqCst);
    let intruder = INTRUDER_HITS.load(Ordering::SeqCst);
    on_fresh_thread(move || raise_here(restart));
    assert_eq!(FOREIGN_HITS.load(Ordering::SeqCst), hits + 1);
    assert_eq!(INTRUDER_HITS.load(Ordering::SeqCst), intruder);
}

#[test]
#[serial]
fn test_reload_keeps_trampoline_visible() {
    const RELOADS: usize = 2_000;

    fixture();
    let started = Arc::new(Barrier::new(2));
    let done = Arc::new(AtomicBool::new(false));

    let watcher = {
        let started = started.clone();
        let done = done.clone();
        thread::spawn(move || {
            started.wait();
            let mut other_seen = 0usize;
            let mut polls = 0usize;
            loop {
                for signo in numbers() {
                    let action = os::query_disposition(signo).unwrap();
                    if action.sa_sigaction != dispatch_trampoline as usize {
                        other_seen += 1;
                    }
                }
                polls += 1;
                if done.load(Ordering::SeqCst) {
                    return (other_seen, polls);
                }
            }
        })
    };

    started.wait();
    for _ in 0..RELOADS {
        reload_signal_handlers().unwrap();
    }
    done.store(true, Ordering::SeqCst);

    let (other_seen, polls) = watcher.join().unwrap();
    assert!(polls > 0);
    assert_eq!(other_seen, 0);
}
