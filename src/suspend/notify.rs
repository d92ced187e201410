/*!
 * Initiator Notification
 *
 * Semaphore-backed handshake between a suspend initiator and its target.
 * `sem_post` is async-signal-safe, which makes unnamed POSIX semaphores the
 * one blocking primitive a signal handler can signal through.
 */

use crate::core::traits::InitiatorNotifier;
use crate::thread::ThreadRecord;
use nix::errno::Errno;
use nix::libc;
use std::cell::UnsafeCell;

/// Unnamed process-private POSIX semaphore
pub struct PosixSemaphore {
    inner: Box<UnsafeCell<libc::sem_t>>,
}

// SAFETY: sem_* functions are thread-safe on a stable address; the Box keeps
// the semaphore from moving.
unsafe impl Send for PosixSemaphore {}
unsafe impl Sync for PosixSemaphore {}

impl PosixSemaphore {
    pub fn new(initial: u32) -> Self {
        // SAFETY: sem_t is plain data, initialized by sem_init below
        let inner: Box<UnsafeCell<libc::sem_t>> = Box::new(UnsafeCell::new(unsafe { std::mem::zeroed() }));
        // SAFETY: fresh, exclusively owned storage
        let rc = unsafe { libc::sem_init(inner.get(), 0, initial) };
        if rc != 0 {
            crate::core::fatal::fatal("sem_init failed");
        }
        Self { inner }
    }

    /// Async-signal-safe
    #[inline]
    pub fn post(&self) {
        // SAFETY: initialized in `new`, destroyed only on drop
        unsafe {
            libc::sem_post(self.inner.get());
        }
    }

    /// Block until posted, retrying when interrupted by a signal
    pub fn wait(&self) {
        loop {
            // SAFETY: initialized in `new`, destroyed only on drop
            let rc = unsafe { libc::sem_wait(self.inner.get()) };
            if rc == 0 || Errno::last() != Errno::EINTR {
                return;
            }
        }
    }

    /// Non-blocking decrement; true when a post was consumed
    pub fn try_wait(&self) -> bool {
        // SAFETY: initialized in `new`, destroyed only on drop
        unsafe { libc::sem_trywait(self.inner.get()) == 0 }
    }
}

impl Drop for PosixSemaphore {
    fn drop(&mut self) {
        // SAFETY: no waiters remain once the owner is dropped
        unsafe {
            libc::sem_destroy(self.inner.get());
        }
    }
}

/// Per-thread handshake semaphores
pub struct Handshake {
    pub(crate) suspended: PosixSemaphore,
    pub(crate) resumed: PosixSemaphore,
    pub(crate) aborted: PosixSemaphore,
    /// Wakes a thread parked in the cooperative self-suspend path
    pub(crate) self_resume: PosixSemaphore,
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            suspended: PosixSemaphore::new(0),
            resumed: PosixSemaphore::new(0),
            aborted: PosixSemaphore::new(0),
            self_resume: PosixSemaphore::new(0),
        }
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Default notifier posting to the target record's handshake
#[derive(Debug, Default, Clone, Copy)]
pub struct SemaphoreNotifier;

impl SemaphoreNotifier {
    pub fn new() -> Self {
        Self
    }
}

impl InitiatorNotifier for SemaphoreNotifier {
    fn notify_suspend(&self, thread: &ThreadRecord) {
        thread.handshake().suspended.post();
    }

    fn notify_resume(&self, thread: &ThreadRecord) {
        thread.handshake().resumed.post();
    }

    fn notify_abort(&self, thread: &ThreadRecord) {
        thread.handshake().aborted.post();
    }

    fn wait_suspend(&self, thread: &ThreadRecord) {
        thread.handshake().suspended.wait();
    }

    fn wait_resume(&self, thread: &ThreadRecord) {
        thread.handshake().resumed.wait();
    }

    fn wait_abort(&self, thread: &ThreadRecord) {
        thread.handshake().aborted.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::NativeThreadId;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_semaphore_post_then_wait() {
        let sem = PosixSemaphore::new(0);
        assert!(!sem.try_wait());
        sem.post();
        sem.post();
        assert!(sem.try_wait());
        sem.wait();
        assert!(!sem.try_wait());
    }

    #[test]
    fn test_semaphore_cross_thread_wake() {
        let sem = Arc::new(PosixSemaphore::new(0));
        let poster = sem.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            poster.post();
        });

        sem.wait();
        handle.join().unwrap();
    }

    #[test]
    fn test_notifier_channels_are_independent() {
        let record = ThreadRecord::new(NativeThreadId::current());
        let notifier = SemaphoreNotifier::new();

        notifier.notify_resume(&record);
        assert!(!record.handshake().suspended.try_wait());
        assert!(!record.handshake().aborted.try_wait());

        notifier.wait_resume(&record);
        notifier.notify_suspend(&record);
        notifier.wait_suspend(&record);
        notifier.notify_abort(&record);
        notifier.wait_abort(&record);
    }
}
