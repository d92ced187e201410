/*!
 * Thread Registry
 *
 * Default attach/detach registry. Initiators look threads up through a
 * sharded map; signal handlers find their own record through a
 * const-initialized thread-local, which is a plain TLS load and safe to read
 * from signal context.
 */

use super::record::{Lifecycle, ThreadRecord};
use crate::core::errors::{SuspendError, SuspendResult};
use crate::core::traits::ThreadDirectory;
use crate::core::types::{NativeThreadId, SmallId, UNKNOWN_SMALL_ID};
use crate::signals::os;
use ahash::RandomState;
use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use std::cell::Cell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

thread_local! {
    static CURRENT: Cell<*const ThreadRecord> = const { Cell::new(std::ptr::null()) };
}

fn current_ptr() -> *const ThreadRecord {
    CURRENT.try_with(|slot| slot.get()).unwrap_or(std::ptr::null())
}

/// Registry of threads attached to this runtime
pub struct ThreadRegistry {
    threads: DashMap<NativeThreadId, Arc<ThreadRecord>, RandomState>,
    /// Small ids released by detached threads
    free_ids: SegQueue<SmallId>,
    next_id: AtomicI32,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            threads: DashMap::with_hasher(RandomState::new()),
            free_ids: SegQueue::new(),
            next_id: AtomicI32::new(0),
        }
    }

    /// Attach the calling thread
    pub fn attach(&self) -> SuspendResult<Arc<ThreadRecord>> {
        if !current_ptr().is_null() {
            return Err(SuspendError::ThreadAlreadyAttached);
        }

        let tid = NativeThreadId::current();
        let record = Arc::new(ThreadRecord::new(tid));
        let small_id = self
            .free_ids
            .pop()
            .unwrap_or_else(|| self.next_id.fetch_add(1, Ordering::Relaxed));

        record.set_small_id(small_id);
        self.threads.insert(tid, record.clone());
        CURRENT.with(|slot| slot.set(Arc::as_ptr(&record)));
        record.set_lifecycle(Lifecycle::Attached);

        info!(tid = %tid, small_id, "Thread attached");
        Ok(record)
    }

    /// Detach the calling thread
    ///
    /// All signals stay blocked while the thread-local is cleared so no
    /// handler observes a half torn down record.
    pub fn detach(&self) -> SuspendResult<()> {
        let tid = NativeThreadId::current();
        let record = self
            .threads
            .get(&tid)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SuspendError::ThreadNotAttached(tid.to_string()))?;

        record.set_lifecycle(Lifecycle::Detaching);

        let previous = os::block_all_signals();
        CURRENT.with(|slot| slot.set(std::ptr::null()));
        let small_id = record.small_id();
        record.set_small_id(UNKNOWN_SMALL_ID);
        self.threads.remove(&tid);
        os::restore_signal_mask(&previous);

        if small_id != UNKNOWN_SMALL_ID {
            self.free_ids.push(small_id);
        }
        debug!(tid = %tid, small_id, "Thread detached");
        Ok(())
    }

    /// Record for the calling thread, if attached
    pub fn current_record(&self) -> Option<Arc<ThreadRecord>> {
        self.lookup(NativeThreadId::current())
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Snapshot of attached records
    pub fn records(&self) -> Vec<Arc<ThreadRecord>> {
        self.threads.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadDirectory for ThreadRegistry {
    fn current(&self) -> Option<&ThreadRecord> {
        let ptr = current_ptr();
        // SAFETY: the pointer is set from an Arc held in `threads` and cleared
        // (with signals blocked) before that Arc is released.
        (!ptr.is_null()).then(|| unsafe { &*ptr })
    }

    fn lookup(&self, tid: NativeThreadId) -> Option<Arc<ThreadRecord>> {
        self.threads.get(&tid).map(|entry| entry.value().clone())
    }

    fn small_id(&self, tid: NativeThreadId) -> Option<SmallId> {
        self.threads
            .get(&tid)
            .map(|entry| entry.value().small_id())
            .filter(|&id| id != UNKNOWN_SMALL_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_attach_detach_roundtrip() {
        let registry = Arc::new(ThreadRegistry::new());
        let reg = registry.clone();

        thread::spawn(move || {
            assert!(reg.current().is_none());

            let record = reg.attach().unwrap();
            assert!(record.is_known());
            assert_eq!(record.lifecycle(), Lifecycle::Attached);
            assert_eq!(reg.current().map(|r| r.tid()), Some(record.tid()));
            assert_eq!(reg.small_id(record.tid()), Some(record.small_id()));

            assert!(matches!(reg.attach(), Err(SuspendError::ThreadAlreadyAttached)));

            reg.detach().unwrap();
            assert!(reg.current().is_none());
            assert!(!record.is_known());
            assert_eq!(record.lifecycle(), Lifecycle::Detaching);
            assert!(reg.lookup(record.tid()).is_none());
        })
        .join()
        .unwrap();

        assert!(registry.is_empty());
    }

    #[test]
    fn test_detach_unattached_thread_fails() {
        let registry = ThreadRegistry::new();
        thread::spawn(move || {
            assert!(matches!(registry.detach(), Err(SuspendError::ThreadNotAttached(_))));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_small_ids_are_recycled() {
        let registry = Arc::new(ThreadRegistry::new());

        let first = {
            let reg = registry.clone();
            thread::spawn(move || {
                let id = reg.attach().unwrap().small_id();
                reg.detach().unwrap();
                id
            })
            .join()
            .unwrap()
        };

        let second = {
            let reg = registry.clone();
            thread::spawn(move || {
                let id = reg.attach().unwrap().small_id();
                reg.detach().unwrap();
                id
            })
            .join()
            .unwrap()
        };

        assert_eq!(first, second);
    }
}
