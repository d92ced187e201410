/*!
 * Handler Reclamation Slots
 *
 * Fixed table of reservation slots held by suspend handlers while they may
 * dereference shared runtime memory. Acquire/release are lock-free CAS on a
 * preallocated array, so both are usable from signal context.
 */

use crate::core::traits::ReclamationSlots;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A single reservation slot
#[repr(C, align(64))] // Cache-line aligned to prevent false sharing
struct Slot {
    busy: AtomicBool,
}

/// Default safe-memory-reclamation slot table
pub struct HazardSlots {
    slots: Box<[Slot]>,
    /// Scan start hint, spreads concurrent acquirers across the table
    cursor: AtomicUsize,
}

impl HazardSlots {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity.max(1))
            .map(|_| Slot {
                busy: AtomicBool::new(false),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Reservations currently held
    pub fn in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.busy.load(Ordering::Acquire))
            .count()
    }

    /// True while `index` is reserved
    pub fn is_held(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .is_some_and(|slot| slot.busy.load(Ordering::Acquire))
    }
}

impl ReclamationSlots for HazardSlots {
    fn acquire_slot(&self) -> Option<usize> {
        let len = self.slots.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        (0..len).map(|offset| (start + offset) % len).find(|&index| {
            self.slots[index]
                .busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        })
    }

    fn release_slot(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            slot.busy.store(false, Ordering::Release);
        }
    }
}
