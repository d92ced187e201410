/*!
 * Saved Execution Context
 *
 * Per-thread slot holding the interrupted `ucontext_t`, plus the default
 * capture implementation for Linux. The slot is written once per suspend
 * episode by the target thread and read by the initiator while the target
 * is parked.
 */

use super::record::{AsyncCall, Lifecycle, ThreadRecord};
use crate::core::limits::{ASYNC_CALL_FRAME, STACK_RED_ZONE};
use crate::core::traits::ContextCapture;
use nix::libc;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};

/// Captured machine context of a suspended thread
pub struct SavedContext {
    ucontext: UnsafeCell<MaybeUninit<libc::ucontext_t>>,
    valid: AtomicBool,
}

// SAFETY: the slot has a single writer (the owning thread, inside its suspend
// handler) and readers only look at it after `valid` is published with
// Release ordering and before the writer resumes.
unsafe impl Sync for SavedContext {}
unsafe impl Send for SavedContext {}

impl SavedContext {
    pub(crate) fn new() -> Self {
        Self {
            ucontext: UnsafeCell::new(MaybeUninit::zeroed()),
            valid: AtomicBool::new(false),
        }
    }

    /// Copy a kernel-provided context into the slot
    ///
    /// # Safety
    /// `src` must point to a live `ucontext_t` and the caller must be the
    /// owning thread.
    pub(crate) unsafe fn store(&self, src: *const libc::ucontext_t) {
        std::ptr::copy_nonoverlapping(src, (*self.ucontext.get()).as_mut_ptr(), 1);
        self.valid.store(true, Ordering::Release);
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// Valid between "suspend acknowledged" and "restart consumed"
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Run `f` over the captured context, if one is valid
    pub fn with_context<R>(&self, f: impl FnOnce(&libc::ucontext_t) -> R) -> Option<R> {
        if !self.is_valid() {
            return None;
        }
        // SAFETY: valid implies a completed store on the owning thread
        Some(f(unsafe { (*self.ucontext.get()).assume_init_ref() }))
    }

    /// Interrupted instruction pointer
    pub fn instruction_pointer(&self) -> Option<usize> {
        self.with_context(arch::instruction_pointer)
    }

    /// Interrupted stack pointer
    pub fn stack_pointer(&self) -> Option<usize> {
        self.with_context(arch::stack_pointer)
    }
}

/// Default capture: copies the kernel `ucontext_t` handed to the handler
#[derive(Debug, Default, Clone, Copy)]
pub struct UcontextCapture;

impl UcontextCapture {
    pub fn new() -> Self {
        Self
    }
}

impl ContextCapture for UcontextCapture {
    fn capture(&self, thread: &ThreadRecord, ucontext: *mut libc::c_void) -> bool {
        let saved = thread.saved_context();
        saved.invalidate();

        // Attaching threads have no runtime state to scan yet, detaching ones
        // are tearing it down.
        if thread.lifecycle() != Lifecycle::Attached || ucontext.is_null() {
            return false;
        }

        // SAFETY: the kernel passes a valid ucontext_t to SA_SIGINFO handlers
        // and we are running on the owning thread.
        unsafe { saved.store(ucontext as *const libc::ucontext_t) };
        true
    }

    fn install_async_call(
        &self,
        _thread: &ThreadRecord,
        call: AsyncCall,
        ucontext: *mut libc::c_void,
    ) -> bool {
        if ucontext.is_null() {
            return false;
        }
        // SAFETY: same context the kernel will restore on sigreturn
        unsafe { arch::redirect(&mut *(ucontext as *mut libc::ucontext_t), call) }
    }
}

/// Abort when an async call target returns into the trap frame
#[cfg_attr(not(target_arch = "aarch64"), allow(dead_code))]
extern "C" fn async_call_returned() -> ! {
    crate::core::fatal::fatal("asynchronous call target returned")
}

/// Stack pointer for the spliced call: below the red zone, with a scratch
/// frame, aligned as the ABI expects at function entry.
#[cfg_attr(
    not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))),
    allow(dead_code)
)]
fn call_frame(sp: usize) -> usize {
    (sp - STACK_RED_ZONE - ASYNC_CALL_FRAME) & !0xf
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod arch {
    use super::*;

    pub(super) fn instruction_pointer(ctx: &libc::ucontext_t) -> usize {
        ctx.uc_mcontext.gregs[libc::REG_RIP as usize] as usize
    }

    pub(super) fn stack_pointer(ctx: &libc::ucontext_t) -> usize {
        ctx.uc_mcontext.gregs[libc::REG_RSP as usize] as usize
    }

    pub(super) unsafe fn redirect(ctx: &mut libc::ucontext_t, call: AsyncCall) -> bool {
        let gregs = &mut ctx.uc_mcontext.gregs;
        // Entry expects rsp % 16 == 8, as if a return address had been pushed
        let sp = call_frame(gregs[libc::REG_RSP as usize] as usize) - 8;
        gregs[libc::REG_RSP as usize] = sp as libc::greg_t;
        gregs[libc::REG_RIP as usize] = call.target as usize as libc::greg_t;
        gregs[libc::REG_RDI as usize] = call.arg as usize as libc::greg_t;
        true
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
mod arch {
    use super::*;

    pub(super) fn instruction_pointer(ctx: &libc::ucontext_t) -> usize {
        ctx.uc_mcontext.pc as usize
    }

    pub(super) fn stack_pointer(ctx: &libc::ucontext_t) -> usize {
        ctx.uc_mcontext.sp as usize
    }

    pub(super) unsafe fn redirect(ctx: &mut libc::ucontext_t, call: AsyncCall) -> bool {
        let mc = &mut ctx.uc_mcontext;
        mc.sp = call_frame(mc.sp as usize) as u64;
        mc.pc = call.target as usize as u64;
        mc.regs[0] = call.arg as usize as u64;
        mc.regs[30] = async_call_returned as usize as u64;
        true
    }
}

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
mod arch {
    use super::*;

    pub(super) fn instruction_pointer(_ctx: &libc::ucontext_t) -> usize {
        0
    }

    pub(super) fn stack_pointer(_ctx: &libc::ucontext_t) -> usize {
        0
    }

    pub(super) unsafe fn redirect(_ctx: &mut libc::ucontext_t, _call: AsyncCall) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::NativeThreadId;

    #[test]
    fn test_empty_slot_is_invalid() {
        let slot = SavedContext::new();
        assert!(!slot.is_valid());
        assert!(slot.stack_pointer().is_none());
        assert!(slot.instruction_pointer().is_none());
    }

    #[test]
    fn test_capture_refuses_attaching_thread() {
        let record = ThreadRecord::new(NativeThreadId::current());
        let mut ctx: libc::ucontext_t = unsafe { std::mem::zeroed() };
        let ptr = &mut ctx as *mut libc::ucontext_t as *mut libc::c_void;

        assert!(!UcontextCapture.capture(&record, ptr));
        assert!(!record.saved_context().is_valid());

        record.set_lifecycle(Lifecycle::Attached);
        assert!(UcontextCapture.capture(&record, ptr));
        assert!(record.saved_context().is_valid());

        record.set_lifecycle(Lifecycle::Detaching);
        assert!(!UcontextCapture.capture(&record, ptr));
        assert!(!record.saved_context().is_valid());
    }

    #[test]
    fn test_capture_rejects_null_context() {
        let record = ThreadRecord::new(NativeThreadId::current());
        record.set_lifecycle(Lifecycle::Attached);
        assert!(!UcontextCapture.capture(&record, std::ptr::null_mut()));
    }

    #[test]
    fn test_call_frame_alignment() {
        for sp in [0x7fff_0000_1000usize, 0x7fff_0000_1008, 0x7fff_0000_100f] {
            let frame = call_frame(sp);
            assert_eq!(frame % 16, 0);
            assert!(frame <= sp - STACK_RED_ZONE - ASYNC_CALL_FRAME);
        }
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn test_redirect_rewrites_registers() {
        unsafe extern "C" fn target(_: *mut libc::c_void) -> ! {
            std::process::abort()
        }

        let record = ThreadRecord::new(NativeThreadId::current());
        let mut ctx: libc::ucontext_t = unsafe { std::mem::zeroed() };
        ctx.uc_mcontext.gregs[libc::REG_RSP as usize] = 0x7fff_0000_2000;
        ctx.uc_mcontext.gregs[libc::REG_RIP as usize] = 0x1234;

        let mut token = 0u8;
        let call = AsyncCall {
            target,
            arg: &mut token as *mut u8 as *mut libc::c_void,
        };
        let ptr = &mut ctx as *mut libc::ucontext_t as *mut libc::c_void;
        assert!(UcontextCapture.install_async_call(&record, call, ptr));

        let gregs = &ctx.uc_mcontext.gregs;
        assert_eq!(gregs[libc::REG_RIP as usize] as usize, target as usize);
        assert_eq!(gregs[libc::REG_RDI as usize] as usize, call.arg as usize);
        assert_eq!(gregs[libc::REG_RSP as usize] as usize % 16, 8);
        assert!((gregs[libc::REG_RSP as usize] as usize) < 0x7fff_0000_2000 - STACK_RED_ZONE);
    }
}
