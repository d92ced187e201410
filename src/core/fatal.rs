/*!
 * Fatal Termination
 *
 * Process abort usable from asynchronous-signal context: no allocation,
 * no locks, no formatting. Only write(2) and abort(3).
 */

use nix::libc;

const PREFIX: &[u8] = b"signal-suspend: fatal: ";

/// Write a diagnostic to stderr and abort the process
#[cold]
pub fn fatal(message: &str) -> ! {
    write_stderr(PREFIX);
    write_stderr(message.as_bytes());
    write_stderr(b"\n");
    // SAFETY: abort is async-signal-safe and never returns
    unsafe { libc::abort() }
}

fn write_stderr(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: the buffer is valid for `bytes.len()` bytes
        let written = unsafe {
            libc::write(
                libc::STDERR_FILENO,
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
            )
        };
        if written <= 0 {
            return;
        }
        bytes = &bytes[written as usize..];
    }
}

/// Assert an invariant from signal context; aborts instead of unwinding
macro_rules! handler_assert {
    ($cond:expr, $msg:expr) => {
        if !$cond {
            $crate::core::fatal::fatal($msg);
        }
    };
}

pub(crate) use handler_assert;
