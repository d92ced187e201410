/*!
 * Thread Module
 * Per-thread records, the default registry and saved execution context
 */

mod context;
mod record;
mod registry;

pub use context::{SavedContext, UcontextCapture};
pub use record::{AsyncCall, AsyncCallTarget, Lifecycle, SuspendSource, SuspendState, ThreadRecord};
pub use registry::ThreadRegistry;
