/*!
 * Monitoring
 * Signal-safe counters and tracing setup
 */

mod stats;
mod tracer;

pub use stats::{AtomicSuspendStats, SuspendStats};
pub use tracer::init_tracing;
