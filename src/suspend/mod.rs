/*!
 * Suspend Module
 * Suspend/resume state machine, initiator handshake and handler reservations
 */

pub mod coordinator;
mod foreign;
mod hazard;
pub mod notify;

pub use coordinator::{
    restart_signal_handler, suspend_signal_handler, SuspendCoordinator, SuspendKind,
    SuspendOutcome, SuspendRoute,
};
pub use foreign::ForeignThreadOracle;
pub use hazard::HazardSlots;
pub use notify::{PosixSemaphore, SemaphoreNotifier};
