/*!
 * Signals Module
 * Signal number negotiation, handler chaining and delivery dispatch
 */

pub mod chain;
pub mod dispatch;
pub mod negotiator;
pub mod os;
mod set;

// Re-export public API
pub use chain::{ChainRegistry, ChainedHandlerRecord};
pub use dispatch::{
    dispatch_trampoline, Delivery, DispatchPolicy, ErrnoGuard, RoleHandlers, SignalAuthority, SmrGuard,
};
pub use negotiator::{PlatformPolicy, SignalChoice, SignalNegotiator};
pub use set::SignalSet;
