/*!
 * Core Module
 * Fundamental engine types, configuration and error handling
 */

pub mod config;
pub mod errors;
pub mod fatal;
pub mod limits;
pub mod traits;
pub mod types;

// Re-export for convenience
pub use config::{SignalSelection, SuspendConfig, SuspendMode};
pub use errors::*;
pub use traits::*;
pub use types::*;
