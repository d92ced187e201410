/*!
 * Engine Limits and Constants
 *
 * Centralized location for the fixed sizes used by the suspend engine.
 */

/// Size of the per-signal-number chain table
/// Covers the real-time ranges of Linux (up to 64) and FreeBSD (65-126)
pub const MAX_SIGNALS: usize = 128;

/// Signals at or above this number are unusable on Android
/// (32-bit ARM headers ship a truncated sigset_t)
pub const ANDROID_SIGNAL_LIMIT: i32 = 32;

/// Default number of safe-memory-reclamation slots reserved for handlers
/// One per thread that can be inside a suspend handler at once
pub const DEFAULT_RECLAMATION_SLOTS: usize = 256;

/// Upper bound accepted from configuration for the reclamation table
pub const MAX_RECLAMATION_SLOTS: usize = 16 * 1024;

/// Bytes below the interrupted stack pointer that leaf code may still own
/// [LINUX-COMPAT] System V x86_64 red zone
pub const STACK_RED_ZONE: usize = 128;

/// Scratch frame reserved under the red zone before an async call
pub const ASYNC_CALL_FRAME: usize = 32;
