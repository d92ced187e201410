/*!
 * Suspend Engine Configuration
 *
 * Runtime configuration for suspension mode and signal selection
 */

use super::errors::{SuspendError, SuspendResult};
use super::limits::{DEFAULT_RECLAMATION_SLOTS, MAX_RECLAMATION_SLOTS};
use super::types::SignalNumber;
use serde::{Deserialize, Serialize};

/// How threads get suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendMode {
    /// Signals only, threads never park themselves
    Preemptive,
    /// Voluntary self-suspension mixed with signaled suspension
    Hybrid,
}

/// Where the three signal numbers come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalSelection {
    /// Per-platform policy table (scan real-time range or fixed numbers)
    Platform,
    /// Numbers chosen by the embedder
    Explicit {
        suspend: SignalNumber,
        restart: SignalNumber,
        abort: SignalNumber,
    },
}

/// Suspend engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuspendConfig {
    pub mode: SuspendMode,
    pub signals: SignalSelection,
    /// Slots in the default safe-memory-reclamation table
    pub reclamation_slots: usize,
}

impl Default for SuspendConfig {
    fn default() -> Self {
        Self {
            mode: SuspendMode::Preemptive,
            signals: SignalSelection::Platform,
            reclamation_slots: DEFAULT_RECLAMATION_SLOTS,
        }
    }
}

impl SuspendConfig {
    /// Configuration for runtimes that also self-suspend at safepoints
    pub fn hybrid() -> Self {
        Self {
            mode: SuspendMode::Hybrid,
            ..Self::default()
        }
    }

    pub fn with_signals(mut self, suspend: SignalNumber, restart: SignalNumber, abort: SignalNumber) -> Self {
        self.signals = SignalSelection::Explicit {
            suspend,
            restart,
            abort,
        };
        self
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - SUSPEND_MODE: `preemptive` or `hybrid` (default: preemptive)
    /// - SUSPEND_SIGNALS: `platform` or `S,R,A` (default: platform)
    /// - SUSPEND_RECLAMATION_SLOTS: slot count (default: 256)
    pub fn from_env() -> SuspendResult<Self> {
        let mut config = Self::default();

        if let Ok(mode) = std::env::var("SUSPEND_MODE") {
            config.mode = parse_mode(&mode)?;
        }
        if let Ok(signals) = std::env::var("SUSPEND_SIGNALS") {
            config.signals = parse_signals(&signals)?;
        }
        if let Ok(slots) = std::env::var("SUSPEND_RECLAMATION_SLOTS") {
            config.reclamation_slots = slots.trim().parse().map_err(|_| {
                SuspendError::InvalidConfig(format!("SUSPEND_RECLAMATION_SLOTS: {}", slots))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON document; missing fields use defaults
    pub fn from_json_str(json: &str) -> SuspendResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SuspendResult<()> {
        if self.reclamation_slots == 0 || self.reclamation_slots > MAX_RECLAMATION_SLOTS {
            return Err(SuspendError::InvalidConfig(format!(
                "reclamation_slots must be in 1..={}, got {}",
                MAX_RECLAMATION_SLOTS, self.reclamation_slots
            )));
        }
        if let SignalSelection::Explicit {
            suspend,
            restart,
            abort,
        } = self.signals
        {
            for signo in [suspend, restart, abort] {
                if signo <= 0 {
                    return Err(SuspendError::InvalidConfig(format!(
                        "signal number must be positive, got {}",
                        signo
                    )));
                }
            }
        }
        Ok(())
    }
}

fn parse_mode(value: &str) -> SuspendResult<SuspendMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "preemptive" => Ok(SuspendMode::Preemptive),
        "hybrid" => Ok(SuspendMode::Hybrid),
        other => Err(SuspendError::InvalidConfig(format!("SUSPEND_MODE: {}", other))),
    }
}

fn parse_signals(value: &str) -> SuspendResult<SignalSelection> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("platform") {
        return Ok(SignalSelection::Platform);
    }

    let numbers = value
        .split(',')
        .map(|part| part.trim().parse::<SignalNumber>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| SuspendError::InvalidConfig(format!("SUSPEND_SIGNALS: {}", value)))?;

    match numbers.as_slice() {
        [suspend, restart, abort] => Ok(SignalSelection::Explicit {
            suspend: *suspend,
            restart: *restart,
            abort: *abort,
        }),
        _ => Err(SuspendError::InvalidConfig(format!(
            "SUSPEND_SIGNALS expects three numbers, got {}",
            value
        ))),
    }
}
