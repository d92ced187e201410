/*!
 * Engine Signal Set
 * Resolved suspend/restart/abort numbers and the masks derived from them
 */

use super::os;
use crate::core::types::{SignalNumber, SignalRole};
use nix::libc;
use std::fmt;

/// Resolved signal triple plus wait masks, immutable once built
#[derive(Clone, Copy)]
pub struct SignalSet {
    suspend: SignalNumber,
    restart: SignalNumber,
    abort: SignalNumber,
    /// Everything blocked except restart; used by the restart-wait
    suspend_mask: libc::sigset_t,
    /// Only restart; blocked while acknowledging suspension
    ack_mask: libc::sigset_t,
}

impl SignalSet {
    /// `numbers` in suspend, restart, abort order, already validated distinct
    pub fn new(numbers: [SignalNumber; 3]) -> Self {
        let [suspend, restart, abort] = numbers;

        let mut suspend_mask = os::full_set();
        os::remove_signal(&mut suspend_mask, restart);

        let mut ack_mask = os::empty_set();
        os::add_signal(&mut ack_mask, restart);

        Self {
            suspend,
            restart,
            abort,
            suspend_mask,
            ack_mask,
        }
    }

    #[inline]
    pub fn suspend(&self) -> SignalNumber {
        self.suspend
    }

    #[inline]
    pub fn restart(&self) -> SignalNumber {
        self.restart
    }

    #[inline]
    pub fn abort(&self) -> SignalNumber {
        self.abort
    }

    pub fn get(&self, role: SignalRole) -> SignalNumber {
        match role {
            SignalRole::Suspend => self.suspend,
            SignalRole::Restart => self.restart,
            SignalRole::Abort => self.abort,
        }
    }

    /// Role played by `signo`, if any
    pub fn role_of(&self, signo: SignalNumber) -> Option<SignalRole> {
        SignalRole::ALL
            .into_iter()
            .find(|role| self.get(*role) == signo)
    }

    #[inline]
    pub fn suspend_mask(&self) -> &libc::sigset_t {
        &self.suspend_mask
    }

    #[inline]
    pub fn ack_mask(&self) -> &libc::sigset_t {
        &self.ack_mask
    }

    /// All three numbers as one set
    pub fn as_sigset(&self) -> libc::sigset_t {
        let mut set = os::empty_set();
        for role in SignalRole::ALL {
            os::add_signal(&mut set, self.get(role));
        }
        set
    }
}

impl fmt::Debug for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSet")
            .field("suspend", &self.suspend)
            .field("restart", &self.restart)
            .field("abort", &self.abort)
            .finish()
    }
}
