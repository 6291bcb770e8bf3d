//! Lifecycle state and the re-entrancy flag.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Where a database is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Usable. The handle is created on first use.
    Open,
    /// `close` is tearing the handle down.
    Closing,
    /// Closed. Only `reset` or `reopen` bring it back.
    Closed,
    /// A destroy, reset or reopen sequence is running.
    Resetting,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Resetting => "resetting",
        };
        f.write_str(name)
    }
}

/// Holds the resetting flag for the duration of one destructive sequence.
///
/// Only one guard can exist per flag; the flag clears when the guard drops,
/// including on early return and panic.
#[derive(Debug)]
pub(crate) struct ResetGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ResetGuard<'a> {
    /// Sets the flag, or returns `None` if it is already set.
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for ResetGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
