//! Event-flag signalling.
//!
//! [`EventFlags`] is a tiny bitmask event group: producers OR bits in,
//! consumers wait for any bit of a mask and atomically consume what matched.
//! The registry uses one instance to publish registered / unregistered /
//! rescan signals to the discovery task and to blocked change watchers.
//!
//! Built on [`tokio::sync::Notify`]; the notified future is created before
//! the state check so a set racing the check is never lost.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};

use crate::error::{KernelError, Result};

/// How long a blocking operation is willing to suspend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Fail immediately instead of suspending.
    No,
    /// Suspend until the operation can complete.
    Forever,
    /// Suspend at most this long, then fail with [`KernelError::Timeout`].
    For(Duration),
}

impl Wait {
    /// The absolute deadline for a bounded wait, if any.
    pub(crate) fn deadline(self) -> Option<Instant> {
        match self {
            Wait::For(d) => Some(Instant::now() + d),
            _ => None,
        }
    }
}

/// A bitmask event group with consume-on-wait semantics.
#[derive(Debug, Default)]
pub struct EventFlags {
    bits: Mutex<u32>,
    notify: Notify,
}

impl EventFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, u32> {
        self.bits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// OR `bits` into the group and wake every waiter.
    pub fn set(&self, bits: u32) {
        *self.lock() |= bits;
        self.notify.notify_waiters();
    }

    /// Take (and clear) any currently set bits matching `mask`.
    pub fn try_take(&self, mask: u32) -> Option<u32> {
        let mut bits = self.lock();
        let hit = *bits & mask;
        if hit == 0 {
            return None;
        }
        *bits &= !hit;
        Some(hit)
    }

    /// Wait until any bit of `mask` is set, consuming and returning the
    /// matched bits.
    pub async fn wait_any(&self, mask: u32, wait: Wait) -> Result<u32> {
        let deadline = wait.deadline();
        loop {
            let notified = self.notify.notified();
            if let Some(hit) = self.try_take(mask) {
                return Ok(hit);
            }
            match wait {
                Wait::No => return Err(KernelError::Timeout),
                Wait::Forever => notified.await,
                Wait::For(_) => {
                    let deadline = deadline.unwrap_or_else(Instant::now);
                    if timeout_at(deadline, notified).await.is_err() {
                        // Last chance: a set may have landed with the timer.
                        return self.try_take(mask).ok_or(KernelError::Timeout);
                    }
                }
            }
        }
    }
}
