//! Monotonic microsecond clock.
//!
//! Every timeout in the core (resolution expiry, retry spacing, fragment
//! idle) is an absolute deadline in microseconds compared against this
//! clock. Deadlines are checked opportunistically on the next poll or
//! fragment call, never by dedicated timers.

use std::sync::Arc;
use std::time::Instant;

/// Source of monotonic microseconds since an arbitrary epoch.
pub trait Clock: Send + Sync {
    /// Current time in microseconds.
    fn now_us(&self) -> u64;
}

/// Wall clock backed by [`std::time::Instant`].
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock with its epoch at the moment of construction.
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }

    /// Convenience constructor for the common shared-handle case.
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}
