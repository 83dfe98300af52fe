use std::sync::atomic::{AtomicBool, Ordering};

use tracing::error;

/// Run-wide switch that disables the probe after a permanent failure.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    open: AtomicBool,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Open the breaker. Only the call that actually flips it logs and
    /// returns `true`.
    pub fn trip(&self, reason: &str) -> bool {
        let won = self
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            error!(
                reason,
                "Remote existence probe disabled for the rest of this run"
            );
        }
        won
    }
}
