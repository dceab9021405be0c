//! Elapsed-time watchdog carried by every transaction.
//!
//! Expiry is logged and nothing else: the runtime never forcibly aborts a
//! slow transaction on its behalf.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    started: Instant,
    threshold: Duration,
    warned: bool,
}

impl Watchdog {
    pub fn new(threshold: Duration) -> Self {
        Self {
            started: Instant::now(),
            threshold,
            warned: false,
        }
    }

    /// Checks elapsed time against the threshold, logging a warning the
    /// first time it is exceeded. Idempotent: later calls after the first
    /// expiry do not log again.
    pub fn check(&mut self, store: &str, tx_id: u64) {
        if self.warned {
            return;
        }
        if self.started.elapsed() >= self.threshold {
            self.warned = true;
            log::warn!(
                "transaction {tx_id} on store {store:?} exceeded its watchdog threshold of {:?}",
                self.threshold
            );
        }
    }
}
