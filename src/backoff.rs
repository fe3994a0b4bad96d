//! Per-device PASE attempt tracker: tiered backoff on repeated failures
//! (spec §4.5).

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::config::BackoffTier;

/// Process-wide counter of consecutive PASE failures, with delay computed as
/// a monotone step function of the counter (spec §4.5).
pub struct PaseAttemptTracker {
    consecutive_failures: AtomicU32,
    tiers: Vec<BackoffTier>,
    enabled: bool,
}

impl PaseAttemptTracker {
    pub fn new(tiers: Vec<BackoffTier>, enabled: bool) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            tiers,
            enabled,
        }
    }

    /// Increments the failure counter.
    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Resets the counter: on successful authentication, and whenever the
    /// commissioning window closes (spec §4.5: "open -> close transitions").
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Returns the delay applicable to the current failure count. The tiers
    /// are sorted by `at_failures` ascending; the highest tier whose
    /// threshold the count has reached wins.
    pub fn get_delay(&self) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        let failures = self.consecutive_failures.load(Ordering::SeqCst);
        self.tiers
            .iter()
            .filter(|t| t.at_failures <= failures)
            .map(|t| t.delay)
            .max()
            .unwrap_or(Duration::ZERO)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }
}
