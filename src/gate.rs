//! Commissioning gate (spec §4.6, DEC-061/DEC-047/DEC-062): the single-writer
//! lock over commissioning handshakes, a cooldown between attempts, and a
//! check against free LOCAL zone slots.
//!
//! Deliberately independent from the device-state lock and the connection
//! tracker's mutex (spec §5: "The commissioning gate and connection-tracker
//! use independent mutexes to avoid lock-order hazards.").

use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct GateState {
    held: bool,
    last_released_at: Option<Instant>,
}

/// Why `accept()` refused the gate, carrying enough detail to build the
/// BUSY retry-after hint (spec §4.6 `busy_retry_after_ms`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateRefusal {
    AlreadyInProgress,
    CooldownActive { remaining: Duration },
    ZoneSlotsFull { in_use: usize, max: usize },
}

impl GateRefusal {
    pub fn reason_string(&self) -> String {
        match self {
            GateRefusal::AlreadyInProgress => "commissioning already in progress".to_string(),
            GateRefusal::CooldownActive { remaining } => {
                format!("cooldown active ({}ms remaining)", remaining.as_millis())
            }
            GateRefusal::ZoneSlotsFull { in_use, max } => {
                format!("zone slots full ({in_use}/{max})")
            }
        }
    }
}

pub struct CommissioningGate {
    state: Mutex<GateState>,
    cooldown: Duration,
    handshake_timeout: Duration,
}

impl CommissioningGate {
    pub fn new(cooldown: Duration, handshake_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(GateState { held: false, last_released_at: None }),
            cooldown,
            handshake_timeout,
        }
    }

    /// Acquires the gate if none is active AND (cooldown elapsed OR test
    /// mode) AND a free LOCAL slot exists. The caller supplies the slot
    /// check as `(in_use, max)` rather than this type owning zone state,
    /// keeping the gate's lock scope minimal (spec §5: independent mutex).
    ///
    /// Critical ordering invariant (spec §4.6): callers must only call this
    /// *after* the first PASE message has arrived, never on bare TLS accept.
    pub fn accept(&self, test_mode: bool, slots: (usize, usize)) -> Result<(), GateRefusal> {
        let mut state = self.state.lock();
        if state.held {
            return Err(GateRefusal::AlreadyInProgress);
        }

        if !test_mode {
            if let Some(released_at) = state.last_released_at {
                let elapsed = released_at.elapsed();
                if elapsed < self.cooldown {
                    return Err(GateRefusal::CooldownActive { remaining: self.cooldown - elapsed });
                }
            }
        }

        let (in_use, max) = slots;
        if in_use >= max {
            return Err(GateRefusal::ZoneSlotsFull { in_use, max });
        }

        state.held = true;
        Ok(())
    }

    /// Unconditional release (spec §4.6 `release`).
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.held = false;
        state.last_released_at = Some(Instant::now());
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().held
    }

    /// Retry-after hint for a BUSY response (spec §4.6 `busy_retry_after_ms`):
    /// remaining cooldown if any, else the handshake timeout if the gate is
    /// held, else 0 for a zones-full refusal.
    pub fn busy_retry_after_ms(&self, refusal: &GateRefusal) -> u64 {
        match refusal {
            GateRefusal::CooldownActive { remaining } => remaining.as_millis() as u64,
            GateRefusal::AlreadyInProgress => self.handshake_timeout.as_millis() as u64,
            GateRefusal::ZoneSlotsFull { .. } => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_commissioning_at_a_time() {
        let gate = CommissioningGate::new(Duration::from_millis(0), Duration::from_secs(5));
        assert!(gate.accept(true, (0, 2)).is_ok());
        let refusal = gate.accept(true, (0, 2)).unwrap_err();
        assert_eq!(refusal, GateRefusal::AlreadyInProgress);
    }

    #[test]
    fn cooldown_blocks_until_elapsed() {
        let gate = CommissioningGate::new(Duration::from_millis(50), Duration::from_secs(5));
        gate.accept(false, (0, 2)).unwrap();
        gate.release();

        let refusal = gate.accept(false, (0, 2)).unwrap_err();
        assert!(matches!(refusal, GateRefusal::CooldownActive { .. }));
    }

    #[test]
    fn test_mode_bypasses_cooldown() {
        let gate = CommissioningGate::new(Duration::from_secs(60), Duration::from_secs(5));
        gate.accept(true, (0, 2)).unwrap();
        gate.release();
        assert!(gate.accept(true, (0, 2)).is_ok());
    }

    #[test]
    fn zone_slots_full_is_refused() {
        let gate = CommissioningGate::new(Duration::ZERO, Duration::from_secs(5));
        let refusal = gate.accept(true, (1, 1)).unwrap_err();
        assert_eq!(refusal, GateRefusal::ZoneSlotsFull { in_use: 1, max: 1 });
        assert_eq!(gate.busy_retry_after_ms(&refusal), 0);
    }

    #[test]
    fn busy_retry_after_prefers_cooldown_over_in_progress() {
        let gate = CommissioningGate::new(Duration::from_millis(500), Duration::from_secs(5));
        gate.accept(false, (0, 2)).unwrap();
        gate.release();
        let refusal = gate.accept(false, (0, 2)).unwrap_err();
        let hint = gate.busy_retry_after_ms(&refusal);
        assert!(hint > 0 && hint <= 500);
    }
}
