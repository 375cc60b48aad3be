use crate::clock::{elapsed_ms, Millis};

/// Time-based backstop: the relay may not stay on longer than the timeout
/// without a fresh authoritative signal.
#[derive(Debug, Clone)]
pub struct FailsafeMonitor {
    timeout_ms: u32,
    last_signal_at: Millis,
    trips: u32,
}

impl FailsafeMonitor {
    pub fn new(timeout_ms: u32, boot_ms: Millis) -> Self {
        Self {
            timeout_ms,
            last_signal_at: boot_ms,
            trips: 0,
        }
    }

    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    pub fn last_signal_at(&self) -> Millis {
        self.last_signal_at
    }

    pub fn trips(&self) -> u32 {
        self.trips
    }

    pub fn record_signal(&mut self, now_ms: Millis) {
        self.last_signal_at = now_ms;
    }

    pub fn silence_ms(&self, now_ms: Millis) -> u32 {
        elapsed_ms(now_ms, self.last_signal_at)
    }

    /// Returns `true` when the relay must be forced off this tick.
    pub fn evaluate(&mut self, relay_on: bool, now_ms: Millis) -> bool {
        if !relay_on || self.silence_ms(now_ms) <= self.timeout_ms {
            return false;
        }
        self.trips = self.trips.saturating_add(1);
        log::warn!(
            "failsafe timeout: no authoritative signal for {}ms, forcing relay off",
            self.silence_ms(now_ms)
        );
        true
    }
}
