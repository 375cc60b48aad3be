use crate::clock::{elapsed_ms, Millis};

/// Independent timer that resets the device unless fed in time.
pub trait WatchdogTimer {
    fn feed(&mut self);
}

/// Tracks liveness proofs sent to the hardware watchdog.
#[derive(Debug, Clone)]
pub struct HardwareWatchdogStrobe {
    timeout_ms: u32,
    last_strobe_at: Option<Millis>,
    strobes: u64,
    worst_gap_ms: u32,
}

impl HardwareWatchdogStrobe {
    pub fn new(timeout_ms: u32) -> Self {
        Self {
            timeout_ms,
            last_strobe_at: None,
            strobes: 0,
            worst_gap_ms: 0,
        }
    }

    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    pub fn strobes(&self) -> u64 {
        self.strobes
    }

    /// Longest observed interval between two strobes.
    pub fn worst_gap_ms(&self) -> u32 {
        self.worst_gap_ms
    }

    pub fn strobe<W: WatchdogTimer>(&mut self, timer: &mut W, now_ms: Millis) {
        timer.feed();
        if let Some(last) = self.last_strobe_at {
            let gap = elapsed_ms(now_ms, last);
            if gap > self.worst_gap_ms {
                self.worst_gap_ms = gap;
                // Half the budget already gone means something in the loop is slow.
                if gap > self.timeout_ms / 2 {
                    log::warn!(
                        "loop stalled {gap}ms between watchdog strobes (timeout {}ms)",
                        self.timeout_ms
                    );
                }
            }
        }
        self.last_strobe_at = Some(now_ms);
        self.strobes = self.strobes.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingTimer {
        feeds: u32,
    }

    impl WatchdogTimer for CountingTimer {
        fn feed(&mut self) {
            self.feeds += 1;
        }
    }

    #[test]
    fn every_strobe_feeds_the_timer() {
        let mut timer = CountingTimer::default();
        let mut strobe = HardwareWatchdogStrobe::new(8_000);

        strobe.strobe(&mut timer, 0);
        strobe.strobe(&mut timer, 10);
        strobe.strobe(&mut timer, 3_010);

        assert_eq!(timer.feeds, 3);
        assert_eq!(strobe.strobes(), 3);
        assert_eq!(strobe.worst_gap_ms(), 3_000);
    }
}
