/// Monotonic loop-clock milliseconds. Wraps after ~49.7 days.
pub type Millis = u32;

/// Milliseconds from `since` to `now`, tolerating a single counter wrap.
pub fn elapsed_ms(now: Millis, since: Millis) -> u32 {
    now.wrapping_sub(since)
}

/// Fixed-interval gate for periodic checks driven from the control loop.
///
/// The first call to [`Cadence::due`] fires immediately so a freshly booted
/// node samples once before waiting a full interval.
#[derive(Debug, Clone)]
pub struct Cadence {
    interval_ms: u32,
    last_fired_ms: Option<Millis>,
}

impl Cadence {
    pub fn new(interval_ms: u32) -> Self {
        Self {
            interval_ms,
            last_fired_ms: None,
        }
    }

    pub fn interval_ms(&self) -> u32 {
        self.interval_ms
    }

    pub fn last_fired_ms(&self) -> Option<Millis> {
        self.last_fired_ms
    }

    /// Returns `true` and re-arms when the interval has elapsed.
    pub fn due(&mut self, now_ms: Millis) -> bool {
        let fire = match self.last_fired_ms {
            Some(last) => elapsed_ms(now_ms, last) >= self.interval_ms,
            None => true,
        };
        if fire {
            self.last_fired_ms = Some(now_ms);
        }
        fire
    }
}
