use crate::{
    clock::{Cadence, Millis},
    error::ControlError,
    types::{PollResult, RemoteRelayDocument},
};

/// One pending negative observation at most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebounceCounter {
    #[default]
    Clear,
    OneOffObserved,
}

impl DebounceCounter {
    pub fn value(self) -> u8 {
        match self {
            Self::Clear => 0,
            Self::OneOffObserved => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    TurnOn,
    /// First negative observation; relay left as-is.
    HoldPendingOff,
    TurnOff,
}

impl PollDecision {
    /// Relay value to apply, if any.
    pub fn desired(self) -> Option<bool> {
        match self {
            Self::TurnOn => Some(true),
            Self::HoldPendingOff => None,
            Self::TurnOff => Some(false),
        }
    }
}

/// Pull-mode arbitration: fetch on a fixed cadence and require two
/// consecutive OFF reports before switching off.
#[derive(Debug, Clone)]
pub struct CloudPollArbiter {
    cadence: Cadence,
    debounce: DebounceCounter,
    last_result_at: Option<Millis>,
    consecutive_failures: u32,
}

impl CloudPollArbiter {
    pub fn new(interval_ms: u32) -> Self {
        Self {
            cadence: Cadence::new(interval_ms),
            debounce: DebounceCounter::Clear,
            last_result_at: None,
            consecutive_failures: 0,
        }
    }

    pub fn debounce(&self) -> DebounceCounter {
        self.debounce
    }

    pub fn last_result_at(&self) -> Option<Millis> {
        self.last_result_at
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether a fetch should be issued this tick.
    pub fn fetch_due(&mut self, now_ms: Millis) -> bool {
        self.cadence.due(now_ms)
    }

    pub fn observe(&mut self, result: &PollResult) -> PollDecision {
        self.last_result_at = Some(result.received_at);
        self.consecutive_failures = 0;

        if result.reported_on {
            self.debounce = DebounceCounter::Clear;
            return PollDecision::TurnOn;
        }

        match self.debounce {
            DebounceCounter::Clear => {
                self.debounce = DebounceCounter::OneOffObserved;
                PollDecision::HoldPendingOff
            }
            DebounceCounter::OneOffObserved => {
                self.debounce = DebounceCounter::Clear;
                PollDecision::TurnOff
            }
        }
    }

    /// A failed fetch leaves both relay and debounce untouched.
    pub fn record_failure(&mut self, err: &ControlError) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        log::warn!(
            "poll fetch failed ({} in a row): {err}",
            self.consecutive_failures
        );
    }
}

/// Decodes the remote `{"relay": <bool>}` document.
pub fn parse_remote_document(body: &[u8], now_ms: Millis) -> Result<PollResult, ControlError> {
    let document = serde_json::from_slice::<RemoteRelayDocument>(body)
        .map_err(|err| ControlError::Transport(format!("invalid poll body: {err}")))?;
    Ok(PollResult {
        reported_on: document.relay,
        received_at: now_ms,
    })
}
