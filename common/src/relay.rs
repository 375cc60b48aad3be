use serde::{Deserialize, Serialize};

use crate::{
    clock::Millis,
    types::{RelayState, SignalSource},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

impl Polarity {
    /// Physical pin level (`true` = high) that realizes the logical value.
    pub fn pin_level(self, logical_on: bool) -> bool {
        logical_on ^ (self == Self::ActiveLow)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ActiveHigh => "ACTIVE_HIGH",
            Self::ActiveLow => "ACTIVE_LOW",
        }
    }
}

/// Output pins driven by [`RelayDriver`]. Writes are treated as infallible;
/// implementations log hardware errors themselves.
pub trait RelayOutputs {
    fn write_relay(&mut self, level_high: bool);
    fn write_indicator(&mut self, lit: bool);
}

/// Sole writer of the relay pin and keeper of the logical relay state.
#[derive(Debug)]
pub struct RelayDriver<O> {
    outputs: O,
    polarity: Polarity,
    state: RelayState,
}

impl<O: RelayOutputs> RelayDriver<O> {
    /// Drives both pins to the safe (off) state before returning.
    pub fn new(outputs: O, polarity: Polarity) -> Self {
        let mut driver = Self {
            outputs,
            polarity,
            state: RelayState::default(),
        };
        driver.write_pins(false);
        driver
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn is_on(&self) -> bool {
        self.state.logical
    }

    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    pub fn outputs(&self) -> &O {
        &self.outputs
    }

    /// Returns `true` when the logical value changed.
    pub fn apply(&mut self, desired: bool, source: SignalSource, now_ms: Millis) -> bool {
        let changed = self.state.logical != desired;
        self.write_pins(desired);
        if changed {
            self.state = RelayState {
                logical: desired,
                last_changed_at: now_ms,
                last_source: source,
            };
            log::info!(
                "relay {} via {}",
                if desired { "ON" } else { "OFF" },
                source.as_str()
            );
        }
        changed
    }

    fn write_pins(&mut self, desired: bool) {
        self.outputs.write_relay(self.polarity.pin_level(desired));
        self.outputs.write_indicator(desired);
    }
}
