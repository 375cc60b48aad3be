use serde::{Deserialize, Serialize};

use std::str::FromStr;

use crate::{clock::Millis, config::ConfigError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    Push,
    Pull,
}

impl OperatingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
        }
    }
}

impl FromStr for OperatingMode {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(Self::Push),
            "pull" => Ok(Self::Pull),
            _ => Err(ConfigError::UnknownMode(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSource {
    Boot,
    Command,
    Poll,
    Failsafe,
    HeapExhaustion,
}

impl SignalSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boot => "BOOT",
            Self::Command => "COMMAND",
            Self::Poll => "POLL",
            Self::Failsafe => "FAILSAFE",
            Self::HeapExhaustion => "HEAP_EXHAUSTION",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayState {
    pub logical: bool,
    pub last_changed_at: Millis,
    pub last_source: SignalSource,
}

impl Default for RelayState {
    fn default() -> Self {
        Self {
            logical: false,
            last_changed_at: 0,
            last_source: SignalSource::Boot,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandEvent {
    pub requested_on: bool,
    pub authenticated: bool,
    pub received_at: Millis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollResult {
    pub reported_on: bool,
    pub received_at: Millis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSample {
    pub free_bytes: u32,
    pub sampled_at: Millis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
    ReconnectPending,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
            Self::ReconnectPending => "RECONNECT_PENDING",
        }
    }
}

/// Body of `POST /relay`.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayCommandBody {
    pub on: bool,
}

/// Success reply of `POST /relay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayCommandReply {
    pub success: bool,
    pub relay: bool,
}

/// Remote document fetched in pull mode.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteRelayDocument {
    pub relay: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub relay: bool,
    pub uptime: Millis,
    pub free_heap: Option<u32>,
    pub wifi_rssi: Option<i8>,
    pub failsafe_active: bool,
    pub link: &'static str,
    pub mode: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_operating_mode_case_insensitively() {
        assert_eq!(" Pull ".parse::<OperatingMode>(), Ok(OperatingMode::Pull));
        assert_eq!("push".parse::<OperatingMode>(), Ok(OperatingMode::Push));
        assert_eq!(
            "poll".parse::<OperatingMode>(),
            Err(ConfigError::UnknownMode("poll".to_string()))
        );
    }

    #[test]
    fn status_serializes_missing_rssi_as_null() {
        let status = NodeStatus {
            relay: true,
            uptime: 42,
            free_heap: Some(150_000),
            wifi_rssi: None,
            failsafe_active: false,
            link: LinkState::Connected.as_str(),
            mode: OperatingMode::Push.as_str(),
        };

        let json = serde_json::to_value(&status).unwrap();

        assert_eq!(json["relay"], true);
        assert_eq!(json["wifi_rssi"], serde_json::Value::Null);
        assert_eq!(json["free_heap"], 150_000);
    }
}
