use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{relay::Polarity, types::OperatingMode};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("api key cannot be empty")]
    EmptyApiKey,
    #[error("relay and indicator cannot share GPIO{0}")]
    SharedPin(i32),
    #[error("unknown operating mode `{0}`")]
    UnknownMode(String),
    #[error("pull mode requires a poll host")]
    MissingPollHost,
    #[error(
        "poll timeout ({poll_timeout_ms}ms) plus loop period ({loop_period_ms}ms) must stay below the hardware watchdog timeout ({watchdog_ms}ms)"
    )]
    PollExceedsWatchdog {
        poll_timeout_ms: u32,
        loop_period_ms: u32,
        watchdog_ms: u32,
    },
    #[error("heap restart grace ({grace_ms}ms) must stay below the hardware watchdog timeout ({watchdog_ms}ms)")]
    GraceExceedsWatchdog { grace_ms: u32, watchdog_ms: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub failsafe_timeout_ms: u32,
    pub loop_period_ms: u32,
    pub link_check_interval_ms: u32,
    pub reconnect_backoff_ms: u32,
    pub heap_check_interval_ms: u32,
    pub heap_low_water_bytes: u32,
    pub heap_restart_grace_ms: u32,
    pub hardware_watchdog_timeout_ms: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            failsafe_timeout_ms: 15_000,
            loop_period_ms: 10,
            link_check_interval_ms: 5_000,
            reconnect_backoff_ms: 30_000,
            heap_check_interval_ms: 10_000,
            heap_low_water_bytes: 20_000,
            heap_restart_grace_ms: 100,
            hardware_watchdog_timeout_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub api_key: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            api_key: String::new(),
            http_port: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GpioConfig {
    pub relay_pin: i32,
    pub indicator_pin: i32,
    pub polarity: Polarity,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            relay_pin: 18,
            indicator_pin: 2,
            polarity: Polarity::ActiveLow,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub use_tls: bool,
    pub interval_ms: u32,
    pub timeout_ms: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 443,
            path: "/relay".to_string(),
            use_tls: true,
            interval_ms: 2_000,
            timeout_ms: 3_000,
        }
    }
}

impl PollConfig {
    pub fn url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{scheme}://{}:{}{}", self.host, self.port, self.path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub mode: OperatingMode,
    pub network: NetworkConfig,
    pub gpio: GpioConfig,
    pub timing: TimingConfig,
    pub poll: PollConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            mode: OperatingMode::Push,
            network: NetworkConfig::default(),
            gpio: GpioConfig::default(),
            timing: TimingConfig::default(),
            poll: PollConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Clamps values into ranges the control loop can honor.
    pub fn sanitize(&mut self) {
        let timing = &mut self.timing;
        timing.loop_period_ms = timing.loop_period_ms.clamp(1, 1_000);
        timing.failsafe_timeout_ms = timing.failsafe_timeout_ms.max(1_000);
        timing.link_check_interval_ms = timing.link_check_interval_ms.max(500);
        timing.reconnect_backoff_ms = timing
            .reconnect_backoff_ms
            .max(timing.link_check_interval_ms);
        timing.heap_check_interval_ms = timing.heap_check_interval_ms.max(100);
        timing.hardware_watchdog_timeout_ms = timing.hardware_watchdog_timeout_ms.max(1_000);

        self.poll.interval_ms = self.poll.interval_ms.max(500);
        self.poll.timeout_ms = self.poll.timeout_ms.max(100);
        if !self.poll.path.starts_with('/') {
            self.poll.path.insert(0, '/');
        }

        self.network.api_key = self.network.api_key.trim().to_string();
        self.poll.host = self.poll.host.trim().to_string();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == OperatingMode::Push && self.network.api_key.is_empty() {
            return Err(ConfigError::EmptyApiKey);
        }
        if self.gpio.relay_pin == self.gpio.indicator_pin {
            return Err(ConfigError::SharedPin(self.gpio.relay_pin));
        }

        let watchdog_ms = self.timing.hardware_watchdog_timeout_ms;
        if self.timing.heap_restart_grace_ms >= watchdog_ms {
            return Err(ConfigError::GraceExceedsWatchdog {
                grace_ms: self.timing.heap_restart_grace_ms,
                watchdog_ms,
            });
        }

        if self.mode == OperatingMode::Pull {
            if self.poll.host.is_empty() {
                return Err(ConfigError::MissingPollHost);
            }
            let budget = self
                .poll
                .timeout_ms
                .saturating_add(self.timing.loop_period_ms);
            if budget >= watchdog_ms {
                return Err(ConfigError::PollExceedsWatchdog {
                    poll_timeout_ms: self.poll.timeout_ms,
                    loop_period_ms: self.timing.loop_period_ms,
                    watchdog_ms,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.network.api_key = "secret".to_string();
        config
    }

    #[test]
    fn default_push_config_with_key_is_valid() {
        assert_eq!(push_config().validate(), Ok(()));
    }

    #[test]
    fn push_mode_requires_api_key() {
        let mut config = push_config();
        config.network.api_key = "   ".to_string();
        config.sanitize();

        assert_eq!(config.validate(), Err(ConfigError::EmptyApiKey));
    }

    #[test]
    fn poll_timeout_must_fit_inside_watchdog_budget() {
        let mut config = push_config();
        config.mode = OperatingMode::Pull;
        config.poll.host = "relay.example.com".to_string();
        config.poll.timeout_ms = 7_995;
        config.timing.loop_period_ms = 10;
        config.timing.hardware_watchdog_timeout_ms = 8_000;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::PollExceedsWatchdog { .. })
        ));

        config.poll.timeout_ms = 3_000;
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn relay_and_indicator_need_distinct_pins() {
        let mut config = push_config();
        config.gpio.indicator_pin = config.gpio.relay_pin;

        assert_eq!(config.validate(), Err(ConfigError::SharedPin(18)));
    }

    #[test]
    fn sanitize_normalizes_poll_path_and_backoff() {
        let mut config = push_config();
        config.poll.path = "state".to_string();
        config.timing.link_check_interval_ms = 5_000;
        config.timing.reconnect_backoff_ms = 10;
        config.sanitize();

        assert_eq!(config.poll.path, "/state");
        assert_eq!(config.timing.reconnect_backoff_ms, 5_000);
    }

    #[test]
    fn poll_url_includes_scheme_and_port() {
        let mut poll = PollConfig::default();
        poll.host = "relay.example.com".to_string();

        assert_eq!(poll.url(), "https://relay.example.com:443/relay");
    }

    #[test]
    fn parses_json_config_with_polarity() {
        let raw = r#"{
            "mode": "pull",
            "network": {"wifi_ssid": "lab", "wifi_pass": "pw", "api_key": "k", "http_port": 8080},
            "gpio": {"relay_pin": 5, "indicator_pin": 2, "polarity": "ACTIVE_HIGH"},
            "timing": {
                "failsafe_timeout_ms": 15000, "loop_period_ms": 10,
                "link_check_interval_ms": 5000, "reconnect_backoff_ms": 30000,
                "heap_check_interval_ms": 10000, "heap_low_water_bytes": 20000,
                "heap_restart_grace_ms": 100, "hardware_watchdog_timeout_ms": 8000
            }
        }"#;

        let config: NodeConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.mode, OperatingMode::Pull);
        assert_eq!(config.gpio.polarity, Polarity::ActiveHigh);
        assert_eq!(config.poll.path, "/relay");
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let raw = r#"{"network": {"api_key": "k"}, "timing": {"failsafe_timeout_ms": 30000}}"#;

        let config: NodeConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.mode, OperatingMode::Push);
        assert_eq!(config.network.http_port, 80);
        assert_eq!(config.timing.failsafe_timeout_ms, 30_000);
        assert_eq!(config.timing.loop_period_ms, 10);
        assert_eq!(config.validate(), Ok(()));
    }
}
