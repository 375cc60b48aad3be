pub mod api;
pub mod authority;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod failsafe;
pub mod heap;
pub mod link;
pub mod poll;
pub mod relay;
pub mod strobe;
pub mod types;

pub use api::{
    dispatch, dispatch_queued, InboundRequest, Method, OutboundResponse, REPLY_TIMEOUT_MS,
    ROUTE_RELAY, ROUTE_STATUS,
};
pub use authority::{CommandAuthority, API_KEY_HEADER};
pub use clock::{elapsed_ms, Cadence, Millis};
pub use config::{ConfigError, GpioConfig, NetworkConfig, NodeConfig, PollConfig, TimingConfig};
pub use controller::{Board, NodeController, Supervision, TickReport};
pub use error::{ControlError, InvalidRequest};
pub use failsafe::FailsafeMonitor;
pub use heap::{HeapVerdict, HeapWatchdog};
pub use link::{LinkEvent, LinkWatchdog, NetworkLink};
pub use poll::{parse_remote_document, CloudPollArbiter, DebounceCounter, PollDecision};
pub use relay::{Polarity, RelayDriver, RelayOutputs};
pub use strobe::{HardwareWatchdogStrobe, WatchdogTimer};
pub use types::{
    CommandEvent, HeapSample, LinkState, NodeStatus, OperatingMode, PollResult, RelayCommandReply,
    RelayState, SignalSource,
};
