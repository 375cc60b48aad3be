use crate::{
    authority::CommandAuthority,
    clock::{elapsed_ms, Millis},
    config::NodeConfig,
    error::ControlError,
    failsafe::FailsafeMonitor,
    heap::{HeapVerdict, HeapWatchdog},
    link::{LinkEvent, LinkWatchdog, NetworkLink},
    poll::{CloudPollArbiter, PollDecision},
    relay::{RelayDriver, RelayOutputs},
    strobe::{HardwareWatchdogStrobe, WatchdogTimer},
    types::{
        CommandEvent, NodeStatus, OperatingMode, PollResult, RelayCommandReply, RelayState,
        SignalSource,
    },
};

/// Platform services the supervisory loop needs besides the relay pins.
pub trait Board: NetworkLink + WatchdogTimer {
    fn free_heap_bytes(&mut self) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supervision {
    Continue,
    /// Relay already forced off; the platform must wait `grace_ms` and restart.
    Restart { grace_ms: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub failsafe_tripped: bool,
    pub link: LinkEvent,
    pub heap: HeapVerdict,
    pub supervision: Supervision,
}

/// Explicit context object owning every supervisory component. Only the
/// control loop holds it; transports hand events in and get replies back.
#[derive(Debug)]
pub struct NodeController<O> {
    mode: OperatingMode,
    boot_ms: Millis,
    heap_restart_grace_ms: u32,
    relay: RelayDriver<O>,
    authority: CommandAuthority,
    failsafe: FailsafeMonitor,
    poll: CloudPollArbiter,
    link: LinkWatchdog,
    heap: HeapWatchdog,
    strobe: HardwareWatchdogStrobe,
}

impl<O: RelayOutputs> NodeController<O> {
    pub fn new(config: &NodeConfig, outputs: O, boot_ms: Millis) -> Self {
        let timing = &config.timing;
        Self {
            mode: config.mode,
            boot_ms,
            heap_restart_grace_ms: timing.heap_restart_grace_ms,
            relay: RelayDriver::new(outputs, config.gpio.polarity),
            authority: CommandAuthority::new(&config.network.api_key),
            failsafe: FailsafeMonitor::new(timing.failsafe_timeout_ms, boot_ms),
            poll: CloudPollArbiter::new(config.poll.interval_ms),
            link: LinkWatchdog::new(timing.link_check_interval_ms, timing.reconnect_backoff_ms),
            heap: HeapWatchdog::new(timing.heap_check_interval_ms, timing.heap_low_water_bytes),
            strobe: HardwareWatchdogStrobe::new(timing.hardware_watchdog_timeout_ms),
        }
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    pub fn relay_state(&self) -> RelayState {
        self.relay.state()
    }

    pub fn is_relay_on(&self) -> bool {
        self.relay.is_on()
    }

    pub fn relay(&self) -> &RelayDriver<O> {
        &self.relay
    }

    pub fn authority(&self) -> &CommandAuthority {
        &self.authority
    }

    pub fn failsafe(&self) -> &FailsafeMonitor {
        &self.failsafe
    }

    pub fn poll(&self) -> &CloudPollArbiter {
        &self.poll
    }

    pub fn link(&self) -> &LinkWatchdog {
        &self.link
    }

    pub fn heap(&self) -> &HeapWatchdog {
        &self.heap
    }

    pub fn watchdog_strobe(&self) -> &HardwareWatchdogStrobe {
        &self.strobe
    }

    /// First step of every iteration, ahead of any potentially slow work.
    pub fn strobe<W: WatchdogTimer>(&mut self, timer: &mut W, now_ms: Millis) {
        self.strobe.strobe(timer, now_ms);
    }

    pub fn authenticate(&self, presented_key: Option<&str>) -> bool {
        self.authority.authenticate(presented_key)
    }

    pub fn build_command(
        &self,
        presented_key: Option<&str>,
        body: Option<&[u8]>,
        now_ms: Millis,
    ) -> Result<CommandEvent, ControlError> {
        self.authority.build_event(presented_key, body, now_ms)
    }

    pub fn on_command(&mut self, event: CommandEvent) -> Result<RelayCommandReply, ControlError> {
        self.authority.accept(&event)?;
        self.failsafe.record_signal(event.received_at);
        let changed = self
            .relay
            .apply(event.requested_on, SignalSource::Command, event.received_at);
        if !changed {
            log::info!(
                "relay {} via COMMAND (unchanged)",
                if event.requested_on { "ON" } else { "OFF" }
            );
        }
        Ok(RelayCommandReply {
            success: true,
            relay: self.relay.is_on(),
        })
    }

    /// An authenticated status query keeps the relay alive without changing it.
    pub fn on_status_query(
        &mut self,
        presented_key: Option<&str>,
        now_ms: Millis,
    ) -> Result<NodeStatus, ControlError> {
        if !self.authority.authenticate(presented_key) {
            return Err(ControlError::Unauthorized);
        }
        self.failsafe.record_signal(now_ms);
        Ok(self.status(now_ms))
    }

    /// Pull mode only; never due in push mode.
    pub fn poll_due(&mut self, now_ms: Millis) -> bool {
        self.mode == OperatingMode::Pull && self.poll.fetch_due(now_ms)
    }

    pub fn on_poll(&mut self, outcome: Result<PollResult, ControlError>) -> Option<PollDecision> {
        match outcome {
            Ok(result) => {
                self.failsafe.record_signal(result.received_at);
                let decision = self.poll.observe(&result);
                if let Some(desired) = decision.desired() {
                    self.relay
                        .apply(desired, SignalSource::Poll, result.received_at);
                }
                Some(decision)
            }
            Err(err) => {
                self.poll.record_failure(&err);
                None
            }
        }
    }

    /// Failsafe, link and heap checks, in that order, every tick.
    pub fn supervise<B: Board>(&mut self, board: &mut B, now_ms: Millis) -> TickReport {
        let failsafe_tripped = self.failsafe.evaluate(self.relay.is_on(), now_ms);
        if failsafe_tripped {
            self.relay.apply(false, SignalSource::Failsafe, now_ms);
        }

        let link = self.link.supervise(board, now_ms);

        let heap = self.heap.supervise(now_ms, || board.free_heap_bytes());
        let supervision = match heap {
            HeapVerdict::Exhausted(_) => {
                self.relay.apply(false, SignalSource::HeapExhaustion, now_ms);
                log::error!(
                    "heap exhausted, relay forced off; restarting in {}ms",
                    self.heap_restart_grace_ms
                );
                Supervision::Restart {
                    grace_ms: self.heap_restart_grace_ms,
                }
            }
            HeapVerdict::Idle | HeapVerdict::Healthy(_) => Supervision::Continue,
        };

        TickReport {
            failsafe_tripped,
            link,
            heap,
            supervision,
        }
    }

    pub fn status(&self, now_ms: Millis) -> NodeStatus {
        let state = self.relay.state();
        NodeStatus {
            relay: state.logical,
            uptime: elapsed_ms(now_ms, self.boot_ms),
            free_heap: self.heap.last_sample().map(|sample| sample.free_bytes),
            wifi_rssi: self.link.last_rssi(),
            failsafe_active: !state.logical && state.last_source == SignalSource::Failsafe,
            link: self.link.state().as_str(),
            mode: self.mode.as_str(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Board;
    use crate::{
        config::NodeConfig,
        link::NetworkLink,
        relay::testing::RecordingPins,
        strobe::WatchdogTimer,
    };

    #[derive(Debug)]
    pub struct FakeBoard {
        pub connected: bool,
        pub free_heap: u32,
        pub feeds: u32,
        pub reconnects: u32,
    }

    impl Default for FakeBoard {
        fn default() -> Self {
            Self {
                connected: true,
                free_heap: 200_000,
                feeds: 0,
                reconnects: 0,
            }
        }
    }

    impl NetworkLink for FakeBoard {
        fn is_connected(&mut self) -> bool {
            self.connected
        }

        fn begin_reconnect(&mut self) {
            self.reconnects += 1;
        }

        fn rssi(&mut self) -> Option<i8> {
            Some(-55)
        }
    }

    impl WatchdogTimer for FakeBoard {
        fn feed(&mut self) {
            self.feeds += 1;
        }
    }

    impl Board for FakeBoard {
        fn free_heap_bytes(&mut self) -> u32 {
            self.free_heap
        }
    }

    pub fn test_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.network.api_key = "secret".to_string();
        config.timing.failsafe_timeout_ms = 15_000;
        config
    }

    pub fn controller(config: &NodeConfig) -> super::NodeController<RecordingPins> {
        super::NodeController::new(config, RecordingPins::default(), 0)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::testing::{controller, test_config, FakeBoard};
    use super::*;
    use crate::{
        poll::DebounceCounter,
        relay::{testing::PinWrite, Polarity},
        types::LinkState,
    };

    fn command(on: bool, at: Millis) -> CommandEvent {
        CommandEvent {
            requested_on: on,
            authenticated: true,
            received_at: at,
        }
    }

    fn poll(on: bool, at: Millis) -> Result<PollResult, ControlError> {
        Ok(PollResult {
            reported_on: on,
            received_at: at,
        })
    }

    #[test]
    fn authenticated_command_sets_relay_and_signal_time() {
        let mut node = controller(&test_config());

        let reply = node.on_command(command(true, 1_500)).unwrap();

        assert!(reply.success && reply.relay);
        assert!(node.is_relay_on());
        assert_eq!(node.failsafe().last_signal_at(), 1_500);
        assert_eq!(node.relay_state().last_source, SignalSource::Command);
    }

    #[test]
    fn repeated_command_is_accepted_and_refreshes_failsafe() {
        let mut node = controller(&test_config());
        node.on_command(command(true, 1_000)).unwrap();

        let reply = node.on_command(command(true, 9_000)).unwrap();

        assert_eq!(
            reply,
            RelayCommandReply {
                success: true,
                relay: true
            }
        );
        assert_eq!(node.failsafe().last_signal_at(), 9_000);
        assert_eq!(node.relay_state().last_changed_at, 1_000);
    }

    #[test]
    fn unauthenticated_command_changes_nothing() {
        let mut node = controller(&test_config());
        node.on_command(command(true, 100)).unwrap();

        let mut forged = command(false, 200);
        forged.authenticated = false;

        assert_eq!(node.on_command(forged), Err(ControlError::Unauthorized));
        assert!(node.is_relay_on());
        assert_eq!(node.failsafe().last_signal_at(), 100);
    }

    #[test]
    fn status_query_is_a_heartbeat() {
        let mut node = controller(&test_config());
        let mut board = FakeBoard::default();
        node.on_command(command(true, 0)).unwrap();

        node.on_status_query(Some("secret"), 14_000).unwrap();
        let report = node.supervise(&mut board, 28_000);

        assert!(!report.failsafe_tripped);
        assert!(node.is_relay_on());
    }

    #[test]
    fn rejected_status_query_is_not_a_heartbeat() {
        let mut node = controller(&test_config());
        node.on_command(command(true, 0)).unwrap();

        assert_eq!(
            node.on_status_query(Some("nope"), 10_000).unwrap_err(),
            ControlError::Unauthorized
        );
        assert_eq!(node.failsafe().last_signal_at(), 0);
    }

    #[test]
    fn failsafe_trips_after_timeout_and_stays_off() {
        let mut node = controller(&test_config());
        let mut board = FakeBoard::default();
        node.on_command(command(true, 1_000)).unwrap();

        assert!(!node.supervise(&mut board, 16_000).failsafe_tripped);
        assert!(node.supervise(&mut board, 16_001).failsafe_tripped);
        assert!(!node.is_relay_on());
        assert!(node.status(16_001).failsafe_active);

        for now in [20_000, 40_000, 80_000] {
            node.supervise(&mut board, now);
            assert!(!node.is_relay_on());
        }

        node.on_command(command(true, 90_000)).unwrap();
        assert!(node.is_relay_on());
        assert!(!node.status(90_000).failsafe_active);
    }

    #[test]
    fn command_in_same_tick_preempts_failsafe() {
        let mut node = controller(&test_config());
        let mut board = FakeBoard::default();
        node.on_command(command(true, 0)).unwrap();

        node.on_command(command(true, 20_000)).unwrap();
        let report = node.supervise(&mut board, 20_000);

        assert!(!report.failsafe_tripped);
        assert!(node.is_relay_on());
    }

    #[test]
    fn poll_sequence_produces_debounced_trace() {
        let mut config = test_config();
        config.mode = OperatingMode::Pull;
        let mut node = controller(&config);

        let mut trace = Vec::new();
        for (i, reported) in [true, false, false, true].into_iter().enumerate() {
            node.on_poll(poll(reported, i as u32 * 2_000));
            trace.push(node.is_relay_on());
        }

        assert_eq!(trace, vec![true, true, false, true]);
        assert_eq!(node.poll().debounce(), DebounceCounter::Clear);
    }

    #[test]
    fn poll_failure_is_absorbed() {
        let mut config = test_config();
        config.mode = OperatingMode::Pull;
        let mut node = controller(&config);
        node.on_poll(poll(true, 0));

        let decision = node.on_poll(Err(ControlError::Transport("connect refused".into())));

        assert_eq!(decision, None);
        assert!(node.is_relay_on());
        assert_eq!(node.failsafe().last_signal_at(), 0);
    }

    #[test]
    fn poll_results_feed_the_failsafe() {
        let mut config = test_config();
        config.mode = OperatingMode::Pull;
        let mut node = controller(&config);
        let mut board = FakeBoard::default();

        node.on_poll(poll(true, 0));
        node.on_poll(poll(true, 10_000));
        assert!(!node.supervise(&mut board, 20_000).failsafe_tripped);
        assert!(node.supervise(&mut board, 25_001).failsafe_tripped);
    }

    #[test]
    fn poll_is_never_due_in_push_mode() {
        let mut node = controller(&test_config());

        assert!(!node.poll_due(0));
        assert!(!node.poll_due(60_000));
    }

    #[test]
    fn heap_exhaustion_forces_relay_off_before_restart() {
        let mut config = test_config();
        config.gpio.polarity = Polarity::ActiveHigh;
        let mut node = controller(&config);
        let mut board = FakeBoard::default();
        node.on_command(command(true, 0)).unwrap();

        board.free_heap = 1_024;
        let report = node.supervise(&mut board, 100);

        assert_eq!(report.supervision, Supervision::Restart { grace_ms: 100 });
        assert!(!node.is_relay_on());
        assert_eq!(node.relay_state().last_source, SignalSource::HeapExhaustion);
        let writes = &node.relay().outputs().writes;
        assert_eq!(
            &writes[writes.len() - 2..],
            &[PinWrite::Relay(false), PinWrite::Indicator(false)]
        );
    }

    #[test]
    fn link_loss_does_not_touch_relay() {
        let mut node = controller(&test_config());
        let mut board = FakeBoard::default();
        node.on_command(command(true, 0)).unwrap();

        board.connected = false;
        let report = node.supervise(&mut board, 1_000);

        assert_eq!(report.link, LinkEvent::Lost);
        assert_eq!(report.supervision, Supervision::Continue);
        assert_eq!(node.link().state(), LinkState::ReconnectPending);
        assert_eq!(board.reconnects, 1);
        assert!(node.is_relay_on());
    }

    #[test]
    fn strobe_feeds_board_watchdog() {
        let mut node = controller(&test_config());
        let mut board = FakeBoard::default();

        node.strobe(&mut board, 0);
        node.strobe(&mut board, 10);

        assert_eq!(board.feeds, 2);
        assert_eq!(node.watchdog_strobe().strobes(), 2);
    }

    #[test]
    fn status_reports_cached_telemetry() {
        let mut node = controller(&test_config());
        let mut board = FakeBoard::default();
        node.supervise(&mut board, 0);

        let status = node.status(5_000);

        assert_eq!(status.uptime, 5_000);
        assert_eq!(status.free_heap, Some(200_000));
        assert_eq!(status.wifi_rssi, Some(-55));
        assert_eq!(status.link, "CONNECTED");
        assert_eq!(status.mode, "push");
    }
}
