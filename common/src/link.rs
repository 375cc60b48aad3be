use crate::{
    clock::{elapsed_ms, Cadence, Millis},
    types::LinkState,
};

/// Network station hooks used by [`LinkWatchdog`].
pub trait NetworkLink {
    fn is_connected(&mut self) -> bool;
    /// Must return promptly; the association completes in the background.
    fn begin_reconnect(&mut self);
    fn rssi(&mut self) -> Option<i8> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// No health check this tick.
    Idle,
    Healthy,
    Lost,
    Retried,
    Waiting,
    Restored,
}

#[derive(Debug, Clone)]
pub struct LinkWatchdog {
    state: LinkState,
    check: Cadence,
    backoff_ms: u32,
    last_check_at: Option<Millis>,
    last_reconnect_attempt_at: Option<Millis>,
    reconnect_attempts: u32,
    last_rssi: Option<i8>,
}

impl LinkWatchdog {
    pub fn new(check_interval_ms: u32, backoff_ms: u32) -> Self {
        Self {
            state: LinkState::Connected,
            check: Cadence::new(check_interval_ms),
            backoff_ms,
            last_check_at: None,
            last_reconnect_attempt_at: None,
            reconnect_attempts: 0,
            last_rssi: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn last_check_at(&self) -> Option<Millis> {
        self.last_check_at
    }

    pub fn last_reconnect_attempt_at(&self) -> Option<Millis> {
        self.last_reconnect_attempt_at
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn last_rssi(&self) -> Option<i8> {
        self.last_rssi
    }

    pub fn supervise<L: NetworkLink>(&mut self, link: &mut L, now_ms: Millis) -> LinkEvent {
        if !self.check.due(now_ms) {
            return LinkEvent::Idle;
        }
        self.last_check_at = Some(now_ms);

        if link.is_connected() {
            self.last_rssi = link.rssi();
            let was_down = self.state != LinkState::Connected;
            self.state = LinkState::Connected;
            if was_down {
                log::info!(
                    "link restored after {} reconnect attempt(s)",
                    self.reconnect_attempts
                );
                self.reconnect_attempts = 0;
                return LinkEvent::Restored;
            }
            return LinkEvent::Healthy;
        }

        self.last_rssi = None;
        match self.state {
            LinkState::Connected => {
                log::warn!("link lost, reconnecting");
                self.state = LinkState::Disconnected;
                self.attempt(link, now_ms);
                LinkEvent::Lost
            }
            LinkState::Disconnected | LinkState::ReconnectPending => {
                let backoff_elapsed = self
                    .last_reconnect_attempt_at
                    .map(|last| elapsed_ms(now_ms, last) >= self.backoff_ms)
                    .unwrap_or(true);
                if backoff_elapsed {
                    self.attempt(link, now_ms);
                    LinkEvent::Retried
                } else {
                    LinkEvent::Waiting
                }
            }
        }
    }

    fn attempt<L: NetworkLink>(&mut self, link: &mut L, now_ms: Millis) {
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        self.last_reconnect_attempt_at = Some(now_ms);
        log::info!("reconnect attempt {}", self.reconnect_attempts);
        link.begin_reconnect();
        self.state = LinkState::ReconnectPending;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::NetworkLink;

    #[derive(Debug, Default)]
    pub struct ScriptedLink {
        pub connected: bool,
        pub reconnect_calls: Vec<u32>,
        pub rssi: Option<i8>,
        pub clock_ms: u32,
    }

    impl ScriptedLink {
        pub fn up() -> Self {
            Self {
                connected: true,
                rssi: Some(-61),
                ..Self::default()
            }
        }
    }

    impl NetworkLink for ScriptedLink {
        fn is_connected(&mut self) -> bool {
            self.connected
        }

        fn begin_reconnect(&mut self) {
            self.reconnect_calls.push(self.clock_ms);
        }

        fn rssi(&mut self) -> Option<i8> {
            self.rssi
        }
    }
}
