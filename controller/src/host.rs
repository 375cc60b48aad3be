use std::{
    future::IntoFuture,
    net::{SocketAddr, UdpSocket},
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, Method as HttpMethod, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use relay_common::{
    dispatch_queued, parse_remote_document, Board, ControlError, GpioConfig, InboundRequest,
    Method, Millis, NetworkLink, NodeConfig, NodeController, OperatingMode, OutboundResponse,
    PollConfig, PollResult, RelayOutputs, Supervision, WatchdogTimer, API_KEY_HEADER,
    REPLY_TIMEOUT_MS,
};
use sysinfo::System;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    time::MissedTickBehavior,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

const REQUEST_QUEUE_DEPTH: usize = 16;
const REPLY_TIMEOUT: Duration = Duration::from_millis(REPLY_TIMEOUT_MS as u64);
const DEFAULT_LINK_PROBE: &str = "1.1.1.1:53";

struct Envelope {
    request: InboundRequest,
    queued_at: Millis,
    reply: oneshot::Sender<OutboundResponse>,
}

#[derive(Clone)]
struct AppState {
    requests: mpsc::Sender<Envelope>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config()?;
    log_boot_banner(&config);

    let node = NodeController::new(
        &config,
        SimulatedPins::new(&config.gpio),
        loop_clock_ms(),
    );

    let last_feed = Arc::new(AtomicU64::new(monotonic_ms()));
    spawn_software_watchdog(config.timing.hardware_watchdog_timeout_ms, last_feed.clone())?;
    let probe = std::env::var("RELAY_LINK_PROBE").unwrap_or_else(|_| DEFAULT_LINK_PROBE.into());
    let board = HostBoard::new(probe, last_feed);

    let poller = match config.mode {
        OperatingMode::Pull => Some(RemotePoller::new(&config.poll)?),
        OperatingMode::Push => None,
    };

    let (requests, inbox) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    let control = control_loop(node, board, inbox, poller, config.timing.loop_period_ms);

    match config.mode {
        OperatingMode::Push => {
            let app = Router::new()
                .fallback(handle_request)
                .layer(TraceLayer::new_for_http())
                .with_state(AppState { requests });

            let addr = SocketAddr::from(([0, 0, 0, 0], config.network.http_port));
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind relay server at {addr}"))?;
            info!("relay node listening on http://{addr}");

            tokio::select! {
                served = axum::serve(listener, app).into_future() => {
                    served.context("relay server stopped")
                }
                stopped = control => stopped,
            }
        }
        OperatingMode::Pull => {
            drop(requests);
            control.await
        }
    }
}

fn load_config() -> anyhow::Result<NodeConfig> {
    let mut config = match std::env::var("RELAY_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read(&path)
                .with_context(|| format!("failed to read config file {path}"))?;
            serde_json::from_slice::<NodeConfig>(&raw)
                .with_context(|| format!("failed to parse config file {path}"))?
        }
        Err(_) => NodeConfig::default(),
    };

    if let Some(key) = env_value::<String>("RELAY_API_KEY") {
        config.network.api_key = key;
    }
    if let Ok(mode) = std::env::var("RELAY_MODE") {
        config.mode = mode.parse().context("invalid RELAY_MODE")?;
    }
    if let Some(port) = env_value("RELAY_HTTP_PORT") {
        config.network.http_port = port;
    }
    if let Some(host) = env_value::<String>("RELAY_POLL_HOST") {
        config.poll.host = host;
    }
    if let Some(port) = env_value("RELAY_POLL_PORT") {
        config.poll.port = port;
    }
    if let Some(path) = env_value::<String>("RELAY_POLL_PATH") {
        config.poll.path = path;
    }
    if let Some(use_tls) = env_value("RELAY_POLL_TLS") {
        config.poll.use_tls = use_tls;
    }

    config.sanitize();
    config.validate().context("invalid relay configuration")?;
    Ok(config)
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
}

fn log_boot_banner(config: &NodeConfig) {
    info!(
        mode = config.mode.as_str(),
        relay_pin = config.gpio.relay_pin,
        indicator_pin = config.gpio.indicator_pin,
        polarity = config.gpio.polarity.as_str(),
        failsafe_timeout_ms = config.timing.failsafe_timeout_ms,
        "relay node booting"
    );
    if config.mode == OperatingMode::Pull {
        info!(
            url = %config.poll.url(),
            use_tls = config.poll.use_tls,
            interval_ms = config.poll.interval_ms,
            timeout_ms = config.poll.timeout_ms,
            "polling remote relay state"
        );
    }
}

async fn control_loop(
    mut node: NodeController<SimulatedPins>,
    mut board: HostBoard,
    mut inbox: mpsc::Receiver<Envelope>,
    poller: Option<RemotePoller>,
    loop_period_ms: u32,
) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(Duration::from_millis(loop_period_ms.into()));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        node.strobe(&mut board, loop_clock_ms());

        while let Ok(envelope) = inbox.try_recv() {
            if envelope.reply.is_closed() {
                debug!(path = %envelope.request.path, "client went away, skipping request");
                continue;
            }
            let Some(response) =
                dispatch_queued(&mut node, &envelope.request, envelope.queued_at, loop_clock_ms())
            else {
                continue;
            };
            if envelope.reply.send(response).is_err() {
                debug!("client went away before the reply was ready");
            }
        }

        if let Some(poller) = &poller {
            if node.poll_due(loop_clock_ms()) {
                let outcome = poller.fetch().await;
                node.on_poll(outcome);
            }
        }

        let report = node.supervise(&mut board, loop_clock_ms());
        if let Supervision::Restart { grace_ms } = report.supervision {
            tokio::time::sleep(Duration::from_millis(grace_ms.into())).await;
            return Err(anyhow!("free memory below low-water mark, restarting"));
        }
    }
}

async fn handle_request(
    State(state): State<AppState>,
    method: HttpMethod,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = InboundRequest {
        method: Method::parse(method.as_str()),
        path: uri.path().to_string(),
        api_key: headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        body: (!body.is_empty()).then(|| body.to_vec()),
    };

    let (reply, answer) = oneshot::channel();
    let envelope = Envelope {
        request,
        queued_at: loop_clock_ms(),
        reply,
    };
    if state.requests.send(envelope).await.is_err() {
        return into_http(OutboundResponse::unavailable());
    }

    let response = match tokio::time::timeout(REPLY_TIMEOUT, answer).await {
        Ok(Ok(response)) => response,
        Ok(Err(_)) | Err(_) => {
            warn!("control loop did not answer within {REPLY_TIMEOUT:?}");
            OutboundResponse::unavailable()
        }
    };
    into_http(response)
}

fn into_http(response: OutboundResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, response.content_type)],
        response.body,
    )
        .into_response()
}

struct RemotePoller {
    client: reqwest::Client,
    url: String,
}

impl RemotePoller {
    fn new(poll: &PollConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(poll.timeout_ms.into()))
            .danger_accept_invalid_certs(true)
            .build()
            .context("failed to build poll client")?;
        Ok(Self {
            client,
            url: poll.url(),
        })
    }

    async fn fetch(&self) -> Result<PollResult, ControlError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| ControlError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ControlError::Transport(format!("remote answered {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| ControlError::Transport(err.to_string()))?;
        parse_remote_document(&body, loop_clock_ms())
    }
}

/// Stands in for the relay and indicator GPIOs on a development host.
struct SimulatedPins {
    relay_pin: i32,
    indicator_pin: i32,
    relay_level: Option<bool>,
    indicator_lit: Option<bool>,
}

impl SimulatedPins {
    fn new(gpio: &GpioConfig) -> Self {
        Self {
            relay_pin: gpio.relay_pin,
            indicator_pin: gpio.indicator_pin,
            relay_level: None,
            indicator_lit: None,
        }
    }
}

impl RelayOutputs for SimulatedPins {
    fn write_relay(&mut self, level_high: bool) {
        if self.relay_level != Some(level_high) {
            info!(pin = self.relay_pin, high = level_high, "relay pin");
        }
        self.relay_level = Some(level_high);
    }

    fn write_indicator(&mut self, lit: bool) {
        if self.indicator_lit != Some(lit) {
            debug!(pin = self.indicator_pin, lit, "indicator pin");
        }
        self.indicator_lit = Some(lit);
    }
}

struct HostBoard {
    probe: String,
    system: System,
    last_feed: Arc<AtomicU64>,
}

impl HostBoard {
    fn new(probe: String, last_feed: Arc<AtomicU64>) -> Self {
        Self {
            probe,
            system: System::new(),
            last_feed,
        }
    }
}

impl NetworkLink for HostBoard {
    /// A UDP connect only resolves a route, so it never blocks on the network.
    fn is_connected(&mut self) -> bool {
        UdpSocket::bind("0.0.0.0:0")
            .and_then(|socket| socket.connect(self.probe.as_str()))
            .is_ok()
    }

    fn begin_reconnect(&mut self) {
        info!(probe = %self.probe, "host network is managed by the OS; waiting for a route");
    }
}

impl WatchdogTimer for HostBoard {
    fn feed(&mut self) {
        self.last_feed.store(monotonic_ms(), Ordering::Relaxed);
    }
}

impl Board for HostBoard {
    fn free_heap_bytes(&mut self) -> u32 {
        self.system.refresh_memory();
        u32::try_from(self.system.available_memory()).unwrap_or(u32::MAX)
    }
}

/// Software stand-in for the hardware watchdog: aborts the process when the
/// control loop stops feeding it.
fn spawn_software_watchdog(timeout_ms: u32, last_feed: Arc<AtomicU64>) -> anyhow::Result<()> {
    let timeout_ms = u64::from(timeout_ms);
    std::thread::Builder::new()
        .name("watchdog".into())
        .spawn(move || loop {
            std::thread::sleep(Duration::from_millis((timeout_ms / 4).max(1)));
            let silent_ms = monotonic_ms().saturating_sub(last_feed.load(Ordering::Relaxed));
            if silent_ms > timeout_ms {
                error!("control loop silent for {silent_ms}ms, watchdog reset");
                std::process::abort();
            }
        })
        .context("failed to spawn watchdog thread")?;
    Ok(())
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Truncates to the 32-bit loop clock, wrapping like the device counter.
fn loop_clock_ms() -> Millis {
    monotonic_ms() as Millis
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const SDKCONFIG_DEFAULTS: &str = include_str!("../../sdkconfig.defaults");

    fn sdkconfig_value(key: &str) -> Option<&'static str> {
        SDKCONFIG_DEFAULTS
            .lines()
            .filter_map(|line| line.trim().split_once('='))
            .find_map(|(name, value)| (name == key).then_some(value))
    }

    #[test]
    fn device_build_skips_tls_server_verification() {
        assert!(PollConfig::default().use_tls);
        assert!(PollConfig::default().url().starts_with("https://"));
        assert_eq!(sdkconfig_value("CONFIG_ESP_TLS_INSECURE"), Some("y"));
        assert_eq!(
            sdkconfig_value("CONFIG_ESP_TLS_SKIP_SERVER_CERT_VERIFY"),
            Some("y")
        );
    }

    #[test]
    fn reply_timeout_matches_queue_expiry() {
        assert_eq!(REPLY_TIMEOUT.as_millis(), u128::from(REPLY_TIMEOUT_MS));
    }
}
