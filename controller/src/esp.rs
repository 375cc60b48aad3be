use std::{
    sync::{mpsc, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method as EspMethod, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::EspDefaultNvsPartition,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use relay_common::{
    authority::MAX_COMMAND_BODY_BYTES, dispatch_queued, parse_remote_document, Board,
    ControlError, GpioConfig, InboundRequest, Method, Millis, NetworkConfig, NetworkLink,
    NodeConfig, NodeController, OperatingMode, OutboundResponse, PollConfig, PollResult, Polarity,
    RelayOutputs, Supervision, WatchdogTimer, API_KEY_HEADER, REPLY_TIMEOUT_MS, ROUTE_RELAY,
    ROUTE_STATUS,
};

const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 2_000;
const REQUEST_QUEUE_DEPTH: usize = 8;
const REPLY_TIMEOUT: Duration = Duration::from_millis(REPLY_TIMEOUT_MS as u64);
const MAX_REMOTE_DOCUMENT_BYTES: usize = 1024;
const CONTROL_LOOP_STACK_BYTES: usize = 12 * 1024;

struct Envelope {
    request: InboundRequest,
    queued_at: Millis,
    reply: mpsc::SyncSender<OutboundResponse>,
}

type Inbox = mpsc::SyncSender<Envelope>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let config = load_config()?;
    info!(
        "relay node booting: mode={}, relay=GPIO{} ({}), indicator=GPIO{}, failsafe={}ms",
        config.mode.as_str(),
        config.gpio.relay_pin,
        config.gpio.polarity.as_str(),
        config.gpio.indicator_pin,
        config.timing.failsafe_timeout_ms,
    );

    // Drive the relay to its safe level before anything slow happens.
    let pins = EspPins::new(&config.gpio)?;
    let node = NodeController::new(&config, pins, loop_clock_ms());

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, .. } = Peripherals::take()?;

    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &config.network)
        .context("wifi startup failed")?;
    disable_wifi_power_save();

    // Association is done; from here on a stalled loop resets the chip.
    init_watchdog(config.timing.hardware_watchdog_timeout_ms)?;

    let (inbox, requests) = mpsc::sync_channel(REQUEST_QUEUE_DEPTH);
    let poll = (config.mode == OperatingMode::Pull).then(|| config.poll.clone());
    if let Some(poll) = &poll {
        info!(
            "polling {} every {}ms (timeout {}ms, tls={}, certificate checks off)",
            poll.url(),
            poll.interval_ms,
            poll.timeout_ms,
            poll.use_tls
        );
    }
    spawn_control_loop(node, requests, poll, config.timing.loop_period_ms)?;

    let server = match config.mode {
        OperatingMode::Push => Some(create_http_server(&config.network, inbox)?),
        OperatingMode::Pull => {
            drop(inbox);
            None
        }
    };

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn load_config() -> anyhow::Result<NodeConfig> {
    let mut config = NodeConfig::default();

    if let Some(ssid) = option_env!("WIFI_SSID") {
        config.network.wifi_ssid = ssid.to_string();
    }
    if let Some(pass) = option_env!("WIFI_PASS") {
        config.network.wifi_pass = pass.to_string();
    }
    if let Some(key) = option_env!("RELAY_API_KEY") {
        config.network.api_key = key.to_string();
    }
    if let Some(mode) = option_env!("RELAY_MODE") {
        config.mode = mode.parse().context("invalid RELAY_MODE")?;
    }
    if let Some(host) = option_env!("RELAY_POLL_HOST") {
        config.poll.host = host.to_string();
    }
    if let Some(path) = option_env!("RELAY_POLL_PATH") {
        config.poll.path = path.to_string();
    }
    if let Some(port) = option_env!("RELAY_POLL_PORT").and_then(|value| value.parse().ok()) {
        config.poll.port = port;
    }
    if let Some(use_tls) = option_env!("RELAY_POLL_TLS").and_then(|value| value.parse().ok()) {
        config.poll.use_tls = use_tls;
    }
    if let Some(polarity) = option_env!("RELAY_ACTIVE_HIGH") {
        config.gpio.polarity = if polarity == "1" || polarity.eq_ignore_ascii_case("true") {
            Polarity::ActiveHigh
        } else {
            Polarity::ActiveLow
        };
    }

    config.sanitize();
    config.validate().context("invalid relay configuration")?;
    Ok(config)
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    if network.wifi_ssid.is_empty() {
        warn!("wifi ssid not configured; link watchdog will keep retrying");
        drop(wifi);
        return Ok(esp_wifi);
    }
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                drop(wifi);
                return Ok(esp_wifi);
            }
            Err(err) => warn!("wifi connect failed on attempt {attempt}: {err:#}"),
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    // The link watchdog owns reconnection from here.
    warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; continuing offline");
    drop(wifi);
    Ok(esp_wifi)
}

fn spawn_control_loop(
    mut node: NodeController<EspPins>,
    requests: mpsc::Receiver<Envelope>,
    poll: Option<PollConfig>,
    loop_period_ms: u32,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(CONTROL_LOOP_STACK_BYTES)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }
            let mut board = EspBoard;

            loop {
                node.strobe(&mut board, loop_clock_ms());

                while let Ok(envelope) = requests.try_recv() {
                    let queued_at = envelope.queued_at;
                    if let Some(response) =
                        dispatch_queued(&mut node, &envelope.request, queued_at, loop_clock_ms())
                    {
                        let _ = envelope.reply.try_send(response);
                    }
                }

                if let Some(poll) = &poll {
                    if node.poll_due(loop_clock_ms()) {
                        node.on_poll(fetch_remote(poll));
                    }
                }

                let report = node.supervise(&mut board, loop_clock_ms());
                if let Supervision::Restart { grace_ms } = report.supervision {
                    thread::sleep(Duration::from_millis(grace_ms.into()));
                    unsafe { esp_idf_svc::sys::esp_restart() };
                }

                thread::sleep(Duration::from_millis(loop_period_ms.into()));
            }
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

fn create_http_server(
    network: &NetworkConfig,
    inbox: Inbox,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: network.http_port,
        stack_size: 8 * 1024,
        max_uri_handlers: 16,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    // Registration order matters: the wildcard catch-all must come last.
    let routes = [ROUTE_RELAY, ROUTE_STATUS, "/*"];
    let methods = [
        EspMethod::Get,
        EspMethod::Post,
        EspMethod::Put,
        EspMethod::Delete,
    ];
    for path in routes {
        for method in methods {
            let inbox = inbox.clone();
            server.fn_handler::<anyhow::Error, _>(path, method, move |mut req| {
                let request = InboundRequest {
                    method: map_method(method),
                    path: req.uri().to_string(),
                    api_key: req.header(API_KEY_HEADER).map(str::to_string),
                    body: read_request_body(&mut req)?,
                };
                let response = forward(&inbox, request);
                req.into_response(
                    response.status,
                    None,
                    &[("Content-Type", response.content_type)],
                )?
                .write_all(response.body.as_bytes())?;
                Ok(())
            })?;
        }
    }

    info!("relay node listening on port {}", network.http_port);
    Ok(server)
}

fn map_method(method: EspMethod) -> Method {
    match method {
        EspMethod::Get => Method::Get,
        EspMethod::Post => Method::Post,
        _ => Method::Other,
    }
}

fn forward(inbox: &Inbox, request: InboundRequest) -> OutboundResponse {
    let (reply, answer) = mpsc::sync_channel(1);
    let envelope = Envelope {
        request,
        queued_at: loop_clock_ms(),
        reply,
    };
    if inbox.try_send(envelope).is_err() {
        warn!("control loop queue full, dropping request");
        return OutboundResponse::unavailable();
    }
    answer
        .recv_timeout(REPLY_TIMEOUT)
        .unwrap_or_else(|_| OutboundResponse::unavailable())
}

/// Reads at most one byte past the command limit; the parser rejects anything longer.
fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Option<Vec<u8>>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len == 0 {
        return Ok(None);
    }

    let mut body = vec![0_u8; len.min(MAX_COMMAND_BODY_BYTES + 1)];
    req.read_exact(&mut body)?;
    Ok(Some(body))
}

fn fetch_remote(poll: &PollConfig) -> Result<PollResult, ControlError> {
    let body = fetch_body(&poll.url(), poll.timeout_ms)
        .map_err(|err| ControlError::Transport(format!("{err:#}")))?;
    parse_remote_document(&body, loop_clock_ms())
}

/// No CA or bundle is attached: `sdkconfig.defaults` enables
/// `CONFIG_ESP_TLS_SKIP_SERVER_CERT_VERIFY`, so the session is encrypted but unverified.
fn fetch_body(url: &str, timeout_ms: u32) -> anyhow::Result<Vec<u8>> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_millis(timeout_ms.into())),
        use_global_ca_store: false,
        crt_bundle_attach: None,
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);
    let request = client.request(EspMethod::Get, url, &[])?;
    let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(anyhow!("remote answered HTTP {status}"));
    }

    let mut body = Vec::new();
    let mut chunk = [0_u8; 256];
    loop {
        let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
        if body.len() > MAX_REMOTE_DOCUMENT_BYTES {
            return Err(anyhow!("remote document exceeds {MAX_REMOTE_DOCUMENT_BYTES} bytes"));
        }
    }
    Ok(body)
}

struct EspPins {
    relay: PinDriver<'static, AnyOutputPin, Output>,
    indicator: Option<PinDriver<'static, AnyOutputPin, Output>>,
}

impl EspPins {
    fn new(gpio: &GpioConfig) -> anyhow::Result<Self> {
        let mut relay = unsafe { PinDriver::output(AnyOutputPin::new(gpio.relay_pin)) }
            .with_context(|| format!("relay output unavailable on GPIO{}", gpio.relay_pin))?;
        relay.set_level(gpio.polarity.pin_level(false).into())?;

        let indicator = match unsafe { PinDriver::output(AnyOutputPin::new(gpio.indicator_pin)) } {
            Ok(mut pin) => {
                let _ = pin.set_low();
                Some(pin)
            }
            Err(err) => {
                warn!("indicator unavailable on GPIO{}: {err}", gpio.indicator_pin);
                None
            }
        };

        Ok(Self { relay, indicator })
    }
}

impl RelayOutputs for EspPins {
    fn write_relay(&mut self, level_high: bool) {
        if let Err(err) = self.relay.set_level(level_high.into()) {
            warn!("failed to drive relay pin: {err}");
        }
    }

    fn write_indicator(&mut self, lit: bool) {
        let Some(pin) = self.indicator.as_mut() else {
            return;
        };
        if let Err(err) = pin.set_level(lit.into()) {
            warn!("failed to drive indicator pin: {err}");
        }
    }
}

struct EspBoard;

impl NetworkLink for EspBoard {
    fn is_connected(&mut self) -> bool {
        station_ap_info().is_some()
    }

    fn begin_reconnect(&mut self) {
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_connect() };
        if rc != esp_idf_svc::sys::ESP_OK {
            warn!("esp_wifi_connect failed: esp_err_t={rc}");
        }
    }

    fn rssi(&mut self) -> Option<i8> {
        station_ap_info().map(|info| info.rssi)
    }
}

impl WatchdogTimer for EspBoard {
    fn feed(&mut self) {
        let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
    }
}

impl Board for EspBoard {
    fn free_heap_bytes(&mut self) -> u32 {
        unsafe { esp_idf_svc::sys::esp_get_free_heap_size() }
    }
}

fn station_ap_info() -> Option<esp_idf_svc::sys::wifi_ap_record_t> {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    (rc == esp_idf_svc::sys::ESP_OK).then_some(ap_info)
}

fn init_watchdog(timeout_ms: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms,
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK {
        return Ok(());
    }
    if rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        // Already running from sdkconfig; apply our timeout instead.
        let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_reconfigure(&config) };
        if rc == esp_idf_svc::sys::ESP_OK {
            return Ok(());
        }
        return Err(anyhow!("esp_task_wdt_reconfigure failed with code {}", rc));
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
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
