use core::convert::TryInto;
use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    mqtt::client::{EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    io::EspIOError,
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{error, info, warn};

use porssari_common::{
    render_status_page, status_topic, ActuationError, BusPublisher, ChannelBank, ClockError,
    Connectivity, ConnectivityProbe, ControllerStatus, DeviceConfig, FailsafePattern, FatalSignal,
    HttpReply, KnownNetwork, MqttConfig, Orchestrator, OutputPin, ScheduleTransport,
    SharedOrchestrator, TickOutcome, TimeSource, TransportError,
};

const NVS_NAMESPACE: &str = "porssari";
const NVS_CONFIG_KEY: &str = "config_json";
const NVS_FAILSAFE_KEY: &str = "failsafe_json";
const NVS_BUFFER_BYTES: usize = 4096;
const MAX_SCHEDULE_BYTES: usize = 32 * 1024;
const ACCESS_POINT_SSID: &str = "Porssari-AP";
const ACCESS_POINT_PASSWORD: &str = "PorssariSetup";
const WATCHDOG_TIMEOUT_SEC: u32 = 60;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const WIFI_RECOVERY_CHECKS: u32 = 4;
const ACCESS_POINT_RETRY_CHECKS: u32 = 40;
const STATUS_LED_PIN: i32 = 48;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

struct RelayPin {
    pin: i32,
    driver: PinDriver<'static, AnyOutputPin, Output>,
}

struct EspBusPublisher {
    client: Arc<Mutex<EspMqttClient<'static>>>,
}

struct EspTransport {
    timeout: Duration,
}

struct RtcClock;

/// Station link supervisor; drops to the local access point when no known network answers.
struct WifiProbe {
    wifi: BlockingWifi<EspWifi<'static>>,
    networks: Vec<KnownNetwork>,
    access_point: bool,
    failed_checks: u32,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let config = match nvs_store.load_config() {
        Ok(config) => config,
        Err(err) => {
            error!("device config unusable: {err:#}");
            fatal(FatalSignal::ConfigUnreadable);
        }
    };

    let failsafe = if config.failsafe {
        nvs_store.load_failsafe().unwrap_or_else(|err| {
            warn!("failed to load failsafe pattern from NVS: {err:#}");
            None
        })
    } else {
        None
    };

    info!(
        "NVS config loaded: channels={}, known_networks={}, json_version={}, failsafe={}",
        config.channels.len(),
        config.known_networks.len(),
        config.json_version.number(),
        failsafe.is_some()
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
    let probe = WifiProbe::start(wifi, config.known_networks.clone()).context("wifi startup failed")?;

    let adapter_mac = match probe.station_mac() {
        Ok(mac) => Some(mac),
        Err(err) => {
            warn!("station mac unavailable: {err:#}");
            None
        }
    };
    let Some(device_id) = config.device_identity(adapter_mac) else {
        error!("no device identity: station mac unreadable and Mac_fallback unset");
        fatal(FatalSignal::IdentityUnavailable);
    };
    info!("device identity `{device_id}`");

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let mqtt = match config.mqtt.as_ref() {
        Some(mqtt_config) => {
            let (client, conn) = create_mqtt_client(mqtt_config)?;
            spawn_mqtt_receiver(conn);
            Some(Arc::new(Mutex::new(client)))
        }
        None => None,
    };

    let publisher = mqtt.clone().map(|client| {
        Arc::new(EspBusPublisher { client }) as Arc<dyn BusPublisher>
    });
    let bank = ChannelBank::from_config(&config, &device_id, open_relay, publisher)
        .context("failed to set up channel outputs")?;

    let controller = Arc::new(SharedOrchestrator::new(Orchestrator::new(
        &config,
        &device_id,
        bank,
        failsafe,
        Box::new(EspTransport {
            timeout: Duration::from_millis(config.cadence.fetch_timeout_ms),
        }),
        Box::new(RtcClock),
        Box::new(probe),
    )));

    let server = create_http_server(controller.clone())?;
    spawn_control_loop(
        controller,
        mqtt,
        device_id,
        Duration::from_millis(config.cadence.cycle_period_ms),
    )?;

    // Keep the server alive for the program lifetime.
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn create_http_server(controller: Arc<SharedOrchestrator>) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let controller = controller.clone();
        server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
            let Some(status) = controller.latest_status() else {
                return write_error(req, 503, "controller starting");
            };
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(render_status_page(&status).as_bytes())?;
            Ok(())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/status", Method::Get, move |req| {
        match controller.latest_status() {
            Some(status) => write_json(req, &status),
            None => write_error(req, 503, "controller starting"),
        }
    })?;

    Ok(server)
}

fn write_json(
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'_>>,
    status: &ControllerStatus,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(status)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'_>>,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn create_mqtt_client(
    config: &MqttConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", config.host, config.port);

    let conf = MqttClientConfiguration {
        client_id: Some(config.client_id.as_str()),
        username: if config.user.is_empty() {
            None
        } else {
            Some(config.user.as_str())
        },
        password: if config.pass.is_empty() {
            None
        } else {
            Some(config.pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn spawn_mqtt_receiver(mut conn: EspMqttConnection) {
    let spawned = thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(6 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => info!("mqtt connected"),
                    EventPayload::Disconnected => warn!("mqtt disconnected"),
                    _ => {}
                },
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        });

    if let Err(err) = spawned {
        warn!("failed to spawn mqtt receiver thread: {err}");
    }
}

fn spawn_control_loop(
    controller: Arc<SharedOrchestrator>,
    mqtt: Option<Arc<Mutex<EspMqttClient<'static>>>>,
    device_id: String,
    period: Duration,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            loop {
                feed_watchdog();
                let started = Instant::now();
                let outcome = controller.try_tick();

                if let (Some(status), Some(mqtt)) = (outcome.status(), mqtt.as_ref()) {
                    if let Err(err) = publish_status(mqtt, &device_id, status) {
                        warn!("controller status publish failed: {err:#}");
                    }
                }

                if let TickOutcome::RestartRequired { valid_until, .. } = outcome {
                    restart_device(&format!("schedule expired at {valid_until}"));
                }

                feed_watchdog();
                thread::sleep(period.saturating_sub(started.elapsed()));
            }
        })
        .context("failed to spawn control loop thread")?;

    Ok(())
}

fn publish_status(
    mqtt: &Arc<Mutex<EspMqttClient<'static>>>,
    device_id: &str,
    status: &ControllerStatus,
) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(status)?;
    let mut client = mqtt.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    client.publish(&status_topic(device_id), QoS::AtLeastOnce, true, &payload)?;
    Ok(())
}

fn open_relay(pin: i32) -> Result<Box<dyn OutputPin>, ActuationError> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) }.map_err(|err| {
        ActuationError::Pin {
            pin,
            reason: err.to_string(),
        }
    })?;
    Ok(Box::new(RelayPin { pin, driver }))
}

/// Plays the fatal pattern on the status LED, then restarts.
fn fatal(signal: FatalSignal) -> ! {
    match open_relay(STATUS_LED_PIN) {
        Ok(mut led) => signal.play(led.as_mut(), thread::sleep),
        Err(err) => warn!("status LED unavailable on GPIO{STATUS_LED_PIN}: {err}"),
    }
    restart_device(signal.as_str());
}

#[allow(unreachable_code)]
fn restart_device(reason: &str) -> ! {
    warn!("restarting device: {reason}");
    thread::sleep(Duration::from_millis(100));
    unsafe { esp_idf_svc::sys::esp_restart() };
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

impl NvsStore {
    fn read_key(&self, key: &str) -> anyhow::Result<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; NVS_BUFFER_BYTES];
        Ok(nvs.get_str(key, &mut buffer)?.map(str::to_string))
    }

    fn load_config(&self) -> anyhow::Result<DeviceConfig> {
        let raw = self
            .read_key(NVS_CONFIG_KEY)?
            .ok_or_else(|| anyhow!("`{NVS_CONFIG_KEY}` missing from NVS namespace `{NVS_NAMESPACE}`"))?;
        Ok(DeviceConfig::from_json(raw.as_bytes())?)
    }

    fn load_failsafe(&self) -> anyhow::Result<Option<FailsafePattern>> {
        match self.read_key(NVS_FAILSAFE_KEY)? {
            Some(raw) => Ok(Some(FailsafePattern::from_json(raw.as_bytes())?)),
            None => {
                warn!("failsafe enabled but `{NVS_FAILSAFE_KEY}` is not stored");
                Ok(None)
            }
        }
    }
}

impl OutputPin for RelayPin {
    fn set_level(&mut self, high: bool) -> Result<(), ActuationError> {
        let result = if high {
            self.driver.set_high()
        } else {
            self.driver.set_low()
        };
        result.map_err(|err| ActuationError::Pin {
            pin: self.pin,
            reason: err.to_string(),
        })
    }
}

impl BusPublisher for EspBusPublisher {
    fn publish(&self, topic: &str, payload: &'static str) -> Result<(), ActuationError> {
        let mut client = self.client.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        client
            .publish(topic, QoS::AtLeastOnce, true, payload.as_bytes())
            .map(|_| ())
            .map_err(|err| ActuationError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }
}

impl ScheduleTransport for EspTransport {
    fn get(&mut self, url: &str) -> Result<HttpReply, TransportError> {
        let http_conf = HttpClientConfiguration {
            timeout: Some(self.timeout),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&http_conf)
            .map_err(|err| TransportError::Io(err.to_string()))?;
        let mut client = HttpClient::wrap(connection);
        let request = client
            .request(Method::Get, url, &[("Accept", "application/json")])
            .map_err(transport_error)?;
        let mut response = request.submit().map_err(transport_error)?;

        let status = response.status();
        let mut body = Vec::new();
        let mut chunk = [0_u8; 1024];
        loop {
            let read = response.read(&mut chunk).map_err(transport_error)?;
            if read == 0 {
                break;
            }
            if body.len() + read > MAX_SCHEDULE_BYTES {
                return Err(TransportError::Io(format!(
                    "response body exceeds {MAX_SCHEDULE_BYTES} bytes"
                )));
            }
            body.extend_from_slice(&chunk[..read]);
        }

        Ok(HttpReply { status, body })
    }
}

fn transport_error(err: EspIOError) -> TransportError {
    if err.0.code() == esp_idf_svc::sys::ESP_ERR_TIMEOUT as i32 {
        TransportError::Timeout
    } else {
        TransportError::Io(format!("{err:?}"))
    }
}

impl TimeSource for RtcClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }

    fn commit(&mut self, at: DateTime<Utc>) -> Result<(), ClockError> {
        let tv = esp_idf_svc::sys::timeval {
            tv_sec: at.timestamp() as _,
            tv_usec: at.timestamp_subsec_micros() as _,
        };
        let rc = unsafe { esp_idf_svc::sys::settimeofday(&tv, core::ptr::null()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(ClockError::Rejected(format!("settimeofday returned {rc}")))
        }
    }
}

impl WifiProbe {
    fn start(
        mut wifi: BlockingWifi<EspWifi<'static>>,
        networks: Vec<KnownNetwork>,
    ) -> anyhow::Result<Self> {
        let joined = join_known_network(&mut wifi, &networks, WIFI_CONNECT_ATTEMPTS)?;
        if joined {
            disable_wifi_power_save();
        } else {
            warn!("no known network reachable; starting access point `{ACCESS_POINT_SSID}`");
            start_access_point(&mut wifi)?;
        }

        Ok(Self {
            wifi,
            networks,
            access_point: !joined,
            failed_checks: 0,
        })
    }

    fn station_mac(&self) -> anyhow::Result<String> {
        let mac = self.wifi.wifi().sta_netif().get_mac()?;
        Ok(mac.iter().map(|byte| format!("{byte:02x}")).collect())
    }

    fn rejoin(&mut self, attempts: u32) -> Connectivity {
        match join_known_network(&mut self.wifi, &self.networks, attempts) {
            Ok(true) => {
                self.access_point = false;
                self.failed_checks = 0;
                disable_wifi_power_save();
                Connectivity::Station
            }
            Ok(false) => self.fall_back(),
            Err(err) => {
                warn!("wifi rejoin failed: {err:#}");
                self.fall_back()
            }
        }
    }

    fn fall_back(&mut self) -> Connectivity {
        self.failed_checks = 0;
        match start_access_point(&mut self.wifi) {
            Ok(()) => {
                self.access_point = true;
                Connectivity::AccessPoint
            }
            Err(err) => {
                warn!("access point start failed: {err:#}");
                self.access_point = false;
                Connectivity::Disconnected
            }
        }
    }
}

impl ConnectivityProbe for WifiProbe {
    fn refresh(&mut self) -> Connectivity {
        if self.access_point {
            self.failed_checks += 1;
            if self.failed_checks < ACCESS_POINT_RETRY_CHECKS {
                return Connectivity::AccessPoint;
            }
            info!("retrying known networks from access point mode");
            return self.rejoin(1);
        }

        if is_wifi_station_connected() {
            self.failed_checks = 0;
            return Connectivity::Station;
        }

        self.failed_checks += 1;
        warn!(
            "wifi station link down ({}/{WIFI_RECOVERY_CHECKS} checks)",
            self.failed_checks
        );
        if self.failed_checks >= WIFI_RECOVERY_CHECKS {
            return self.rejoin(2);
        }
        if let Err(err) = self.wifi.wifi_mut().connect() {
            warn!("wifi reconnect request failed: {err}");
        }
        Connectivity::Disconnected
    }
}

fn join_known_network(
    wifi: &mut BlockingWifi<EspWifi<'static>>,
    networks: &[KnownNetwork],
    attempts: u32,
) -> anyhow::Result<bool> {
    for network in networks.iter().filter(|network| !network.ssid.is_empty()) {
        let auth_method = if network.pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        if wifi.is_started()? {
            let _ = wifi.disconnect();
            wifi.stop()?;
        }
        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: network
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid too long"))?,
            password: network
                .pass
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        }))?;
        wifi.start()?;
        info!("wifi started, connecting to `{}`", network.ssid);

        for attempt in 1..=attempts {
            feed_watchdog();
            info!("wifi connect attempt {attempt}/{attempts} to `{}`", network.ssid);
            let joined = wifi.connect().and_then(|()| wifi.wait_netif_up());
            match joined {
                Ok(()) => {
                    info!("wifi connected to `{}` on attempt {attempt}", network.ssid);
                    return Ok(true);
                }
                Err(err) => warn!("wifi connect to `{}` failed on attempt {attempt}: {err:#}", network.ssid),
            }

            if attempt < attempts {
                let _ = wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
        }
    }

    Ok(false)
}

fn start_access_point(wifi: &mut BlockingWifi<EspWifi<'static>>) -> anyhow::Result<()> {
    if wifi.is_started()? {
        let _ = wifi.disconnect();
        wifi.stop()?;
    }
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: ACCESS_POINT_SSID
            .try_into()
            .map_err(|_| anyhow!("access point SSID too long"))?,
        password: ACCESS_POINT_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("access point password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("access point started on `{ACCESS_POINT_SSID}`");
    Ok(())
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
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

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}
