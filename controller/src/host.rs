use std::{
    future::IntoFuture,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{oneshot, watch},
};
use tracing::{debug, info, warn};

use porssari_common::{
    render_status_page, status_topic, ActuationError, BusPublisher, ChannelBank, Connectivity,
    ConnectivityProbe, ControllerStatus, DeviceConfig, FailsafePattern, FatalSignal, HttpReply,
    MqttConfig, OffsetClock, Orchestrator, OutputPin, ScheduleTransport, SharedOrchestrator,
    TickOutcome, TransportError,
};

#[derive(Clone)]
struct AppState {
    status: watch::Receiver<Option<ControllerStatus>>,
}

#[derive(Clone)]
struct ConfigStore {
    config_path: Arc<PathBuf>,
    failsafe_path: Arc<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

struct MqttPublisher {
    client: AsyncClient,
}

struct LoggedPin {
    pin: i32,
    level: Option<bool>,
}

struct HostProbe;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::from_env();
    let config = match store.load_config().await {
        Ok(config) => config,
        Err(err) => {
            signal_fatal(FatalSignal::ConfigUnreadable).await;
            return Err(err);
        }
    };

    let failsafe = if config.failsafe {
        store.load_failsafe().await.unwrap_or_else(|err| {
            warn!("failed to load failsafe pattern: {err:#}");
            None
        })
    } else {
        None
    };

    let Some(device_id) = config.device_identity(std::env::var("PORSSARI_DEVICE_MAC").ok()) else {
        signal_fatal(FatalSignal::IdentityUnavailable).await;
        return Err(anyhow!(
            "no device identity: set PORSSARI_DEVICE_MAC or Mac_fallback"
        ));
    };

    info!(
        "config loaded: device=`{device_id}`, channels={}, json_version={}, failsafe={}",
        config.channels.len(),
        config.json_version.number(),
        failsafe.is_some()
    );

    let mqtt = match config.mqtt.as_ref() {
        Some(mqtt_config) => {
            let (client, eventloop) = AsyncClient::new(mqtt_options(mqtt_config), 64);
            spawn_mqtt_loop(eventloop);
            Some(client)
        }
        None => None,
    };

    let (status_tx, status_rx) = watch::channel(None);
    let (restart_tx, restart_rx) = oneshot::channel();
    spawn_control_loop(config, device_id, failsafe, mqtt, status_tx, restart_tx)?;

    let app = Router::new()
        .route("/", get(handle_get_page))
        .route("/api/status", get(handle_get_status))
        .with_state(AppState { status: status_rx });

    let port = std::env::var("PORSSARI_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server at {addr}"))?;

    info!("status page listening on http://{addr}");
    tokio::select! {
        served = axum::serve(listener, app).into_future() => {
            served?;
            Ok(())
        }
        reason = restart_rx => {
            let reason = reason.unwrap_or_else(|_| "control loop stopped".to_string());
            Err(anyhow!("restart required: {reason}"))
        }
    }
}

fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(config.host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.port);

    let mut mqtt_options = MqttOptions::new(config.client_id.clone(), mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(config.user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(config.pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options
}

fn spawn_mqtt_loop(mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

// The blocking HTTP client owns its own runtime, so the whole cycle runs on a plain thread.
fn spawn_control_loop(
    config: DeviceConfig,
    device_id: String,
    failsafe: Option<FailsafePattern>,
    mqtt: Option<AsyncClient>,
    status_tx: watch::Sender<Option<ControllerStatus>>,
    restart_tx: oneshot::Sender<String>,
) -> anyhow::Result<()> {
    let period = Duration::from_millis(config.cadence.cycle_period_ms);
    let timeout = Duration::from_millis(config.cadence.fetch_timeout_ms);

    thread::Builder::new()
        .name("control-loop".into())
        .spawn(move || {
            let controller = match build_controller(&config, &device_id, failsafe, mqtt.clone(), timeout) {
                Ok(controller) => controller,
                Err(err) => {
                    let _ = restart_tx.send(format!("controller setup failed: {err:#}"));
                    return;
                }
            };
            status_tx.send_replace(controller.latest_status());

            loop {
                let started = Instant::now();
                let outcome = controller.try_tick();

                if let Some(status) = outcome.status() {
                    publish_status(mqtt.as_ref(), &device_id, status);
                    status_tx.send_replace(Some(status.clone()));
                }

                if let TickOutcome::RestartRequired { valid_until, .. } = outcome {
                    let _ = restart_tx.send(format!("schedule expired at {valid_until}"));
                    return;
                }

                thread::sleep(period.saturating_sub(started.elapsed()));
            }
        })
        .context("failed to spawn control loop")?;

    Ok(())
}

fn build_controller(
    config: &DeviceConfig,
    device_id: &str,
    failsafe: Option<FailsafePattern>,
    mqtt: Option<AsyncClient>,
    timeout: Duration,
) -> anyhow::Result<SharedOrchestrator> {
    let publisher = mqtt.map(|client| Arc::new(MqttPublisher { client }) as Arc<dyn BusPublisher>);
    let bank = ChannelBank::from_config(
        config,
        device_id,
        |pin| Ok(Box::new(LoggedPin::new(pin)) as Box<dyn OutputPin>),
        publisher,
    )
    .context("failed to set up channel outputs")?;
    let transport = ReqwestTransport::new(timeout)?;

    Ok(SharedOrchestrator::new(Orchestrator::new(
        config,
        device_id,
        bank,
        failsafe,
        Box::new(transport),
        Box::new(OffsetClock::new()),
        Box::new(HostProbe),
    )))
}

fn publish_status(mqtt: Option<&AsyncClient>, device_id: &str, status: &ControllerStatus) {
    let Some(client) = mqtt else {
        return;
    };

    match serde_json::to_vec(status) {
        Ok(body) => {
            if let Err(err) = client.try_publish(status_topic(device_id), QoS::AtLeastOnce, true, body) {
                warn!("controller status publish failed: {err}");
            }
        }
        Err(err) => warn!("controller status serialization failed: {err}"),
    }
}

async fn signal_fatal(signal: FatalSignal) {
    let blink = tokio::task::spawn_blocking(move || {
        let mut led = LoggedPin::new(-1);
        signal.play(&mut led, thread::sleep);
    });
    if let Err(err) = blink.await {
        warn!("status led task failed: {err}");
    }
}

async fn handle_get_page(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.status.borrow().clone();
    match status {
        Some(status) => Html(render_status_page(&status)).into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "controller starting"),
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.status.borrow().clone();
    match status {
        Some(status) => Json(status).into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "controller starting"),
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

impl ConfigStore {
    fn from_env() -> Self {
        let config_path = std::env::var("PORSSARI_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./config.json"));
        let failsafe_path = std::env::var("PORSSARI_FAILSAFE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./failsafe.json"));
        Self::new(config_path, failsafe_path)
    }

    fn new(config_path: PathBuf, failsafe_path: PathBuf) -> Self {
        Self {
            config_path: Arc::new(config_path),
            failsafe_path: Arc::new(failsafe_path),
        }
    }

    async fn load_config(&self) -> anyhow::Result<DeviceConfig> {
        let path = self.config_path.as_ref();
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read config {}", path.display()))?;
        DeviceConfig::from_json(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    async fn load_failsafe(&self) -> anyhow::Result<Option<FailsafePattern>> {
        let path = self.failsafe_path.as_ref();
        match tokio::fs::read(path).await {
            Ok(raw) => Ok(Some(FailsafePattern::from_json(&raw).with_context(|| {
                format!("invalid failsafe pattern {}", path.display())
            })?)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("failsafe enabled but {} does not exist", path.display());
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl ReqwestTransport {
    fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { client })
    }
}

impl ScheduleTransport for ReqwestTransport {
    fn get(&mut self, url: &str) -> Result<HttpReply, TransportError> {
        let response = self.client.get(url).send().map_err(transport_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().map_err(transport_error)?.to_vec();
        Ok(HttpReply { status, body })
    }
}

fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Io(err.to_string())
    }
}

impl BusPublisher for MqttPublisher {
    fn publish(&self, topic: &str, payload: &'static str) -> Result<(), ActuationError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, true, payload.as_bytes())
            .map_err(|err| ActuationError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }
}

impl LoggedPin {
    fn new(pin: i32) -> Self {
        Self { pin, level: None }
    }
}

impl OutputPin for LoggedPin {
    fn set_level(&mut self, high: bool) -> Result<(), ActuationError> {
        if self.level != Some(high) {
            info!(pin = self.pin, high, "gpio level change");
        } else {
            debug!(pin = self.pin, high, "gpio level rewrite");
        }
        self.level = Some(high);
        Ok(())
    }
}

impl ConnectivityProbe for HostProbe {
    fn refresh(&mut self) -> Connectivity {
        Connectivity::Station
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn loads_config_and_failsafe_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = write(
            &dir,
            "config.json",
            r#"{"Fetch_url_fallback": "https://api.porssari.fi/getcontrols.php", "Failsafe": true}"#,
        );
        let failsafe = write(&dir, "failsafe.json", r#"{"00": ["relay1"], "13": [2, 3]}"#);
        let store = ConfigStore::new(config, failsafe);

        let config = store.load_config().await.unwrap();
        let pattern = store.load_failsafe().await.unwrap().unwrap();

        assert!(config.failsafe);
        assert_eq!(config.channels.len(), 8);
        assert!(pattern.covers(13));
        assert!(!pattern.covers(12));
    }

    #[tokio::test]
    async fn missing_or_invalid_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("absent.json"), dir.path().join("f.json"));
        assert!(store.load_config().await.is_err());

        let broken = write(&dir, "broken.json", r#"{"Failsafe": true}"#);
        let store = ConfigStore::new(broken, dir.path().join("f.json"));
        let err = store.load_config().await.unwrap_err();
        assert!(format!("{err:#}").contains("Fetch_url_fallback"));
    }

    #[tokio::test]
    async fn missing_failsafe_file_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("c.json"), dir.path().join("absent.json"));
        assert!(store.load_failsafe().await.unwrap().is_none());

        let bad = write(&dir, "bad.json", r#"{"99": []}"#);
        let store = ConfigStore::new(dir.path().join("c.json"), bad);
        assert!(store.load_failsafe().await.is_err());
    }

    #[test]
    fn logged_pin_tracks_level() {
        let mut pin = LoggedPin::new(21);
        pin.set_level(true).unwrap();
        pin.set_level(true).unwrap();
        assert_eq!(pin.level, Some(true));
    }

    #[test]
    fn mqtt_options_use_config_values() {
        let options = mqtt_options(&MqttConfig {
            host: "broker.local".into(),
            port: 1884,
            client_id: "relay-box".into(),
            user: String::new(),
            pass: String::new(),
        });
        assert_eq!(options.client_id(), "relay-box");
        if std::env::var("MQTT_HOST").is_err() && std::env::var("MQTT_PORT").is_err() {
            assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        }
    }
}
