use serde::{Deserialize, Serialize};

use crate::{schedule::JsonVersion, topics::channel_topic};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config is not valid json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Fetch_url_fallback is missing")]
    MissingFallbackUrl,
    #[error("Fetch_url_fallback `{0}` is not an http(s) url")]
    InvalidFallbackUrl(String),
    #[error("no channels configured")]
    NoChannels,
    #[error("channel ids must be contiguous from 1, found {found} at position {position}")]
    NonContiguousChannels { position: usize, found: usize },
    #[error("channel {0} publishes to mqtt but no Mqtt broker is configured")]
    MqttRequired(usize),
    #[error("channel {0} has an empty mqtt topic")]
    EmptyTopic(usize),
    #[error("channel {channel} has invalid gpio pin {pin}")]
    InvalidPin { channel: usize, pin: i32 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnownNetwork {
    #[serde(rename = "SSID")]
    pub ssid: String,
    #[serde(rename = "PASS", default)]
    pub pass: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "UPPERCASE")]
pub enum ChannelOutput {
    Gpio {
        pin: i32,
    },
    Mqtt {
        #[serde(default)]
        topic: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelConfig {
    pub id: usize,
    #[serde(flatten)]
    pub output: ChannelOutput,
}

impl ChannelConfig {
    pub fn resolved_topic(&self, device_id: &str) -> Option<String> {
        match &self.output {
            ChannelOutput::Mqtt { topic: Some(topic) } => Some(topic.clone()),
            ChannelOutput::Mqtt { topic: None } => Some(channel_topic(device_id, self.id)),
            ChannelOutput::Gpio { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "porssari-controller".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CadenceConfig {
    pub cycle_period_ms: u64,
    pub request_cycles_min: u32,
    pub request_cycles_max: u32,
    pub fetch_timeout_ms: u64,
    pub clock_tolerance_secs: i64,
    pub clock_settle_ms: u64,
    pub restart_on_expiry: bool,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            cycle_period_ms: 15_000,
            request_cycles_min: 18,
            request_cycles_max: 20,
            fetch_timeout_ms: 8_000,
            clock_tolerance_secs: 1,
            clock_settle_ms: 500,
            restart_on_expiry: true,
        }
    }
}

impl CadenceConfig {
    pub fn sanitize(&mut self) {
        self.cycle_period_ms = self.cycle_period_ms.clamp(1_000, 300_000);
        self.request_cycles_min = self.request_cycles_min.clamp(1, 1_000);
        if self.request_cycles_max <= self.request_cycles_min {
            self.request_cycles_max = self.request_cycles_min + 1;
        }
        // A fetch must finish well inside one cycle.
        self.fetch_timeout_ms = self
            .fetch_timeout_ms
            .clamp(1_000, self.cycle_period_ms.max(1_000));
        self.clock_tolerance_secs = self.clock_tolerance_secs.clamp(0, 60);
        self.clock_settle_ms = self.clock_settle_ms.min(2_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    #[serde(rename = "Fetch_url_fallback", default)]
    pub fetch_url_fallback: String,
    #[serde(rename = "Failsafe", default)]
    pub failsafe: bool,
    #[serde(rename = "Mac_fallback", default)]
    pub mac_fallback: Option<String>,
    #[serde(rename = "Known_networks", default)]
    pub known_networks: Vec<KnownNetwork>,
    #[serde(rename = "Json_version", default)]
    pub json_version: JsonVersion,
    #[serde(rename = "Channels", default = "default_channels")]
    pub channels: Vec<ChannelConfig>,
    #[serde(rename = "Mqtt", default)]
    pub mqtt: Option<MqttConfig>,
    #[serde(rename = "Cadence", default)]
    pub cadence: CadenceConfig,
}

const DEFAULT_RELAY_PINS: [i32; 8] = [21, 20, 19, 18, 17, 16, 15, 14];

fn default_channels() -> Vec<ChannelConfig> {
    DEFAULT_RELAY_PINS
        .iter()
        .enumerate()
        .map(|(index, pin)| ChannelConfig {
            id: index + 1,
            output: ChannelOutput::Gpio { pin: *pin },
        })
        .collect()
}

impl DeviceConfig {
    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_slice(raw)?;
        config.cadence.sanitize();
        config.channels.sort_by_key(|channel| channel.id);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.fetch_url_fallback.trim();
        if url.is_empty() {
            return Err(ConfigError::MissingFallbackUrl);
        }
        if !is_http_url(url) {
            return Err(ConfigError::InvalidFallbackUrl(url.to_string()));
        }

        if self.channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }

        for (position, channel) in self.channels.iter().enumerate() {
            if channel.id != position + 1 {
                return Err(ConfigError::NonContiguousChannels {
                    position,
                    found: channel.id,
                });
            }

            match &channel.output {
                ChannelOutput::Gpio { pin } if *pin < 0 => {
                    return Err(ConfigError::InvalidPin {
                        channel: channel.id,
                        pin: *pin,
                    });
                }
                ChannelOutput::Mqtt { topic } => {
                    if self.mqtt.is_none() {
                        return Err(ConfigError::MqttRequired(channel.id));
                    }
                    if topic.as_deref().is_some_and(|topic| topic.trim().is_empty()) {
                        return Err(ConfigError::EmptyTopic(channel.id));
                    }
                }
                ChannelOutput::Gpio { .. } => {}
            }
        }

        Ok(())
    }

    pub fn uses_mqtt(&self) -> bool {
        self.channels
            .iter()
            .any(|channel| matches!(channel.output, ChannelOutput::Mqtt { .. }))
    }

    pub fn device_identity(&self, adapter_mac: Option<String>) -> Option<String> {
        adapter_mac
            .map(|mac| mac.trim().to_ascii_lowercase())
            .filter(|mac| !mac.is_empty())
            .or_else(|| {
                self.mac_fallback
                    .as_deref()
                    .map(str::trim)
                    .filter(|mac| !mac.is_empty())
                    .map(str::to_string)
            })
    }
}

pub fn is_http_url(candidate: &str) -> bool {
    let candidate = candidate.trim();
    let rest = candidate
        .strip_prefix("https://")
        .or_else(|| candidate.strip_prefix("http://"));
    matches!(rest, Some(host) if !host.is_empty() && !host.contains(char::is_whitespace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_capitalised_key_names() {
        let raw = br#"{
            "Fetch_url_fallback": "https://api.porssari.fi/getcontrols.php",
            "Failsafe": true,
            "Mac_fallback": "e6614104030a1234",
            "Known_networks": [{"SSID": "home", "PASS": "secret"}, {"SSID": "open"}]
        }"#;

        let config = DeviceConfig::from_json(raw).unwrap();

        assert!(config.failsafe);
        assert_eq!(config.json_version, JsonVersion::V2);
        assert_eq!(config.channels.len(), 8);
        assert_eq!(config.channels[0].output, ChannelOutput::Gpio { pin: 21 });
        assert_eq!(
            config.known_networks,
            vec![
                KnownNetwork {
                    ssid: "home".into(),
                    pass: "secret".into()
                },
                KnownNetwork {
                    ssid: "open".into(),
                    pass: String::new()
                },
            ]
        );
        assert_eq!(config.cadence, CadenceConfig::default());
    }

    #[test]
    fn mixed_channel_outputs() {
        let raw = br#"{
            "Fetch_url_fallback": "http://localhost/controls",
            "Mqtt": {"host": "192.168.1.91"},
            "Channels": [
                {"id": 2, "mode": "MQTT"},
                {"id": 1, "mode": "GPIO", "pin": 21},
                {"id": 3, "mode": "MQTT", "topic": "garage/heater"}
            ]
        }"#;

        let config = DeviceConfig::from_json(raw).unwrap();

        assert!(config.uses_mqtt());
        assert_eq!(config.mqtt.as_ref().unwrap().port, 1883);
        assert_eq!(config.channels[1].resolved_topic("aabb"), Some("porssari/aabb/channel/2/set".into()));
        assert_eq!(config.channels[2].resolved_topic("aabb"), Some("garage/heater".into()));
        assert_eq!(config.channels[0].resolved_topic("aabb"), None);
    }

    #[test]
    fn rejects_missing_fallback_url() {
        let err = DeviceConfig::from_json(br#"{"Failsafe": false}"#).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFallbackUrl));

        let err = DeviceConfig::from_json(br#"{"Fetch_url_fallback": "ftp://x"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFallbackUrl(_)));
    }

    #[test]
    fn rejects_gaps_in_channel_ids() {
        let raw = br#"{
            "Fetch_url_fallback": "http://localhost/controls",
            "Channels": [{"id": 1, "mode": "GPIO", "pin": 4}, {"id": 3, "mode": "GPIO", "pin": 5}]
        }"#;
        let err = DeviceConfig::from_json(raw).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::NonContiguousChannels {
                position: 1,
                found: 3
            }
        ));
    }

    #[test]
    fn mqtt_channel_requires_broker() {
        let raw = br#"{
            "Fetch_url_fallback": "http://localhost/controls",
            "Channels": [{"id": 1, "mode": "MQTT", "topic": "a"}]
        }"#;
        let err = DeviceConfig::from_json(raw).unwrap_err();
        assert!(matches!(err, ConfigError::MqttRequired(1)));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            DeviceConfig::from_json(b"{not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn sanitize_keeps_jitter_window_open() {
        let mut cadence = CadenceConfig {
            request_cycles_min: 5,
            request_cycles_max: 3,
            fetch_timeout_ms: 60_000,
            cycle_period_ms: 10_000,
            ..CadenceConfig::default()
        };
        cadence.sanitize();

        assert_eq!(cadence.request_cycles_max, 6);
        assert_eq!(cadence.fetch_timeout_ms, 10_000);
    }

    #[test]
    fn identity_prefers_adapter_mac() {
        let config = DeviceConfig::from_json(
            br#"{"Fetch_url_fallback": "http://x/y", "Mac_fallback": "fallback"}"#,
        )
        .unwrap();

        assert_eq!(config.device_identity(Some("AABB".into())), Some("aabb".into()));
        assert_eq!(config.device_identity(None), Some("fallback".into()));
        assert_eq!(config.device_identity(Some("  ".into())), Some("fallback".into()));
    }
}
