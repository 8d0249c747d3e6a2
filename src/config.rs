use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::fanout::{BridgeTopics, BrokerTopics, CameraDescriptor};
use crate::snapshot::{CaptureConfig, DEFAULT_GRACE_MS};
use crate::transport::{parse_mqtt_endpoint, MqttEndpoint, MqttSettings, TlsMaterials};

const DEFAULT_SNAPSHOT_DIR: &str = "/data/ds/datasets/autocap";
const DEFAULT_MQTT_HOST: &str = "127.0.0.1";
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_MQTT_CLIENT_ID: &str = "detection-relay";
const DEFAULT_BRIDGE_HOST: &str = "localhost";
const DEFAULT_BRIDGE_PORT: u16 = 9090;
const DEFAULT_BRIDGE_PREFIX: &str = "/deepstream";
const DEFAULT_DETECTIONS_LOG: &str = "/tmp/ds_usb_detections.jsonl";

#[derive(Debug, Deserialize, Default)]
struct RelayConfigFile {
    snapshot: Option<SnapshotConfigFile>,
    mqtt: Option<MqttConfigFile>,
    bridge: Option<BridgeConfigFile>,
    detections_log: Option<String>,
    camera: Option<CameraConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SnapshotConfigFile {
    dir: Option<PathBuf>,
    period_ms: Option<i64>,
    grace_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    host: Option<String>,
    port: Option<u16>,
    use_tls: Option<bool>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    tls_ca: Option<PathBuf>,
    tls_client_cert: Option<PathBuf>,
    tls_client_key: Option<PathBuf>,
    topic: Option<String>,
    heartbeat_topic: Option<String>,
    snap_topic: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct BridgeConfigFile {
    host: Option<String>,
    port: Option<u16>,
    enabled: Option<bool>,
    topic_prefix: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<String>,
    caps: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub snapshot: SnapshotSettings,
    pub mqtt: BrokerSettings,
    pub bridge: BridgeSettings,
    /// `None` disables the local JSON-lines log.
    pub detections_log: Option<PathBuf>,
    pub camera: CameraDescriptor,
}

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub dir: PathBuf,
    pub period_ms: u64,
    pub grace_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls_ca: Option<PathBuf>,
    pub tls_client_cert: Option<PathBuf>,
    pub tls_client_key: Option<PathBuf>,
    pub topics: BrokerTopics,
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub host: String,
    pub port: u16,
    pub enabled: bool,
    pub topic_prefix: String,
}

impl RelayConfig {
    pub fn load() -> Result<Self> {
        let config_path = env_value("DS_CONFIG").map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like [`RelayConfig::load`] with an explicit config file instead of `DS_CONFIG`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => read_config_file(path)?,
            None => RelayConfigFile::default(),
        };
        // Falls back to the detections topic only after env overrides are in.
        let heartbeat_topic = file_cfg
            .mqtt
            .as_ref()
            .and_then(|mqtt| mqtt.heartbeat_topic.clone());
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        let heartbeat_topic = env_value("DS_MQTT_HEARTBEAT_TOPIC")
            .or(heartbeat_topic)
            .unwrap_or_else(|| cfg.mqtt.topics.detections.clone());
        cfg.mqtt.topics.heartbeat = heartbeat_topic;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Self {
        let snapshot = file.snapshot.unwrap_or_default();
        let mqtt = file.mqtt.unwrap_or_default();
        let bridge = file.bridge.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let default_topics = BrokerTopics::default();
        let default_camera = CameraDescriptor::default();

        Self {
            snapshot: SnapshotSettings {
                dir: snapshot
                    .dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_DIR)),
                period_ms: snapshot.period_ms.map_or(0, clamp_period),
                grace_ms: snapshot.grace_ms.unwrap_or(DEFAULT_GRACE_MS),
            },
            mqtt: BrokerSettings {
                host: mqtt.host.unwrap_or_else(|| DEFAULT_MQTT_HOST.to_string()),
                port: mqtt.port.unwrap_or(DEFAULT_MQTT_PORT),
                use_tls: mqtt.use_tls.unwrap_or(false),
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                username: mqtt.username,
                password: mqtt.password,
                tls_ca: mqtt.tls_ca,
                tls_client_cert: mqtt.tls_client_cert,
                tls_client_key: mqtt.tls_client_key,
                topics: BrokerTopics {
                    detections: mqtt.topic.unwrap_or(default_topics.detections),
                    heartbeat: default_topics.heartbeat,
                    snapshot: mqtt.snap_topic.unwrap_or(default_topics.snapshot),
                },
            },
            bridge: BridgeSettings {
                host: bridge
                    .host
                    .unwrap_or_else(|| DEFAULT_BRIDGE_HOST.to_string()),
                port: bridge.port.unwrap_or(DEFAULT_BRIDGE_PORT),
                enabled: bridge.enabled.unwrap_or(true),
                topic_prefix: bridge
                    .topic_prefix
                    .unwrap_or_else(|| DEFAULT_BRIDGE_PREFIX.to_string()),
            },
            detections_log: match file.detections_log {
                Some(path) if path.trim().is_empty() => None,
                Some(path) => Some(PathBuf::from(path)),
                None => Some(PathBuf::from(DEFAULT_DETECTIONS_LOG)),
            },
            camera: CameraDescriptor {
                device: camera.device.unwrap_or(default_camera.device),
                width: camera.width.unwrap_or(default_camera.width),
                height: camera.height.unwrap_or(default_camera.height),
                fps: camera.fps.unwrap_or(default_camera.fps),
                caps: camera.caps.unwrap_or(default_camera.caps),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(dir) = env_value("DS_SNAPSHOT_DIR") {
            self.snapshot.dir = PathBuf::from(dir);
        }
        if let Some(period) = env_parse::<i64>("DS_SNAPSHOT_PERIOD_MS")? {
            self.snapshot.period_ms = clamp_period(period);
        }
        if let Some(grace) = env_parse::<u64>("DS_SNAPSHOT_GRACE_MS")? {
            self.snapshot.grace_ms = grace;
        }

        if let Some(host) = env_value("DS_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = env_parse::<u16>("DS_MQTT_PORT")? {
            self.mqtt.port = port;
        }
        if let Some(use_tls) = env_flag("DS_MQTT_USE_TLS")? {
            self.mqtt.use_tls = use_tls;
        }
        if let Some(client_id) = env_value("DS_MQTT_CLIENT_ID") {
            self.mqtt.client_id = client_id;
        }
        if let Some(username) = env_value("DS_MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = env_value("DS_MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(path) = env_value("DS_MQTT_TLS_CA") {
            self.mqtt.tls_ca = Some(PathBuf::from(path));
        }
        if let Some(path) = env_value("DS_MQTT_TLS_CLIENT_CERT") {
            self.mqtt.tls_client_cert = Some(PathBuf::from(path));
        }
        if let Some(path) = env_value("DS_MQTT_TLS_CLIENT_KEY") {
            self.mqtt.tls_client_key = Some(PathBuf::from(path));
        }
        if let Some(topic) = env_value("DS_MQTT_TOPIC") {
            self.mqtt.topics.detections = topic;
        }
        if let Some(topic) = env_value("DS_MQTT_SNAP_TOPIC") {
            self.mqtt.topics.snapshot = topic;
        }

        if let Some(host) = env_value("DS_ROS_HOST") {
            self.bridge.host = host;
        }
        if let Some(port) = env_parse::<u16>("DS_ROS_PORT")? {
            self.bridge.port = port;
        }
        if let Some(enabled) = env_flag("DS_ROS_ENABLE")? {
            self.bridge.enabled = enabled;
        }
        if let Some(prefix) = env_value("DS_ROS_TOPIC_PREFIX") {
            self.bridge.topic_prefix = prefix;
        }

        // Set but empty disables the log, unlike the other variables.
        if let Ok(path) = std::env::var("DS_DETECTIONS_LOG") {
            self.detections_log = if path.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }

        if let Some(device) = env_value("DS_CAM_DEVICE") {
            self.camera.device = device;
        }
        if let Some(width) = env_parse::<u32>("DS_CAM_WIDTH")? {
            self.camera.width = width;
        }
        if let Some(height) = env_parse::<u32>("DS_CAM_HEIGHT")? {
            self.camera.height = height;
        }
        if let Some(fps) = env_value("DS_CAM_FPS") {
            self.camera.fps = fps;
        }
        if let Some(caps) = env_value("DS_CAM_CAPS") {
            self.camera.caps = caps;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.mqtt.port == 0 {
            return Err(anyhow!("MQTT port must be greater than zero"));
        }
        if self.bridge.port == 0 {
            return Err(anyhow!("bridge port must be greater than zero"));
        }
        if self.mqtt.host.trim().is_empty() {
            return Err(anyhow!("MQTT host must not be empty"));
        }
        for (name, topic) in [
            ("detections", &self.mqtt.topics.detections),
            ("heartbeat", &self.mqtt.topics.heartbeat),
            ("snapshot", &self.mqtt.topics.snapshot),
        ] {
            if topic.trim().is_empty() {
                return Err(anyhow!("{} topic must not be empty", name));
            }
        }
        if self.snapshot.grace_ms == 0 {
            return Err(anyhow!("snapshot grace period must be greater than zero"));
        }
        Ok(())
    }

    /// Capture starts enabled only when a positive period is configured.
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig::new(self.snapshot.period_ms > 0, self.snapshot.period_ms)
    }

    pub fn bridge_topics(&self) -> BridgeTopics {
        BridgeTopics::with_prefix(&self.bridge.topic_prefix)
    }

    pub fn broker_settings(&self) -> Result<MqttSettings> {
        let tls = TlsMaterials::load(
            self.mqtt.tls_ca.as_deref(),
            self.mqtt.tls_client_cert.as_deref(),
            self.mqtt.tls_client_key.as_deref(),
        )?;
        // A full address in the host field (`mqtts://host:port`) wins over the port.
        let endpoint = if self.mqtt.host.contains("://") {
            parse_mqtt_endpoint(&self.mqtt.host, self.mqtt.use_tls)?
        } else {
            MqttEndpoint {
                host: self.mqtt.host.clone(),
                port: self.mqtt.port,
                use_tls: self.mqtt.use_tls,
            }
        };
        let mut settings = MqttSettings::new(endpoint, self.mqtt.client_id.clone());
        settings.tls = tls;
        settings.username = self.mqtt.username.clone();
        settings.password = self.mqtt.password.clone();
        Ok(settings)
    }

    /// Startup warning for a bridge left on the rosbridge port.
    ///
    /// The bridge channel speaks MQTT; a websocket rosbridge on that port will
    /// never accept the connection.
    pub fn bridge_notice(&self) -> Option<String> {
        if !self.bridge.enabled || self.bridge.port != DEFAULT_BRIDGE_PORT {
            return None;
        }
        Some(format!(
            "bridge at {}:{} must accept MQTT connections; a websocket rosbridge will not \
             (set DS_ROS_ENABLE=0 or point DS_ROS_PORT at an MQTT-speaking bridge)",
            self.bridge.host, self.bridge.port
        ))
    }

    /// The bridge gets its own client id so both connections can share a broker.
    pub fn bridge_settings(&self) -> MqttSettings {
        MqttSettings::new(
            MqttEndpoint::new(self.bridge.host.clone(), self.bridge.port),
            format!("{}-bridge", self.mqtt.client_id),
        )
    }
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let cfg = serde_json::from_str(&raw)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(cfg)
}

/// Negative periods mean "off", the same as zero.
fn clamp_period(period_ms: i64) -> u64 {
    u64::try_from(period_ms).unwrap_or(0)
}

/// Unset and blank values are both treated as absent.
fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_value(key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be an integer, got '{}'", key, value)),
        None => Ok(None),
    }
}

fn env_flag(key: &str) -> Result<Option<bool>> {
    match env_value(key) {
        Some(value) => match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(anyhow!("{} must be a boolean, got '{}'", key, value)),
        },
        None => Ok(None),
    }
}
