use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_DETECTOR_BACKEND: &str = "stub";
const DEFAULT_MODEL_PATH: &str = "models/fall_detector.onnx";
const DEFAULT_MODEL_INPUT: u32 = 640;
const DEFAULT_CONF_THRESHOLD: f32 = 0.60;
const DEFAULT_EVIDENCE_DIR: &str = "static/falls";
const DEFAULT_LOG_PATH: &str = "falls_log.csv";
const DEFAULT_COOLDOWN_SECS: u64 = 60;
const DEFAULT_MQTT_TOPIC: &str = "fallwatch/alerts";
const DEFAULT_MQTT_CLIENT_ID: &str = "fallwatchd";
const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_SOURCE: &str = "stub://camera";
const DEFAULT_SOURCE_FPS: u32 = 10;

#[derive(Debug, Deserialize, Default)]
struct FallwatchConfigFile {
    detector: Option<DetectorConfigFile>,
    evidence: Option<EvidenceConfigFile>,
    alerts: Option<AlertConfigFile>,
    server: Option<ServerConfigFile>,
    source: Option<SourceConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    confidence_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct EvidenceConfigFile {
    dir: Option<PathBuf>,
    log_path: Option<PathBuf>,
    location: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertConfigFile {
    cooldown_secs: Option<u64>,
    handoff: Option<String>,
    shared_cooldown: Option<bool>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    topic: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    use_tls: Option<bool>,
    ca_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    default: Option<String>,
    target_fps: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct FallwatchConfig {
    pub detector: DetectorSettings,
    pub evidence: EvidenceSettings,
    pub alerts: AlertSettings,
    pub server_addr: String,
    pub source: SourceSettings,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: PathBuf,
    pub input_width: u32,
    pub input_height: u32,
    pub confidence_threshold: f32,
}

#[derive(Debug, Clone)]
pub struct EvidenceSettings {
    pub dir: PathBuf,
    pub log_path: PathBuf,
    /// Location written to each record; precise location resolution is out of scope.
    pub location: String,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub cooldown: Duration,
    pub handoff: HandoffKind,
    /// Share one cooldown gate across all streams instead of one per stream.
    pub shared_cooldown: bool,
    pub mqtt: Option<MqttSettings>,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub ca_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub default: String,
    pub target_fps: u32,
}

/// How the producer hands a fall event to the stream consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandoffKind {
    /// Single atomic handoff through a bounded channel; the latest event wins.
    Channel,
    /// Pending flag plus metadata record, resolved with bounded retries.
    Flag,
}

impl FromStr for HandoffKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "channel" => Ok(Self::Channel),
            "flag" => Ok(Self::Flag),
            other => Err(anyhow!(
                "unknown alert handoff '{}': expected 'channel' or 'flag'",
                other
            )),
        }
    }
}

impl FallwatchConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FALLWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit file (if any), then apply env overrides and validate.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FallwatchConfigFile) -> Result<Self> {
        let detector_file = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            backend: detector_file
                .backend
                .unwrap_or_else(|| DEFAULT_DETECTOR_BACKEND.to_string()),
            model_path: detector_file
                .model_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
            input_width: detector_file.input_width.unwrap_or(DEFAULT_MODEL_INPUT),
            input_height: detector_file.input_height.unwrap_or(DEFAULT_MODEL_INPUT),
            confidence_threshold: detector_file
                .confidence_threshold
                .unwrap_or(DEFAULT_CONF_THRESHOLD),
        };

        let evidence_file = file.evidence.unwrap_or_default();
        let evidence = EvidenceSettings {
            dir: evidence_file
                .dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_EVIDENCE_DIR)),
            log_path: evidence_file
                .log_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_PATH)),
            location: evidence_file
                .location
                .unwrap_or_else(|| "Unknown".to_string()),
        };

        let alert_file = file.alerts.unwrap_or_default();
        let handoff = match alert_file.handoff.as_deref() {
            Some(kind) => kind.parse()?,
            None => HandoffKind::Channel,
        };
        let mqtt = alert_file.mqtt.and_then(|mqtt| {
            mqtt.broker.map(|broker| MqttSettings {
                broker,
                topic: mqtt.topic.unwrap_or_else(|| DEFAULT_MQTT_TOPIC.to_string()),
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                username: mqtt.username,
                password: mqtt.password,
                use_tls: mqtt.use_tls.unwrap_or(false),
                ca_path: mqtt.ca_path,
            })
        });
        let alerts = AlertSettings {
            cooldown: Duration::from_secs(
                alert_file.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS),
            ),
            handoff,
            shared_cooldown: alert_file.shared_cooldown.unwrap_or(false),
            mqtt,
        };

        let server_addr = file
            .server
            .and_then(|server| server.addr)
            .unwrap_or_else(|| DEFAULT_SERVER_ADDR.to_string());

        let source_file = file.source.unwrap_or_default();
        let source = SourceSettings {
            default: source_file
                .default
                .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            target_fps: source_file.target_fps.unwrap_or(DEFAULT_SOURCE_FPS),
        };

        Ok(Self {
            detector,
            evidence,
            alerts,
            server_addr,
            source,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(backend) = std::env::var("FALL_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detector.backend = backend.trim().to_string();
            }
        }
        if let Ok(path) = std::env::var("FALL_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.detector.model_path = PathBuf::from(path);
            }
        }
        if let Ok(threshold) = std::env::var("FALL_CONF_THRESHOLD") {
            self.detector.confidence_threshold = threshold
                .trim()
                .parse()
                .map_err(|_| anyhow!("FALL_CONF_THRESHOLD must be a number in 0..=1"))?;
        }
        if let Ok(dir) = std::env::var("FALL_FOLDER") {
            if !dir.trim().is_empty() {
                self.evidence.dir = PathBuf::from(dir);
            }
        }
        if let Ok(path) = std::env::var("FALL_LOG_FILE") {
            if !path.trim().is_empty() {
                self.evidence.log_path = PathBuf::from(path);
            }
        }
        if let Ok(cooldown) = std::env::var("FALL_ALERT_COOLDOWN_SECS") {
            let seconds: u64 = cooldown.trim().parse().map_err(|_| {
                anyhow!("FALL_ALERT_COOLDOWN_SECS must be an integer number of seconds")
            })?;
            self.alerts.cooldown = Duration::from_secs(seconds);
        }
        if let Ok(handoff) = std::env::var("FALL_ALERT_HANDOFF") {
            if !handoff.trim().is_empty() {
                self.alerts.handoff = handoff.parse()?;
            }
        }
        if let Ok(broker) = std::env::var("FALL_MQTT_BROKER") {
            if !broker.trim().is_empty() {
                let mqtt = self.alerts.mqtt.get_or_insert_with(|| MqttSettings {
                    broker: String::new(),
                    topic: DEFAULT_MQTT_TOPIC.to_string(),
                    client_id: DEFAULT_MQTT_CLIENT_ID.to_string(),
                    username: None,
                    password: None,
                    use_tls: false,
                    ca_path: None,
                });
                mqtt.broker = broker.trim().to_string();
            }
        }
        if let Some(mqtt) = self.alerts.mqtt.as_mut() {
            if let Ok(topic) = std::env::var("FALL_MQTT_TOPIC") {
                if !topic.trim().is_empty() {
                    mqtt.topic = topic.trim().to_string();
                }
            }
            if let Ok(user) = std::env::var("FALL_MQTT_USERNAME") {
                mqtt.username = Some(user);
            }
            if let Ok(password) = std::env::var("FALL_MQTT_PASSWORD") {
                mqtt.password = Some(password);
            }
        }
        if let Ok(addr) = std::env::var("FALL_SERVER_ADDR") {
            if !addr.trim().is_empty() {
                self.server_addr = addr;
            }
        }
        if let Ok(source) = std::env::var("FALL_SOURCE") {
            if !source.trim().is_empty() {
                self.source.default = source;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let threshold = self.detector.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "confidence threshold must be within 0..=1 (got {})",
                threshold
            ));
        }
        if self.detector.input_width == 0 || self.detector.input_height == 0 {
            return Err(anyhow!("detector input size must be non-zero"));
        }
        if let Some(mqtt) = &self.alerts.mqtt {
            if mqtt.topic.trim().is_empty() {
                return Err(anyhow!("MQTT alert topic cannot be empty"));
            }
        }
        if self.server_addr.trim().is_empty() {
            return Err(anyhow!("server address cannot be empty"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<FallwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
