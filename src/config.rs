use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::RetryPolicy;
use crate::frame::DEFAULT_DISTRIBUTOR_CAPACITY;
use crate::ingest::{SourceDescriptor, SourceOptions};
use crate::motion::MotionConfig;
use crate::pipeline::{PipelineConfig, RECOGNITION_JPEG_QUALITY};
use crate::recognize::{Accelerator, DEFAULT_SIMILARITY_THRESHOLD};
use crate::state::DEFAULT_HISTORY_CAPACITY;
use crate::stream::StreamConfig;
use crate::transport::{MqttSettings, DEFAULT_LOCATION};

const DEFAULT_SOURCE_URL: &str = "stub://front_camera";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_KNOWN_FACES_DIR: &str = "known_faces";
const DEFAULT_EMBEDDING_DIM: usize = 512;
const DEFAULT_MQTT_TOPIC: &str = "facewatch/detections";
const DEFAULT_MQTT_CLIENT_ID: &str = "facewatch";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FacewatchConfigFile {
    log_level: Option<String>,
    source: Option<SourceConfigFile>,
    capture: Option<CaptureConfigFile>,
    distributor: Option<DistributorConfigFile>,
    motion: Option<MotionConfigFile>,
    recognition: Option<RecognitionConfigFile>,
    history: Option<HistoryConfigFile>,
    stream: Option<StreamConfigFile>,
    api: Option<ApiConfigFile>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    connect_timeout_ms: Option<u64>,
    probe_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    soft_failure_threshold: Option<u32>,
    hard_failure_threshold: Option<u32>,
    max_reconnect_attempts: Option<u32>,
    connect_attempts: Option<u32>,
    connect_retry_delay_ms: Option<u64>,
    connect_with_retry_attempts: Option<u32>,
    connect_with_retry_delay_ms: Option<u64>,
    failure_pause_ms: Option<u64>,
    max_failure_pause_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    drain_reads: Option<u32>,
    min_brightness: Option<f64>,
    max_brightness: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct DistributorConfigFile {
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct MotionConfigFile {
    enabled: Option<bool>,
    area_threshold: Option<u32>,
    var_threshold: Option<f32>,
    history: Option<u32>,
    cooldown_secs: Option<f64>,
    processing_width: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RecognitionConfigFile {
    similarity_threshold: Option<f32>,
    known_faces_dir: Option<PathBuf>,
    embedding_dim: Option<usize>,
    accelerators: Option<Vec<Accelerator>>,
    model_path: Option<PathBuf>,
    enhance_contrast: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct HistoryConfigFile {
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    max_width: Option<u32>,
    jpeg_quality: Option<u8>,
    max_empty_polls: Option<u32>,
    poll_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    topic: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    location: Option<String>,
    tls_ca: Option<PathBuf>,
    tls_client_cert: Option<PathBuf>,
    tls_client_key: Option<PathBuf>,
}

/// Daemon configuration: defaults, then `FACEWATCH_CONFIG`, then environment.
#[derive(Debug, Clone)]
pub struct FacewatchConfig {
    pub log_level: Option<String>,
    pub source: SourceSettings,
    pub capture: RetryPolicy,
    pub distributor_capacity: usize,
    pub motion: MotionSettings,
    pub recognition: RecognitionSettings,
    pub history_capacity: usize,
    pub stream: StreamConfig,
    pub api_addr: String,
    /// `None` disables broker publishing; events are logged instead.
    pub mqtt: Option<MqttSettings>,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub url: String,
    pub options: SourceOptions,
}

#[derive(Debug, Clone)]
pub struct MotionSettings {
    pub enabled: bool,
    pub gate: MotionConfig,
}

#[derive(Debug, Clone)]
pub struct RecognitionSettings {
    pub similarity_threshold: f32,
    pub known_faces_dir: PathBuf,
    pub embedding_dim: usize,
    pub accelerators: Vec<Accelerator>,
    pub model_path: Option<PathBuf>,
    pub enhance_contrast: bool,
}

impl FacewatchConfig {
    pub fn load() -> Result<Self> {
        let config_path = env_nonempty("FACEWATCH_CONFIG").map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like [`load`](Self::load) with an explicit config file.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FacewatchConfigFile) -> Self {
        let source = file.source.unwrap_or_default();
        let capture = file.capture.unwrap_or_default();
        let motion = file.motion.unwrap_or_default();
        let recognition = file.recognition.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();

        let source_defaults = SourceOptions::default();
        let options = SourceOptions {
            connect_timeout: millis_or(source.connect_timeout_ms, source_defaults.connect_timeout),
            read_timeout: millis_or(source.read_timeout_ms, source_defaults.read_timeout),
            width: source.width.unwrap_or(source_defaults.width),
            height: source.height.unwrap_or(source_defaults.height),
            target_fps: source.target_fps.unwrap_or(source_defaults.target_fps),
        };

        let retry = RetryPolicy::default();
        let capture = RetryPolicy {
            probe_timeout: millis_or(source.probe_timeout_ms, retry.probe_timeout),
            frame_attempts: capture.connect_attempts.unwrap_or(retry.frame_attempts),
            frame_retry_delay: millis_or(capture.connect_retry_delay_ms, retry.frame_retry_delay),
            connect_attempts: capture
                .connect_with_retry_attempts
                .unwrap_or(retry.connect_attempts),
            connect_retry_delay: millis_or(
                capture.connect_with_retry_delay_ms,
                retry.connect_retry_delay,
            ),
            soft_failure_threshold: capture
                .soft_failure_threshold
                .unwrap_or(retry.soft_failure_threshold),
            hard_failure_threshold: capture
                .hard_failure_threshold
                .unwrap_or(retry.hard_failure_threshold),
            max_reconnect_attempts: capture
                .max_reconnect_attempts
                .unwrap_or(retry.max_reconnect_attempts),
            failure_pause: millis_or(capture.failure_pause_ms, retry.failure_pause),
            max_failure_pause: millis_or(capture.max_failure_pause_ms, retry.max_failure_pause),
            reconnect_delay: millis_or(capture.reconnect_delay_ms, retry.reconnect_delay),
            drain_reads: capture.drain_reads.unwrap_or(retry.drain_reads),
            min_brightness: capture.min_brightness.unwrap_or(retry.min_brightness),
            max_brightness: capture.max_brightness.unwrap_or(retry.max_brightness),
            join_timeout: retry.join_timeout,
        };

        let gate_defaults = MotionConfig::default();
        let gate = MotionConfig {
            area_threshold: motion.area_threshold.unwrap_or(gate_defaults.area_threshold),
            var_threshold: motion.var_threshold.unwrap_or(gate_defaults.var_threshold),
            history: motion.history.unwrap_or(gate_defaults.history),
            cooldown: motion
                .cooldown_secs
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Duration::from_secs_f64)
                .unwrap_or(gate_defaults.cooldown),
            processing_width: motion
                .processing_width
                .unwrap_or(gate_defaults.processing_width),
        };

        let stream_defaults = StreamConfig::default();
        let stream = StreamConfig {
            max_width: stream.max_width.unwrap_or(stream_defaults.max_width),
            jpeg_quality: stream.jpeg_quality.unwrap_or(stream_defaults.jpeg_quality),
            max_empty_polls: stream
                .max_empty_polls
                .unwrap_or(stream_defaults.max_empty_polls),
            poll_timeout: millis_or(stream.poll_timeout_ms, stream_defaults.poll_timeout),
        };

        let mqtt = file.mqtt.and_then(|mqtt| {
            let broker = mqtt.broker?;
            Some(MqttSettings {
                broker,
                topic: mqtt.topic.unwrap_or_else(|| DEFAULT_MQTT_TOPIC.to_string()),
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                username: mqtt.username,
                password: mqtt.password,
                location: mqtt.location.unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
                tls_ca: mqtt.tls_ca,
                tls_client_cert: mqtt.tls_client_cert,
                tls_client_key: mqtt.tls_client_key,
                ..MqttSettings::default()
            })
        });

        Self {
            log_level: file.log_level,
            source: SourceSettings {
                url: source.url.unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
                options,
            },
            capture,
            distributor_capacity: file
                .distributor
                .and_then(|d| d.capacity)
                .unwrap_or(DEFAULT_DISTRIBUTOR_CAPACITY),
            motion: MotionSettings {
                enabled: motion.enabled.unwrap_or(true),
                gate,
            },
            recognition: RecognitionSettings {
                similarity_threshold: recognition
                    .similarity_threshold
                    .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD),
                known_faces_dir: recognition
                    .known_faces_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_KNOWN_FACES_DIR)),
                embedding_dim: recognition.embedding_dim.unwrap_or(DEFAULT_EMBEDDING_DIM),
                accelerators: recognition
                    .accelerators
                    .unwrap_or_else(|| vec![Accelerator::Gpu, Accelerator::Cpu]),
                model_path: recognition.model_path,
                enhance_contrast: recognition.enhance_contrast.unwrap_or(true),
            },
            history_capacity: file
                .history
                .and_then(|h| h.capacity)
                .unwrap_or(DEFAULT_HISTORY_CAPACITY),
            stream,
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            mqtt,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_nonempty("FACEWATCH_SOURCE_URL") {
            self.source.url = url;
        }
        if let Some(enabled) = env_nonempty("FACEWATCH_MOTION_ENABLED") {
            self.motion.enabled = parse_bool(&enabled)
                .ok_or_else(|| anyhow!("FACEWATCH_MOTION_ENABLED must be true or false"))?;
        }
        if let Some(cooldown) = env_nonempty("FACEWATCH_MOTION_COOLDOWN_SECS") {
            let secs: f64 = cooldown
                .parse()
                .map_err(|_| anyhow!("FACEWATCH_MOTION_COOLDOWN_SECS must be a number of seconds"))?;
            if !secs.is_finite() || secs < 0.0 {
                return Err(anyhow!("FACEWATCH_MOTION_COOLDOWN_SECS must be non-negative"));
            }
            self.motion.gate.cooldown = Duration::from_secs_f64(secs);
        }
        if let Some(threshold) = env_nonempty("FACEWATCH_SIMILARITY_THRESHOLD") {
            self.recognition.similarity_threshold = threshold
                .parse()
                .map_err(|_| anyhow!("FACEWATCH_SIMILARITY_THRESHOLD must be a number"))?;
        }
        if let Some(dir) = env_nonempty("FACEWATCH_KNOWN_FACES_DIR") {
            self.recognition.known_faces_dir = PathBuf::from(dir);
        }
        if let Some(list) = env_nonempty("FACEWATCH_ACCELERATORS") {
            self.recognition.accelerators = split_csv(&list)
                .iter()
                .map(|entry| entry.parse())
                .collect::<Result<_>>()?;
        }
        if let Some(path) = env_nonempty("FACEWATCH_MODEL_PATH") {
            self.recognition.model_path = Some(PathBuf::from(path));
        }
        if let Some(addr) = env_nonempty("FACEWATCH_API_ADDR") {
            self.api_addr = addr;
        }

        if let Some(broker) = env_nonempty("FACEWATCH_MQTT_BROKER") {
            let mqtt = self.mqtt.get_or_insert_with(|| MqttSettings {
                topic: DEFAULT_MQTT_TOPIC.to_string(),
                client_id: DEFAULT_MQTT_CLIENT_ID.to_string(),
                ..MqttSettings::default()
            });
            mqtt.broker = broker;
        }
        if let Some(mqtt) = self.mqtt.as_mut() {
            if let Some(topic) = env_nonempty("FACEWATCH_MQTT_TOPIC") {
                mqtt.topic = topic;
            }
            if let Some(client_id) = env_nonempty("FACEWATCH_MQTT_CLIENT_ID") {
                mqtt.client_id = client_id;
            }
            if let Some(username) = env_nonempty("FACEWATCH_MQTT_USERNAME") {
                mqtt.username = Some(username);
            }
            if let Some(password) = env_nonempty("FACEWATCH_MQTT_PASSWORD") {
                mqtt.password = Some(password);
            }
            if let Some(location) = env_nonempty("FACEWATCH_MQTT_LOCATION") {
                mqtt.location = location;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        // Fail fast on a bad default source; nothing is dialled here.
        SourceDescriptor::parse(&self.source.url)
            .map_err(|err| anyhow!("source.url: {}", err))?;

        if self.distributor_capacity == 0 {
            return Err(anyhow!("distributor.capacity must be greater than zero"));
        }
        if self.history_capacity == 0 {
            return Err(anyhow!("history.capacity must be greater than zero"));
        }
        if self.capture.soft_failure_threshold >= self.capture.hard_failure_threshold {
            return Err(anyhow!(
                "capture.soft_failure_threshold ({}) must be below capture.hard_failure_threshold ({})",
                self.capture.soft_failure_threshold,
                self.capture.hard_failure_threshold
            ));
        }
        if self.capture.min_brightness >= self.capture.max_brightness {
            return Err(anyhow!("capture.min_brightness must be below capture.max_brightness"));
        }
        let threshold = self.recognition.similarity_threshold;
        if !threshold.is_finite() || !(-1.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "recognition.similarity_threshold must be within [-1, 1], got {}",
                threshold
            ));
        }
        if self.recognition.accelerators.is_empty() {
            return Err(anyhow!("recognition.accelerators must not be empty"));
        }
        self.recognition.accelerators.dedup();
        if self.recognition.embedding_dim == 0 {
            return Err(anyhow!("recognition.embedding_dim must be greater than zero"));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(anyhow!(
                "stream.jpeg_quality must be within 1..=100, got {}",
                self.stream.jpeg_quality
            ));
        }
        if let Some(mqtt) = &self.mqtt {
            crate::transport::parse_mqtt_endpoint(&mqtt.broker)?;
            if mqtt.topic.trim().is_empty() {
                return Err(anyhow!("mqtt.topic must not be empty"));
            }
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            motion_enabled: self.motion.enabled,
            enhance_contrast: self.recognition.enhance_contrast,
            jpeg_quality: RECOGNITION_JPEG_QUALITY,
            ..PipelineConfig::default()
        }
    }
}

fn read_config_file(path: &Path) -> Result<FacewatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() -> Result<()> {
        let mut cfg = FacewatchConfig::from_file(FacewatchConfigFile::default());
        cfg.validate()?;
        assert_eq!(cfg.source.url, DEFAULT_SOURCE_URL);
        assert_eq!(cfg.distributor_capacity, 3);
        assert_eq!(cfg.history_capacity, 20);
        assert_eq!(cfg.capture.soft_failure_threshold, 15);
        assert_eq!(cfg.capture.hard_failure_threshold, 20);
        assert_eq!(cfg.motion.gate.cooldown, Duration::from_secs(3));
        assert_eq!(cfg.recognition.accelerators, vec![Accelerator::Gpu, Accelerator::Cpu]);
        assert!(cfg.mqtt.is_none());
        Ok(())
    }

    #[test]
    fn parses_toml_sections() -> Result<()> {
        let file: FacewatchConfigFile = toml::from_str(
            r#"
            [capture]
            soft_failure_threshold = 4
            hard_failure_threshold = 6

            [recognition]
            accelerators = ["cpu"]
            similarity_threshold = 0.5

            [mqtt]
            broker = "mqtts://broker.example:8883"
            "#,
        )?;
        let mut cfg = FacewatchConfig::from_file(file);
        cfg.validate()?;
        assert_eq!(cfg.capture.soft_failure_threshold, 4);
        assert_eq!(cfg.recognition.accelerators, vec![Accelerator::Cpu]);
        let mqtt = cfg.mqtt.expect("mqtt settings");
        assert_eq!(mqtt.topic, DEFAULT_MQTT_TOPIC);
        assert_eq!(mqtt.location, DEFAULT_LOCATION);
        Ok(())
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut cfg = FacewatchConfig::from_file(FacewatchConfigFile::default());
        cfg.capture.soft_failure_threshold = 20;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_similarity() {
        let mut cfg = FacewatchConfig::from_file(FacewatchConfigFile::default());
        cfg.recognition.similarity_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn csv_and_bool_helpers() {
        assert_eq!(split_csv(" gpu, ,cpu "), vec!["gpu", "cpu"]);
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("nope"), None);
    }
}
