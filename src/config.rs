use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gate::GateConfig;
use crate::ingest::{Resolution, SourceOptions};
use crate::pipeline::PipelineConfig;
use crate::stream::StreamConfig;
use crate::tracker::TrackerConfig;
use crate::verification::VerifierConfig;

const DEFAULT_CAMERA_URL: &str = "http://192.168.1.100/stream";
const DEFAULT_CAMERA_NAME: &str = "ESP32 Camera";
const DEFAULT_TARGET_FPS: u32 = 15;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_STREAM_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 60;
const DEFAULT_OFFLINE_AFTER_FAILURES: u32 = 3;
const DEFAULT_LOCAL_DEVICES: usize = 5;

const DEFAULT_PERSON_CONFIDENCE: f32 = 0.75;
const DEFAULT_MIN_DETECTIONS: u32 = 5;
const DEFAULT_KNOWN_CONFIDENCE: f32 = 0.92;
const DEFAULT_FRAME_SKIP: u32 = 5;
const DEFAULT_MIN_PERSON_AREA_PERCENT: f32 = 2.0;
const DEFAULT_TRACK_DISTANCE: f32 = 100.0;
const DEFAULT_TRACK_TIMEOUT_FRAMES: u32 = 30;

const DEFAULT_IMAGES_DIR: &str = "security_images";
const DEFAULT_LOG_PATH: &str = "security_log.jsonl";
const DEFAULT_DATASET_DIR: &str = "training_data";
const DEFAULT_HASH_THRESHOLD: u32 = 5;
const DEFAULT_COOLDOWN_THRESHOLD: u32 = 10;
const DEFAULT_SAVE_COOLDOWN_SECS: u64 = 60 * 60;

const DEFAULT_BUZZER_URL: &str = "http://192.168.1.101/alert";
const DEFAULT_BUZZER_PATTERN: u8 = 1;
const DEFAULT_ALERT_COOLDOWN_SECS: u64 = 30;
const DEFAULT_ALERT_TIMEOUT_SECS: u64 = 2;

const DEFAULT_API_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_PREVIEW_FPS: u32 = 15;

#[derive(Debug, Deserialize, Default)]
struct WatchpostConfigFile {
    camera: Option<CameraConfigFile>,
    detection: Option<DetectionConfigFile>,
    storage: Option<StorageConfigFile>,
    alert: Option<AlertConfigFile>,
    api: Option<ApiConfigFile>,
    models: Option<ModelConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    url: Option<String>,
    name: Option<String>,
    local_devices: Option<usize>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    timeout_secs: Option<u64>,
    reconnect_delay_secs: Option<u64>,
    max_backoff_secs: Option<u64>,
    offline_after_failures: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    person_confidence: Option<f32>,
    min_detections: Option<u32>,
    known_confidence: Option<f32>,
    frame_skip: Option<u32>,
    min_person_area_percent: Option<f32>,
    max_track_distance: Option<f32>,
    track_timeout_frames: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    save_images: Option<bool>,
    images_dir: Option<PathBuf>,
    log_path: Option<PathBuf>,
    dataset_dir: Option<PathBuf>,
    hash_similarity_threshold: Option<u32>,
    cooldown_similarity_threshold: Option<u32>,
    save_cooldown_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertConfigFile {
    enabled: Option<bool>,
    buzzer_url: Option<String>,
    pattern: Option<u8>,
    cooldown_secs: Option<u64>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    preview_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    person: Option<PathBuf>,
    face: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct WatchpostConfig {
    pub camera: CameraSettings,
    pub detection: DetectionSettings,
    pub storage: StorageSettings,
    pub alert: AlertSettings,
    pub api: ApiSettings,
    pub models: ModelSettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub url: String,
    pub name: String,
    pub local_devices: usize,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    pub timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_backoff: Duration,
    pub offline_after_failures: u32,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub person_confidence: f32,
    pub min_detections: u32,
    pub known_confidence: f32,
    pub frame_skip: u32,
    pub min_person_area_percent: f32,
    pub max_track_distance: f32,
    pub track_timeout_frames: u32,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub save_images: bool,
    pub images_dir: PathBuf,
    pub log_path: PathBuf,
    pub dataset_dir: PathBuf,
    pub hash_similarity_threshold: u32,
    pub cooldown_similarity_threshold: u32,
    pub save_cooldown: Duration,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub enabled: bool,
    pub buzzer_url: String,
    pub pattern: u8,
    pub cooldown: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub addr: String,
    pub preview_fps: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ModelSettings {
    pub person: Option<PathBuf>,
    pub face: Option<PathBuf>,
}

impl WatchpostConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("WATCHPOST_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from an explicit file instead of `WATCHPOST_CONFIG`. Environment overrides still apply.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: WatchpostConfigFile) -> Self {
        let camera = file.camera.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let storage = file.storage.unwrap_or_default();
        let alert = file.alert.unwrap_or_default();
        let api = file.api.unwrap_or_default();
        let models = file.models.unwrap_or_default();
        Self {
            camera: CameraSettings {
                url: camera.url.unwrap_or_else(|| DEFAULT_CAMERA_URL.to_string()),
                name: camera.name.unwrap_or_else(|| DEFAULT_CAMERA_NAME.to_string()),
                local_devices: camera.local_devices.unwrap_or(DEFAULT_LOCAL_DEVICES),
                target_fps: camera.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
                width: camera.width.unwrap_or(DEFAULT_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_HEIGHT),
                timeout: Duration::from_secs(
                    camera.timeout_secs.unwrap_or(DEFAULT_STREAM_TIMEOUT_SECS),
                ),
                reconnect_delay: Duration::from_secs(
                    camera
                        .reconnect_delay_secs
                        .unwrap_or(DEFAULT_RECONNECT_DELAY_SECS),
                ),
                max_backoff: Duration::from_secs(
                    camera.max_backoff_secs.unwrap_or(DEFAULT_MAX_BACKOFF_SECS),
                ),
                offline_after_failures: camera
                    .offline_after_failures
                    .unwrap_or(DEFAULT_OFFLINE_AFTER_FAILURES),
            },
            detection: DetectionSettings {
                person_confidence: detection
                    .person_confidence
                    .unwrap_or(DEFAULT_PERSON_CONFIDENCE),
                min_detections: detection.min_detections.unwrap_or(DEFAULT_MIN_DETECTIONS),
                known_confidence: detection
                    .known_confidence
                    .unwrap_or(DEFAULT_KNOWN_CONFIDENCE),
                frame_skip: detection.frame_skip.unwrap_or(DEFAULT_FRAME_SKIP),
                min_person_area_percent: detection
                    .min_person_area_percent
                    .unwrap_or(DEFAULT_MIN_PERSON_AREA_PERCENT),
                max_track_distance: detection
                    .max_track_distance
                    .unwrap_or(DEFAULT_TRACK_DISTANCE),
                track_timeout_frames: detection
                    .track_timeout_frames
                    .unwrap_or(DEFAULT_TRACK_TIMEOUT_FRAMES),
            },
            storage: StorageSettings {
                save_images: storage.save_images.unwrap_or(true),
                images_dir: storage
                    .images_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGES_DIR)),
                log_path: storage
                    .log_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_PATH)),
                dataset_dir: storage
                    .dataset_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_DATASET_DIR)),
                hash_similarity_threshold: storage
                    .hash_similarity_threshold
                    .unwrap_or(DEFAULT_HASH_THRESHOLD),
                cooldown_similarity_threshold: storage
                    .cooldown_similarity_threshold
                    .unwrap_or(DEFAULT_COOLDOWN_THRESHOLD),
                save_cooldown: Duration::from_secs(
                    storage
                        .save_cooldown_secs
                        .unwrap_or(DEFAULT_SAVE_COOLDOWN_SECS),
                ),
            },
            alert: AlertSettings {
                enabled: alert.enabled.unwrap_or(true),
                buzzer_url: alert
                    .buzzer_url
                    .unwrap_or_else(|| DEFAULT_BUZZER_URL.to_string()),
                pattern: alert.pattern.unwrap_or(DEFAULT_BUZZER_PATTERN),
                cooldown: Duration::from_secs(
                    alert.cooldown_secs.unwrap_or(DEFAULT_ALERT_COOLDOWN_SECS),
                ),
                timeout: Duration::from_secs(
                    alert.timeout_secs.unwrap_or(DEFAULT_ALERT_TIMEOUT_SECS),
                ),
            },
            api: ApiSettings {
                addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
                preview_fps: api.preview_fps.unwrap_or(DEFAULT_PREVIEW_FPS),
            },
            models: ModelSettings {
                person: models.person,
                face: models.face,
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = non_empty_env("WATCHPOST_CAMERA_URL") {
            self.camera.url = url;
        }
        if let Some(url) = non_empty_env("WATCHPOST_BUZZER_URL") {
            self.alert.buzzer_url = url;
        }
        if let Some(addr) = non_empty_env("WATCHPOST_API_ADDR") {
            self.api.addr = addr;
        }
        if let Some(dir) = non_empty_env("WATCHPOST_IMAGES_DIR") {
            self.storage.images_dir = PathBuf::from(dir);
        }
        if let Some(raw) = non_empty_env("WATCHPOST_MIN_DETECTIONS") {
            self.detection.min_detections = raw
                .parse()
                .map_err(|_| anyhow!("WATCHPOST_MIN_DETECTIONS must be a positive integer"))?;
        }
        if let Some(raw) = non_empty_env("WATCHPOST_KNOWN_CONFIDENCE") {
            self.detection.known_confidence = raw
                .parse()
                .map_err(|_| anyhow!("WATCHPOST_KNOWN_CONFIDENCE must be a number in [0, 1]"))?;
        }
        if let Some(raw) = non_empty_env("WATCHPOST_ALERT_COOLDOWN_SECS") {
            let seconds: u64 = raw.parse().map_err(|_| {
                anyhow!("WATCHPOST_ALERT_COOLDOWN_SECS must be an integer number of seconds")
            })?;
            self.alert.cooldown = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("person_confidence", self.detection.person_confidence),
            ("known_confidence", self.detection.known_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if self.detection.min_detections == 0 {
            return Err(anyhow!("min_detections must be at least 1"));
        }
        if self.detection.frame_skip == 0 {
            return Err(anyhow!("frame_skip must be at least 1"));
        }
        if !(0.0..=100.0).contains(&self.detection.min_person_area_percent) {
            return Err(anyhow!("min_person_area_percent must be within [0, 100]"));
        }
        if self.detection.max_track_distance <= 0.0 {
            return Err(anyhow!("max_track_distance must be greater than zero"));
        }
        if self.camera.target_fps == 0 || self.api.preview_fps == 0 {
            return Err(anyhow!("fps values must be greater than zero"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera resolution must be non-zero"));
        }
        if self.camera.timeout.is_zero() {
            return Err(anyhow!("camera timeout must be greater than zero"));
        }
        if self.camera.offline_after_failures == 0 {
            return Err(anyhow!("offline_after_failures must be at least 1"));
        }
        if self.camera.max_backoff < self.camera.reconnect_delay {
            return Err(anyhow!("max_backoff must not be shorter than reconnect_delay"));
        }
        if self.storage.cooldown_similarity_threshold > 64
            || self.storage.hash_similarity_threshold > 64
        {
            return Err(anyhow!("hash thresholds are bit counts and must be at most 64"));
        }
        Ok(())
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            reconnect_delay: self.camera.reconnect_delay,
            max_backoff: self.camera.max_backoff,
            offline_after_failures: self.camera.offline_after_failures,
            source: SourceOptions {
                target_fps: self.camera.target_fps,
                timeout: self.camera.timeout,
                preferred: Resolution::new(self.camera.width, self.camera.height),
            },
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            person_confidence: self.detection.person_confidence,
            min_person_area_percent: self.detection.min_person_area_percent,
            frame_skip: self.detection.frame_skip,
            buzzer_pattern: self.alert.pattern,
            tracker: TrackerConfig {
                max_track_distance: self.detection.max_track_distance,
                track_timeout_frames: self.detection.track_timeout_frames,
            },
            verifier: VerifierConfig {
                min_detections: self.detection.min_detections,
                known_confidence: self.detection.known_confidence,
            },
            gate: GateConfig {
                save_images: self.storage.save_images,
                hash_similarity_threshold: self.storage.hash_similarity_threshold,
                cooldown_similarity_threshold: self.storage.cooldown_similarity_threshold,
                save_cooldown: to_chrono(self.storage.save_cooldown),
                alert_cooldown: to_chrono(self.alert.cooldown),
            },
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<WatchpostConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
