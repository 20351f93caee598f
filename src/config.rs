use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::ConfigurationError;

type Result<T> = std::result::Result<T, ConfigurationError>;

const DEFAULT_DB_PATH: &str = "gatewatch.db";
const DEFAULT_SNAPSHOT_DIR: &str = "snapshots";
const DEFAULT_CAMERA_ID: &str = "front-door";
const DEFAULT_CAMERA_URI: &str = "stub://front-door";
const DEFAULT_TARGET_FPS: u32 = 5;
const MAX_TARGET_FPS: u32 = 60;
const DEFAULT_RECOGNITION_THRESHOLD: f32 = 0.4;
const DEFAULT_LIVENESS_THRESHOLD: f32 = 0.7;
const DEFAULT_COOLDOWN_SECS: u64 = 30;
const DEFAULT_STALL_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_BACKOFF_MIN_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_STABLE_AFTER_MS: u64 = 10_000;
const DEFAULT_MIN_FACE_SIZE: u32 = 60;
const DEFAULT_DETECTION_CONFIDENCE: f32 = 0.7;
const DEFAULT_SNAPSHOT_RETENTION_DAYS: u32 = 7;
const DEFAULT_PIPELINE_WORKERS: usize = 2;
const DEFAULT_STATUS_LOG_SECS: u64 = 5;
/// `[spoof, live]` softmax ordering.
const DEFAULT_LIVENESS_LIVE_INDEX: usize = 1;

// -------------------- File layout --------------------

#[derive(Debug, Deserialize, Default)]
struct GatewatchConfigFile {
    cameras: Option<Vec<CameraFile>>,
    thresholds: Option<ThresholdsFile>,
    stream: Option<StreamFile>,
    detection: Option<DetectionFile>,
    storage: Option<StorageFile>,
    models: Option<ModelsFile>,
    pipeline_workers: Option<usize>,
    identity_reload_secs: Option<u64>,
    status_log_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CameraFile {
    id: String,
    location: Option<String>,
    transport: Option<TransportKind>,
    uri: String,
    enabled: Option<bool>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ThresholdsFile {
    recognition_threshold: Option<f32>,
    liveness_threshold: Option<f32>,
    cooldown_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamFile {
    stall_timeout_ms: Option<u64>,
    backoff_min_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    stable_after_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionFile {
    min_face_size: Option<u32>,
    detection_confidence: Option<f32>,
    liveness_enabled: Option<bool>,
    try_rotations: Option<bool>,
    metric: Option<MetricKind>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageFile {
    db_path: Option<String>,
    snapshot_dir: Option<PathBuf>,
    snapshot_retention_days: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelsFile {
    backend: Option<String>,
    embedder_path: Option<PathBuf>,
    liveness_path: Option<PathBuf>,
    liveness_live_index: Option<usize>,
}

// -------------------- Resolved configuration --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Pull-mode MJPEG (or single JPEG snapshots) over HTTP.
    Mjpeg,
    Rtsp,
}

/// One configured camera. Everything except `enabled` is fixed after load.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraSource {
    pub id: String,
    pub location: String,
    pub transport: TransportKind,
    pub uri: String,
    pub enabled: bool,
    pub target_fps: u32,
}

impl CameraSource {
    pub fn is_stub(&self) -> bool {
        self.uri.starts_with("stub://")
    }
}

/// Runtime-adjustable decision thresholds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thresholds {
    /// Maximum embedding distance accepted as a match.
    pub recognition_threshold: f32,
    /// Minimum liveness score for a face to count as live.
    pub liveness_threshold: f32,
    pub cooldown: Duration,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            recognition_threshold: DEFAULT_RECOGNITION_THRESHOLD,
            liveness_threshold: DEFAULT_LIVENESS_THRESHOLD,
            cooldown: Duration::from_secs(DEFAULT_COOLDOWN_SECS),
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<()> {
        check_unit("recognition_threshold", self.recognition_threshold)?;
        check_unit("liveness_threshold", self.liveness_threshold)?;
        if self.cooldown.is_zero() {
            return Err(ConfigurationError::new("cooldown must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamTiming {
    /// A session with no frame for this long is treated as stalled.
    pub stall_timeout: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// Streaming at least this long resets the backoff to `backoff_min`.
    pub stable_after: Duration,
}

impl Default for StreamTiming {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_millis(DEFAULT_STALL_TIMEOUT_MS),
            backoff_min: Duration::from_millis(DEFAULT_BACKOFF_MIN_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            stable_after: Duration::from_millis(DEFAULT_STABLE_AFTER_MS),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    #[default]
    Cosine,
    Euclidean,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectionSettings {
    pub min_face_size: u32,
    pub detection_confidence: f32,
    pub liveness_enabled: bool,
    pub try_rotations: bool,
    pub metric: MetricKind,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            detection_confidence: DEFAULT_DETECTION_CONFIDENCE,
            liveness_enabled: true,
            try_rotations: true,
            metric: MetricKind::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StorageSettings {
    pub db_path: String,
    pub snapshot_dir: PathBuf,
    pub snapshot_retention_days: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelSettings {
    /// `stub` or `tract`.
    pub backend: String,
    pub embedder_path: Option<PathBuf>,
    pub liveness_path: Option<PathBuf>,
    /// Output index of the live class for multi-output liveness models.
    pub liveness_live_index: usize,
}

#[derive(Clone, Debug)]
pub struct GatewatchConfig {
    pub cameras: Vec<CameraSource>,
    pub thresholds: Thresholds,
    pub timing: StreamTiming,
    pub detection: DetectionSettings,
    pub storage: StorageSettings,
    pub models: ModelSettings,
    pub pipeline_workers: usize,
    pub identity_reload: Option<Duration>,
    pub status_log_interval: Duration,
}

impl GatewatchConfig {
    /// Load from `GATEWATCH_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("GATEWATCH_CONFIG").ok();
        Self::load_with_path(path.as_deref().map(Path::new))
    }

    /// Load an explicit config file; `None` falls back to defaults.
    pub fn load_with_path(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GatewatchConfigFile) -> Result<Self> {
        let cameras = match file.cameras {
            Some(cameras) => cameras
                .into_iter()
                .map(|camera| {
                    let transport = match camera.transport {
                        Some(transport) => transport,
                        None => infer_transport(&camera.uri)?,
                    };
                    Ok(CameraSource {
                        location: camera.location.unwrap_or_else(|| camera.id.clone()),
                        id: camera.id,
                        transport,
                        uri: camera.uri,
                        enabled: camera.enabled.unwrap_or(true),
                        target_fps: camera.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            None => vec![CameraSource {
                id: DEFAULT_CAMERA_ID.to_string(),
                location: "Main Entrance".to_string(),
                transport: TransportKind::Mjpeg,
                uri: DEFAULT_CAMERA_URI.to_string(),
                enabled: true,
                target_fps: DEFAULT_TARGET_FPS,
            }],
        };

        let thresholds_file = file.thresholds.unwrap_or_default();
        let defaults = Thresholds::default();
        let thresholds = Thresholds {
            recognition_threshold: thresholds_file
                .recognition_threshold
                .unwrap_or(defaults.recognition_threshold),
            liveness_threshold: thresholds_file
                .liveness_threshold
                .unwrap_or(defaults.liveness_threshold),
            cooldown: thresholds_file
                .cooldown_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.cooldown),
        };

        let stream = file.stream.unwrap_or_default();
        let defaults = StreamTiming::default();
        let timing = StreamTiming {
            stall_timeout: stream
                .stall_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.stall_timeout),
            backoff_min: stream
                .backoff_min_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_min),
            backoff_max: stream
                .backoff_max_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_max),
            stable_after: stream
                .stable_after_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.stable_after),
        };

        let detection_file = file.detection.unwrap_or_default();
        let defaults = DetectionSettings::default();
        let detection = DetectionSettings {
            min_face_size: detection_file.min_face_size.unwrap_or(defaults.min_face_size),
            detection_confidence: detection_file
                .detection_confidence
                .unwrap_or(defaults.detection_confidence),
            liveness_enabled: detection_file
                .liveness_enabled
                .unwrap_or(defaults.liveness_enabled),
            try_rotations: detection_file.try_rotations.unwrap_or(defaults.try_rotations),
            metric: detection_file.metric.unwrap_or(defaults.metric),
        };

        let storage_file = file.storage.unwrap_or_default();
        let storage = StorageSettings {
            db_path: storage_file
                .db_path
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            snapshot_dir: storage_file
                .snapshot_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_DIR)),
            snapshot_retention_days: storage_file
                .snapshot_retention_days
                .unwrap_or(DEFAULT_SNAPSHOT_RETENTION_DAYS),
        };

        let models_file = file.models.unwrap_or_default();
        let models = ModelSettings {
            backend: models_file.backend.unwrap_or_else(|| "stub".to_string()),
            embedder_path: models_file.embedder_path,
            liveness_path: models_file.liveness_path,
            liveness_live_index: models_file
                .liveness_live_index
                .unwrap_or(DEFAULT_LIVENESS_LIVE_INDEX),
        };

        Ok(Self {
            cameras,
            thresholds,
            timing,
            detection,
            storage,
            models,
            pipeline_workers: file.pipeline_workers.unwrap_or(DEFAULT_PIPELINE_WORKERS),
            identity_reload: file
                .identity_reload_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            status_log_interval: Duration::from_secs(
                file.status_log_secs.unwrap_or(DEFAULT_STATUS_LOG_SECS).max(1),
            ),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("GATEWATCH_DB_PATH") {
            if !path.trim().is_empty() {
                self.storage.db_path = path;
            }
        }
        if let Ok(dir) = std::env::var("GATEWATCH_SNAPSHOT_DIR") {
            if !dir.trim().is_empty() {
                self.storage.snapshot_dir = PathBuf::from(dir);
            }
        }
        if let Some(value) = env_parse::<f32>("GATEWATCH_RECOGNITION_THRESHOLD")? {
            self.thresholds.recognition_threshold = value;
        }
        if let Some(value) = env_parse::<f32>("GATEWATCH_LIVENESS_THRESHOLD")? {
            self.thresholds.liveness_threshold = value;
        }
        if let Some(value) = env_parse::<u64>("GATEWATCH_COOLDOWN_SECS")? {
            self.thresholds.cooldown = Duration::from_secs(value);
        }
        if let Some(value) = env_parse::<usize>("GATEWATCH_PIPELINE_WORKERS")? {
            self.pipeline_workers = value;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(ConfigurationError::new("at least one camera must be configured"));
        }
        let mut seen = std::collections::HashSet::new();
        for camera in &self.cameras {
            validate_camera(camera)?;
            if !seen.insert(camera.id.as_str()) {
                return Err(ConfigurationError(format!(
                    "duplicate camera id '{}'",
                    camera.id
                )));
            }
        }

        self.thresholds.validate()?;
        check_unit("detection_confidence", self.detection.detection_confidence)?;

        if self.timing.stall_timeout.is_zero() {
            return Err(ConfigurationError::new("stall timeout must be greater than zero"));
        }
        if self.timing.backoff_min.is_zero() || self.timing.backoff_min > self.timing.backoff_max {
            return Err(ConfigurationError::new(
                "backoff must satisfy 0 < backoff_min <= backoff_max",
            ));
        }
        if self.pipeline_workers == 0 {
            return Err(ConfigurationError::new("pipeline_workers must be at least 1"));
        }
        match self.models.backend.as_str() {
            "stub" | "tract" => {}
            other => {
                return Err(ConfigurationError(format!(
                    "unknown model backend '{}'; expected stub or tract",
                    other
                )))
            }
        }
        Ok(())
    }

    pub fn camera(&self, id: &str) -> Option<&CameraSource> {
        self.cameras.iter().find(|camera| camera.id == id)
    }
}

pub fn validate_camera_id(id: &str) -> Result<()> {
    static CAMERA_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = CAMERA_ID_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("camera id pattern is valid")
    });
    if !re.is_match(id) {
        return Err(ConfigurationError(format!(
            "camera id '{}' must be 1-64 characters of [A-Za-z0-9_-]",
            id
        )));
    }
    Ok(())
}

fn validate_camera(camera: &CameraSource) -> Result<()> {
    validate_camera_id(&camera.id)?;
    if camera.target_fps == 0 || camera.target_fps > MAX_TARGET_FPS {
        return Err(ConfigurationError(format!(
            "camera '{}': target_fps must be in 1..={}",
            camera.id, MAX_TARGET_FPS
        )));
    }
    if camera.is_stub() {
        return Ok(());
    }
    let scheme_ok = match camera.transport {
        TransportKind::Mjpeg => {
            camera.uri.starts_with("http://") || camera.uri.starts_with("https://")
        }
        TransportKind::Rtsp => camera.uri.starts_with("rtsp://"),
    };
    if !scheme_ok {
        return Err(ConfigurationError(format!(
            "camera '{}': uri '{}' does not match transport {:?}",
            camera.id, camera.uri, camera.transport
        )));
    }
    url::Url::parse(&camera.uri).map_err(|e| {
        ConfigurationError(format!("camera '{}': invalid uri: {}", camera.id, e))
    })?;
    Ok(())
}

fn infer_transport(uri: &str) -> Result<TransportKind> {
    if uri.starts_with("rtsp://") {
        Ok(TransportKind::Rtsp)
    } else if uri.starts_with("http://") || uri.starts_with("https://") || uri.starts_with("stub://")
    {
        Ok(TransportKind::Mjpeg)
    } else {
        Err(ConfigurationError(format!(
            "cannot infer transport for uri '{}'",
            uri
        )))
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigurationError(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )));
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigurationError(format!("{} has an invalid value '{}'", key, raw))),
        _ => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<GatewatchConfigFile> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ConfigurationError(format!("failed to read config file {}: {}", path.display(), e))
    })?;
    let parsed = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&raw).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&raw).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| ConfigurationError(format!("invalid config file {}: {}", path.display(), e)))
}
