use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Quality and framing gates, fixed for the lifetime of a capture session.
///
/// Kept as a flat key/value table so it can be tuned per deployment without
/// touching the other sections.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Thresholds {
    /// Minimum mean grayscale intensity (0-255).
    #[serde(default = "default_brightness_min")]
    pub brightness_min: f64,
    /// Minimum variance of the Laplacian response.
    #[serde(default = "default_sharpness_min")]
    pub sharpness_min: f64,
    #[serde(default = "default_min_width_px")]
    pub min_width_px: u32,
    #[serde(default = "default_min_height_px")]
    pub min_height_px: u32,
    #[serde(default = "default_aspect_ratio_min")]
    pub aspect_ratio_min: f64,
    #[serde(default = "default_aspect_ratio_max")]
    pub aspect_ratio_max: f64,
}

impl Thresholds {
    /// Whether a bounding box of `width` x `height` passes the size and
    /// aspect-ratio gates. Width and height must strictly exceed the minimums;
    /// the aspect band is inclusive.
    pub fn accepts_box(&self, width: u32, height: u32) -> bool {
        if height == 0 || width <= self.min_width_px || height <= self.min_height_px {
            return false;
        }
        self.accepts_aspect(width as f64 / height as f64)
    }

    pub fn accepts_aspect(&self, aspect_ratio: f64) -> bool {
        aspect_ratio >= self.aspect_ratio_min && aspect_ratio <= self.aspect_ratio_max
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            brightness_min: default_brightness_min(),
            sharpness_min: default_sharpness_min(),
            min_width_px: default_min_width_px(),
            min_height_px: default_min_height_px(),
            aspect_ratio_min: default_aspect_ratio_min(),
            aspect_ratio_max: default_aspect_ratio_max(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_canny_low")]
    pub canny_low: f32,
    #[serde(default = "default_canny_high")]
    pub canny_high: f32,
    /// Polygon approximation tolerance as a fraction of the contour perimeter.
    #[serde(default = "default_epsilon_ratio")]
    pub epsilon_ratio: f64,
    /// Radius of the square dilation applied to the edge map. 0 disables it.
    #[serde(default = "default_dilate_radius")]
    pub dilate_radius: u8,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            canny_low: default_canny_low(),
            canny_high: default_canny_high(),
            epsilon_ratio: default_epsilon_ratio(),
            dilate_radius: default_dilate_radius(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Capacity of the result channel between the scheduler and the session.
    #[serde(default = "default_result_buffer")]
    pub result_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            result_buffer: default_result_buffer(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapturePolicy {
    /// The user presses the shutter; only enabled while guidance is ok.
    Manual,
    /// The session captures as soon as a card-shaped quadrilateral is seen.
    Auto,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_policy")]
    pub policy: CapturePolicy,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Capture/submit rounds the CLI runs before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            jpeg_quality: default_jpeg_quality(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    Http,
    File,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_camera_kind")]
    pub kind: CameraKind,
    /// Snapshot endpoint returning one JPEG per request (`kind = "http"`).
    #[serde(default = "default_snapshot_url")]
    pub snapshot_url: String,
    /// Image served as the live frame (`kind = "file"`).
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            kind: default_camera_kind(),
            snapshot_url: default_snapshot_url(),
            image_path: None,
            poll_interval_ms: default_poll_interval_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionConfig {
    #[serde(default = "default_recognition_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_recognition_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_recognition_endpoint(),
            timeout_secs: default_recognition_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.thresholds;
        if !(0.0..=255.0).contains(&t.brightness_min) {
            return Err(ConfigError::Invalid(format!(
                "thresholds.brightness_min must be within 0..=255, got {}",
                t.brightness_min
            )));
        }
        if t.sharpness_min < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "thresholds.sharpness_min must be non-negative, got {}",
                t.sharpness_min
            )));
        }
        if t.aspect_ratio_min <= 0.0 || t.aspect_ratio_min > t.aspect_ratio_max {
            return Err(ConfigError::Invalid(format!(
                "thresholds.aspect_ratio_min ({}) must be positive and <= aspect_ratio_max ({})",
                t.aspect_ratio_min, t.aspect_ratio_max
            )));
        }
        let d = &self.detector;
        if d.canny_low < 0.0 || d.canny_low > d.canny_high {
            return Err(ConfigError::Invalid(format!(
                "detector.canny_low ({}) must be non-negative and <= canny_high ({})",
                d.canny_low, d.canny_high
            )));
        }
        if !(d.epsilon_ratio > 0.0 && d.epsilon_ratio < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "detector.epsilon_ratio must be within (0, 1), got {}",
                d.epsilon_ratio
            )));
        }
        if self.scheduler.interval_ms == 0 {
            return Err(ConfigError::Invalid("scheduler.interval_ms must be > 0".into()));
        }
        if self.scheduler.result_buffer == 0 {
            return Err(ConfigError::Invalid("scheduler.result_buffer must be > 0".into()));
        }
        if !(1..=100).contains(&self.capture.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "capture.jpeg_quality must be within 1..=100, got {}",
                self.capture.jpeg_quality
            )));
        }
        if self.capture.max_attempts == 0 {
            return Err(ConfigError::Invalid("capture.max_attempts must be > 0".into()));
        }
        if self.camera.kind == CameraKind::File && self.camera.image_path.is_none() {
            return Err(ConfigError::Invalid(
                "camera.image_path is required when camera.kind = \"file\"".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_brightness_min() -> f64 {
    50.0
}
fn default_sharpness_min() -> f64 {
    80.0
}
fn default_min_width_px() -> u32 {
    200
}
fn default_min_height_px() -> u32 {
    100
}
fn default_aspect_ratio_min() -> f64 {
    1.4
}
fn default_aspect_ratio_max() -> f64 {
    1.8
}
fn default_canny_low() -> f32 {
    50.0
}
fn default_canny_high() -> f32 {
    150.0
}
fn default_epsilon_ratio() -> f64 {
    0.03
}
fn default_dilate_radius() -> u8 {
    1
}
fn default_interval_ms() -> u64 {
    500
}
fn default_result_buffer() -> usize {
    4
}
fn default_policy() -> CapturePolicy {
    CapturePolicy::Auto
}
fn default_jpeg_quality() -> u8 {
    90
}
fn default_max_attempts() -> u32 {
    3
}
fn default_camera_kind() -> CameraKind {
    CameraKind::Http
}
fn default_snapshot_url() -> String {
    "http://127.0.0.1:8080/frame".into()
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_recognition_endpoint() -> String {
    "http://127.0.0.1:3000/api/ocr".into()
}
fn default_recognition_timeout_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".into()
}
