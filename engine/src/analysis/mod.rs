pub mod geometry;
pub mod metrics;
pub mod traits;

use card_capture_common::config::{DetectorConfig, Thresholds};
use card_capture_common::frame::{Frame, FrameError};
use tracing::debug;

use self::geometry::CardDetector;
use self::traits::FrameAnalyzer;

/// Axis-aligned box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Everything the capture state machine learns about one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub frame_seq: u64,
    pub captured_at_ms: i64,
    pub mean_brightness: f64,
    pub sharpness_variance: f64,
    pub card_detected: bool,
    pub bounding_box: Option<Rect>,
    pub aspect_ratio: Option<f64>,
    /// Set when analysis failed; the numeric fields are zeroed.
    pub error_message: Option<String>,
}

impl AnalysisResult {
    pub fn degraded(frame_seq: u64, captured_at_ms: i64, message: impl Into<String>) -> Self {
        Self {
            frame_seq,
            captured_at_ms,
            mean_brightness: 0.0,
            sharpness_variance: 0.0,
            card_detected: false,
            bounding_box: None,
            aspect_ratio: None,
            error_message: Some(message.into()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error_message.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error(transparent)]
    InvalidFrame(#[from] FrameError),
    #[error("analysis backend not initialized: {0}")]
    Init(String),
    #[error("analysis failed: {0}")]
    Failed(String),
}

/// Default analyzer: brightness + Laplacian sharpness + card outline search.
pub struct CardAnalyzer {
    detector: CardDetector,
    ready: bool,
}

impl CardAnalyzer {
    /// Explicit initialization phase. Rejects detector settings the edge and
    /// polygon stages cannot work with.
    pub fn initialize(
        thresholds: Thresholds,
        config: DetectorConfig,
    ) -> Result<Self, AnalysisError> {
        if !(config.epsilon_ratio > 0.0 && config.epsilon_ratio < 1.0) {
            return Err(AnalysisError::Init(format!(
                "epsilon_ratio {} outside (0, 1)",
                config.epsilon_ratio
            )));
        }
        if config.canny_low < 0.0 || config.canny_low > config.canny_high {
            return Err(AnalysisError::Init(format!(
                "canny thresholds {}/{} out of order",
                config.canny_low, config.canny_high
            )));
        }
        Ok(Self {
            detector: CardDetector::new(thresholds, config),
            ready: true,
        })
    }
}

impl FrameAnalyzer for CardAnalyzer {
    fn analyze(&self, frame: &Frame) -> Result<AnalysisResult, AnalysisError> {
        let gray = frame.grayscale()?;
        let m = metrics::metrics_from_gray(&gray);
        let card = self.detector.detect_card(&gray);

        debug!(
            seq = frame.seq,
            brightness = format!("{:.1}", m.mean_brightness),
            sharpness = format!("{:.1}", m.sharpness_variance),
            card = card.found,
            "frame analyzed"
        );

        Ok(AnalysisResult {
            frame_seq: frame.seq,
            captured_at_ms: frame.captured_at_ms,
            mean_brightness: m.mean_brightness,
            sharpness_variance: m.sharpness_variance,
            card_detected: card.found,
            bounding_box: card.bounding_box,
            aspect_ratio: card.aspect_ratio,
            error_message: None,
        })
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn name(&self) -> &str {
        "card"
    }
}
