use std::fmt;

use bytes::Bytes;

use crate::recognition::IdCardFields;

/// Lifecycle of one capture attempt.
///
/// The captured image only exists inside the states that hold it, so a
/// `Capturing` session (the only state with a running scheduler) can never
/// carry one.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureState {
    Idle,
    Capturing,
    Preview { image: Bytes },
    Processing { image: Bytes },
    Terminal { image: Bytes, fields: IdCardFields },
}

impl CaptureState {
    pub fn kind(&self) -> StateKind {
        match self {
            Self::Idle => StateKind::Idle,
            Self::Capturing => StateKind::Capturing,
            Self::Preview { .. } => StateKind::Preview,
            Self::Processing { .. } => StateKind::Processing,
            Self::Terminal { .. } => StateKind::Terminal,
        }
    }

    pub fn image(&self) -> Option<&Bytes> {
        match self {
            Self::Preview { image } | Self::Processing { image } | Self::Terminal { image, .. } => {
                Some(image)
            }
            Self::Idle | Self::Capturing => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Idle,
    Capturing,
    Preview,
    Processing,
    Terminal,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Capturing => "capturing",
            Self::Preview => "preview",
            Self::Processing => "processing",
            Self::Terminal => "terminal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuidanceColor {
    Ok,
    Warn,
}

/// What the user is told to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuidanceKind {
    Preparing,
    CameraUnavailable,
    AnalysisFailed,
    InsufficientLight,
    AlignCard,
    HoldSteady,
    Ready,
    CardDetected,
}

impl GuidanceKind {
    pub fn message(self) -> &'static str {
        match self {
            Self::Preparing => "preparing camera",
            Self::CameraUnavailable => "camera unavailable",
            Self::AnalysisFailed => "analysis failed, retrying",
            Self::InsufficientLight => "insufficient light",
            Self::AlignCard => "align card in frame",
            Self::HoldSteady => "hold steady",
            Self::Ready => "ready / hold still to capture",
            Self::CardDetected => "card detected",
        }
    }

    pub fn color(self) -> GuidanceColor {
        match self {
            Self::Ready | Self::CardDetected => GuidanceColor::Ok,
            _ => GuidanceColor::Warn,
        }
    }
}

/// The mutable record of the current capture attempt.
#[derive(Debug, Clone)]
pub struct CaptureSession {
    pub(super) state: CaptureState,
    pub(super) guidance: GuidanceKind,
    pub(super) last_error: Option<String>,
    pub(super) retry_count: u32,
}

impl CaptureSession {
    pub fn new() -> Self {
        Self {
            state: CaptureState::Idle,
            guidance: GuidanceKind::Preparing,
            last_error: None,
            retry_count: 0,
        }
    }

    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    pub fn kind(&self) -> StateKind {
        self.state.kind()
    }

    pub fn captured_image(&self) -> Option<&Bytes> {
        self.state.image()
    }

    pub fn guidance(&self) -> GuidanceKind {
        self.guidance
    }

    pub fn guidance_message(&self) -> &'static str {
        self.guidance.message()
    }

    pub fn guidance_color(&self) -> GuidanceColor {
        self.guidance.color()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// The manual shutter is enabled only while capturing with ok guidance.
    pub fn can_capture(&self) -> bool {
        self.kind() == StateKind::Capturing && self.guidance_color() == GuidanceColor::Ok
    }
}

impl Default for CaptureSession {
    fn default() -> Self {
        Self::new()
    }
}
