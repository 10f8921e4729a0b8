use bytes::Bytes;
use card_capture_common::config::{CapturePolicy, Thresholds};
use tracing::{debug, info, warn};

use crate::analysis::AnalysisResult;
use crate::recognition::IdCardFields;

use super::session::{CaptureSession, CaptureState, GuidanceKind, StateKind};
use super::CaptureError;

/// What the caller must do after feeding an analysis result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The session is not capturing; the result was dropped.
    Ignored,
    /// Guidance updated, keep sampling.
    Guided,
    /// Auto policy matched: grab a frame and call [`CaptureStateMachine::captured`].
    AutoCapture,
}

/// Reducer over [`CaptureSession`]: analysis results and user actions in,
/// state transitions and guidance out.
///
/// Every action checks the current state first and leaves the session
/// untouched when it does not apply.
pub struct CaptureStateMachine {
    session: CaptureSession,
    thresholds: Thresholds,
    policy: CapturePolicy,
}

/// Guidance for one result. First matching rule wins.
pub fn evaluate(result: &AnalysisResult, thresholds: &Thresholds) -> GuidanceKind {
    if result.is_degraded() {
        GuidanceKind::AnalysisFailed
    } else if result.mean_brightness < thresholds.brightness_min {
        GuidanceKind::InsufficientLight
    } else if !card_in_bounds(result, thresholds) {
        GuidanceKind::AlignCard
    } else if result.sharpness_variance < thresholds.sharpness_min {
        GuidanceKind::HoldSteady
    } else {
        GuidanceKind::Ready
    }
}

fn card_in_bounds(result: &AnalysisResult, thresholds: &Thresholds) -> bool {
    result.card_detected
        && result
            .bounding_box
            .is_some_and(|b| thresholds.accepts_box(b.width, b.height))
}

impl CaptureStateMachine {
    pub fn new(thresholds: Thresholds, policy: CapturePolicy) -> Self {
        Self {
            session: CaptureSession::new(),
            thresholds,
            policy,
        }
    }

    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    pub fn policy(&self) -> CapturePolicy {
        self.policy
    }

    pub fn kind(&self) -> StateKind {
        self.session.kind()
    }

    /// Whether the analysis scheduler should be running.
    pub fn is_capturing(&self) -> bool {
        self.kind() == StateKind::Capturing
    }

    fn require(&self, wanted: StateKind, action: &'static str) -> Result<(), CaptureError> {
        let state = self.kind();
        if state != wanted {
            return Err(CaptureError::InvalidTransition { action, state });
        }
        Ok(())
    }

    pub fn ensure_idle(&self, action: &'static str) -> Result<(), CaptureError> {
        self.require(StateKind::Idle, action)
    }

    /// IDLE→CAPTURING once the camera is open and the scheduler is ready.
    pub fn begin_capturing(&mut self) -> Result<(), CaptureError> {
        self.require(StateKind::Idle, "start capturing")?;
        self.session.state = CaptureState::Capturing;
        self.session.guidance = GuidanceKind::Preparing;
        self.session.last_error = None;
        info!(policy = ?self.policy, "IDLE→CAPTURING");
        Ok(())
    }

    /// The camera could not be opened: stay idle and surface the error.
    pub fn device_unavailable(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(error = message, "camera unavailable, staying IDLE");
        self.session.guidance = GuidanceKind::CameraUnavailable;
        self.session.last_error = Some(message);
    }

    /// Fold one analysis result into the session.
    pub fn apply(&mut self, result: &AnalysisResult) -> TickOutcome {
        if !self.is_capturing() {
            debug!(
                seq = result.frame_seq,
                state = %self.kind(),
                "late analysis result dropped"
            );
            return TickOutcome::Ignored;
        }

        let guidance = evaluate(result, &self.thresholds);
        let auto = self.policy == CapturePolicy::Auto
            && !result.is_degraded()
            && result.mean_brightness >= self.thresholds.brightness_min
            && card_in_bounds(result, &self.thresholds);

        if auto {
            self.session.guidance = GuidanceKind::CardDetected;
            info!(
                seq = result.frame_seq,
                aspect = ?result.aspect_ratio,
                sharpness = format!("{:.1}", result.sharpness_variance),
                "card in bounds, auto-capturing"
            );
            return TickOutcome::AutoCapture;
        }

        if guidance != self.session.guidance {
            debug!(
                seq = result.frame_seq,
                from = ?self.session.guidance,
                to = ?guidance,
                "guidance changed"
            );
        }
        self.session.guidance = guidance;
        TickOutcome::Guided
    }

    /// Check that the manual shutter may fire now.
    pub fn request_shutter(&self) -> Result<(), CaptureError> {
        self.require(StateKind::Capturing, "capture")?;
        if !self.session.can_capture() {
            return Err(CaptureError::ShutterDisabled(
                self.session.guidance_message().to_string(),
            ));
        }
        Ok(())
    }

    /// CAPTURING→PREVIEW with the grabbed frame. The scheduler must already
    /// be stopped.
    pub fn captured(&mut self, image: Bytes) -> Result<(), CaptureError> {
        self.require(StateKind::Capturing, "store capture")?;
        info!(bytes = image.len(), "CAPTURING→PREVIEW");
        self.session.state = CaptureState::Preview { image };
        self.session.last_error = None;
        Ok(())
    }

    /// PREVIEW→CAPTURING, dropping the image and any submit error.
    pub fn retry(&mut self) -> Result<(), CaptureError> {
        self.require(StateKind::Preview, "retry")?;
        self.session.state = CaptureState::Capturing;
        self.session.last_error = None;
        self.session.guidance = GuidanceKind::Preparing;
        self.session.retry_count += 1;
        info!(retry_count = self.session.retry_count, "PREVIEW→CAPTURING (retry)");
        Ok(())
    }

    /// PREVIEW→PROCESSING. Returns the image to hand to recognition.
    pub fn begin_submit(&mut self) -> Result<Bytes, CaptureError> {
        let CaptureState::Preview { image } = &self.session.state else {
            return Err(CaptureError::InvalidTransition {
                action: "submit",
                state: self.kind(),
            });
        };
        let image = image.clone();
        self.session.state = CaptureState::Processing {
            image: image.clone(),
        };
        self.session.last_error = None;
        info!(bytes = image.len(), "PREVIEW→PROCESSING");
        Ok(image)
    }

    /// PROCESSING→TERMINAL.
    pub fn submit_succeeded(&mut self, fields: IdCardFields) -> Result<(), CaptureError> {
        let CaptureState::Processing { image } = &self.session.state else {
            return Err(CaptureError::InvalidTransition {
                action: "complete submit",
                state: self.kind(),
            });
        };
        self.session.state = CaptureState::Terminal {
            image: image.clone(),
            fields,
        };
        info!("PROCESSING→TERMINAL");
        Ok(())
    }

    /// PROCESSING→PREVIEW keeping the image so the user can resubmit.
    pub fn submit_failed(&mut self, message: impl Into<String>) -> Result<(), CaptureError> {
        let CaptureState::Processing { image } = &self.session.state else {
            return Err(CaptureError::InvalidTransition {
                action: "fail submit",
                state: self.kind(),
            });
        };
        let message = message.into();
        warn!(error = message, "PROCESSING→PREVIEW: submit failed");
        self.session.state = CaptureState::Preview {
            image: image.clone(),
        };
        self.session.last_error = Some(message);
        Ok(())
    }

    /// A grab after `AutoCapture` failed. Stay in CAPTURING and keep sampling.
    pub fn capture_failed(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(error = message, "frame grab failed, still CAPTURING");
        self.session.guidance = GuidanceKind::Preparing;
        self.session.last_error = Some(message);
    }

    /// Back to IDLE from anywhere with a fresh session record.
    pub fn abandon(&mut self) {
        if self.kind() != StateKind::Idle {
            info!(state = %self.kind(), "flow abandoned, back to IDLE");
        }
        self.session = CaptureSession::new();
    }
}
