use card_capture_common::frame::Frame;

use super::{AnalysisError, AnalysisResult};

/// Narrow interface between the scheduler and the vision backend.
///
/// Implementations receive one raw frame per tick and turn it into an
/// [`AnalysisResult`]. Swapping the edge/contour backend means providing a
/// different implementation; the state machine only ever sees the result.
pub trait FrameAnalyzer: Send + Sync + 'static {
    /// Analyze a single frame. Must not retain the frame or any scratch
    /// buffer derived from it.
    fn analyze(&self, frame: &Frame) -> Result<AnalysisResult, AnalysisError>;

    /// Whether initialization finished. The scheduler refuses to start
    /// until this returns `true`.
    fn is_ready(&self) -> bool {
        true
    }

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}
