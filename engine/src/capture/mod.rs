//! Capture flow: session record, state machine and the controller that
//! drives camera, scheduler and recognition through it.

pub mod controller;
pub mod session;
pub mod state;

use bytes::Bytes;
use card_capture_common::frame::FrameError;

use crate::analysis::AnalysisError;
use crate::recognition::RecognitionError;
use crate::scheduler::SchedulerError;
use crate::source::SourceError;

pub use controller::{CaptureController, ControllerSettings};
pub use session::{CaptureSession, CaptureState, GuidanceColor, GuidanceKind, StateKind};
pub use state::{CaptureStateMachine, TickOutcome};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error(transparent)]
    InvalidFrame(#[from] FrameError),
    #[error(transparent)]
    AnalysisFailure(#[from] AnalysisError),
    #[error(transparent)]
    DeviceUnavailable(#[from] SourceError),
    #[error(transparent)]
    SubmitFailure(#[from] RecognitionError),
    #[error(transparent)]
    NotReady(#[from] SchedulerError),
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: StateKind,
    },
    #[error("shutter disabled: {0}")]
    ShutterDisabled(String),
    #[error("no frame available from camera")]
    NoFrame,
    #[error("analysis scheduler stopped unexpectedly")]
    SchedulerStopped,
}

/// Updates pushed to a UI subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(StateKind),
    Guidance {
        message: &'static str,
        color: GuidanceColor,
        can_capture: bool,
    },
    Captured(Bytes),
    Error(String),
}
