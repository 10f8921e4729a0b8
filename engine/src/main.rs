use std::path::PathBuf;
use std::sync::Arc;

use card_capture_common::config::Config;
use card_capture_engine::analysis::traits::FrameAnalyzer;
use card_capture_engine::analysis::CardAnalyzer;
use card_capture_engine::capture::{CaptureController, CaptureError, ControllerSettings, SessionEvent};
use card_capture_engine::recognition::{HttpRecognizer, IdCardFields, Recognizer};
use card_capture_engine::source::{CameraSource, FrameSource};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        camera = ?config.camera.kind,
        policy = ?config.capture.policy,
        interval_ms = config.scheduler.interval_ms,
        brightness_min = config.thresholds.brightness_min,
        sharpness_min = config.thresholds.sharpness_min,
        recognition_endpoint = config.recognition.endpoint,
        "starting card-capture"
    );

    let source = match CameraSource::from_config(&config.camera) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to set up camera backend");
            std::process::exit(1);
        }
    };

    // Readiness gate: the scheduler refuses to start until this succeeds.
    let analyzer = match CardAnalyzer::initialize(config.thresholds.clone(), config.detector.clone())
    {
        Ok(a) => Arc::new(a),
        Err(e) => {
            error!(error = %e, "failed to initialize card analyzer");
            std::process::exit(1);
        }
    };

    let recognizer = match HttpRecognizer::new(&config.recognition) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "failed to build recognition client");
            std::process::exit(1);
        }
    };

    let mut controller = CaptureController::new(
        source,
        analyzer,
        recognizer,
        config.thresholds.clone(),
        config.capture.policy,
        ControllerSettings::from_config(&config),
    );
    tokio::spawn(log_session_events(controller.subscribe()));

    let outcome = tokio::select! {
        r = run_flow(&mut controller, config.capture.max_attempts) => Some(r),
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, abandoning capture");
            None
        }
    };
    controller.abandon();

    match outcome {
        Some(Ok(fields)) => match serde_json::to_string_pretty(&fields) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                error!(error = %e, "failed to serialize extracted fields");
                std::process::exit(1);
            }
        },
        Some(Err(e)) => {
            error!(error = %e, "capture failed");
            std::process::exit(1);
        }
        None => std::process::exit(130),
    }
}

/// Capture, submit, and capture again on submit failure until
/// `max_attempts` submissions have been made.
async fn run_flow<S: FrameSource, A: FrameAnalyzer, R: Recognizer>(
    controller: &mut CaptureController<S, A, R>,
    max_attempts: u32,
) -> Result<IdCardFields, CaptureError> {
    controller.start().await?;
    let mut attempt = 1;
    loop {
        let image = controller.run_until_captured().await?;
        info!(attempt, bytes = image.len(), "card captured, submitting");
        match controller.submit().await {
            Ok(fields) => return Ok(fields),
            Err(e) if attempt < max_attempts => {
                warn!(attempt, max_attempts, error = %e, "submit failed, capturing again");
                attempt += 1;
                controller.retry().await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Stand-in UI: logs guidance changes and session events.
async fn log_session_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    let mut last_message = None;
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Guidance {
                message,
                color,
                can_capture,
            } => {
                if last_message != Some(message) {
                    info!(guidance = message, ?color, can_capture, "guidance");
                    last_message = Some(message);
                }
            }
            SessionEvent::StateChanged(state) => {
                debug!(%state, "session state changed");
                last_message = None;
            }
            SessionEvent::Captured(image) => {
                info!(bytes = image.len(), "capture ready for preview");
            }
            SessionEvent::Error(message) => warn!(error = message, "session error"),
        }
    }
}
