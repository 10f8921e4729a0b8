use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use card_capture_common::config::{CapturePolicy, Config, Thresholds};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::analysis::traits::FrameAnalyzer;
use crate::analysis::AnalysisError;
use crate::recognition::{IdCardFields, Recognizer};
use crate::scheduler::{AnalysisScheduler, SchedulerHandle};
use crate::source::FrameSource;

use super::session::{CaptureSession, StateKind};
use super::state::{CaptureStateMachine, TickOutcome};
use super::{CaptureError, SessionEvent};

#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub period: Duration,
    pub result_buffer: usize,
    pub jpeg_quality: u8,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            period: Duration::from_millis(config.scheduler.interval_ms),
            result_buffer: config.scheduler.result_buffer,
            jpeg_quality: config.capture.jpeg_quality,
        }
    }
}

/// Drives one capture session: owns the camera lifetime, the analysis
/// scheduler and the recognition hand-off, and feeds everything through
/// [`CaptureStateMachine`].
///
/// The camera is opened on the first entry to `Capturing` and held across
/// retries. It is closed once the session reaches `Terminal`, is abandoned,
/// or the controller is dropped. The scheduler only runs while `Capturing`.
pub struct CaptureController<S: FrameSource, A: FrameAnalyzer, R: Recognizer> {
    source: Arc<S>,
    scheduler: AnalysisScheduler<S, A>,
    running: Option<SchedulerHandle>,
    recognizer: R,
    machine: CaptureStateMachine,
    settings: ControllerSettings,
    device_open: bool,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl<S: FrameSource, A: FrameAnalyzer, R: Recognizer> CaptureController<S, A, R> {
    pub fn new(
        source: Arc<S>,
        analyzer: Arc<A>,
        recognizer: R,
        thresholds: Thresholds,
        policy: CapturePolicy,
        settings: ControllerSettings,
    ) -> Self {
        let scheduler = AnalysisScheduler::new(
            Arc::clone(&source),
            analyzer,
            settings.period,
            settings.result_buffer,
        );
        Self {
            source,
            scheduler,
            running: None,
            recognizer,
            machine: CaptureStateMachine::new(thresholds, policy),
            settings,
            device_open: false,
            events: None,
        }
    }

    /// Attach the UI. Replaces any previous subscriber.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn session(&self) -> &CaptureSession {
        self.machine.session()
    }

    pub fn state(&self) -> StateKind {
        self.machine.kind()
    }

    pub fn is_analyzing(&self) -> bool {
        self.running.is_some()
    }

    pub fn is_device_open(&self) -> bool {
        self.device_open
    }

    /// IDLE→CAPTURING: open the camera (if not already held) and start sampling.
    pub async fn start(&mut self) -> Result<(), CaptureError> {
        self.machine.ensure_idle("start")?;

        if !self.device_open {
            if let Err(e) = self.source.open().await {
                self.machine.device_unavailable(e.to_string());
                self.emit(SessionEvent::Error(e.to_string()));
                self.emit_guidance();
                return Err(e.into());
            }
            self.device_open = true;
            info!("camera opened");
        }

        match self.scheduler.start() {
            Ok(handle) => self.running = Some(handle),
            Err(e) => {
                warn!(error = %e, "analysis backend not ready, releasing camera");
                self.release_device();
                self.emit(SessionEvent::Error(e.to_string()));
                return Err(e.into());
            }
        }

        self.machine.begin_capturing()?;
        self.emit(SessionEvent::StateChanged(StateKind::Capturing));
        self.emit_guidance();
        Ok(())
    }

    /// Wait for the next analysis result and fold it into the session.
    ///
    /// Under the auto policy a matching result grabs the frame and moves the
    /// session to `Preview` before returning. A failed grab leaves the session
    /// capturing and sampling continues.
    pub async fn tick(&mut self) -> Result<TickOutcome, CaptureError> {
        let Some(handle) = self.running.as_mut() else {
            return Err(CaptureError::InvalidTransition {
                action: "await analysis",
                state: self.machine.kind(),
            });
        };
        let Some(result) = handle.next().await else {
            error!("analysis scheduler ended while capturing");
            self.stop_scheduler();
            self.emit(SessionEvent::Error(CaptureError::SchedulerStopped.to_string()));
            return Err(CaptureError::SchedulerStopped);
        };

        let outcome = self.machine.apply(&result);
        if outcome != TickOutcome::Ignored {
            self.emit_guidance();
        }
        if outcome == TickOutcome::AutoCapture {
            match self.capture_frame().await {
                Ok(()) => {}
                Err(
                    e @ (CaptureError::NoFrame
                    | CaptureError::InvalidFrame(_)
                    | CaptureError::AnalysisFailure(_)),
                ) => {
                    self.machine.capture_failed(e.to_string());
                    self.emit(SessionEvent::Error(e.to_string()));
                    self.emit_guidance();
                    return Ok(TickOutcome::Guided);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    /// Tick until the session leaves `Capturing` and return the captured
    /// image. Under the manual policy the shutter is pressed the first time
    /// it is enabled.
    pub async fn run_until_captured(&mut self) -> Result<Bytes, CaptureError> {
        while self.machine.is_capturing() {
            self.tick().await?;
            if self.machine.policy() == CapturePolicy::Manual && self.session().can_capture() {
                self.shutter().await?;
            }
        }
        self.session()
            .captured_image()
            .cloned()
            .ok_or(CaptureError::InvalidTransition {
                action: "read capture",
                state: self.machine.kind(),
            })
    }

    /// Manual shutter. Only allowed while guidance is ok.
    pub async fn shutter(&mut self) -> Result<(), CaptureError> {
        self.machine.request_shutter()?;
        self.capture_frame().await
    }

    /// Grab the newest frame as JPEG, stop sampling, CAPTURING→PREVIEW.
    async fn capture_frame(&mut self) -> Result<(), CaptureError> {
        let frame = self.source.try_get_latest_frame().ok_or(CaptureError::NoFrame)?;
        frame.validate()?;
        let (seq, quality) = (frame.seq, self.settings.jpeg_quality);
        let encoded = tokio::task::spawn_blocking(move || frame.encode_jpeg(quality))
            .await
            .map_err(|e| AnalysisError::Failed(format!("jpeg encoding aborted: {e}")))??;
        let image = Bytes::from(encoded);

        self.stop_scheduler();
        self.machine.captured(image.clone())?;
        debug!(seq, bytes = image.len(), "frame captured");
        self.emit(SessionEvent::StateChanged(StateKind::Preview));
        self.emit(SessionEvent::Captured(image));
        Ok(())
    }

    /// PREVIEW→CAPTURING with a fresh scheduler. The camera stays open.
    pub async fn retry(&mut self) -> Result<(), CaptureError> {
        let handle = self.scheduler.start()?;
        if let Err(e) = self.machine.retry() {
            handle.stop();
            return Err(e);
        }
        self.running = Some(handle);
        self.emit(SessionEvent::StateChanged(StateKind::Capturing));
        self.emit_guidance();
        Ok(())
    }

    /// PREVIEW→PROCESSING→TERMINAL, or back to PREVIEW with `last_error`
    /// set when recognition fails.
    pub async fn submit(&mut self) -> Result<IdCardFields, CaptureError> {
        let image = self.machine.begin_submit()?;
        self.emit(SessionEvent::StateChanged(StateKind::Processing));

        match self.recognizer.recognize(image).await {
            Ok(fields) => {
                self.machine.submit_succeeded(fields.clone())?;
                self.release_device();
                self.emit(SessionEvent::StateChanged(StateKind::Terminal));
                Ok(fields)
            }
            Err(e) => {
                error!(error = %e, "recognition failed");
                self.machine.submit_failed(e.to_string())?;
                self.emit(SessionEvent::Error(e.to_string()));
                self.emit(SessionEvent::StateChanged(StateKind::Preview));
                Err(e.into())
            }
        }
    }

    /// Drop the session from any state and release the camera.
    pub fn abandon(&mut self) {
        self.stop_scheduler();
        self.machine.abandon();
        self.release_device();
        self.emit(SessionEvent::StateChanged(StateKind::Idle));
    }

    fn stop_scheduler(&mut self) {
        if let Some(handle) = self.running.take() {
            let stats = handle.stop();
            info!(
                ticks = stats.ticks,
                analyses = stats.analyses,
                skipped_busy = stats.skipped_busy,
                degraded = stats.degraded,
                "analysis stopped"
            );
        }
    }

    fn release_device(&mut self) {
        if self.device_open {
            self.source.close();
            self.device_open = false;
            info!("camera released");
        }
    }

    fn emit(&mut self, event: SessionEvent) {
        let Some(tx) = &self.events else {
            return;
        };
        if tx.send(event).is_err() {
            debug!("session subscriber gone");
            self.events = None;
        }
    }

    fn emit_guidance(&mut self) {
        let session = self.machine.session();
        let event = SessionEvent::Guidance {
            message: session.guidance_message(),
            color: session.guidance_color(),
            can_capture: session.can_capture(),
        };
        self.emit(event);
    }
}

impl<S: FrameSource, A: FrameAnalyzer, R: Recognizer> Drop for CaptureController<S, A, R> {
    fn drop(&mut self) {
        self.stop_scheduler();
        self.release_device();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisResult, Rect};
    use crate::capture::{GuidanceColor, GuidanceKind};
    use crate::recognition::RecognitionError;
    use crate::source::SourceError;
    use card_capture_common::frame::Frame;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MockCamera {
        fail_open: bool,
        /// Pull index that comes back empty.
        missing_pull: Option<u64>,
        /// Pulls from this index on panic, killing whoever asked.
        panic_from_pull: Option<u64>,
        open: AtomicBool,
        opens: AtomicUsize,
        closes: AtomicUsize,
        seq: AtomicU64,
    }

    impl MockCamera {
        fn new(fail_open: bool) -> Arc<Self> {
            Self::scripted(fail_open, None, None)
        }

        fn scripted(
            fail_open: bool,
            missing_pull: Option<u64>,
            panic_from_pull: Option<u64>,
        ) -> Arc<Self> {
            Arc::new(Self {
                fail_open,
                missing_pull,
                panic_from_pull,
                open: AtomicBool::new(false),
                opens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                seq: AtomicU64::new(0),
            })
        }
    }

    impl FrameSource for MockCamera {
        async fn open(&self) -> Result<(), SourceError> {
            if self.fail_open {
                return Err(SourceError::DeviceUnavailable("no device".into()));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.open.store(false, Ordering::SeqCst);
        }

        fn try_get_latest_frame(&self) -> Option<Frame> {
            if !self.open.load(Ordering::SeqCst) {
                return None;
            }
            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
            if self.panic_from_pull.is_some_and(|n| seq >= n) {
                panic!("camera driver crashed");
            }
            if self.missing_pull == Some(seq) {
                return None;
            }
            Some(Frame::new(16, 12, [120u8, 120, 120, 255].repeat(16 * 12), 0, seq))
        }
    }

    /// Returns canned metrics for every frame.
    struct FixedAnalyzer {
        brightness: f64,
        sharpness: f64,
        card: Option<(u32, u32)>,
        ready: bool,
    }

    impl FrameAnalyzer for FixedAnalyzer {
        fn analyze(&self, frame: &Frame) -> Result<AnalysisResult, AnalysisError> {
            Ok(AnalysisResult {
                frame_seq: frame.seq,
                captured_at_ms: frame.captured_at_ms,
                mean_brightness: self.brightness,
                sharpness_variance: self.sharpness,
                card_detected: self.card.is_some(),
                bounding_box: self.card.map(|(width, height)| Rect {
                    x: 0,
                    y: 0,
                    width,
                    height,
                }),
                aspect_ratio: self.card.map(|(w, h)| w as f64 / h as f64),
                error_message: None,
            })
        }

        fn is_ready(&self) -> bool {
            self.ready
        }
    }

    /// Pops scripted replies; succeeds once the script runs out.
    #[derive(Default)]
    struct ScriptedRecognizer {
        replies: Mutex<VecDeque<Result<IdCardFields, String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedRecognizer {
        fn with(replies: Vec<Result<IdCardFields, String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Recognizer for ScriptedRecognizer {
        async fn recognize(&self, image: Bytes) -> Result<IdCardFields, RecognitionError> {
            assert!(!image.is_empty());
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(Ok(fields)) => Ok(fields),
                Some(Err(msg)) => Err(RecognitionError::Rejected(msg)),
                None => Ok(IdCardFields {
                    identification_number: Some("1100000000000".into()),
                    ..IdCardFields::default()
                }),
            }
        }
    }

    fn settings() -> ControllerSettings {
        ControllerSettings {
            period: Duration::from_millis(5),
            result_buffer: 4,
            jpeg_quality: 90,
        }
    }

    fn controller(
        camera: &Arc<MockCamera>,
        analyzer: FixedAnalyzer,
        recognizer: ScriptedRecognizer,
        policy: CapturePolicy,
    ) -> CaptureController<MockCamera, FixedAnalyzer, ScriptedRecognizer> {
        CaptureController::new(
            Arc::clone(camera),
            Arc::new(analyzer),
            recognizer,
            Thresholds::default(),
            policy,
            settings(),
        )
    }

    fn card_in_view() -> FixedAnalyzer {
        FixedAnalyzer {
            brightness: 120.0,
            sharpness: 150.0,
            card: Some((220, 140)),
            ready: true,
        }
    }

    async fn tick(c: &mut CaptureController<MockCamera, FixedAnalyzer, ScriptedRecognizer>) {
        tokio::time::timeout(Duration::from_secs(2), c.tick())
            .await
            .expect("tick timed out")
            .unwrap();
    }

    #[tokio::test]
    async fn auto_policy_captures_card_in_bounds() {
        let camera = MockCamera::new(false);
        let mut c = controller(
            &camera,
            card_in_view(),
            ScriptedRecognizer::default(),
            CapturePolicy::Auto,
        );
        c.start().await.unwrap();
        assert!(c.is_analyzing());

        let image = tokio::time::timeout(Duration::from_secs(2), c.run_until_captured())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c.state(), StateKind::Preview);
        assert_eq!(&image[..2], &[0xFF, 0xD8], "not a jpeg");
        assert_eq!(c.session().captured_image(), Some(&image));
        assert!(!c.is_analyzing(), "scheduler still running in preview");
        assert!(c.is_device_open());
    }

    #[tokio::test]
    async fn dark_scene_never_auto_captures() {
        let camera = MockCamera::new(false);
        let mut c = controller(
            &camera,
            FixedAnalyzer {
                brightness: 30.0,
                sharpness: 150.0,
                card: Some((220, 140)),
                ready: true,
            },
            ScriptedRecognizer::default(),
            CapturePolicy::Auto,
        );
        c.start().await.unwrap();
        for _ in 0..5 {
            tick(&mut c).await;
        }
        assert_eq!(c.state(), StateKind::Capturing);
        assert_eq!(c.session().guidance(), GuidanceKind::InsufficientLight);
        assert_eq!(c.session().guidance_color(), GuidanceColor::Warn);
        assert!(matches!(c.shutter().await, Err(CaptureError::ShutterDisabled(_))));
    }

    #[tokio::test]
    async fn manual_shutter_after_ready() {
        let camera = MockCamera::new(false);
        let mut c = controller(
            &camera,
            card_in_view(),
            ScriptedRecognizer::default(),
            CapturePolicy::Manual,
        );
        c.start().await.unwrap();
        assert!(!c.session().can_capture(), "enabled before any analysis");

        tick(&mut c).await;
        assert_eq!(c.session().guidance(), GuidanceKind::Ready);
        assert_eq!(c.state(), StateKind::Capturing, "manual policy captured on its own");

        c.shutter().await.unwrap();
        assert_eq!(c.state(), StateKind::Preview);
        assert!(!c.is_analyzing());
    }

    #[tokio::test]
    async fn retry_restarts_scheduler_and_keeps_camera() {
        let camera = MockCamera::new(false);
        let mut c = controller(
            &camera,
            card_in_view(),
            ScriptedRecognizer::default(),
            CapturePolicy::Auto,
        );
        c.start().await.unwrap();
        c.run_until_captured().await.unwrap();

        c.retry().await.unwrap();
        assert_eq!(c.state(), StateKind::Capturing);
        assert!(c.session().captured_image().is_none());
        assert!(c.session().last_error().is_none());
        assert!(c.is_analyzing());
        assert_eq!(camera.opens.load(Ordering::SeqCst), 1, "camera reopened on retry");

        c.run_until_captured().await.unwrap();
        assert_eq!(c.session().retry_count(), 1);
    }

    #[tokio::test]
    async fn failed_submit_returns_to_preview_then_succeeds() {
        let camera = MockCamera::new(false);
        let recognizer = ScriptedRecognizer::with(vec![Err("server error: 500".into())]);
        let mut c = controller(&camera, card_in_view(), recognizer, CapturePolicy::Auto);
        c.start().await.unwrap();
        let image = c.run_until_captured().await.unwrap();

        let err = c.submit().await.unwrap_err();
        assert!(matches!(err, CaptureError::SubmitFailure(_)));
        assert_eq!(c.state(), StateKind::Preview);
        assert_eq!(c.session().captured_image(), Some(&image));
        assert_eq!(c.session().last_error(), Some("server error: 500"));
        assert!(c.is_device_open());

        let fields = c.submit().await.unwrap();
        assert_eq!(fields.identification_number.as_deref(), Some("1100000000000"));
        assert_eq!(c.state(), StateKind::Terminal);
        assert!(!c.is_device_open());
        assert_eq!(camera.closes.load(Ordering::SeqCst), 1);
        assert_eq!(c.recognizer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unavailable_camera_stays_idle() {
        let camera = MockCamera::new(true);
        let mut c = controller(
            &camera,
            card_in_view(),
            ScriptedRecognizer::default(),
            CapturePolicy::Auto,
        );
        let mut events = c.subscribe();

        let err = c.start().await.unwrap_err();
        assert!(matches!(err, CaptureError::DeviceUnavailable(_)));
        assert_eq!(c.state(), StateKind::Idle);
        assert!(!c.is_analyzing());
        assert_eq!(c.session().guidance(), GuidanceKind::CameraUnavailable);
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::Error("camera unavailable: no device".into()))
        );
    }

    #[tokio::test]
    async fn drop_and_abandon_release_camera() {
        let camera = MockCamera::new(false);
        {
            let mut c = controller(
                &camera,
                card_in_view(),
                ScriptedRecognizer::default(),
                CapturePolicy::Manual,
            );
            c.start().await.unwrap();
            assert!(camera.open.load(Ordering::SeqCst));
        }
        assert!(!camera.open.load(Ordering::SeqCst), "drop left camera open");

        let mut c = controller(
            &camera,
            card_in_view(),
            ScriptedRecognizer::default(),
            CapturePolicy::Auto,
        );
        c.start().await.unwrap();
        c.run_until_captured().await.unwrap();
        c.abandon();
        assert_eq!(c.state(), StateKind::Idle);
        assert!(c.session().captured_image().is_none());
        assert!(!camera.open.load(Ordering::SeqCst));
        assert!(c.submit().await.is_err());
    }

    #[tokio::test]
    async fn subscriber_sees_guidance_and_capture() {
        let camera = MockCamera::new(false);
        let mut c = controller(
            &camera,
            card_in_view(),
            ScriptedRecognizer::default(),
            CapturePolicy::Auto,
        );
        let mut events = c.subscribe();
        c.start().await.unwrap();
        let image = c.run_until_captured().await.unwrap();
        drop(c);

        let mut seen = Vec::new();
        while let Some(e) = events.recv().await {
            seen.push(e);
        }
        assert_eq!(seen.first(), Some(&SessionEvent::StateChanged(StateKind::Capturing)));
        assert!(seen.contains(&SessionEvent::Guidance {
            message: "card detected",
            color: GuidanceColor::Ok,
            can_capture: true,
        }));
        assert!(seen.contains(&SessionEvent::StateChanged(StateKind::Preview)));
        assert_eq!(seen.last(), Some(&SessionEvent::Captured(image)));
    }

    #[tokio::test]
    async fn not_ready_analyzer_releases_camera() {
        let camera = MockCamera::new(false);
        let analyzer = FixedAnalyzer {
            ready: false,
            ..card_in_view()
        };
        let recognizer = ScriptedRecognizer::default();
        let mut c = controller(&camera, analyzer, recognizer, CapturePolicy::Auto);

        let err = c.start().await.unwrap_err();
        assert!(matches!(err, CaptureError::NotReady(_)), "{err}");
        assert_eq!(c.state(), StateKind::Idle);
        assert!(!c.is_analyzing());
        assert!(!c.is_device_open());
        assert_eq!(camera.opens.load(Ordering::SeqCst), 1);
        assert_eq!(camera.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_scheduler_ends_capture_loop() {
        // First pull serves a frame, the next one kills the sampling task.
        let camera = MockCamera::scripted(false, None, Some(1));
        let analyzer = FixedAnalyzer {
            card: None,
            ..card_in_view()
        };
        let recognizer = ScriptedRecognizer::default();
        let mut c = controller(&camera, analyzer, recognizer, CapturePolicy::Auto);
        c.start().await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(2), c.run_until_captured())
            .await
            .expect("capture loop kept spinning")
            .unwrap_err();
        assert!(matches!(err, CaptureError::SchedulerStopped), "{err}");
        assert!(!c.is_analyzing());
        assert_eq!(c.state(), StateKind::Capturing);
    }

    #[tokio::test]
    async fn failed_auto_grab_keeps_sampling() {
        // Pull 0 is analyzed, pull 1 is the grab and comes back empty. The
        // long period keeps the scheduler from pulling in between.
        let camera = MockCamera::scripted(false, Some(1), None);
        let mut c = CaptureController::new(
            Arc::clone(&camera),
            Arc::new(card_in_view()),
            ScriptedRecognizer::default(),
            Thresholds::default(),
            CapturePolicy::Auto,
            ControllerSettings {
                period: Duration::from_millis(150),
                ..settings()
            },
        );
        let mut events = c.subscribe();
        c.start().await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), c.tick())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, TickOutcome::Guided);
        assert_eq!(c.state(), StateKind::Capturing);
        assert!(c.is_analyzing());
        assert_eq!(c.session().last_error(), Some("no frame available from camera"));

        let image = tokio::time::timeout(Duration::from_secs(2), c.run_until_captured())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(c.state(), StateKind::Preview);
        assert_eq!(c.session().captured_image(), Some(&image));
        assert!(c.session().last_error().is_none());
        drop(c);

        let mut seen = Vec::new();
        while let Some(e) = events.recv().await {
            seen.push(e);
        }
        assert!(seen.contains(&SessionEvent::Error("no frame available from camera".into())));
    }
}
