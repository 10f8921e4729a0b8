use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use card_capture_common::frame::Frame;
use chrono::Utc;
use tracing::info;

use super::{FrameSource, SourceError};

/// Serves one decoded image file as if it were a live camera.
///
/// Used for bench testing thresholds without hardware. Every pull returns the
/// same pixels with a fresh timestamp and sequence number.
pub struct StillImageSource {
    path: PathBuf,
    image: Mutex<Option<Frame>>,
    seq: AtomicU64,
}

impl StillImageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            image: Mutex::new(None),
            seq: AtomicU64::new(0),
        }
    }
}

impl FrameSource for StillImageSource {
    async fn open(&self) -> Result<(), SourceError> {
        let data = tokio::fs::read(&self.path).await.map_err(|e| {
            SourceError::DeviceUnavailable(format!("{}: {e}", self.path.display()))
        })?;
        let frame = tokio::task::spawn_blocking(move || Frame::decode(&data, 0, 0))
            .await
            .map_err(|e| SourceError::DeviceUnavailable(e.to_string()))?
            .map_err(|e| SourceError::DeviceUnavailable(e.to_string()))?;

        info!(
            path = self.path.display().to_string(),
            width = frame.width,
            height = frame.height,
            "still image camera opened"
        );
        if let Ok(mut image) = self.image.lock() {
            *image = Some(frame);
        }
        Ok(())
    }

    fn close(&self) {
        if let Ok(mut image) = self.image.lock() {
            *image = None;
        }
    }

    fn try_get_latest_frame(&self) -> Option<Frame> {
        let image = self.image.lock().ok()?;
        let frame = image.as_ref()?;
        Some(Frame {
            captured_at_ms: Utc::now().timestamp_millis(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            ..frame.clone()
        })
    }
}
