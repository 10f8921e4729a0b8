use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use card_capture_common::config::CameraConfig;
use card_capture_common::frame::Frame;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{FrameSource, SourceError};

/// Polls a camera snapshot endpoint and keeps the most recent decoded frame.
///
/// The endpoint must answer each GET with a single encoded image (JPEG from
/// most IP cameras). Only the newest frame is kept; a slow consumer simply
/// sees fewer frames.
pub struct HttpSnapshotSource {
    url: String,
    interval: Duration,
    client: reqwest::Client,
    latest: Arc<Mutex<Option<Frame>>>,
    seq: Arc<AtomicU64>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl HttpSnapshotSource {
    pub fn new(config: &CameraConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.connect_timeout_secs.max(1) * 2))
            .build()
            .map_err(|e| SourceError::DeviceUnavailable(e.to_string()))?;
        Ok(Self {
            url: config.snapshot_url.clone(),
            interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            client,
            latest: Arc::new(Mutex::new(None)),
            seq: Arc::new(AtomicU64::new(0)),
            poller: Mutex::new(None),
        })
    }

    fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .map(|p| p.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }
}

impl FrameSource for HttpSnapshotSource {
    async fn open(&self) -> Result<(), SourceError> {
        if self.is_polling() {
            return Ok(());
        }

        info!(url = self.url, "opening HTTP snapshot camera");
        // Probe once so an unreachable camera is reported before capture starts.
        let frame = fetch_frame(&self.client, &self.url, &self.seq)
            .await
            .map_err(SourceError::DeviceUnavailable)?;
        info!(
            width = frame.width,
            height = frame.height,
            "camera is live"
        );
        store(&self.latest, frame);

        let client = self.client.clone();
        let url = self.url.clone();
        let latest = Arc::clone(&self.latest);
        let seq = Arc::clone(&self.seq);
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match fetch_frame(&client, &url, &seq).await {
                    Ok(frame) => {
                        debug!(seq = frame.seq, "snapshot received");
                        store(&latest, frame);
                    }
                    Err(e) => warn!(error = %e, "failed to fetch camera snapshot"),
                }
            }
        });

        if let Ok(mut poller) = self.poller.lock() {
            if let Some(old) = poller.replace(handle) {
                old.abort();
            }
        }
        Ok(())
    }

    fn close(&self) {
        if let Ok(mut poller) = self.poller.lock() {
            if let Some(handle) = poller.take() {
                handle.abort();
                info!(url = self.url, "HTTP snapshot camera closed");
            }
        }
        if let Ok(mut latest) = self.latest.lock() {
            *latest = None;
        }
    }

    fn try_get_latest_frame(&self) -> Option<Frame> {
        self.latest.lock().ok().and_then(|f| f.clone())
    }
}

impl Drop for HttpSnapshotSource {
    fn drop(&mut self) {
        if let Ok(mut poller) = self.poller.lock() {
            if let Some(handle) = poller.take() {
                handle.abort();
            }
        }
    }
}

fn store(latest: &Mutex<Option<Frame>>, frame: Frame) {
    if let Ok(mut slot) = latest.lock() {
        *slot = Some(frame);
    }
}

async fn fetch_frame(
    client: &reqwest::Client,
    url: &str,
    seq: &AtomicU64,
) -> Result<Frame, String> {
    let resp = client.get(url).send().await.map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("HTTP status {}", resp.status()));
    }
    let body = resp.bytes().await.map_err(|e| e.to_string())?;
    let captured_at_ms = Utc::now().timestamp_millis();
    let seq = seq.fetch_add(1, Ordering::Relaxed);

    tokio::task::spawn_blocking(move || Frame::decode(&body, captured_at_ms, seq))
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())
}
