pub mod http;
pub mod still;

use std::future::Future;

use card_capture_common::config::{CameraConfig, CameraKind};
use card_capture_common::frame::Frame;

use self::http::HttpSnapshotSource;
use self::still::StillImageSource;

/// Camera device as seen by a capture session.
///
/// `open`/`close` bracket the device lifetime; `try_get_latest_frame` never
/// blocks and returns `None` until the device delivers its first frame.
pub trait FrameSource: Send + Sync + 'static {
    fn open(&self) -> impl Future<Output = Result<(), SourceError>> + Send;

    fn close(&self);

    fn try_get_latest_frame(&self) -> Option<Frame>;
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Camera backend selected by `camera.kind`.
pub enum CameraSource {
    Http(HttpSnapshotSource),
    Still(StillImageSource),
}

impl CameraSource {
    pub fn from_config(config: &CameraConfig) -> Result<Self, SourceError> {
        match config.kind {
            CameraKind::Http => Ok(Self::Http(HttpSnapshotSource::new(config)?)),
            CameraKind::File => {
                let path = config.image_path.as_deref().ok_or_else(|| {
                    SourceError::DeviceUnavailable("camera.image_path not set".into())
                })?;
                Ok(Self::Still(StillImageSource::new(path)))
            }
        }
    }
}

impl FrameSource for CameraSource {
    async fn open(&self) -> Result<(), SourceError> {
        match self {
            Self::Http(s) => s.open().await,
            Self::Still(s) => s.open().await,
        }
    }

    fn close(&self) {
        match self {
            Self::Http(s) => s.close(),
            Self::Still(s) => s.close(),
        }
    }

    fn try_get_latest_frame(&self) -> Option<Frame> {
        match self {
            Self::Http(s) => s.try_get_latest_frame(),
            Self::Still(s) => s.try_get_latest_frame(),
        }
    }
}
