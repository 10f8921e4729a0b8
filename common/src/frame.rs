use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, RgbaImage};

/// Single-channel intensity matrix derived from a [`Frame`].
pub type GrayscaleBuffer = GrayImage;

const RGBA_CHANNELS: usize = 4;

/// A raw RGBA camera frame with capture metadata.
///
/// Pixels are row-major, 4 bytes per pixel, no padding between rows. The
/// buffer is reference counted so handing the latest frame to an analysis
/// tick does not copy it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Bytes,
    pub captured_at_ms: i64,
    pub seq: u64,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        pixels: impl Into<Bytes>,
        captured_at_ms: i64,
        seq: u64,
    ) -> Self {
        Self {
            width,
            height,
            pixels: pixels.into(),
            captured_at_ms,
            seq,
        }
    }

    pub fn from_rgba_image(img: RgbaImage, captured_at_ms: i64, seq: u64) -> Self {
        let (width, height) = img.dimensions();
        Self::new(width, height, img.into_raw(), captured_at_ms, seq)
    }

    /// Decode an encoded image (JPEG, PNG, ...) into an RGBA frame.
    pub fn decode(encoded: &[u8], captured_at_ms: i64, seq: u64) -> Result<Self, FrameError> {
        let img = image::load_from_memory(encoded)
            .map_err(|e| FrameError::Decode(e.to_string()))?
            .to_rgba8();
        Ok(Self::from_rgba_image(img, captured_at_ms, seq))
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * RGBA_CHANNELS
    }

    /// Check the frame's preconditions: non-empty and a buffer matching its
    /// declared dimensions.
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::Empty {
                width: self.width,
                height: self.height,
            });
        }
        if self.pixels.len() != self.expected_len() {
            return Err(FrameError::LengthMismatch {
                got: self.pixels.len(),
                expected: self.expected_len(),
            });
        }
        Ok(())
    }

    pub fn to_rgba_image(&self) -> Result<RgbaImage, FrameError> {
        self.validate()?;
        RgbaImage::from_raw(self.width, self.height, self.pixels.to_vec()).ok_or(
            FrameError::LengthMismatch {
                got: self.pixels.len(),
                expected: self.expected_len(),
            },
        )
    }

    /// Luma conversion of the frame. Alpha is ignored.
    pub fn grayscale(&self) -> Result<GrayscaleBuffer, FrameError> {
        let rgba = self.to_rgba_image()?;
        Ok(image::imageops::grayscale(&rgba))
    }

    /// Encode the frame as a JPEG for hand-off to recognition.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        let rgb = image::DynamicImage::ImageRgba8(self.to_rgba_image()?).to_rgb8();
        let mut out = Vec::with_capacity(self.expected_len() / 8);
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode_image(&rgb)
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(out)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame: empty dimensions {width}x{height}")]
    Empty { width: u32, height: u32 },
    #[error("invalid frame: pixel buffer is {got} bytes, expected {expected}")]
    LengthMismatch { got: usize, expected: usize },
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
}
