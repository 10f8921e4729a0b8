use card_capture_common::frame::{Frame, FrameError, GrayscaleBuffer};
use imageproc::filter::laplacian_filter;

/// Per-frame quality scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMetrics {
    /// Mean grayscale intensity, 0-255.
    pub mean_brightness: f64,
    /// Variance of the 3x3 Laplacian response. Low values mean little
    /// high-frequency content: blur, defocus or an occluded lens.
    pub sharpness_variance: f64,
}

/// Brightness and sharpness of a single frame.
///
/// Stateless: the same frame always yields bit-identical scores.
pub fn compute_metrics(frame: &Frame) -> Result<FrameMetrics, FrameError> {
    let gray = frame.grayscale()?;
    Ok(metrics_from_gray(&gray))
}

pub fn metrics_from_gray(gray: &GrayscaleBuffer) -> FrameMetrics {
    FrameMetrics {
        mean_brightness: mean_brightness(gray),
        sharpness_variance: laplacian_variance(gray),
    }
}

pub fn mean_brightness(gray: &GrayscaleBuffer) -> f64 {
    let count = gray.as_raw().len();
    if count == 0 {
        return 0.0;
    }
    let sum: u64 = gray.as_raw().iter().map(|&p| u64::from(p)).sum();
    sum as f64 / count as f64
}

/// `mean(r^2) - mean(r)^2` over the Laplacian response `r`.
///
/// Sums are accumulated as integers so the result does not depend on
/// summation order.
pub fn laplacian_variance(gray: &GrayscaleBuffer) -> f64 {
    let response = laplacian_filter(gray);
    let count = response.as_raw().len();
    if count == 0 {
        return 0.0;
    }

    let mut sum = 0i64;
    let mut sum_sq = 0i64;
    for &r in response.as_raw() {
        let r = i64::from(r);
        sum += r;
        sum_sq += r * r;
    }

    let mean = sum as f64 / count as f64;
    let mean_sq = sum_sq as f64 / count as f64;
    (mean_sq - mean * mean).max(0.0)
}
