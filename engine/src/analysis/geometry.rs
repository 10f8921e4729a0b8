use card_capture_common::config::{DetectorConfig, Thresholds};
use card_capture_common::frame::GrayscaleBuffer;
use imageproc::contours::{find_contours, Contour};
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::geometry::{approximate_polygon_dp, arc_length};
use imageproc::morphology::dilate;
use imageproc::point::Point;
use tracing::debug;

use super::Rect;

/// Outcome of one card search over a grayscale buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CardDetection {
    pub found: bool,
    pub bounding_box: Option<Rect>,
    pub aspect_ratio: Option<f64>,
}

impl CardDetection {
    pub fn not_found() -> Self {
        Self {
            found: false,
            bounding_box: None,
            aspect_ratio: None,
        }
    }
}

/// Finds an ID-1 card outline in a grayscale frame.
///
/// Algorithm:
/// 1. Canny edge map with fixed hysteresis thresholds, then a small square
///    dilation to close corner gaps
/// 2. External contours only; holes and nested contours are ignored
/// 3. Each contour is approximated to a polygon within `epsilon_ratio` of its
///    perimeter; only quadrilaterals are kept
/// 4. The first quadrilateral whose bounding box passes the size and aspect
///    gates wins
///
/// First match rather than best match: this runs every tick of a live
/// guidance loop.
#[derive(Debug, Clone)]
pub struct CardDetector {
    thresholds: Thresholds,
    config: DetectorConfig,
}

impl CardDetector {
    pub fn new(thresholds: Thresholds, config: DetectorConfig) -> Self {
        Self { thresholds, config }
    }

    pub fn detect_card(&self, gray: &GrayscaleBuffer) -> CardDetection {
        let (width, height) = gray.dimensions();
        if width < 3 || height < 3 {
            return CardDetection::not_found();
        }

        let mut edges = canny(gray, self.config.canny_low, self.config.canny_high);
        if self.config.dilate_radius > 0 {
            edges = dilate(&edges, Norm::LInf, self.config.dilate_radius);
        }

        let contours: Vec<Contour<i32>> = find_contours(&edges);
        let mut external = 0usize;
        let mut quads = 0usize;

        for contour in contours.iter().filter(|c| c.parent.is_none()) {
            external += 1;
            let Some(polygon) = approximate_contour(&contour.points, self.config.epsilon_ratio)
            else {
                continue;
            };
            if polygon.len() != 4 {
                continue;
            }
            quads += 1;

            let Some(rect) = bounding_rect(&polygon) else {
                continue;
            };
            if !self.thresholds.accepts_box(rect.width, rect.height) {
                continue;
            }

            let aspect_ratio = rect.width as f64 / rect.height as f64;
            debug!(
                x = rect.x,
                y = rect.y,
                width = rect.width,
                height = rect.height,
                aspect = format!("{:.3}", aspect_ratio),
                "card outline found"
            );
            return CardDetection {
                found: true,
                bounding_box: Some(rect),
                aspect_ratio: Some(aspect_ratio),
            };
        }

        debug!(
            contours = contours.len(),
            external, quads, "no card-shaped quadrilateral"
        );
        CardDetection::not_found()
    }
}

/// Closed-polygon approximation of a contour, or `None` for degenerate input.
///
/// The contour is split at the point farthest from its start and each half
/// is simplified as an open curve, so both split points survive as vertices.
fn approximate_contour(points: &[Point<i32>], epsilon_ratio: f64) -> Option<Vec<Point<i32>>> {
    if points.len() < 4 {
        return None;
    }
    let perimeter = arc_length(points, true);
    let epsilon = epsilon_ratio * perimeter;
    if !(epsilon > 0.0) {
        return None;
    }

    let start = points[0];
    let (far, far_dist) = points
        .iter()
        .enumerate()
        .skip(1)
        .map(|(i, p)| (i, squared_distance(start, *p)))
        .max_by_key(|&(_, d)| d)?;
    if far_dist == 0 {
        return None;
    }

    let mut polygon = approximate_polygon_dp(&points[..=far], epsilon, false);

    let mut closing = points[far..].to_vec();
    closing.push(start);
    let second = approximate_polygon_dp(&closing, epsilon, false);
    if second.len() > 2 {
        polygon.extend_from_slice(&second[1..second.len() - 1]);
    }

    polygon.dedup();
    Some(polygon)
}

fn squared_distance(a: Point<i32>, b: Point<i32>) -> i64 {
    let dx = i64::from(a.x - b.x);
    let dy = i64::from(a.y - b.y);
    dx * dx + dy * dy
}

/// Inclusive axis-aligned bounding box, `None` if it has no area.
fn bounding_rect(points: &[Point<i32>]) -> Option<Rect> {
    let min_x = points.iter().map(|p| p.x).min()?;
    let max_x = points.iter().map(|p| p.x).max()?;
    let min_y = points.iter().map(|p| p.y).min()?;
    let max_y = points.iter().map(|p| p.y).max()?;
    if max_x == min_x || max_y == min_y {
        return None;
    }
    Some(Rect {
        x: min_x,
        y: min_y,
        width: (max_x - min_x + 1) as u32,
        height: (max_y - min_y + 1) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn detector() -> CardDetector {
        CardDetector::new(Thresholds::default(), DetectorConfig::default())
    }

    fn filled_rect(w: u32, h: u32, x0: u32, y0: u32, rw: u32, rh: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            if x >= x0 && x < x0 + rw && y >= y0 && y < y0 + rh {
                Luma([220])
            } else {
                Luma([30])
            }
        })
    }

    #[test]
    fn uniform_buffer_finds_nothing() {
        for value in [0u8, 128, 255] {
            let gray = GrayImage::from_pixel(320, 240, Luma([value]));
            assert_eq!(detector().detect_card(&gray), CardDetection::not_found());
        }
    }

    #[test]
    fn card_shaped_rectangle_is_found() {
        let gray = filled_rect(400, 300, 60, 70, 256, 160);
        let det = detector().detect_card(&gray);
        assert!(det.found);
        let rect = det.bounding_box.unwrap();
        assert!((rect.width as i64 - 256).abs() <= 6, "width {}", rect.width);
        assert!((rect.height as i64 - 160).abs() <= 6, "height {}", rect.height);
        let aspect = det.aspect_ratio.unwrap();
        assert!((1.4..=1.8).contains(&aspect), "aspect {aspect}");
    }

    #[test]
    fn square_is_rejected_by_aspect_gate() {
        let gray = filled_rect(400, 400, 80, 80, 220, 220);
        assert!(!detector().detect_card(&gray).found);
    }

    #[test]
    fn small_card_is_rejected_by_size_gate() {
        // Correct aspect ratio but below the 200x100 minimum.
        let gray = filled_rect(400, 300, 100, 100, 160, 100);
        assert!(!detector().detect_card(&gray).found);
    }

    #[test]
    fn disk_is_not_a_quadrilateral() {
        let gray = GrayImage::from_fn(400, 300, |x, y| {
            let dx = x as f64 - 200.0;
            let dy = y as f64 - 150.0;
            if dx * dx + dy * dy < 110.0 * 110.0 {
                Luma([220])
            } else {
                Luma([30])
            }
        });
        assert!(!detector().detect_card(&gray).found);
    }

    #[test]
    fn tiny_and_degenerate_buffers_do_not_panic() {
        for (w, h) in [(0, 0), (1, 1), (2, 50), (50, 2)] {
            let gray = GrayImage::new(w, h);
            assert!(!detector().detect_card(&gray).found);
        }
        // A single bright pixel yields a contour with no area.
        let mut gray = GrayImage::new(50, 50);
        gray.put_pixel(25, 25, Luma([255]));
        assert!(!detector().detect_card(&gray).found);
    }

    #[test]
    fn approximation_of_rectangle_outline_has_four_vertices() {
        let mut points = Vec::new();
        for x in 0..100 {
            points.push(Point::new(x, 0));
        }
        for y in 1..60 {
            points.push(Point::new(99, y));
        }
        for x in (0..99).rev() {
            points.push(Point::new(x, 59));
        }
        for y in (1..59).rev() {
            points.push(Point::new(0, y));
        }
        let polygon = approximate_contour(&points, 0.03).unwrap();
        assert_eq!(polygon.len(), 4, "{polygon:?}");
        let rect = bounding_rect(&polygon).unwrap();
        assert_eq!((rect.width, rect.height), (100, 60));
    }

    #[test]
    fn collinear_points_are_degenerate() {
        let points: Vec<Point<i32>> = (0..20).map(|x| Point::new(x, 5)).collect();
        let polygon = approximate_contour(&points, 0.03).unwrap();
        assert!(polygon.len() < 4);
        assert!(bounding_rect(&polygon).is_none());
    }
}
