//! Spherical and planar helpers shared by projection, arrival detection and
//! neighbor distances. Coordinates are WGS84 degrees, distances meters.

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per degree of latitude (and of longitude at the equator).
const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub lat: f64,
    pub lng: f64,
}

impl Point {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }
}

pub fn haversine_distance(a: Point, b: Point) -> f64 {
    let lat1_rad = a.lat.to_radians();
    let lat2_rad = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().asin();

    EARTH_RADIUS_M * c
}

/// Total along-route length of a polyline.
pub fn polyline_length_meters(points: &[Point]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine_distance(w[0], w[1]))
        .sum()
}

/// Where a point landed on a polyline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolylineProjection {
    /// Normalized along-route position, 0.0 at the first vertex, 1.0 at the last.
    pub progress: f64,
    /// Perpendicular distance from the point to the polyline.
    pub deviation_meters: f64,
    /// Index of the segment the point projected onto.
    pub segment: usize,
}

/// Projects a point onto the nearest segment of a polyline.
///
/// Each candidate segment is evaluated on a local equirectangular plane
/// scaled at the segment's own midpoint latitude, which is accurate at
/// street scale. Ties between equally distant segments resolve to the
/// earliest segment, so a self-crossing route yields a stable progress
/// value.
///
/// Returns None for degenerate input: fewer than two vertices, or a polyline
/// whose total length is zero.
pub fn project_onto_polyline(point: Point, polyline: &[Point]) -> Option<PolylineProjection> {
    if polyline.len() < 2 {
        return None;
    }

    let mut segment_lengths = Vec::with_capacity(polyline.len() - 1);
    let mut total_length = 0.0;
    for w in polyline.windows(2) {
        let len = haversine_distance(w[0], w[1]);
        segment_lengths.push(len);
        total_length += len;
    }
    if total_length <= 0.0 {
        return None;
    }

    let mut best: Option<(f64, usize, f64)> = None;
    for (i, w) in polyline.windows(2).enumerate() {
        // Zero-length segments cannot host a projection.
        if segment_lengths[i] <= 0.0 {
            continue;
        }
        let (deviation, t) = project_onto_segment(point, w[0], w[1]);
        // Strict comparison keeps the earliest segment on exact ties.
        let better = match best {
            None => true,
            Some((best_deviation, _, _)) => deviation < best_deviation,
        };
        if better {
            best = Some((deviation, i, t));
        }
    }

    let (deviation_meters, segment, t) = best?;
    let along = segment_lengths[..segment].iter().sum::<f64>() + t * segment_lengths[segment];
    let progress = (along / total_length).clamp(0.0, 1.0);

    Some(PolylineProjection {
        progress,
        deviation_meters,
        segment,
    })
}

/// Distance from `p` to segment `ab` and the clamped projection parameter,
/// on an equirectangular plane scaled at the segment's midpoint latitude.
fn project_onto_segment(p: Point, a: Point, b: Point) -> (f64, f64) {
    let lng_scale = ((a.lat + b.lat) / 2.0).to_radians().cos();

    let bx = (b.lng - a.lng) * lng_scale * METERS_PER_DEGREE;
    let by = (b.lat - a.lat) * METERS_PER_DEGREE;
    let px = (p.lng - a.lng) * lng_scale * METERS_PER_DEGREE;
    let py = (p.lat - a.lat) * METERS_PER_DEGREE;

    let segment_sq = bx * bx + by * by;
    let t = if segment_sq > 0.0 {
        ((px * bx + py * by) / segment_sq).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let dx = px - t * bx;
    let dy = py - t * by;
    ((dx * dx + dy * dy).sqrt(), t)
}

/// Even-odd ray cast. Polygons with fewer than three vertices contain nothing;
/// the closing edge from last to first vertex is implied.
pub fn point_in_polygon(point: Point, polygon: &[Point]) -> bool {
    if polygon.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let pi = polygon[i];
        let pj = polygon[j];
        if (pi.lat > point.lat) != (pj.lat > point.lat) {
            let crossing_lng =
                (pj.lng - pi.lng) * (point.lat - pi.lat) / (pj.lat - pi.lat) + pi.lng;
            if point.lng < crossing_lng {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    // Roughly one meter of latitude in degrees.
    const DEG_M: f64 = 1.0 / 111_194.9;

    fn straight_line() -> Vec<Point> {
        vec![
            Point::new(0.0, 0.0),
            Point::new(0.0, 0.001),
            Point::new(0.0, 0.002),
        ]
    }

    #[test]
    fn test_haversine_known_distance() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(0.0, 0.001);
        let d = haversine_distance(a, b);
        assert!((d - 111.19).abs() < 0.1, "got {d}");
    }

    #[test]
    fn test_projection_endpoints_and_midpoint() {
        let line = straight_line();

        let start = project_onto_polyline(Point::new(0.0, 0.0), &line).unwrap();
        assert!(start.progress.abs() < 1e-9);
        assert!(start.deviation_meters < 1e-6);

        let end = project_onto_polyline(Point::new(0.0, 0.002), &line).unwrap();
        assert!((end.progress - 1.0).abs() < 1e-9);

        let mid = project_onto_polyline(Point::new(0.0, 0.001), &line).unwrap();
        assert!((mid.progress - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_projection_reports_perpendicular_deviation() {
        let line = straight_line();
        // 50 meters north of the midpoint.
        let p = Point::new(50.0 * DEG_M, 0.001);
        let proj = project_onto_polyline(p, &line).unwrap();
        assert!((proj.deviation_meters - 50.0).abs() < 0.5, "got {}", proj.deviation_meters);
        assert!((proj.progress - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_projection_clamps_beyond_endpoints() {
        let line = straight_line();
        let past_end = project_onto_polyline(Point::new(0.0, 0.003), &line).unwrap();
        assert!((past_end.progress - 1.0).abs() < 1e-9);
        assert!(past_end.deviation_meters > 100.0);

        let before_start = project_onto_polyline(Point::new(0.0, -0.001), &line).unwrap();
        assert!(before_start.progress.abs() < 1e-9);
    }

    #[test]
    fn test_tie_breaks_to_earliest_segment() {
        // Out-and-back along the same track: both segments are equally close
        // to any point on the track.
        let line = vec![
            Point::new(0.0, 0.0),
            Point::new(0.0, 0.001),
            Point::new(0.0, 0.0),
        ];
        let proj = project_onto_polyline(Point::new(0.0, 0.0005), &line).unwrap();
        assert_eq!(proj.segment, 0);
        assert!((proj.progress - 0.25).abs() < 1e-6, "got {}", proj.progress);
    }

    #[test]
    fn test_degenerate_polylines_yield_none() {
        assert!(project_onto_polyline(Point::new(0.0, 0.0), &[]).is_none());
        assert!(project_onto_polyline(Point::new(0.0, 0.0), &[Point::new(1.0, 1.0)]).is_none());
        let collapsed = vec![Point::new(1.0, 1.0), Point::new(1.0, 1.0)];
        assert!(project_onto_polyline(Point::new(0.0, 0.0), &collapsed).is_none());
    }

    #[test]
    fn test_zero_length_segment_skipped() {
        let line = vec![
            Point::new(0.0, 0.0),
            Point::new(0.0, 0.001),
            Point::new(0.0, 0.001),
            Point::new(0.0, 0.002),
        ];
        let proj = project_onto_polyline(Point::new(0.0, 0.0015), &line).unwrap();
        assert!((proj.progress - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_point_in_polygon_square() {
        let square = vec![
            Point::new(0.0, 0.0),
            Point::new(0.0, 0.002),
            Point::new(0.002, 0.002),
            Point::new(0.002, 0.0),
        ];
        assert!(point_in_polygon(Point::new(0.001, 0.001), &square));
        assert!(!point_in_polygon(Point::new(0.003, 0.001), &square));
        assert!(!point_in_polygon(Point::new(-0.001, 0.001), &square));
    }

    #[test]
    fn test_too_small_polygon_contains_nothing() {
        let pair = vec![Point::new(0.0, 0.0), Point::new(0.0, 0.002)];
        assert!(!point_in_polygon(Point::new(0.0, 0.001), &pair));
    }

    #[test]
    fn test_polyline_length_sums_segments() {
        let len = polyline_length_meters(&straight_line());
        assert!((len - 222.39).abs() < 0.2, "got {len}");
    }
}
