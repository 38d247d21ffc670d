//! Quadrilateral and rotated-rectangle geometry used to build RBOX supervision.
//!
//! All coordinates are in image pixel space: x grows to the right, y grows downwards.
//! A quad is "clockwise" when it reads top-left, top-right, bottom-right, bottom-left
//! on screen, which is a positive signed area in these coordinates.

use std::f32::consts::{FRAC_PI_2, FRAC_PI_4, PI};

use float_ord::FloatOrd;
use geo::{
    Area, BoundingRect, Coord, EuclideanDistance, EuclideanLength, Intersects, Line, LineString,
    MinimumRotatedRect, Point, Polygon,
};
use imageproc::point::Point as PixelPoint;
use nalgebra::{Rotation2, Vector2};

use crate::error::GeometryError;

/// Fraction of the shorter adjacent edge each vertex is moved inwards when shrinking.
pub const SHRINK_RATIO: f32 = 0.3;

/// Anything with less absolute area than this (in px²) is treated as degenerate.
pub const MIN_POLYGON_AREA: f32 = 1.0;

const POINT_EPSILON: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quad(pub [Coord<f32>; 4]);

impl Quad {
    pub fn new(points: [Coord<f32>; 4]) -> Self {
        Self(points)
    }

    pub fn from_flat(v: [f32; 8]) -> Self {
        Self([
            Coord { x: v[0], y: v[1] },
            Coord { x: v[2], y: v[3] },
            Coord { x: v[4], y: v[5] },
            Coord { x: v[6], y: v[7] },
        ])
    }

    pub fn points(&self) -> &[Coord<f32>; 4] {
        &self.0
    }

    pub fn to_polygon(&self) -> Polygon<f32> {
        Polygon::new(LineString::new(self.0.to_vec()), vec![])
    }

    /// Edge `i` runs from point `i` to point `i + 1`.
    pub fn edge(&self, i: usize) -> Line<f32> {
        Line::new(self.0[i % 4], self.0[(i + 1) % 4])
    }

    pub fn edge_len(&self, i: usize) -> f32 {
        self.edge(i).euclidean_length()
    }

    pub fn min_side(&self) -> f32 {
        (0..4)
            .map(|i| FloatOrd(self.edge_len(i)))
            .min()
            .map(|it| it.0)
            .unwrap_or(0.0)
    }

    pub fn max_side(&self) -> f32 {
        (0..4)
            .map(|i| FloatOrd(self.edge_len(i)))
            .max()
            .map(|it| it.0)
            .unwrap_or(0.0)
    }

    pub fn map(&self, f: impl Fn(Coord<f32>) -> Coord<f32>) -> Self {
        Self(self.0.map(f))
    }

    pub fn scale(&self, factor_x: f32, factor_y: f32) -> Self {
        self.map(|c| Coord {
            x: c.x * factor_x,
            y: c.y * factor_y,
        })
    }

    pub fn translate(&self, dx: f32, dy: f32) -> Self {
        self.map(|c| Coord {
            x: c.x + dx,
            y: c.y + dy,
        })
    }

    /// Clamps every point into `[0, width - 1] × [0, height - 1]`.
    pub fn clip(&self, width: u32, height: u32) -> Self {
        let max_x = width.saturating_sub(1) as f32;
        let max_y = height.saturating_sub(1) as f32;
        self.map(|c| Coord {
            x: c.x.clamp(0.0, max_x),
            y: c.y.clamp(0.0, max_y),
        })
    }

    /// Same polygon, opposite winding, keeping the first point.
    pub fn reversed(&self) -> Self {
        let [p0, p1, p2, p3] = self.0;
        Self([p0, p3, p2, p1])
    }

    /// Rotates the point order so the top-left-most corner comes first.
    ///
    /// "Top-left-most" is the smallest `x + y`, ties broken by the lowest `y`
    /// and then the lowest `x`. For upright boxes this is the same corner as
    /// "lowest `y`, then lowest `x`"; on slanted ones the `x + y` key keeps the
    /// start corner from jumping between neighbours under small rotations.
    pub fn canonical(&self) -> Self {
        let start = self
            .0
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| (FloatOrd(c.x + c.y), FloatOrd(c.y), FloatOrd(c.x)))
            .map(|(i, _)| i)
            .unwrap_or(0);
        Self(std::array::from_fn(|i| self.0[(start + i) % 4]))
    }

    pub fn has_distinct_points(&self) -> bool {
        (0..4).all(|i| {
            ((i + 1)..4).all(|j| {
                let (a, b) = (self.0[i], self.0[j]);
                (a.x - b.x).abs() > POINT_EPSILON || (a.y - b.y).abs() > POINT_EPSILON
            })
        })
    }

    /// A "bowtie": one pair of opposite edges crosses.
    pub fn is_self_intersecting(&self) -> bool {
        self.edge(0).intersects(&self.edge(2)) || self.edge(1).intersects(&self.edge(3))
    }

    /// `(min, max)` corners of the axis-aligned bounds.
    pub fn bounds(&self) -> (Coord<f32>, Coord<f32>) {
        match LineString::new(self.0.to_vec()).bounding_rect() {
            Some(rect) => (rect.min(), rect.max()),
            None => (self.0[0], self.0[0]),
        }
    }

    /// True if every point lies inside the closed box `[min, max]`.
    pub fn is_within(&self, min: Coord<f32>, max: Coord<f32>) -> bool {
        self.0
            .iter()
            .all(|c| c.x >= min.x && c.x <= max.x && c.y >= min.y && c.y <= max.y)
    }

    pub(crate) fn to_pixel_points(&self) -> Vec<PixelPoint<i32>> {
        let mut points: Vec<PixelPoint<i32>> = Vec::with_capacity(4);
        for c in self.0 {
            let point = PixelPoint::new(c.x.round() as i32, c.y.round() as i32);
            if points.last() != Some(&point) {
                points.push(point);
            }
        }
        while points.len() > 1 && points.first() == points.last() {
            points.pop();
        }
        points
    }
}

/// Signed shoelace area. Positive for clockwise-on-screen point order.
pub fn polygon_area(quad: &Quad) -> f32 {
    quad.to_polygon().signed_area()
}

/// Distance from `p` to the segment `a–b`, measured to the nearest endpoint when the
/// perpendicular foot falls outside the segment.
pub fn point_to_segment_distance(p: Coord<f32>, a: Coord<f32>, b: Coord<f32>) -> f32 {
    Point::from(p).euclidean_distance(&Line::new(a, b))
}

/// Checks a raw annotation quad and brings it into canonical form: clockwise on screen,
/// starting at the top-left-most corner.
pub fn validate_quad(quad: Quad) -> Result<Quad, GeometryError> {
    if !quad.has_distinct_points() {
        return Err(GeometryError::TooFewPoints);
    }
    let area = polygon_area(&quad);
    if area.abs() < MIN_POLYGON_AREA {
        return Err(GeometryError::Degenerate { area });
    }
    if quad.is_self_intersecting() {
        return Err(GeometryError::SelfIntersecting);
    }
    let quad = if area < 0.0 { quad.reversed() } else { quad };
    Ok(quad.canonical())
}

/// Moves every vertex inwards along both of its edges by `ratio` times the length of
/// its shorter adjacent edge. The longer pair of opposite edges is handled first.
pub fn shrink_polygon(quad: &Quad, ratio: f32) -> Result<Quad, GeometryError> {
    let original_area = polygon_area(quad);
    let mut p = quad.0;
    let r: [f32; 4] = std::array::from_fn(|i| quad.edge_len(i).min(quad.edge_len(i + 3)));

    let horizontal_first =
        quad.edge_len(0) + quad.edge_len(2) > quad.edge_len(1) + quad.edge_len(3);
    let order: [(usize, usize); 4] = if horizontal_first {
        [(0, 1), (3, 2), (0, 3), (1, 2)]
    } else {
        [(0, 3), (1, 2), (0, 1), (3, 2)]
    };

    for (a, b) in order {
        let dx = p[b].x - p[a].x;
        let dy = p[b].y - p[a].y;
        let len = (dx * dx + dy * dy).sqrt();
        if len <= POINT_EPSILON {
            return Err(GeometryError::Unshrinkable);
        }
        let (ux, uy) = (dx / len, dy / len);
        p[a].x += ratio * r[a] * ux;
        p[a].y += ratio * r[a] * uy;
        p[b].x -= ratio * r[b] * ux;
        p[b].y -= ratio * r[b] * uy;
    }

    let shrunk = Quad(p);
    let area = polygon_area(&shrunk);
    if area.abs() < MIN_POLYGON_AREA || area.signum() != original_area.signum() {
        return Err(GeometryError::Unshrinkable);
    }
    Ok(shrunk)
}

/// Minimum-area enclosing rectangle of the quad, with its angle normalized.
pub fn fit_min_area_rect(quad: &Quad) -> Result<RotatedRect, GeometryError> {
    let rect = quad
        .to_polygon()
        .minimum_rotated_rect()
        .ok_or(GeometryError::RectFit)?;
    let coords = rect.exterior().0.as_slice();
    if coords.len() < 4 {
        return Err(GeometryError::RectFit);
    }
    let rect = RotatedRect::from_corners([coords[0], coords[1], coords[2], coords[3]])
        .ok_or(GeometryError::RectFit)?;
    if !(rect.width * rect.height).is_finite() || rect.width * rect.height < MIN_POLYGON_AREA {
        return Err(GeometryError::RectFit);
    }
    Ok(rect)
}

/// A rectangle rotated about its center.
///
/// `angle` is in `(-π/4, π/4]`. The "top" edge runs along `(cos θ, -sin θ)`, so a positive
/// angle tilts the text baseline upwards to the right on screen. `width` is measured
/// along the top edge and may be smaller than `height` for vertical text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotatedRect {
    pub center: Coord<f32>,
    pub width: f32,
    pub height: f32,
    pub angle: f32,
}

impl RotatedRect {
    /// Builds a rectangle from its four corners in traversal order (either winding),
    /// labelling the edge that lies within 45° of horizontal as the top.
    pub fn from_corners(corners: [Coord<f32>; 4]) -> Option<Self> {
        let e0 = corners[1] - corners[0];
        let e1 = corners[2] - corners[1];
        let len0 = (e0.x * e0.x + e0.y * e0.y).sqrt();
        let len1 = (e1.x * e1.x + e1.y * e1.y).sqrt();
        if len0 <= POINT_EPSILON || len1 <= POINT_EPSILON {
            return None;
        }
        let center = Coord {
            x: corners.iter().map(|c| c.x).sum::<f32>() / 4.0,
            y: corners.iter().map(|c| c.y).sum::<f32>() / 4.0,
        };

        let theta0 = fold_half_turn((-e0.y).atan2(e0.x));
        let theta1 = fold_half_turn((-e1.y).atan2(e1.x));
        let (width, height, angle) = if (theta0.abs() - theta1.abs()).abs() < 1e-5 {
            // 45°: both edges qualify, the positive angle wins
            if theta0 >= theta1 {
                (len0, len1, theta0)
            } else {
                (len1, len0, theta1)
            }
        } else if theta0.abs() < theta1.abs() {
            (len0, len1, theta0)
        } else {
            (len1, len0, theta1)
        };

        Some(Self {
            center,
            width,
            height,
            angle: angle.min(FRAC_PI_4),
        })
    }

    /// Rebuilds the rectangle seen from one interior pixel: `distances` are
    /// `[top, right, bottom, left]`.
    pub fn from_rbox(pixel: Coord<f32>, distances: [f32; 4], angle: f32) -> Self {
        let [top, right, bottom, left] = distances;
        let local = Vector2::new((right - left) / 2.0, (bottom - top) / 2.0);
        let offset = Rotation2::new(-angle) * local;
        Self {
            center: Coord {
                x: pixel.x + offset.x,
                y: pixel.y + offset.y,
            },
            width: left + right,
            height: top + bottom,
            angle,
        }
    }

    fn axes(&self) -> (Vector2<f32>, Vector2<f32>) {
        let (sin, cos) = self.angle.sin_cos();
        (Vector2::new(cos, -sin), Vector2::new(sin, cos))
    }

    /// Top-left, top-right, bottom-right, bottom-left.
    pub fn corners(&self) -> [Coord<f32>; 4] {
        let (u, v) = self.axes();
        let c = Vector2::new(self.center.x, self.center.y);
        let hw = u * (self.width / 2.0);
        let hh = v * (self.height / 2.0);
        [c - hw - hh, c + hw - hh, c + hw + hh, c - hw + hh].map(|p| Coord { x: p.x, y: p.y })
    }

    /// Perpendicular distances from `p` to the top, right, bottom and left edge lines.
    /// Negative when `p` lies outside that edge.
    pub fn edge_distances(&self, p: Coord<f32>) -> [f32; 4] {
        let local = Rotation2::new(self.angle)
            * Vector2::new(p.x - self.center.x, p.y - self.center.y);
        let hw = self.width / 2.0;
        let hh = self.height / 2.0;
        [hh + local.y, hw - local.x, hh - local.y, hw + local.x]
    }

    /// Largest distance from a quad vertex to the rectangle outline.
    pub fn residual(&self, quad: &Quad) -> f32 {
        let corners = self.corners();
        quad.points()
            .iter()
            .map(|p| {
                (0..4)
                    .map(|i| FloatOrd(point_to_segment_distance(*p, corners[i], corners[(i + 1) % 4])))
                    .min()
                    .map(|it| it.0)
                    .unwrap_or(0.0)
            })
            .map(FloatOrd)
            .max()
            .map(|it| it.0)
            .unwrap_or(0.0)
    }
}

fn fold_half_turn(mut theta: f32) -> f32 {
    while theta > FRAC_PI_2 {
        theta -= PI;
    }
    while theta <= -FRAC_PI_2 {
        theta += PI;
    }
    theta
}

#[cfg(test)]
mod tests {
    use geo::Contains;

    use super::*;

    fn quad(points: [(f32, f32); 4]) -> Quad {
        Quad(points.map(|(x, y)| Coord { x, y }))
    }

    fn rect_quad(x0: f32, y0: f32, x1: f32, y1: f32) -> Quad {
        quad([(x0, y0), (x1, y0), (x1, y1), (x0, y1)])
    }

    #[test]
    fn area_is_positive_for_screen_clockwise() {
        assert_eq!(polygon_area(&rect_quad(0.0, 0.0, 10.0, 5.0)), 50.0);
    }

    #[test]
    fn area_invariant_under_rotation_and_flips_on_reversal() {
        let q = quad([(3.0, 1.0), (20.0, 4.0), (18.0, 15.0), (1.0, 9.0)]);
        let area = polygon_area(&q);
        for shift in 1..4 {
            let rotated = Quad(std::array::from_fn(|i| q.0[(i + shift) % 4]));
            assert!((polygon_area(&rotated) - area).abs() < 1e-3);
        }
        let reversed = Quad([q.0[3], q.0[2], q.0[1], q.0[0]]);
        assert!((polygon_area(&reversed) + area).abs() < 1e-3);
    }

    #[test]
    fn segment_distance_clamps_to_endpoints() {
        let a = Coord { x: 0.0, y: 0.0 };
        let b = Coord { x: 10.0, y: 0.0 };
        assert!((point_to_segment_distance(Coord { x: 5.0, y: 3.0 }, a, b) - 3.0).abs() < 1e-5);
        assert!((point_to_segment_distance(Coord { x: 13.0, y: 4.0 }, a, b) - 5.0).abs() < 1e-5);
        assert!((point_to_segment_distance(Coord { x: -3.0, y: -4.0 }, a, b) - 5.0).abs() < 1e-5);
    }

    #[test]
    fn validate_reorients_and_starts_top_left() {
        let ccw = quad([(10.0, 10.0), (10.0, 20.0), (40.0, 20.0), (40.0, 10.0)]);
        let q = validate_quad(ccw).unwrap();
        assert!(polygon_area(&q) > 0.0);
        assert_eq!(q.0[0], Coord { x: 10.0, y: 10.0 });
        assert_eq!(q.0[1], Coord { x: 40.0, y: 10.0 });

        let shifted = quad([(40.0, 20.0), (10.0, 20.0), (10.0, 10.0), (40.0, 10.0)]);
        assert_eq!(validate_quad(shifted).unwrap(), q);
    }

    #[test]
    fn canonical_start_breaks_ties_on_lowest_y() {
        let diamond = quad([(100.0, 50.0), (50.0, 100.0), (0.0, 50.0), (50.0, 0.0)]);
        // (0, 50) and (50, 0) share x + y
        assert_eq!(diamond.canonical().0[0], Coord { x: 50.0, y: 0.0 });

        let upright = quad([(40.0, 30.0), (5.0, 30.0), (5.0, 8.0), (40.0, 8.0)]);
        assert_eq!(upright.canonical().0[0], Coord { x: 5.0, y: 8.0 });
        assert_eq!(upright.canonical().0[1], Coord { x: 40.0, y: 8.0 });
    }

    #[test]
    fn validate_rejects_bad_polygons() {
        let collinear = quad([(0.0, 0.0), (5.0, 0.0), (10.0, 0.0), (15.0, 0.0)]);
        assert!(matches!(
            validate_quad(collinear),
            Err(GeometryError::Degenerate { .. })
        ));
        let duplicate = quad([(0.0, 0.0), (0.0, 0.0), (10.0, 10.0), (0.0, 10.0)]);
        assert_eq!(validate_quad(duplicate), Err(GeometryError::TooFewPoints));
        let bowtie = quad([(0.0, 0.0), (20.0, 10.0), (20.0, 0.0), (0.0, 12.0)]);
        assert_eq!(validate_quad(bowtie), Err(GeometryError::SelfIntersecting));
    }

    #[test]
    fn shrink_stays_strictly_inside_convex_quads() {
        let quads = [
            rect_quad(0.0, 0.0, 100.0, 30.0),
            quad([(5.0, 2.0), (60.0, 10.0), (55.0, 40.0), (2.0, 30.0)]),
            quad([(50.0, 0.0), (100.0, 50.0), (50.0, 100.0), (0.0, 50.0)]),
        ];
        for q in quads {
            let polygon = q.to_polygon();
            for ratio in [0.05, 0.2, 0.3, 0.45] {
                let shrunk = shrink_polygon(&q, ratio).unwrap();
                assert!(polygon_area(&shrunk) > 0.0);
                assert!(polygon_area(&shrunk) < polygon_area(&q));
                for p in shrunk.points() {
                    assert!(polygon.contains(p), "{p:?} escaped {q:?} at ratio {ratio}");
                }
            }
        }
    }

    #[test]
    fn shrink_moves_rectangle_edges_by_ratio_of_short_side() {
        let shrunk = shrink_polygon(&rect_quad(0.0, 0.0, 100.0, 20.0), 0.3).unwrap();
        let (min, max) = shrunk.bounds();
        assert!((min.x - 6.0).abs() < 1e-4 && (max.x - 94.0).abs() < 1e-4);
        assert!((min.y - 6.0).abs() < 1e-4 && (max.y - 14.0).abs() < 1e-4);
    }

    #[test]
    fn tiny_polygons_are_unshrinkable() {
        let tiny = rect_quad(0.0, 0.0, 2.0, 1.0);
        assert_eq!(shrink_polygon(&tiny, 0.3), Err(GeometryError::Unshrinkable));
    }

    #[test]
    fn axis_aligned_rect_fit() {
        let rect = fit_min_area_rect(&rect_quad(100.0, 100.0, 300.0, 200.0)).unwrap();
        assert!(rect.angle.abs() < 1e-5);
        assert!((rect.width - 200.0).abs() < 1e-3);
        assert!((rect.height - 100.0).abs() < 1e-3);
        assert!((rect.center.x - 200.0).abs() < 1e-3 && (rect.center.y - 150.0).abs() < 1e-3);
        let distances = rect.edge_distances(Coord { x: 150.0, y: 120.0 });
        for (got, want) in distances.iter().zip([20.0, 150.0, 80.0, 50.0]) {
            assert!((got - want).abs() < 1e-3, "{distances:?}");
        }
    }

    #[test]
    fn vertical_rect_keeps_horizontal_edge_as_top() {
        let rect = fit_min_area_rect(&rect_quad(0.0, 0.0, 20.0, 100.0)).unwrap();
        assert!(rect.angle.abs() < 1e-5);
        assert!((rect.width - 20.0).abs() < 1e-3);
        assert!((rect.height - 100.0).abs() < 1e-3);
    }

    #[test]
    fn normalized_angle_range_and_rbox_round_trip() {
        let mut theta = -PI;
        while theta < PI {
            let rect = RotatedRect {
                center: Coord { x: 250.0, y: 180.0 },
                width: 120.0,
                height: 40.0,
                angle: theta,
            };
            let corners = rect.corners();
            for order in [corners, [corners[3], corners[2], corners[1], corners[0]]] {
                let fitted = RotatedRect::from_corners(order).unwrap();
                assert!(fitted.angle > -FRAC_PI_4 && fitted.angle <= FRAC_PI_4, "{fitted:?}");
                assert!((fitted.width * fitted.height - 4800.0).abs() < 0.5);

                let distances = fitted.edge_distances(fitted.center);
                let restored = RotatedRect::from_rbox(fitted.center, distances, fitted.angle);
                assert!((restored.width - fitted.width).abs() < 1e-3);
                assert!((restored.height - fitted.height).abs() < 1e-3);
                assert!((restored.angle - fitted.angle).abs() < 1e-6);

                let off_center = Coord { x: 260.0, y: 175.0 };
                let restored = RotatedRect::from_rbox(
                    off_center,
                    fitted.edge_distances(off_center),
                    fitted.angle,
                );
                assert!((restored.center.x - fitted.center.x).abs() < 1e-3);
                assert!((restored.center.y - fitted.center.y).abs() < 1e-3);
            }
            theta += 0.07;
        }
    }

    #[test]
    fn forty_five_degrees_resolves_to_positive_angle() {
        let diamond = quad([(50.0, 0.0), (100.0, 50.0), (50.0, 100.0), (0.0, 50.0)]);
        let rect = fit_min_area_rect(&diamond).unwrap();
        assert!((rect.angle - FRAC_PI_4).abs() < 1e-4, "{rect:?}");
    }

    #[test]
    fn rect_residual_is_zero_for_rectangles() {
        let q = rect_quad(10.0, 10.0, 50.0, 30.0);
        let rect = fit_min_area_rect(&q).unwrap();
        assert!(rect.residual(&q) < 1e-3);
    }

    #[test]
    fn scale_composes() {
        let q = quad([(3.5, 1.0), (20.0, 4.25), (18.0, 15.0), (1.0, 9.0)]);
        let twice = q.scale(1.5, 0.8).scale(0.6, 2.5);
        let once = q.scale(1.5 * 0.6, 0.8 * 2.5);
        for (a, b) in twice.points().iter().zip(once.points()) {
            assert!((a.x - b.x).abs() < 1e-4 && (a.y - b.y).abs() < 1e-4);
        }
    }

    #[test]
    fn pixel_points_drop_repeated_corners() {
        let q = quad([(0.1, 0.1), (0.2, 0.2), (10.0, 0.0), (10.0, 10.0)]);
        assert_eq!(q.to_pixel_points().len(), 3);
    }
}
