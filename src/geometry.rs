// src/geometry.rs
//
// Segment intersection and signed-angle primitives for tripwire tests.
// Ported semantics: orientation-triple intersection with a collinear
// on-segment fallback, and movement-vs-line angle via atan2(cross, dot)
// normalized into [0, 360). Points are stored as f32 pixels; all the math
// runs in f64 so the endpoint offset is not rounded away at coordinates
// where the f32 ulp exceeds it (x >= 2048).

use serde::{Deserialize, Serialize};

/// Offset applied to tripwire endpoints before every intersection test.
///
/// A trajectory point that lands exactly on the line would otherwise be
/// evaluated as collinear on two consecutive frames and double-trigger a
/// single physical crossing. Regression case: movement (654,97)->(650,97)
/// followed by (650,97)->(649,97) against tripwire (650,0)-(650,100).
pub const LINE_EPSILON: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub a: Point,
    pub b: Point,
}

impl Segment {
    pub fn new(a: Point, b: Point) -> Self {
        Self { a, b }
    }

    fn endpoints(&self) -> (P64, P64) {
        ((self.a.x as f64, self.a.y as f64), (self.b.x as f64, self.b.y as f64))
    }

    fn endpoints_offset(&self, d: f64) -> (P64, P64) {
        let (a, b) = self.endpoints();
        ((a.0 + d, a.1 + d), (b.0 + d, b.1 + d))
    }
}

type P64 = (f64, f64);

fn orientation(p: P64, q: P64, r: P64) -> i8 {
    let val = (q.1 - p.1) * (r.0 - q.0) - (q.0 - p.0) * (r.1 - q.1);
    if val == 0.0 {
        0
    } else if val > 0.0 {
        1
    } else {
        -1
    }
}

fn on_segment(p: P64, q: P64, r: P64) -> bool {
    r.0 <= p.0.max(q.0) && r.0 >= p.0.min(q.0) && r.1 <= p.1.max(q.1) && r.1 >= p.1.min(q.1)
}

/// Segment-segment intersection. True for proper crossings and for
/// touching / collinear-overlap cases.
pub fn intersects(seg1: Segment, seg2: Segment) -> bool {
    intersects64(seg1.endpoints(), seg2.endpoints())
}

fn intersects64((p1, q1): (P64, P64), (p2, q2): (P64, P64)) -> bool {

    let o1 = orientation(p1, q1, p2);
    let o2 = orientation(p1, q1, q2);
    let o3 = orientation(p2, q2, p1);
    let o4 = orientation(p2, q2, q1);

    if o1 != o2 && o3 != o4 {
        return true;
    }

    if o1 == 0 && on_segment(p1, q1, p2) {
        return true;
    }
    if o2 == 0 && on_segment(p1, q1, q2) {
        return true;
    }
    if o3 == 0 && on_segment(p2, q2, p1) {
        return true;
    }
    if o4 == 0 && on_segment(p2, q2, q1) {
        return true;
    }
    false
}

/// Angle from `line` to `movement`, degrees in [0, 360).
///
/// Returns `None` when either vector is zero-length; callers must treat
/// that as "no angle, no crossing".
pub fn signed_angle(movement: Segment, line: Segment) -> Option<f32> {
    signed_angle64(movement.endpoints(), line.endpoints())
}

fn signed_angle64((ma, mb): (P64, P64), (la, lb): (P64, P64)) -> Option<f32> {
    let v1 = (mb.0 - ma.0, mb.1 - ma.1);
    let v2 = (lb.0 - la.0, lb.1 - la.1);

    if (v1.0 == 0.0 && v1.1 == 0.0) || (v2.0 == 0.0 && v2.1 == 0.0) {
        return None;
    }

    let n1 = (v1.0 * v1.0 + v1.1 * v1.1).sqrt();
    let n2 = (v2.0 * v2.0 + v2.1 * v2.1).sqrt();
    let u1 = (v1.0 / n1, v1.1 / n1);
    let u2 = (v2.0 / n2, v2.1 / n2);

    let dot = u1.0 * u2.0 + u1.1 * u2.1;
    let cross = u1.0 * u2.1 - u1.1 * u2.0;

    let angle = cross.atan2(dot).to_degrees();
    if angle < 0.0 {
        Some((360.0 + angle) as f32)
    } else {
        Some(angle as f32)
    }
}

/// Test a movement step against a tripwire, with the epsilon offset applied
/// to the tripwire. Returns `(angle, intersected)`; an absent angle means
/// degenerate geometry and is never counted even when `intersected` is true.
pub fn crossing_angle(prev: Point, curr: Point, line: Segment) -> (Option<f32>, bool) {
    let movement = Segment::new(prev, curr).endpoints();
    let line = line.endpoints_offset(LINE_EPSILON);
    (signed_angle64(movement, line), intersects64(movement, line))
}
