//! Collinear-vertex removal for traced lines and rings.
//!
//! Traced geometry has a vertex at every cell center or cell corner.
//! Vertices that lie on the straight segment between their neighbours
//! carry no shape information and are dropped; every other vertex is
//! kept, so the geometry is unchanged.

use geo::{Coord, LineString, Polygon};

/// Relative tolerance of the collinearity test.
const COLLINEAR_EPSILON: f64 = 1e-9;

/// Drop interior vertices of an open line that are collinear with their
/// neighbours. Repeated vertices are dropped too. Endpoints are kept.
#[must_use = "returns the simplified line"]
pub fn simplify_line(line: &LineString<f64>) -> LineString<f64> {
    LineString::new(remove_collinear(&dedup(&line.0)))
}

/// Drop collinear vertices of a closed ring, including the vertex where
/// the ring starts. The result is closed again.
#[must_use = "returns the simplified ring"]
pub fn simplify_ring(ring: &LineString<f64>) -> LineString<f64> {
    let mut coords = dedup(&ring.0);
    if coords.len() > 1 && coords.first() == coords.last() {
        coords.pop();
    }
    if coords.len() < 3 {
        return ring.clone();
    }

    let n = coords.len();
    let kept: Vec<Coord<f64>> = (0..n)
        .filter(|&i| {
            let prev = coords[(i + n - 1) % n];
            let next = coords[(i + 1) % n];
            !is_collinear(prev, coords[i], next)
        })
        .map(|i| coords[i])
        .collect();

    let mut closed = if kept.len() < 3 { coords } else { kept };
    if let Some(&first) = closed.first() {
        closed.push(first);
    }
    LineString::new(closed)
}

/// Apply [`simplify_ring`] to the exterior and every hole.
#[must_use = "returns the simplified polygon"]
pub fn simplify_polygon(polygon: &Polygon<f64>) -> Polygon<f64> {
    Polygon::new(
        simplify_ring(polygon.exterior()),
        polygon.interiors().iter().map(simplify_ring).collect(),
    )
}

fn dedup(coords: &[Coord<f64>]) -> Vec<Coord<f64>> {
    let mut out: Vec<Coord<f64>> = Vec::with_capacity(coords.len());
    for &c in coords {
        if out.last() != Some(&c) {
            out.push(c);
        }
    }
    out
}

fn remove_collinear(coords: &[Coord<f64>]) -> Vec<Coord<f64>> {
    if coords.len() < 3 {
        return coords.to_vec();
    }
    let mut out = vec![coords[0]];
    for window in coords.windows(3) {
        let prev = out.last().copied().unwrap_or(window[0]);
        if !is_collinear(prev, window[1], window[2]) {
            out.push(window[1]);
        }
    }
    out.extend(coords.last());
    out
}

/// Whether `b` lies on the segment `a`-`c` and the path does not double
/// back at `b`.
fn is_collinear(a: Coord<f64>, b: Coord<f64>, c: Coord<f64>) -> bool {
    let (ux, uy) = (b.x - a.x, b.y - a.y);
    let (vx, vy) = (c.x - b.x, c.y - b.y);
    let cross = ux.mul_add(vy, -(uy * vx));
    let dot = ux.mul_add(vx, uy * vy);
    let scale = ux.hypot(uy) * vx.hypot(vy);
    cross.abs() <= COLLINEAR_EPSILON * scale.max(f64::MIN_POSITIVE) && dot > 0.0
}
