//! Polygon validity, simplification and WGS84 area helpers shared by the
//! extractor and the tracker.

use geo::algorithm::line_intersection::{line_intersection, LineIntersection};
use geo::orient::Direction;
use geo::{
    Area, BooleanOps, Coord, GeodesicArea, Line, LineString, MultiPolygon, Orient, Polygon, Simplify,
    SimplifyVwPreserve,
};

pub const M2_PER_HECTARE: f64 = 10_000.0;

/// Absolute ellipsoidal (WGS84) area in hectares; coordinates are lon/lat.
/// Independent of ring winding.
pub fn geodesic_area_ha<G: GeodesicArea<f64>>(geometry: &G) -> f64 {
    geometry.geodesic_area_signed().abs() / M2_PER_HECTARE
}

/// Exterior rings counter-clockwise, holes clockwise
pub fn orient_ccw(polygon: &Polygon<f64>) -> Polygon<f64> {
    polygon.orient(Direction::Default)
}

pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Close a coordinate ring in place
pub fn close_ring(coords: &mut Vec<Coord<f64>>) {
    if let (Some(first), Some(last)) = (coords.first().copied(), coords.last().copied()) {
        if first != last {
            coords.push(first);
        }
    }
}

fn dedup_consecutive(ring: &LineString<f64>) -> Vec<Coord<f64>> {
    let mut coords: Vec<Coord<f64>> = Vec::with_capacity(ring.0.len());
    for c in &ring.0 {
        if coords.last() != Some(c) {
            coords.push(*c);
        }
    }
    coords
}

#[inline]
fn boxes_overlap(a: &Line<f64>, b: &Line<f64>) -> bool {
    a.start.x.min(a.end.x) <= b.start.x.max(b.end.x)
        && b.start.x.min(b.end.x) <= a.start.x.max(a.end.x)
        && a.start.y.min(a.end.y) <= b.start.y.max(b.end.y)
        && b.start.y.min(b.end.y) <= a.start.y.max(a.end.y)
}

/// A ring is simple when it has at least three distinct vertices, encloses
/// non-zero area and no two segments meet except consecutive ones at their
/// shared vertex.
pub fn is_simple_ring(ring: &LineString<f64>) -> bool {
    let coords = dedup_consecutive(ring);
    if coords.len() < 4 || coords.first() != coords.last() {
        return false;
    }
    if coords.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return false;
    }
    if Polygon::new(LineString::from(coords.clone()), vec![]).unsigned_area() == 0.0 {
        return false;
    }

    let segments: Vec<Line<f64>> = coords.windows(2).map(|w| Line::new(w[0], w[1])).collect();
    let n = segments.len();

    for i in 0..n {
        for j in (i + 1)..n {
            let (a, b) = (&segments[i], &segments[j]);
            if !boxes_overlap(a, b) {
                continue;
            }
            let adjacent = j == i + 1 || (i == 0 && j == n - 1);
            match line_intersection(*a, *b) {
                None => {}
                Some(LineIntersection::SinglePoint { .. }) if adjacent => {}
                Some(_) => return false,
            }
        }
    }
    true
}

/// Structural validity: every ring simple, holes strictly inside the shell
pub fn is_valid_polygon(polygon: &Polygon<f64>) -> bool {
    if !is_simple_ring(polygon.exterior()) {
        return false;
    }
    polygon.interiors().iter().all(|hole| {
        is_simple_ring(hole)
            && hole
                .0
                .iter()
                .all(|c| geo::Contains::contains(&Polygon::new(polygon.exterior().clone(), vec![]), c))
    })
}

pub fn is_empty_polygon(polygon: &Polygon<f64>) -> bool {
    polygon.exterior().0.is_empty()
}

/// Simplify without breaking validity. Douglas-Peucker first; when that
/// degenerates the ring, Visvalingam-Whyatt with topology preservation; when
/// both fail, the input is kept.
pub fn simplify_preserving(polygon: &Polygon<f64>, tolerance: f64) -> Polygon<f64> {
    if tolerance <= 0.0 {
        return polygon.clone();
    }
    let rdp = polygon.simplify(&tolerance);
    if is_valid_polygon(&rdp) {
        return rdp;
    }
    let vw = polygon.simplify_vw_preserve(&(tolerance * tolerance));
    if is_valid_polygon(&vw) {
        return vw;
    }
    log::debug!("Simplification degenerated polygon, keeping original");
    polygon.clone()
}

/// Union of an existing footprint with one new polygon
pub fn union_with(current: &MultiPolygon<f64>, polygon: &Polygon<f64>) -> MultiPolygon<f64> {
    current
        .union(&MultiPolygon::new(vec![polygon.clone()]))
        .orient(Direction::Default)
}
