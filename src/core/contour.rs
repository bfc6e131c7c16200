//! Outer boundary extraction for binary masks.
//!
//! Foreground is 8-connected, background 4-connected. Only components that
//! touch the background surrounding the image are traced; blobs sitting in
//! the hole of another blob are skipped along with the hole itself.

use ndarray::Array2;
use std::collections::VecDeque;

/// Pixel coordinate, `x` = column and `y` = row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelPoint {
    pub x: i64,
    pub y: i64,
}

impl PixelPoint {
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    fn offset(self, d: (i64, i64)) -> Self {
        Self::new(self.x + d.0, self.y + d.1)
    }
}

/// Closed boundary of one connected component. The last point is adjacent
/// to the first and is not repeated.
#[derive(Debug, Clone, PartialEq)]
pub struct Contour {
    pub points: Vec<PixelPoint>,
}

impl Contour {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Clockwise (y down) neighbour offsets starting at west
const NEIGHBOURS: [(i64, i64); 8] = [
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
];

const FOUR_NEIGHBOURS: [(i64, i64); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];

struct Grid<'a> {
    mask: &'a Array2<u8>,
    rows: i64,
    cols: i64,
}

impl<'a> Grid<'a> {
    fn new(mask: &'a Array2<u8>) -> Self {
        let (rows, cols) = mask.dim();
        Self { mask, rows: rows as i64, cols: cols as i64 }
    }

    fn inside(&self, p: PixelPoint) -> bool {
        p.x >= 0 && p.y >= 0 && p.x < self.cols && p.y < self.rows
    }

    fn is_set(&self, p: PixelPoint) -> bool {
        self.inside(p) && self.mask[[p.y as usize, p.x as usize]] != 0
    }
}

/// Background reachable from outside the image under 4-connectivity
fn outer_background(grid: &Grid) -> Array2<bool> {
    let mut outside = Array2::from_elem(grid.mask.raw_dim(), false);
    let mut queue = VecDeque::new();

    let seed = |p: PixelPoint, outside: &mut Array2<bool>, queue: &mut VecDeque<PixelPoint>| {
        if !grid.is_set(p) && !outside[[p.y as usize, p.x as usize]] {
            outside[[p.y as usize, p.x as usize]] = true;
            queue.push_back(p);
        }
    };

    for x in 0..grid.cols {
        seed(PixelPoint::new(x, 0), &mut outside, &mut queue);
        seed(PixelPoint::new(x, grid.rows - 1), &mut outside, &mut queue);
    }
    for y in 0..grid.rows {
        seed(PixelPoint::new(0, y), &mut outside, &mut queue);
        seed(PixelPoint::new(grid.cols - 1, y), &mut outside, &mut queue);
    }

    while let Some(p) = queue.pop_front() {
        for d in FOUR_NEIGHBOURS {
            let q = p.offset(d);
            if grid.inside(q) {
                seed(q, &mut outside, &mut queue);
            }
        }
    }
    outside
}

/// Flood one 8-connected component, returning its size and whether it
/// borders the outer background.
fn flood_component(
    grid: &Grid,
    start: PixelPoint,
    visited: &mut Array2<bool>,
    outside: &Array2<bool>,
) -> (usize, bool) {
    let mut queue = VecDeque::from([start]);
    visited[[start.y as usize, start.x as usize]] = true;
    let mut size = 0;
    let mut external = false;

    while let Some(p) = queue.pop_front() {
        size += 1;
        if !external {
            external = FOUR_NEIGHBOURS.iter().any(|&d| {
                let q = p.offset(d);
                !grid.inside(q) || outside[[q.y as usize, q.x as usize]]
            });
        }
        for d in NEIGHBOURS {
            let q = p.offset(d);
            if grid.is_set(q) && !visited[[q.y as usize, q.x as usize]] {
                visited[[q.y as usize, q.x as usize]] = true;
                queue.push_back(q);
            }
        }
    }
    (size, external)
}

fn direction_index(d: (i64, i64)) -> Option<usize> {
    NEIGHBOURS.iter().position(|&n| n == d)
}

/// Moore-neighbour tracing from the top-left pixel of a component.
fn trace_boundary(grid: &Grid, start: PixelPoint, component_size: usize) -> Contour {
    let mut points = vec![start];
    let mut p = start;
    // The west neighbour of the first raster-order pixel is background
    let mut back_dir = 0usize;
    let mut first_step: Option<PixelPoint> = None;
    let max_steps = 4 * component_size + 8;

    loop {
        let found = (1..=8)
            .map(|k| (back_dir + k) % 8)
            .find(|&d| grid.is_set(p.offset(NEIGHBOURS[d])));

        let d = match found {
            Some(d) => d,
            None => break, // isolated pixel
        };
        let q = p.offset(NEIGHBOURS[d]);

        if p == start {
            match first_step {
                None => first_step = Some(q),
                Some(f) if f == q => break,
                Some(_) => {}
            }
        }

        let b = p.offset(NEIGHBOURS[(d + 7) % 8]);
        back_dir = match direction_index((b.x - q.x, b.y - q.y)) {
            Some(i) => i,
            None => break,
        };

        points.push(q);
        p = q;

        if points.len() > max_steps {
            log::warn!("Contour trace from ({}, {}) did not close", start.x, start.y);
            break;
        }
    }

    if points.len() > 1 && points.last() == Some(&start) {
        points.pop();
    }
    Contour { points }
}

/// Outer contours of all external components, in raster order of their
/// top-left pixel.
pub fn find_external_contours(mask: &Array2<u8>) -> Vec<Contour> {
    if mask.is_empty() {
        return Vec::new();
    }
    let grid = Grid::new(mask);
    let outside = outer_background(&grid);
    let mut visited = Array2::from_elem(mask.raw_dim(), false);
    let mut contours = Vec::new();

    for y in 0..grid.rows {
        for x in 0..grid.cols {
            let p = PixelPoint::new(x, y);
            if !grid.is_set(p) || visited[[y as usize, x as usize]] {
                continue;
            }
            let (size, external) = flood_component(&grid, p, &mut visited, &outside);
            if external {
                contours.push(trace_boundary(&grid, p, size));
            }
        }
    }

    log::debug!("Traced {} external contours", contours.len());
    contours
}
