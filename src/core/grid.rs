use crate::types::{BoundingBox, FireError, FireResult};
use geo::{GeodesicDistance, Point};
use serde::{Deserialize, Serialize};

/// Sub-tile grid parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridParams {
    /// Target ground sample distance (meters per pixel)
    pub pixel_size_m: f64,
    /// Target sub-tile width/height in pixels
    pub base_px: usize,
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            pixel_size_m: 500.0,
            base_px: 500,
        }
    }
}

impl GridParams {
    pub fn validate(&self) -> FireResult<()> {
        if !(self.pixel_size_m.is_finite() && self.pixel_size_m > 0.0) {
            return Err(FireError::InvalidConfig(format!(
                "pixel_size_m must be positive, got {}",
                self.pixel_size_m
            )));
        }
        if self.base_px == 0 {
            return Err(FireError::InvalidConfig("base_px must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Row-major partition of a region into equal sub-boxes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub rows: usize,
    pub cols: usize,
}

impl TileGrid {
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Geodesic (WGS84) width and height of a box, measured along its central
/// parallel and central meridian.
pub fn bbox_extent_m(bbox: &BoundingBox) -> (f64, f64) {
    let (center_lon, center_lat) = bbox.center();

    let width_m = Point::new(bbox.min_lon, center_lat)
        .geodesic_distance(&Point::new(bbox.max_lon, center_lat));
    let height_m = Point::new(center_lon, bbox.min_lat)
        .geodesic_distance(&Point::new(center_lon, bbox.max_lat));

    (width_m, height_m)
}

/// Number of sub-tile rows and columns so that each sub-tile spans roughly
/// `base_px * pixel_size_m` meters on the ground.
pub fn compute_grid(bbox: &BoundingBox, params: &GridParams) -> FireResult<TileGrid> {
    bbox.validate()?;
    params.validate()?;

    let (width_m, height_m) = bbox_extent_m(bbox);
    let sub_size_m = params.base_px as f64 * params.pixel_size_m;

    let cols = ((width_m / sub_size_m).round() as usize).max(1);
    let rows = ((height_m / sub_size_m).round() as usize).max(1);

    log::debug!(
        "Region {} spans {:.0} m x {:.0} m -> {} rows x {} cols",
        bbox, width_m, height_m, rows, cols
    );

    Ok(TileGrid { rows, cols })
}

/// Split `bbox` into `grid.rows * grid.cols` sub-boxes, row-major from the
/// south-west corner. The last row/column is pinned to the outer edge so the
/// union reconstructs the input exactly.
pub fn split_bbox(bbox: &BoundingBox, grid: TileGrid) -> Vec<BoundingBox> {
    let rows = grid.rows.max(1);
    let cols = grid.cols.max(1);
    let dx = bbox.width_deg() / cols as f64;
    let dy = bbox.height_deg() / rows as f64;

    let edge_x = |j: usize| if j == cols { bbox.max_lon } else { bbox.min_lon + j as f64 * dx };
    let edge_y = |i: usize| if i == rows { bbox.max_lat } else { bbox.min_lat + i as f64 * dy };

    let mut sub_boxes = Vec::with_capacity(rows * cols);
    for i in 0..rows {
        for j in 0..cols {
            sub_boxes.push(BoundingBox {
                min_lon: edge_x(j),
                min_lat: edge_y(i),
                max_lon: edge_x(j + 1),
                max_lat: edge_y(i + 1),
            });
        }
    }
    sub_boxes
}

/// Pixel dimensions `(width, height)` to request for `bbox` at the given
/// ground sample distance.
pub fn image_size_px(bbox: &BoundingBox, pixel_size_m: f64) -> (usize, usize) {
    let (width_m, height_m) = bbox_extent_m(bbox);
    let width_px = ((width_m / pixel_size_m).round() as usize).max(1);
    let height_px = ((height_m / pixel_size_m).round() as usize).max(1);
    (width_px, height_px)
}
