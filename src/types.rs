use chrono::{DateTime, SecondsFormat, Utc};
use geo::{MultiPolygon, Polygon};
use ndarray::Array3;
use serde::{Deserialize, Serialize};

/// 3-band 8-bit pixel array (rows x cols x band)
pub type RgbImage = Array3<u8>;

/// Identity shared by every record of one tracked fire
pub type FireId = u32;

/// Geographic bounding box in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// Build a box from `(lon_min, lat_min, lon_max, lat_max)`, rejecting
    /// degenerate or inverted extents.
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> FireResult<Self> {
        let bbox = Self { min_lon, min_lat, max_lon, max_lat };
        bbox.validate()?;
        Ok(bbox)
    }

    pub fn validate(&self) -> FireResult<()> {
        let finite = [self.min_lon, self.min_lat, self.max_lon, self.max_lat]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.min_lon >= self.max_lon || self.min_lat >= self.max_lat {
            return Err(FireError::InvalidConfig(format!(
                "Invalid bounding box ({}, {}, {}, {}): expected lon_min < lon_max and lat_min < lat_max",
                self.min_lon, self.min_lat, self.max_lon, self.max_lat
            )));
        }
        Ok(())
    }

    pub fn width_deg(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn height_deg(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lon + self.max_lon) / 2.0,
            (self.min_lat + self.max_lat) / 2.0,
        )
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({:.4}, {:.4}, {:.4}, {:.4})",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}

/// Affine pixel-to-geo transform in GDAL coefficient order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    /// North-up transform covering `bbox` with a `width` x `height` raster
    pub fn for_bbox(bbox: &BoundingBox, width: usize, height: usize) -> Self {
        Self {
            top_left_x: bbox.min_lon,
            pixel_width: bbox.width_deg() / width.max(1) as f64,
            rotation_x: 0.0,
            top_left_y: bbox.max_lat,
            rotation_y: 0.0,
            pixel_height: -bbox.height_deg() / height.max(1) as f64,
        }
    }

    /// Geographic coordinate of the center of pixel (`col`, `row`)
    pub fn pixel_center(&self, col: f64, row: f64) -> (f64, f64) {
        let (c, r) = (col + 0.5, row + 0.5);
        (
            self.top_left_x + c * self.pixel_width + r * self.rotation_x,
            self.top_left_y + c * self.rotation_y + r * self.pixel_height,
        )
    }

    /// Transform for a raster resampled by `factor` in both axes; the origin
    /// is unchanged and every pixel shrinks by `1 / factor`.
    pub fn scaled(&self, factor: usize) -> Self {
        let s = 1.0 / factor.max(1) as f64;
        Self {
            top_left_x: self.top_left_x,
            pixel_width: self.pixel_width * s,
            rotation_x: self.rotation_x * s,
            top_left_y: self.top_left_y,
            rotation_y: self.rotation_y * s,
            pixel_height: self.pixel_height * s,
        }
    }
}

/// Decoded image tile with its georeferencing
#[derive(Debug, Clone)]
pub struct RasterTile {
    pub pixels: RgbImage,
    pub transform: GeoTransform,
    pub crs: String,
}

impl RasterTile {
    pub fn height(&self) -> usize {
        self.pixels.dim().0
    }

    pub fn width(&self) -> usize {
        self.pixels.dim().1
    }

    /// True when the tile carries no usable signal: empty, or every sample
    /// holds the same value (zero variance, max == min).
    pub fn is_uniform(&self) -> bool {
        let mut values = self.pixels.iter();
        match values.next() {
            None => true,
            Some(first) => values.all(|v| v == first),
        }
    }
}

/// One accepted polygon from a single (timestamp, sub-tile) pass
#[derive(Debug, Clone)]
pub struct Detection {
    pub polygon: Polygon<f64>,
    pub area_ha: f64,
    pub time: DateTime<Utc>,
}

/// Persisted row of the fire history
#[derive(Debug, Clone, PartialEq)]
pub struct FireRecord {
    pub fire: FireId,
    pub time: DateTime<Utc>,
    /// Hectares contributed by this update alone
    pub time_area: Option<f64>,
    /// Cumulative hectares of the fire as of `time`
    pub acc_area: Option<f64>,
    pub geometry: MultiPolygon<f64>,
}

/// Column order used by every store writer
pub const FIRE_COLUMNS: [&str; 5] = ["fire", "time", "time_area", "acc_area", "geometry"];

/// Render an instant as ISO-8601 with a `Z` designator
pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse an ISO-8601 instant. Values without an offset are taken as UTC.
pub fn parse_timestamp(value: &str) -> FireResult<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = value.trim_end_matches('Z');
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(naive, fmt) {
            return Ok(dt.and_utc());
        }
    }
    Err(FireError::InvalidConfig(format!("Invalid ISO-8601 timestamp: {}", value)))
}

/// Error types for fire detection and tracking
#[derive(Debug, thiserror::Error)]
pub enum FireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

/// Result type for fire operations
pub type FireResult<T> = Result<T, FireError>;
