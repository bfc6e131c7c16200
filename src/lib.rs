//! firetrack: wildfire detection and temporal tracking
//!
//! Fire-temperature RGB composites are fetched per sub-tile and timestamp,
//! thresholded into thermal-anomaly masks, vectorised into WGS84 polygons
//! and reconciled into an append-only history of fire identities.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    format_timestamp, parse_timestamp, BoundingBox, Detection, FireError, FireId, FireRecord, FireResult,
    GeoTransform, RasterTile, RgbImage, FIRE_COLUMNS,
};

pub use crate::core::{
    run, AnomalyDetector, CancelToken, DetectionMethod, DetectionParams, FireTracker, GridRunner, ImageSource,
    LogProgress, PolygonExtractor, ProgressEvent, ProgressSink, RasterDecoder, RunConfig, RunSummary,
    TimestampSeries, TrackerConfig,
};

pub use io::{open_store, FireStore, GeoJsonFireStore, WmsConfig, WmsImageSource};
#[cfg(feature = "gdal")]
pub use io::{GdalFireStore, GdalRasterDecoder};
