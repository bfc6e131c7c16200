//! Fire detection and tracking pipeline

pub mod contour;
pub mod detection;
pub mod filters;
pub mod geometry;
pub mod grid;
pub mod orchestrator;
pub mod polygons;
pub mod timestamps;
pub mod tracker;

// Re-export main types
pub use contour::{find_external_contours, Contour, PixelPoint};
pub use detection::{AnomalyDetector, DetectionMethod, DetectionParams, DetectionResult};
pub use grid::{compute_grid, image_size_px, split_bbox, GridParams, TileGrid};
pub use orchestrator::{
    run, CancelToken, GridRunner, ImageSource, LogProgress, ProgressEvent, ProgressSink, RasterDecoder,
    RunConfig, RunSummary, SubTileOutcome, SubTileStatus, TileRequest, TimestampBatch,
};
pub use polygons::{ExtractedPolygons, PolygonExtractor};
pub use timestamps::TimestampSeries;
pub use tracker::{reconcile, FireTracker, TrackOutcome, TrackerConfig, UpdateSummary};
