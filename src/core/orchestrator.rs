//! Timestamp x sub-tile driver.
//!
//! For every timestamp all sub-tiles are fetched, decoded, detected and
//! vectorised, then the whole batch is handed to the tracker in one call.
//! Two consecutive blank timestamps end the run early.

use crate::core::detection::{AnomalyDetector, DetectionParams};
use crate::core::grid::{compute_grid, image_size_px, split_bbox, GridParams, TileGrid};
use crate::core::polygons::PolygonExtractor;
use crate::core::timestamps::TimestampSeries;
use crate::core::tracker::{FireTracker, TrackerConfig, UpdateSummary};
use crate::io::store::FireStore;
use crate::types::{format_timestamp, BoundingBox, Detection, FireError, FireResult, RasterTile};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Consecutive blank timestamps after which the run stops
pub const BLANK_STOP_THRESHOLD: usize = 2;

/// One image request: region, instant and raster size
#[derive(Debug, Clone, PartialEq)]
pub struct TileRequest {
    pub bbox: BoundingBox,
    pub time: DateTime<Utc>,
    pub width: usize,
    pub height: usize,
}

/// Remote imagery provider. Failures are `FireError::Transport`.
pub trait ImageSource: Send + Sync {
    fn fetch(&self, request: &TileRequest) -> FireResult<Vec<u8>>;
}

/// Raw bytes to a 3-band georeferenced tile. Failures are `FireError::Decode`.
pub trait RasterDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> FireResult<RasterTile>;
}

/// Result of one (timestamp, sub-tile) pass
#[derive(Debug)]
pub enum SubTileOutcome {
    /// Uniform image, no usable data
    Blank,
    /// Processed image; may hold zero detections
    Detections(Vec<Detection>),
    Failed(FireError),
}

impl SubTileOutcome {
    pub fn is_blank(&self) -> bool {
        matches!(self, SubTileOutcome::Blank)
    }

    fn status(&self) -> SubTileStatus {
        match self {
            SubTileOutcome::Blank => SubTileStatus::Blank,
            SubTileOutcome::Detections(d) => SubTileStatus::Polygons(d.len()),
            SubTileOutcome::Failed(e) => SubTileStatus::Failed(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubTileStatus {
    Blank,
    Polygons(usize),
    Failed(String),
}

/// Structured progress reported while a run is in flight
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Started {
        timestamps: usize,
        grid: TileGrid,
    },
    SubTileResult {
        time: DateTime<Utc>,
        index: usize,
        total: usize,
        bbox: BoundingBox,
        status: SubTileStatus,
    },
    TimestampSummary {
        time: DateTime<Utc>,
        detections: usize,
        blank: bool,
        consecutive_blank: usize,
        update: Option<UpdateSummary>,
    },
    Error {
        time: Option<DateTime<Utc>>,
        message: String,
    },
    Finished {
        summary: RunSummary,
    },
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Forwards progress to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn emit(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Started { timestamps, grid } => log::info!(
                "Starting processing: {} timestamps x {} sub-tiles ({}x{})",
                timestamps,
                grid.len(),
                grid.rows,
                grid.cols
            ),
            ProgressEvent::SubTileResult { time, index, total, bbox, status } => match status {
                SubTileStatus::Blank => {
                    log::info!("{} sub-tile {}/{} {}: blank image", format_timestamp(time), index, total, bbox)
                }
                SubTileStatus::Polygons(n) => {
                    log::info!("{} sub-tile {}/{} {}: {} polygons", format_timestamp(time), index, total, bbox, n)
                }
                SubTileStatus::Failed(msg) => {
                    log::warn!("{} sub-tile {}/{} {}: {}", format_timestamp(time), index, total, bbox, msg)
                }
            },
            ProgressEvent::TimestampSummary { time, detections, blank, consecutive_blank, update } => {
                if *blank {
                    log::info!(
                        "All sub-tiles blank at {} (consecutive={})",
                        format_timestamp(time),
                        consecutive_blank
                    );
                } else if let Some(u) = update {
                    log::info!(
                        "{}: {} detections, {} new fires, {} merged, {} unchanged",
                        format_timestamp(time),
                        detections,
                        u.created,
                        u.merged,
                        u.unchanged
                    );
                } else {
                    log::info!("{}: no detections", format_timestamp(time));
                }
            }
            ProgressEvent::Error { time, message } => match time {
                Some(t) => log::error!("{}: {}", format_timestamp(t), message),
                None => log::error!("{}", message),
            },
            ProgressEvent::Finished { summary } => log::info!(
                "Finished: {}/{} timestamps, {} detections, {} records appended{}{}",
                summary.timestamps_processed,
                summary.timestamps_total,
                summary.detections,
                summary.records_appended,
                if summary.early_stop { ", stopped early" } else { "" },
                if summary.cancelled { ", cancelled" } else { "" }
            ),
        }
    }
}

/// Shared flag checked between timestamps
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Full run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub step_minutes: u32,
    /// Target ground sample distance, metres per pixel
    pub pixel_size_m: f64,
    /// Target sub-tile width in pixels
    pub base_px: usize,
    /// Sub-tile worker threads; `None` uses the rayon default
    pub workers: Option<usize>,
    pub detection: DetectionParams,
    pub tracker: TrackerConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            step_minutes: 10,
            pixel_size_m: 500.0,
            base_px: 500,
            workers: None,
            detection: DetectionParams::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn grid_params(&self) -> GridParams {
        GridParams {
            pixel_size_m: self.pixel_size_m,
            base_px: self.base_px,
        }
    }

    pub fn validate(&self) -> FireResult<()> {
        if self.step_minutes == 0 {
            return Err(FireError::InvalidConfig("step_minutes must be positive".to_string()));
        }
        if self.workers == Some(0) {
            return Err(FireError::InvalidConfig("workers must be at least 1".to_string()));
        }
        self.grid_params().validate()?;
        self.detection.validate()?;
        self.tracker.validate()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub timestamps_total: usize,
    pub timestamps_processed: usize,
    pub blank_timestamps: usize,
    pub early_stop: bool,
    pub cancelled: bool,
    pub detections: usize,
    pub records_appended: usize,
    pub subtile_failures: usize,
}

/// Sub-tile results of one timestamp, in row-major order
#[derive(Debug)]
pub struct TimestampBatch {
    pub time: DateTime<Utc>,
    pub outcomes: Vec<SubTileOutcome>,
}

impl TimestampBatch {
    /// Blank only when every sub-tile came back blank
    pub fn is_blank(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(SubTileOutcome::is_blank)
    }

    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, SubTileOutcome::Failed(_)))
            .count()
    }

    pub fn into_detections(self) -> Vec<Detection> {
        self.outcomes
            .into_iter()
            .filter_map(|o| match o {
                SubTileOutcome::Detections(d) => Some(d),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

pub struct GridRunner<'a> {
    source: &'a dyn ImageSource,
    decoder: &'a dyn RasterDecoder,
    progress: &'a dyn ProgressSink,
    cancel: CancelToken,
    config: RunConfig,
    detector: AnomalyDetector,
    extractor: PolygonExtractor,
    #[cfg(feature = "parallel")]
    pool: Option<rayon::ThreadPool>,
}

impl<'a> GridRunner<'a> {
    pub fn new(source: &'a dyn ImageSource, decoder: &'a dyn RasterDecoder, config: RunConfig) -> FireResult<Self> {
        config.validate()?;
        let detector = AnomalyDetector::new(config.detection.clone())?;
        let extractor = PolygonExtractor::from_params(&config.detection);

        #[cfg(feature = "parallel")]
        let pool = match config.workers {
            Some(n) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| FireError::InvalidConfig(format!("Failed to build worker pool: {}", e)))?,
            ),
            None => None,
        };

        Ok(Self {
            source,
            decoder,
            progress: &LogProgress,
            cancel: CancelToken::new(),
            config,
            detector,
            extractor,
            #[cfg(feature = "parallel")]
            pool,
        })
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Fetch, decode, detect and vectorise one sub-tile
    pub fn process_subtile(&self, bbox: &BoundingBox, time: DateTime<Utc>) -> SubTileOutcome {
        match self.try_process_subtile(bbox, time) {
            Ok(outcome) => outcome,
            Err(e) => SubTileOutcome::Failed(e),
        }
    }

    fn try_process_subtile(&self, bbox: &BoundingBox, time: DateTime<Utc>) -> FireResult<SubTileOutcome> {
        let (width, height) = image_size_px(bbox, self.config.pixel_size_m);
        let request = TileRequest { bbox: *bbox, time, width, height };

        let bytes = self.source.fetch(&request)?;
        let tile = self.decoder.decode(&bytes)?;
        if tile.is_uniform() {
            return Ok(SubTileOutcome::Blank);
        }

        let result = self.detector.detect(&tile)?;
        if result.contours.is_empty() {
            log::debug!("No contours at {} in {}", format_timestamp(&time), bbox);
            return Ok(SubTileOutcome::Detections(Vec::new()));
        }

        let extracted = self.extractor.extract(&result.contours, &result.transform);
        if extracted.is_empty() {
            log::debug!("No valid polygons at {} in {}", format_timestamp(&time), bbox);
        }
        let detections = extracted
            .iter()
            .map(|(polygon, area_ha)| Detection { polygon: polygon.clone(), area_ha, time })
            .collect();
        Ok(SubTileOutcome::Detections(detections))
    }

    /// Every sub-tile of one timestamp, results in input order
    pub fn process_timestamp(&self, boxes: &[BoundingBox], time: DateTime<Utc>) -> TimestampBatch {
        #[cfg(feature = "parallel")]
        let outcomes: Vec<SubTileOutcome> = {
            let work = || boxes.par_iter().map(|b| self.process_subtile(b, time)).collect::<Vec<_>>();
            match &self.pool {
                Some(pool) => pool.install(work),
                None => work(),
            }
        };
        #[cfg(not(feature = "parallel"))]
        let outcomes: Vec<SubTileOutcome> = boxes.iter().map(|b| self.process_subtile(b, time)).collect();

        let total = outcomes.len();
        for (i, (outcome, bbox)) in outcomes.iter().zip(boxes).enumerate() {
            self.progress.emit(&ProgressEvent::SubTileResult {
                time,
                index: i + 1,
                total,
                bbox: *bbox,
                status: outcome.status(),
            });
        }
        TimestampBatch { time, outcomes }
    }

    /// Drive the whole region over `[start, end]`, updating the tracker once
    /// per timestamp that produced detections. Store failures abort the run.
    pub fn run<S: FireStore>(
        &self,
        region: &BoundingBox,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        tracker: &mut FireTracker<S>,
    ) -> FireResult<RunSummary> {
        region.validate()?;
        let series = TimestampSeries::new(start, end, self.config.step_minutes)?;
        let grid = compute_grid(region, &self.config.grid_params())?;
        let boxes = split_bbox(region, grid);

        let mut summary = RunSummary { timestamps_total: series.len(), ..Default::default() };
        self.progress.emit(&ProgressEvent::Started { timestamps: series.len(), grid });

        let mut consecutive_blank = 0usize;
        for time in &series {
            if self.cancel.is_cancelled() {
                log::warn!("Run cancelled before {}", format_timestamp(&time));
                summary.cancelled = true;
                break;
            }

            let batch = self.process_timestamp(&boxes, time);
            let blank = batch.is_blank();
            summary.timestamps_processed += 1;
            summary.subtile_failures += batch.failures();

            let detections = batch.into_detections();
            summary.detections += detections.len();

            let update = if detections.is_empty() {
                None
            } else {
                match tracker.update(&detections) {
                    Ok(u) => Some(u),
                    Err(e) => {
                        self.progress.emit(&ProgressEvent::Error {
                            time: Some(time),
                            message: format!("Failed to persist fire records: {}", e),
                        });
                        return Err(e);
                    }
                }
            };
            if let Some(u) = &update {
                summary.records_appended += u.appended();
            }

            if blank {
                consecutive_blank += 1;
                summary.blank_timestamps += 1;
            } else {
                consecutive_blank = 0;
            }

            self.progress.emit(&ProgressEvent::TimestampSummary {
                time,
                detections: detections.len(),
                blank,
                consecutive_blank,
                update,
            });

            if consecutive_blank >= BLANK_STOP_THRESHOLD {
                log::info!("{} consecutive blank timestamps, stopping early", consecutive_blank);
                summary.early_stop = true;
                break;
            }
        }

        self.progress.emit(&ProgressEvent::Finished { summary: summary.clone() });
        Ok(summary)
    }
}

/// Run the full pipeline over `region` and write the fire history to
/// `tracker`'s store.
pub fn run<S: FireStore>(
    source: &dyn ImageSource,
    decoder: &dyn RasterDecoder,
    region: &BoundingBox,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    store: S,
    config: RunConfig,
) -> FireResult<RunSummary> {
    let mut tracker = FireTracker::new(store, config.tracker.clone())?;
    GridRunner::new(source, decoder, config)?.run(region, start, end, &mut tracker)
}
